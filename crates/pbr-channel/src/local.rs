use crate::responder::Responder;
use crate::transport::{
    ContextId, DeliveryAck, DeliveryReceipt, Inbound, ReplyHandle, ReplyReceiver,
    SenderDescriptor, Transport, TransportError,
};
use pbr_core::channel_ipc::ChannelMessage;
use pbr_core::schema::ChannelSchema;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

struct ContextSlot {
    url: String,
    inbox: mpsc::UnboundedSender<Inbound>,
}

#[derive(Default)]
struct RuntimeState {
    next_id: u64,
    contexts: BTreeMap<ContextId, ContextSlot>,
    active: Option<ContextId>,
    extension: Vec<mpsc::UnboundedSender<Inbound>>,
}

/// In-process browser runtime: a set of browsing contexts, at most one of
/// them active, plus any number of extension-side listeners.
#[derive(Clone, Default)]
pub struct LocalRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open_context(&self, url: impl Into<String>) -> ContextHandle {
        let url = url.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id += 1;
        let id = ContextId(state.next_id);
        debug!(event = "context_open", context = %id, url = %url);
        state.contexts.insert(id, ContextSlot { url, inbox: tx });
        ContextHandle {
            id,
            inbox: rx,
            runtime: self.clone(),
        }
    }

    /// Focuses `id`; every other context becomes inactive.
    pub fn activate(&self, id: ContextId) -> bool {
        let mut state = self.lock();
        if !state.contexts.contains_key(&id) {
            return false;
        }
        state.active = Some(id);
        info!(event = "context_activate", context = %id);
        true
    }

    pub fn deactivate(&self) {
        self.lock().active = None;
    }

    pub fn close(&self, id: ContextId) -> bool {
        let mut state = self.lock();
        let removed = state.contexts.remove(&id).is_some();
        if state.active == Some(id) {
            state.active = None;
        }
        if removed {
            debug!(event = "context_close", context = %id);
        }
        removed
    }

    pub fn navigate(&self, id: ContextId, url: impl Into<String>) -> bool {
        match self.lock().contexts.get_mut(&id) {
            Some(slot) => {
                slot.url = url.into();
                true
            }
            None => false,
        }
    }

    pub fn context_url(&self, id: ContextId) -> Option<String> {
        self.lock().contexts.get(&id).map(|slot| slot.url.clone())
    }

    pub fn context_count(&self) -> usize {
        self.lock().contexts.len()
    }

    /// A listener for messages that contexts send to the extension.
    pub fn attach_extension(&self) -> ExtensionEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().extension.push(tx);
        ExtensionEndpoint { inbox: rx }
    }

    fn send_from_context(&self, id: ContextId, message: ChannelMessage) -> ReplyReceiver {
        let (reply, rx) = ReplyHandle::channel();
        let mut state = self.lock();
        let sender = match state.contexts.get(&id) {
            Some(slot) => SenderDescriptor::from_context(id, slot.url.clone(), state.active == Some(id)),
            None => return rx,
        };
        state.extension.retain(|inbox| {
            inbox
                .send(Inbound {
                    message: message.clone(),
                    sender: sender.clone(),
                    reply: reply.clone(),
                })
                .is_ok()
        });
        rx
    }
}

impl Transport for LocalRuntime {
    fn active_context(&self) -> Option<ContextId> {
        self.lock().active
    }

    fn send_to(
        &self,
        target: ContextId,
        message: ChannelMessage,
    ) -> Result<ReplyReceiver, TransportError> {
        let state = self.lock();
        let slot = state
            .contexts
            .get(&target)
            .ok_or(TransportError::Unreachable(target))?;
        let (reply, rx) = ReplyHandle::channel();
        slot.inbox
            .send(Inbound {
                message,
                sender: SenderDescriptor::extension(),
                reply,
            })
            .map_err(|_| TransportError::Unreachable(target))?;
        Ok(rx)
    }

    fn broadcast(&self, message: ChannelMessage) -> Result<DeliveryReceipt, TransportError> {
        let state = self.lock();
        let delivered = state
            .contexts
            .values()
            .filter(|slot| {
                slot.inbox
                    .send(Inbound {
                        message: message.clone(),
                        sender: SenderDescriptor::extension(),
                        reply: ReplyHandle::detached(),
                    })
                    .is_ok()
            })
            .count();
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(DeliveryAck { delivered });
        Ok(rx)
    }
}

/// The page side of one browsing context.
pub struct ContextHandle {
    id: ContextId,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    runtime: LocalRuntime,
}

impl ContextHandle {
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Dispatches every queued message and returns how many were drained.
    pub fn pump<S: ChannelSchema>(&mut self, responder: &Responder<S>) -> usize {
        let mut drained = 0;
        while let Ok(inbound) = self.inbox.try_recv() {
            responder.dispatch(inbound);
            drained += 1;
        }
        drained
    }

    pub fn send_to_extension(&self, message: ChannelMessage) -> ReplyReceiver {
        self.runtime.send_from_context(self.id, message)
    }

    /// Gives up the handle for a long-running [`Responder::run`].
    pub fn into_inbox(self) -> mpsc::UnboundedReceiver<Inbound> {
        self.inbox
    }
}

pub struct ExtensionEndpoint {
    inbox: mpsc::UnboundedReceiver<Inbound>,
}

impl ExtensionEndpoint {
    pub fn pump<S: ChannelSchema>(&mut self, responder: &Responder<S>) -> usize {
        let mut drained = 0;
        while let Ok(inbound) = self.inbox.try_recv() {
            responder.dispatch(inbound);
            drained += 1;
        }
        drained
    }

    pub fn into_inbox(self) -> mpsc::UnboundedReceiver<Inbound> {
        self.inbox
    }
}
