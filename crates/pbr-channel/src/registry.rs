use crate::transport::{Inbound, ReplyHandle, SenderDescriptor};
use pbr_core::channel_ipc::ChannelMessage;
use pbr_core::schema::{ChannelEvent, ChannelSchema};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// A typed listener. Identity is the `Arc` allocation: registering a clone
/// of the same `Arc` again is a no-op.
pub type Listener<E> = Arc<
    dyn Fn(<E as ChannelEvent>::Params, &SenderDescriptor, Reply<E>) + Send + Sync + 'static,
>;

pub fn listener<E, F>(f: F) -> Listener<E>
where
    E: ChannelEvent,
    F: Fn(E::Params, &SenderDescriptor, Reply<E>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Typed view of the shared reply slot of one inbound message.
pub struct Reply<E: ChannelEvent> {
    handle: ReplyHandle,
    marker: PhantomData<fn() -> E>,
}

impl<E: ChannelEvent> Reply<E> {
    fn new(handle: ReplyHandle) -> Self {
        Self {
            handle,
            marker: PhantomData,
        }
    }

    /// Answers the request. Returns false when another listener already
    /// answered or nobody is waiting.
    pub fn send(self, response: E::Response) -> bool {
        match serde_json::to_value(response) {
            Ok(value) => self.handle.send(value),
            Err(err) => {
                warn!(event = "channel_reply_encode_error", event_name = E::NAME, error = %err);
                false
            }
        }
    }
}

type ErasedListener = Arc<dyn Fn(&ChannelMessage, &SenderDescriptor, &ReplyHandle) + Send + Sync>;

struct Entry {
    identity: usize,
    call: ErasedListener,
}

/// Event name → listeners, for one channel instance.
pub struct ListenerRegistry<S> {
    listeners: RwLock<HashMap<&'static str, Vec<Entry>>>,
    marker: PhantomData<fn() -> S>,
}

impl<S: ChannelSchema> Default for ListenerRegistry<S> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            marker: PhantomData,
        }
    }
}

impl<S: ChannelSchema> ListenerRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the listener was newly added.
    pub fn add<E>(&self, listener: Listener<E>) -> bool
    where
        E: ChannelEvent<Schema = S>,
    {
        let identity = Arc::as_ptr(&listener) as *const () as usize;
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entries = listeners.entry(E::NAME).or_default();
        if entries.iter().any(|entry| entry.identity == identity) {
            return false;
        }

        let call: ErasedListener = Arc::new(
            move |message: &ChannelMessage, sender: &SenderDescriptor, reply: &ReplyHandle| {
                match message.params::<E>() {
                    Ok(params) => listener(params, sender, Reply::new(reply.clone())),
                    Err(err) => {
                        warn!(
                            event = "channel_params_invalid",
                            event_name = E::NAME,
                            error = %err
                        );
                    }
                }
            },
        );
        entries.push(Entry { identity, call });
        true
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(event_name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Invokes every listener registered for the message's event name and
    /// returns how many ran. Unknown event names are dropped silently.
    pub fn dispatch(&self, inbound: &Inbound) -> usize {
        let calls = {
            let listeners = self
                .listeners
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match listeners.get(inbound.message.event_name.as_str()) {
                Some(entries) => entries
                    .iter()
                    .map(|entry| entry.call.clone())
                    .collect::<Vec<_>>(),
                None => return 0,
            }
        };
        for call in &calls {
            call(&inbound.message, &inbound.sender, &inbound.reply);
        }
        calls.len()
    }
}
