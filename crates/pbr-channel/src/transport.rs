use pbr_core::channel_ipc::ChannelMessage;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Who sent an inbound message.
///
/// `context` is `None` when the sender is not a browsing context (a UI
/// surface or the backend process).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderDescriptor {
    pub context: Option<ContextId>,
    pub url: Option<String>,
    pub active: bool,
}

impl SenderDescriptor {
    pub fn extension() -> Self {
        Self::default()
    }

    pub fn from_context(id: ContextId, url: impl Into<String>, active: bool) -> Self {
        Self {
            context: Some(id),
            url: Some(url.into()),
            active,
        }
    }
}

pub type ReplyReceiver = oneshot::Receiver<Value>;

/// One-shot response slot shared by every listener of a message.
///
/// The first `send` wins. When the last clone is dropped unanswered the
/// waiting side observes a closed channel.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    slot: Arc<Mutex<Option<oneshot::Sender<Value>>>>,
}

impl ReplyHandle {
    pub fn channel() -> (Self, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// A handle nobody waits on, for fire-and-forget deliveries.
    pub fn detached() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn send(&self, value: Value) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Inbound {
    pub message: ChannelMessage,
    pub sender: SenderDescriptor,
    pub reply: ReplyHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryAck {
    pub delivered: usize,
}

pub type DeliveryReceipt = oneshot::Receiver<DeliveryAck>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("context {0} is not reachable")]
    Unreachable(ContextId),
    #[error("transport closed")]
    Closed,
    #[error("transport rejected message: {0}")]
    Rejected(String),
}

/// The asynchronous, fire-and-forget fabric the channel runs on.
///
/// Sends never block: they enqueue and hand back a one-shot receiver that
/// resolves with the answer (`send_to`) or with the delivery acknowledgment
/// (`broadcast`).
pub trait Transport: Send + Sync {
    /// The focused, active browsing context, if there is one.
    fn active_context(&self) -> Option<ContextId>;

    fn send_to(
        &self,
        target: ContextId,
        message: ChannelMessage,
    ) -> Result<ReplyReceiver, TransportError>;

    fn broadcast(&self, message: ChannelMessage) -> Result<DeliveryReceipt, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reply_wins() {
        let (handle, mut rx) = ReplyHandle::channel();
        let other = handle.clone();
        assert!(handle.send(serde_json::json!(1)));
        assert!(!other.send(serde_json::json!(2)));
        assert_eq!(rx.try_recv().expect("reply"), serde_json::json!(1));
    }

    #[test]
    fn dropping_every_clone_closes_the_receiver() {
        let (handle, mut rx) = ReplyHandle::channel();
        let other = handle.clone();
        drop(handle);
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        drop(other);
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn detached_handle_ignores_replies() {
        assert!(!ReplyHandle::detached().send(Value::Null));
    }
}
