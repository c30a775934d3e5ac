//! Typed, role-aware message channel.
//!
//! The outbound side comes in two shapes: a [`Requester`] talks to the one
//! active browsing context and waits for its answer, a [`Broadcaster`] fans a
//! message out to every context and only waits for the transport to accept
//! it. Inbound messages are dispatched by a [`Responder`] to the listeners
//! registered for their event name. All of them speak
//! [`pbr_core::channel_ipc::ChannelMessage`] over a [`Transport`].

mod broadcaster;
mod local;
mod registry;
mod requester;
mod responder;
mod transport;

pub use broadcaster::Broadcaster;
pub use local::{ContextHandle, ExtensionEndpoint, LocalRuntime};
pub use registry::{listener, Listener, ListenerRegistry, Reply};
pub use requester::{PendingResponse, Requester, RequesterConfig, DEFAULT_REQUEST_TIMEOUT};
pub use responder::{InboundFilter, Responder};
pub use transport::{
    ContextId, DeliveryAck, DeliveryReceipt, Inbound, ReplyHandle, ReplyReceiver,
    SenderDescriptor, Transport, TransportError,
};

use pbr_core::channel_ipc::FrameError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("no active browsing context")]
    NoActiveContext,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("no listener answered {event}")]
    NoResponse { event: &'static str },
    #[error("{event} timed out after {after:?}")]
    Timeout {
        event: &'static str,
        after: Duration,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
}
