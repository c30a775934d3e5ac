use crate::registry::{Listener, ListenerRegistry};
use crate::transport::Inbound;
use pbr_core::schema::{ChannelEvent, ChannelSchema};
use tokio::sync::mpsc;
use tracing::trace;

/// Which senders an inbound side listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFilter {
    /// Only messages whose sender is the active browsing context. Messages
    /// from other contexts, or from no context at all, are ignored.
    ActiveContextOnly,
    AcceptAll,
}

impl InboundFilter {
    pub fn admits(self, inbound: &Inbound) -> bool {
        match self {
            Self::AcceptAll => true,
            Self::ActiveContextOnly => inbound.sender.context.is_some() && inbound.sender.active,
        }
    }
}

pub struct Responder<S> {
    registry: ListenerRegistry<S>,
    filter: InboundFilter,
}

impl<S: ChannelSchema> Responder<S> {
    pub fn new(filter: InboundFilter) -> Self {
        Self {
            registry: ListenerRegistry::new(),
            filter,
        }
    }

    /// The inbound side of a client-role channel.
    pub fn client() -> Self {
        Self::new(InboundFilter::ActiveContextOnly)
    }

    pub fn accept_all() -> Self {
        Self::new(InboundFilter::AcceptAll)
    }

    pub fn filter(&self) -> InboundFilter {
        self.filter
    }

    pub fn add_event_listener<E>(&self, listener: Listener<E>) -> bool
    where
        E: ChannelEvent<Schema = S>,
    {
        self.registry.add(listener)
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.registry.listener_count(event_name)
    }

    /// Returns how many listeners ran. Filtered messages run none.
    pub fn dispatch(&self, inbound: Inbound) -> usize {
        if !self.filter.admits(&inbound) {
            trace!(
                event = "channel_inbound_filtered",
                event_name = %inbound.message.event_name,
                context = ?inbound.sender.context
            );
            return 0;
        }
        // Unhandled messages are dropped silently with their reply handle.
        self.registry.dispatch(&inbound)
    }

    /// Dispatches until the sending side of `inbox` is gone.
    pub async fn run(&self, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(inbound) = inbox.recv().await {
            self.dispatch(inbound);
        }
    }
}
