use crate::requester::RequesterConfig;
use crate::transport::{DeliveryAck, DeliveryReceipt, Transport};
use crate::{ChannelError, TransportError};
use pbr_core::channel_ipc::ChannelMessage;
use pbr_core::schema::{ChannelEvent, ChannelSchema};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Backend-role outbound half. Messages fan out to every context and the
/// caller only learns that the transport delivered them, never an answer.
pub struct Broadcaster<S> {
    transport: Arc<dyn Transport>,
    config: RequesterConfig,
    marker: PhantomData<fn() -> S>,
}

impl<S> Clone for Broadcaster<S> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config,
            marker: PhantomData,
        }
    }
}

impl<S: ChannelSchema> Broadcaster<S> {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, RequesterConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: RequesterConfig) -> Self {
        Self {
            transport,
            config,
            marker: PhantomData,
        }
    }

    pub fn send<E>(&self, params: &E::Params) -> Result<DeliveryReceipt, ChannelError>
    where
        E: ChannelEvent<Schema = S>,
    {
        let message = ChannelMessage::for_event::<E>(params)?;
        self.transport.broadcast(message).map_err(|err| {
            error!(event = "channel_broadcast_error", event_name = E::NAME, error = %err);
            ChannelError::Transport(err)
        })
    }

    /// Resolves once the transport reports how many contexts received the
    /// message.
    pub async fn request<E>(&self, params: E::Params) -> Result<DeliveryAck, ChannelError>
    where
        E: ChannelEvent<Schema = S>,
    {
        let receipt = self.send::<E>(&params)?;
        match tokio::time::timeout(self.config.timeout, receipt).await {
            Ok(Ok(ack)) => {
                debug!(
                    event = "channel_broadcast_delivered",
                    event_name = E::NAME,
                    delivered = ack.delivered
                );
                Ok(ack)
            }
            Ok(Err(_)) => Err(ChannelError::Transport(TransportError::Closed)),
            Err(_) => {
                warn!(event = "channel_broadcast_timeout", event_name = E::NAME);
                Err(ChannelError::Timeout {
                    event: E::NAME,
                    after: self.config.timeout,
                })
            }
        }
    }
}
