use crate::transport::{ContextId, ReplyReceiver, Transport};
use crate::ChannelError;
use pbr_core::channel_ipc::ChannelMessage;
use pbr_core::schema::{ChannelEvent, ChannelSchema};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RequesterConfig {
    pub timeout: Duration,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Client-role outbound half: one request goes to the active context and
/// waits, bounded by the configured timeout, for that context's answer.
pub struct Requester<S> {
    transport: Arc<dyn Transport>,
    config: RequesterConfig,
    marker: PhantomData<fn() -> S>,
}

impl<S> Clone for Requester<S> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config,
            marker: PhantomData,
        }
    }
}

impl<S: ChannelSchema> Requester<S> {
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

    /// Hands the message to the transport without waiting for the answer.
    /// Dropping the returned [`PendingResponse`] is the fire-and-forget
    /// form of a request.
    pub fn send<E>(&self, params: &E::Params) -> Result<PendingResponse<E>, ChannelError>
    where
        E: ChannelEvent<Schema = S>,
    {
        let message = ChannelMessage::for_event::<E>(params)?;
        let Some(target) = self.transport.active_context() else {
            error!(event = "channel_no_active_context", event_name = E::NAME);
            return Err(ChannelError::NoActiveContext);
        };
        let reply = self.transport.send_to(target, message).map_err(|err| {
            error!(
                event = "channel_send_error",
                event_name = E::NAME,
                context = %target,
                error = %err
            );
            ChannelError::Transport(err)
        })?;
        debug!(event = "channel_request", event_name = E::NAME, context = %target);
        Ok(PendingResponse {
            reply,
            target,
            timeout: self.config.timeout,
            marker: PhantomData,
        })
    }

    pub async fn request<E>(&self, params: E::Params) -> Result<E::Response, ChannelError>
    where
        E: ChannelEvent<Schema = S>,
    {
        self.send::<E>(&params)?.wait().await
    }
}

/// An in-flight request bound to its own reply channel.
pub struct PendingResponse<E: ChannelEvent> {
    reply: ReplyReceiver,
    target: ContextId,
    timeout: Duration,
    marker: PhantomData<fn() -> E>,
}

impl<E: ChannelEvent> PendingResponse<E> {
    pub fn target(&self) -> ContextId {
        self.target
    }

    pub async fn wait(self) -> Result<E::Response, ChannelError> {
        let value = match tokio::time::timeout(self.timeout, self.reply).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => {
                debug!(event = "channel_no_response", event_name = E::NAME, context = %self.target);
                return Err(ChannelError::NoResponse { event: E::NAME });
            }
            Err(_) => {
                warn!(
                    event = "channel_request_timeout",
                    event_name = E::NAME,
                    context = %self.target,
                    timeout_ms = self.timeout.as_millis() as u64
                );
                return Err(ChannelError::Timeout {
                    event: E::NAME,
                    after: self.timeout,
                });
            }
        };
        serde_json::from_value(value).map_err(|err| {
            warn!(event = "channel_response_invalid", event_name = E::NAME, error = %err);
            ChannelError::Frame(pbr_core::channel_ipc::FrameError::Decode(err.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DeliveryReceipt, Inbound, ReplyHandle, SenderDescriptor};
    use crate::TransportError;
    use pbr_core::schema::{ChangePlayback, ChangePlaybackParams, GetUri, GetUriParams, PlaybackSchema};
    use pbr_core::PageIdentity;
    use std::sync::Mutex;

    /// Records what was sent and lets the test decide how the target answers.
    #[derive(Default)]
    struct ScriptedTransport {
        active: Option<ContextId>,
        fail_send: bool,
        sent: Mutex<Vec<(ContextId, Inbound)>>,
    }

    impl Transport for ScriptedTransport {
        fn active_context(&self) -> Option<ContextId> {
            self.active
        }

        fn send_to(
            &self,
            target: ContextId,
            message: ChannelMessage,
        ) -> Result<ReplyReceiver, TransportError> {
            if self.fail_send {
                return Err(TransportError::Unreachable(target));
            }
            let (reply, rx) = ReplyHandle::channel();
            self.sent.lock().expect("lock").push((
                target,
                Inbound {
                    message,
                    sender: SenderDescriptor::extension(),
                    reply,
                },
            ));
            Ok(rx)
        }

        fn broadcast(&self, _message: ChannelMessage) -> Result<DeliveryReceipt, TransportError> {
            Err(TransportError::Closed)
        }
    }

    fn requester(transport: Arc<ScriptedTransport>) -> Requester<PlaybackSchema> {
        Requester::with_config(
            transport,
            RequesterConfig {
                timeout: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn request_returns_the_active_context_answer() {
        let transport = Arc::new(ScriptedTransport {
            active: Some(ContextId(7)),
            ..Default::default()
        });
        let pending = requester(transport.clone())
            .send::<GetUri>(&GetUriParams {})
            .expect("send");
        assert_eq!(pending.target(), ContextId(7));

        {
            let sent = transport.sent.lock().expect("lock");
            let (target, inbound) = &sent[0];
            assert_eq!(*target, ContextId(7));
            assert_eq!(inbound.message.event_name, "getURI");
            inbound
                .reply
                .send(serde_json::json!({"href": "https://example.com/a", "hostname": "example.com"}));
        }

        assert_eq!(
            pending.wait().await.expect("answer"),
            PageIdentity::new("https://example.com/a", "example.com")
        );
    }

    #[tokio::test]
    async fn no_active_context_is_an_explicit_error() {
        let transport = Arc::new(ScriptedTransport::default());
        let result = requester(transport)
            .request::<ChangePlayback>(ChangePlaybackParams { playback_rate: 2.0 })
            .await;
        assert_eq!(result, Err(ChannelError::NoActiveContext));
    }

    #[tokio::test]
    async fn transport_failure_is_surfaced() {
        let transport = Arc::new(ScriptedTransport {
            active: Some(ContextId(1)),
            fail_send: true,
            ..Default::default()
        });
        let result = requester(transport)
            .request::<GetUri>(GetUriParams {})
            .await;
        assert_eq!(
            result,
            Err(ChannelError::Transport(TransportError::Unreachable(
                ContextId(1)
            )))
        );
    }

    #[tokio::test]
    async fn unanswered_request_reports_no_response() {
        let transport = Arc::new(ScriptedTransport {
            active: Some(ContextId(1)),
            ..Default::default()
        });
        let pending = requester(transport.clone())
            .send::<GetUri>(&GetUriParams {})
            .expect("send");
        transport.sent.lock().expect("lock").clear();
        assert_eq!(
            pending.wait().await,
            Err(ChannelError::NoResponse { event: "getURI" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_target_times_out() {
        let transport = Arc::new(ScriptedTransport {
            active: Some(ContextId(1)),
            ..Default::default()
        });
        let result = requester(transport.clone())
            .request::<GetUri>(GetUriParams {})
            .await;
        assert_eq!(
            result,
            Err(ChannelError::Timeout {
                event: "getURI",
                after: Duration::from_millis(50),
            })
        );
        assert_eq!(transport.sent.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn malformed_answer_is_a_frame_error() {
        let transport = Arc::new(ScriptedTransport {
            active: Some(ContextId(1)),
            ..Default::default()
        });
        let pending = requester(transport.clone())
            .send::<GetUri>(&GetUriParams {})
            .expect("send");
        transport.sent.lock().expect("lock")[0]
            .1
            .reply
            .send(serde_json::json!({"href": 3}));
        assert!(matches!(
            pending.wait().await,
            Err(ChannelError::Frame(_))
        ));
    }
}
