//! Page-embedded agent: applies playback rates to the page's media and
//! reports the page identity.

mod headless;

pub use headless::{HeadlessDocument, HeadlessMedia};

use pbr_channel::{listener, Inbound, Responder};
use pbr_core::schema::{ChangePlayback, GetUri, PlaybackSchema};
use pbr_core::{validate_rate, PageIdentity};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub trait MediaElement: Send + Sync {
    fn playback_rate(&self) -> f64;
    fn set_playback_rate(&self, rate: f64);
}

/// The page the agent lives in.
pub trait PageDocument: Send + Sync {
    fn identity(&self) -> PageIdentity;
    /// Video elements currently present, in document order.
    fn media_elements(&self) -> Vec<Arc<dyn MediaElement>>;
}

#[derive(Debug, Clone, PartialEq)]
struct PinnedRate {
    href: String,
    rate: f64,
}

struct AgentInner {
    document: Arc<dyn PageDocument>,
    pinned: Mutex<Option<PinnedRate>>,
}

impl AgentInner {
    fn pinned(&self) -> MutexGuard<'_, Option<PinnedRate>> {
        self.pinned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, rate: f64) -> usize {
        if let Err(err) = validate_rate(rate) {
            warn!(event = "agent_rate_rejected", error = %err);
            return 0;
        }
        let href = self.document.identity().href;
        let elements = self.document.media_elements();
        for element in &elements {
            element.set_playback_rate(rate);
        }
        *self.pinned() = Some(PinnedRate {
            href: href.clone(),
            rate,
        });
        debug!(event = "agent_rate_applied", href = %href, rate, elements = elements.len());
        elements.len()
    }
}

/// One agent per browsing context.
///
/// Inbound messages come from the surface or the backend, neither of which
/// is a browsing context, so the agent's responder accepts every sender.
#[derive(Clone)]
pub struct PageAgent {
    inner: Arc<AgentInner>,
    responder: Arc<Responder<PlaybackSchema>>,
}

impl PageAgent {
    pub fn install(document: Arc<dyn PageDocument>) -> Self {
        Self::with_responder(document, Arc::new(Responder::accept_all()))
    }

    /// Registers the agent's listeners on an existing responder.
    pub fn with_responder(
        document: Arc<dyn PageDocument>,
        responder: Arc<Responder<PlaybackSchema>>,
    ) -> Self {
        let inner = Arc::new(AgentInner {
            document,
            pinned: Mutex::new(None),
        });

        let applier = inner.clone();
        responder.add_event_listener(listener::<ChangePlayback, _>(move |params, _, reply| {
            applier.apply(params.playback_rate);
            reply.send(());
        }));

        let reporter = inner.clone();
        responder.add_event_listener(listener::<GetUri, _>(move |_, _, reply| {
            reply.send(reporter.document.identity());
        }));

        Self { inner, responder }
    }

    pub fn responder(&self) -> &Arc<Responder<PlaybackSchema>> {
        &self.responder
    }

    /// Sets every media element's rate and pins it for later `play` events.
    /// Returns the number of elements touched.
    pub fn apply(&self, rate: f64) -> usize {
        self.inner.apply(rate)
    }

    pub fn pinned_rate(&self) -> Option<f64> {
        let href = self.inner.document.identity().href;
        self.inner
            .pinned()
            .as_ref()
            .filter(|pinned| pinned.href == href)
            .map(|pinned| pinned.rate)
    }

    /// Hook for a media element starting to play. Sites commonly reset the
    /// rate on play, so the pinned rate for the current URL goes back on.
    pub fn on_play(&self, element: &dyn MediaElement) -> bool {
        let Some(rate) = self.pinned_rate() else {
            return false;
        };
        if element.playback_rate() != rate {
            element.set_playback_rate(rate);
        }
        true
    }

    pub fn dispatch(&self, inbound: Inbound) -> usize {
        self.responder.dispatch(inbound)
    }

    pub async fn serve(&self, inbox: mpsc::UnboundedReceiver<Inbound>) {
        self.responder.run(inbox).await;
    }
}
