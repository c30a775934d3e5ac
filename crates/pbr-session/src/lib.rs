//! Per-site playback preferences as an observable session.
//!
//! A [`ViewModelSession`] projects one hostname's stored profile into
//! observable cells and writes every edit back to the store, telling the
//! active page about rate changes that concern it. Sessions live in a
//! [`SessionRegistry`] keyed by hostname and page URL.

pub mod reactive;
mod registry;
mod session;
mod surface;

pub use registry::{SessionKey, SessionRegistry};
pub use session::{SessionInit, ViewModelSession, WebsiteItem};
pub use surface::{initial_playback, open_surface};

use pbr_channel::{ChannelError, Requester};
use pbr_core::schema::{ChangePlayback, ChangePlaybackParams, PlaybackSchema};
use pbr_core::InvalidRate;
use pbr_storage::StorageError;
use thiserror::Error;
use tracing::debug;

/// Where `changePlayback` goes when a watcher decides the active page must
/// follow an edit. Delivery is fire-and-forget.
pub trait PlaybackNotifier: Send + Sync {
    fn change_playback(&self, rate: f64);
}

impl PlaybackNotifier for Requester<PlaybackSchema> {
    fn change_playback(&self, rate: f64) {
        // Failures are logged by the requester; nobody waits for the answer.
        if let Ok(pending) = self.send::<ChangePlayback>(&ChangePlaybackParams {
            playback_rate: rate,
        }) {
            debug!(event = "session_change_playback", rate, context = %pending.target());
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    InvalidRate(#[from] InvalidRate),
    #[error("no item for {0}")]
    UnknownItem(String),
    #[error("an item for {0} already exists")]
    DuplicateItem(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

#[cfg(test)]
pub(crate) mod testing {
    use super::PlaybackNotifier;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        rates: Mutex<Vec<f64>>,
    }

    impl RecordingNotifier {
        pub fn rates(&self) -> Vec<f64> {
            self.rates.lock().expect("lock").clone()
        }
    }

    impl PlaybackNotifier for RecordingNotifier {
        fn change_playback(&self, rate: f64) {
            self.rates.lock().expect("lock").push(rate);
        }
    }
}
