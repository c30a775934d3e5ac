use crate::{MediaElement, PageDocument};
use pbr_core::{IdentityError, PageIdentity, DEFAULT_PLAYBACK_RATE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A media element with nothing behind it but its rate.
#[derive(Debug)]
pub struct HeadlessMedia {
    rate_bits: AtomicU64,
}

impl Default for HeadlessMedia {
    fn default() -> Self {
        Self {
            rate_bits: AtomicU64::new(DEFAULT_PLAYBACK_RATE.to_bits()),
        }
    }
}

impl MediaElement for HeadlessMedia {
    fn playback_rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::SeqCst))
    }

    fn set_playback_rate(&self, rate: f64) {
        self.rate_bits.store(rate.to_bits(), Ordering::SeqCst);
    }
}

/// A document without a renderer, driven entirely by its owner.
#[derive(Debug)]
pub struct HeadlessDocument {
    identity: Mutex<PageIdentity>,
    media: Mutex<Vec<Arc<HeadlessMedia>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl HeadlessDocument {
    pub fn new(href: &str) -> Result<Self, IdentityError> {
        Ok(Self {
            identity: Mutex::new(PageIdentity::from_href(href)?),
            media: Mutex::new(Vec::new()),
        })
    }

    /// Same-document navigation: the media elements stay.
    pub fn navigate(&self, href: &str) -> Result<(), IdentityError> {
        *lock(&self.identity) = PageIdentity::from_href(href)?;
        Ok(())
    }

    pub fn add_media(&self, media: HeadlessMedia) -> Arc<HeadlessMedia> {
        let media = Arc::new(media);
        lock(&self.media).push(media.clone());
        media
    }

    pub fn media(&self) -> Vec<Arc<HeadlessMedia>> {
        lock(&self.media).clone()
    }
}

impl PageDocument for HeadlessDocument {
    fn identity(&self) -> PageIdentity {
        lock(&self.identity).clone()
    }

    fn media_elements(&self) -> Vec<Arc<dyn MediaElement>> {
        lock(&self.media)
            .iter()
            .map(|media| media.clone() as Arc<dyn MediaElement>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_hrefs_without_host() {
        assert!(HeadlessDocument::new("about:blank").is_err());
        let document = HeadlessDocument::new("https://example.com/").expect("href");
        assert!(document.navigate("not a url").is_err());
        assert_eq!(document.identity().hostname, "example.com");
    }
}
