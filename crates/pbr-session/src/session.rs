use crate::reactive::{ListChange, Tracked, TrackedList};
use crate::{PlaybackNotifier, SessionError};
use pbr_core::{validate_rate, SiteProfile, SiteRecord};
use pbr_storage::{ProfileStore, StorageError};
use std::sync::Arc;
use tracing::{debug, warn};

/// One slider row: the host default or a per-page override.
#[derive(Debug)]
pub struct WebsiteItem {
    url: String,
    name: Tracked<String>,
    playback_rate: Tracked<f64>,
}

impl WebsiteItem {
    fn new(url: impl Into<String>, name: impl Into<String>, playback_rate: f64) -> Self {
        Self {
            url: url.into(),
            name: Tracked::new(name.into()),
            playback_rate: Tracked::new(playback_rate),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn name(&self) -> &str {
        self.name.get()
    }

    pub fn playback_rate(&self) -> f64 {
        *self.playback_rate.get()
    }

    fn unwatch_all(&mut self) -> usize {
        self.name.unwatch_all() + self.playback_rate.unwatch_all()
    }
}

/// What a session is built from: the active page and its display metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInit {
    pub hostname: String,
    pub url: String,
    pub favicon_url: Option<String>,
}

impl SessionInit {
    pub fn new(hostname: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            url: url.into(),
            favicon_url: None,
        }
    }

    pub fn with_favicon(mut self, favicon_url: impl Into<String>) -> Self {
        self.favicon_url = Some(favicon_url.into());
        self
    }
}

/// What the watchers write through to.
struct Sink {
    hostname: String,
    current_url: String,
    store: Arc<dyn ProfileStore>,
    notifier: Arc<dyn PlaybackNotifier>,
}

impl Sink {
    fn logged(&self, op: &'static str, result: Result<(), StorageError>) {
        if let Err(err) = result {
            warn!(
                event = "session_write_through_failed",
                op,
                hostname = %self.hostname,
                error = %err
            );
        }
    }

    fn item_added(&self, item: &WebsiteItem) {
        let record = SiteRecord::new(item.name(), item.playback_rate());
        self.logged(
            "add_record",
            self.store.add_record(&self.hostname, item.url(), record),
        );
    }

    fn item_removed(&self, item: &WebsiteItem) {
        let result = self
            .store
            .delete_record(&self.hostname, item.url())
            .map(|existed| {
                if !existed {
                    debug!(event = "session_record_already_gone", url = %item.url());
                }
            });
        self.logged("delete_record", result);
    }

    fn default_rate_changed(&self, rate: f64) {
        match self.store.get_record(&self.hostname, &self.current_url) {
            Ok(None) => self.notifier.change_playback(rate),
            Ok(Some(_)) => {}
            Err(err) => warn!(
                event = "session_record_lookup_failed",
                hostname = %self.hostname,
                error = %err
            ),
        }
        let result = self.store.update_profile(&self.hostname, &mut |profile| {
            profile.default_rate = rate;
            profile.children.clear();
        });
        self.logged("update_profile", result.map(drop));
    }

    fn host_renamed(&self, name: &str) {
        let result = self.store.update_profile(&self.hostname, &mut |profile| {
            profile.name = name.to_string();
        });
        self.logged("update_profile", result.map(drop));
    }

    fn item_rate_changed(&self, url: &str, rate: f64) {
        if url == self.current_url {
            self.notifier.change_playback(rate);
        }
        let result = self.store.update_record(&self.hostname, url, &mut |record| {
            record.playback_rate = rate;
        });
        self.logged("update_record", result.map(drop));
    }

    fn item_renamed(&self, url: &str, name: &str) {
        let result = self.store.update_record(&self.hostname, url, &mut |record| {
            record.name = name.to_string();
        });
        self.logged("update_record", result.map(drop));
    }
}

fn watch_item(sink: &Arc<Sink>, item: &mut WebsiteItem) {
    let rate_sink = sink.clone();
    let url = item.url.clone();
    item.playback_rate
        .watch(move |rate: &f64| rate_sink.item_rate_changed(&url, *rate));

    let name_sink = sink.clone();
    let url = item.url.clone();
    item.name
        .watch(move |name: &String| name_sink.item_renamed(&url, name));
}

/// Observable projection of one hostname's [`SiteProfile`].
///
/// Every effective mutation is written through to the store while the
/// session is live. The store is never read back, so external writes are not
/// reflected. After [`dispose`](Self::dispose) mutations only touch memory.
#[derive(Debug)]
pub struct ViewModelSession {
    current_url: String,
    current_domain: String,
    current_name: String,
    favicon_url: Option<String>,
    host_website: WebsiteItem,
    website_items: TrackedList<WebsiteItem>,
    disposed: bool,
}

impl ViewModelSession {
    pub fn open(
        init: SessionInit,
        store: Arc<dyn ProfileStore>,
        notifier: Arc<dyn PlaybackNotifier>,
    ) -> Result<Self, SessionError> {
        let profile = store
            .get_profile(&init.hostname)?
            .unwrap_or_else(|| SiteProfile::default_for(&init.hostname));

        let current_name = if profile.name.is_empty() {
            init.hostname.clone()
        } else {
            profile.name.clone()
        };
        let host_website =
            WebsiteItem::new(init.hostname.as_str(), profile.name, profile.default_rate);
        let website_items = profile
            .children
            .into_iter()
            .map(|(url, record)| WebsiteItem::new(url, record.name, record.playback_rate))
            .collect();

        let mut session = Self {
            current_url: init.url.clone(),
            current_domain: init.hostname.clone(),
            current_name,
            favicon_url: init.favicon_url,
            host_website,
            website_items: TrackedList::new(website_items),
            disposed: false,
        };
        session.install_watchers(Arc::new(Sink {
            hostname: init.hostname,
            current_url: init.url,
            store,
            notifier,
        }));
        debug!(
            event = "session_open",
            hostname = %session.current_domain,
            url = %session.current_url,
            items = session.website_items.len()
        );
        Ok(session)
    }

    fn install_watchers(&mut self, sink: Arc<Sink>) {
        let list_sink = sink.clone();
        self.website_items
            .watch(move |change: ListChange<'_, WebsiteItem>| match change {
                ListChange::Pushed(item) => {
                    watch_item(&list_sink, item);
                    list_sink.item_added(item);
                }
                ListChange::Removed(item) => list_sink.item_removed(item),
            });

        let rate_sink = sink.clone();
        self.host_website
            .playback_rate
            .watch(move |rate: &f64| rate_sink.default_rate_changed(*rate));
        let name_sink = sink.clone();
        self.host_website
            .name
            .watch(move |name: &String| name_sink.host_renamed(name));

        for item in self.website_items.iter_mut() {
            watch_item(&sink, item);
        }
    }

    pub fn current_url(&self) -> &str {
        &self.current_url
    }

    pub fn current_domain(&self) -> &str {
        &self.current_domain
    }

    /// Display title: the profile name, or the hostname when it has none.
    pub fn current_name(&self) -> &str {
        &self.current_name
    }

    pub fn favicon_url(&self) -> Option<&str> {
        self.favicon_url.as_deref()
    }

    pub fn host_website(&self) -> &WebsiteItem {
        &self.host_website
    }

    pub fn website_items(&self) -> &[WebsiteItem] {
        self.website_items.items()
    }

    pub fn item(&self, url: &str) -> Option<&WebsiteItem> {
        self.website_items.items().iter().find(|item| item.url == url)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Changes the site-wide default. Every per-page override of the
    /// hostname is dropped from the store.
    pub fn set_default_rate(&mut self, rate: f64) -> Result<bool, SessionError> {
        let rate = validate_rate(rate)?;
        Ok(self.host_website.playback_rate.set(rate))
    }

    pub fn rename_host(&mut self, name: impl Into<String>) -> bool {
        self.host_website.name.set(name.into())
    }

    pub fn set_item_rate(&mut self, url: &str, rate: f64) -> Result<bool, SessionError> {
        let rate = validate_rate(rate)?;
        let item = self
            .website_items
            .find_mut(|item| item.url == url)
            .ok_or_else(|| SessionError::UnknownItem(url.to_string()))?;
        Ok(item.playback_rate.set(rate))
    }

    pub fn rename_item(&mut self, url: &str, name: impl Into<String>) -> Result<bool, SessionError> {
        let item = self
            .website_items
            .find_mut(|item| item.url == url)
            .ok_or_else(|| SessionError::UnknownItem(url.to_string()))?;
        Ok(item.name.set(name.into()))
    }

    /// Appends a per-page override at the end of the sequence.
    pub fn push_item(
        &mut self,
        url: impl Into<String>,
        name: impl Into<String>,
        playback_rate: f64,
    ) -> Result<(), SessionError> {
        let url = url.into();
        let playback_rate = validate_rate(playback_rate)?;
        if self.item(&url).is_some() {
            return Err(SessionError::DuplicateItem(url));
        }
        self.website_items
            .push(WebsiteItem::new(url, name, playback_rate));
        Ok(())
    }

    /// Removes the override for `url`, wherever it sits in the sequence.
    pub fn remove_item(&mut self, url: &str) -> Option<WebsiteItem> {
        self.website_items.remove_where(|item| item.url == url)
    }

    /// Removes every watcher. Returns how many were installed.
    pub fn dispose(&mut self) -> usize {
        if self.disposed {
            return 0;
        }
        self.disposed = true;
        let mut removed = self.website_items.unwatch_all() + self.host_website.unwatch_all();
        for item in self.website_items.iter_mut() {
            removed += item.unwatch_all();
        }
        debug!(event = "session_disposed", hostname = %self.current_domain, watchers = removed);
        removed
    }
}
