use crate::registry::{SessionKey, SessionRegistry};
use crate::session::SessionInit;
use crate::SessionError;
use pbr_channel::Requester;
use pbr_core::schema::{GetUri, GetUriParams, PlaybackSchema};
use pbr_core::{PageIdentity, SiteProfile};
use pbr_storage::ProfileStore;
use tracing::info;

/// The rate the page should be switched to when a surface opens on it: its
/// own override, else the site default. A hostname seen for the first time
/// gets a default profile stored and no rate.
pub fn initial_playback(
    store: &dyn ProfileStore,
    page: &PageIdentity,
) -> Result<Option<f64>, SessionError> {
    let Some(profile) = store.get_profile(&page.hostname)? else {
        store.set_profile(&page.hostname, &SiteProfile::default_for(&page.hostname))?;
        return Ok(None);
    };
    Ok(Some(profile.effective_rate(&page.href)))
}

/// Asks the active page who it is, syncs its rate to the stored preference
/// and activates a session for it.
pub async fn open_surface(
    requester: &Requester<PlaybackSchema>,
    registry: &mut SessionRegistry,
    favicon_url: Option<String>,
) -> Result<SessionKey, SessionError> {
    let page = requester.request::<GetUri>(GetUriParams {}).await?;
    if let Some(rate) = initial_playback(registry.store().as_ref(), &page)? {
        registry.notifier().change_playback(rate);
    }
    info!(event = "surface_open", hostname = %page.hostname, href = %page.href);

    let init = SessionInit {
        hostname: page.hostname,
        url: page.href,
        favicon_url,
    };
    let key = SessionKey::from(&init);
    registry.activate(init)?;
    Ok(key)
}
