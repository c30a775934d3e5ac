use pbr_agent::{HeadlessDocument, HeadlessMedia, MediaElement, PageAgent, PageDocument};
use pbr_channel::{LocalRuntime, Requester};
use pbr_core::schema::PlaybackSchema;
use pbr_core::{SiteProfile, SiteRecord};
use pbr_session::{open_surface, SessionInit, SessionKey, SessionRegistry};
use pbr_storage::{MemoryProfileStore, ProfileStore, SqliteProfileStore};
use std::sync::Arc;
use std::time::Duration;

struct Page {
    document: Arc<HeadlessDocument>,
    video: Arc<HeadlessMedia>,
    agent: PageAgent,
}

fn spawn_page(runtime: &LocalRuntime, href: &str) -> Page {
    let document = Arc::new(HeadlessDocument::new(href).expect("href"));
    let video = document.add_media(HeadlessMedia::default());
    let handle = runtime.open_context(href);
    runtime.activate(handle.id());
    let agent = PageAgent::install(document.clone());
    let inbox = handle.into_inbox();
    let server = agent.clone();
    tokio::spawn(async move { server.serve(inbox).await });
    Page {
        document,
        video,
        agent,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn example_com_scenario() {
    let runtime = LocalRuntime::new();
    let page = spawn_page(&runtime, "https://example.com/a");
    let requester = Arc::new(Requester::<PlaybackSchema>::new(Arc::new(runtime.clone())));
    let store = Arc::new(MemoryProfileStore::new());
    let mut registry = SessionRegistry::new(store.clone(), requester.clone());

    let key = open_surface(&requester, &mut registry, None)
        .await
        .expect("surface");
    assert_eq!(key, SessionKey::new("example.com", "https://example.com/a"));
    // First visit: default profile stored, page left alone.
    assert_eq!(
        store.get_profile("example.com").expect("get"),
        Some(SiteProfile::default_for("example.com"))
    );

    let session = registry.get_mut(&key).expect("session");
    session.set_default_rate(2.0).expect("rate");
    settle().await;
    assert_eq!(page.video.playback_rate(), 2.0);
    let profile = store.get_profile("example.com").expect("get").expect("profile");
    assert_eq!(profile.name, "example.com");
    assert_eq!(profile.default_rate, 2.0);
    assert!(profile.children.is_empty());

    let session = registry.get_mut(&key).expect("session");
    session
        .push_item("https://example.com/b", "B", 1.5)
        .expect("push");
    settle().await;
    assert_eq!(page.video.playback_rate(), 2.0);
    assert_eq!(
        store
            .get_record("example.com", "https://example.com/b")
            .expect("get"),
        Some(SiteRecord::new("B", 1.5))
    );

    let session = registry.get_mut(&key).expect("session");
    session.set_default_rate(3.0).expect("rate");
    settle().await;
    assert_eq!(page.video.playback_rate(), 3.0);
    let profile = store.get_profile("example.com").expect("get").expect("profile");
    assert_eq!(profile.default_rate, 3.0);
    assert!(profile.children.is_empty());

    assert_eq!(registry.teardown_all(), 1);
    assert_eq!(page.document.identity().href, "https://example.com/a");
}

#[tokio::test]
async fn reopening_restores_the_page_override() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("profiles.sqlite");
    let store: Arc<dyn ProfileStore> = Arc::new(SqliteProfileStore::open(&path).expect("open"));
    store
        .add_record("video.test", "https://video.test/watch", SiteRecord::new("Talk", 1.5))
        .expect("seed");

    let runtime = LocalRuntime::new();
    let page = spawn_page(&runtime, "https://video.test/watch");
    let requester = Arc::new(Requester::<PlaybackSchema>::new(Arc::new(runtime.clone())));
    let mut registry = SessionRegistry::new(store.clone(), requester.clone());

    let key = open_surface(&requester, &mut registry, Some("https://video.test/favicon.ico".into()))
        .await
        .expect("surface");
    settle().await;
    assert_eq!(page.video.playback_rate(), 1.5);

    let session = registry.get(&key).expect("session");
    assert_eq!(session.favicon_url(), Some("https://video.test/favicon.ico"));
    assert_eq!(session.website_items().len(), 1);

    // The page resets its rate when playback starts; the pinned rate wins.
    page.video.set_playback_rate(1.0);
    assert!(page.agent.on_play(page.video.as_ref()));
    assert_eq!(page.video.playback_rate(), 1.5);

    let session = registry.get_mut(&key).expect("session");
    session
        .set_item_rate("https://video.test/watch", 2.5)
        .expect("rate");
    settle().await;
    assert_eq!(page.video.playback_rate(), 2.5);
    drop(registry);

    let reopened = SqliteProfileStore::open(&path).expect("reopen");
    assert_eq!(
        reopened
            .get_record("video.test", "https://video.test/watch")
            .expect("get"),
        Some(SiteRecord::new("Talk", 2.5))
    );
}

#[tokio::test]
async fn surface_without_active_page_fails_cleanly() {
    let runtime = LocalRuntime::new();
    let requester = Arc::new(Requester::<PlaybackSchema>::new(Arc::new(runtime)));
    let store = Arc::new(MemoryProfileStore::new());
    let mut registry = SessionRegistry::new(store.clone(), requester.clone());

    let result = open_surface(&requester, &mut registry, None).await;
    assert!(matches!(result, Err(pbr_session::SessionError::Channel(_))));
    assert!(registry.is_empty());
    assert!(store.is_empty());

    // Sessions still work without a page; dispatches just fail and are logged.
    let session = registry
        .activate(SessionInit::new("example.com", "https://example.com/"))
        .expect("activate");
    session.set_default_rate(2.0).expect("rate");
    assert_eq!(store.get_profile("example.com").expect("get").map(|p| p.default_rate), Some(2.0));
}
