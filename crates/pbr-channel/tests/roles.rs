use pbr_channel::{
    listener, Broadcaster, ChannelError, LocalRuntime, Requester, RequesterConfig, Responder,
};
use pbr_core::channel_ipc::ChannelMessage;
use pbr_core::schema::{ChangePlayback, ChangePlaybackParams, GetUri, GetUriParams, PlaybackSchema};
use pbr_core::PageIdentity;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn page_responder(identity: PageIdentity, applied: Arc<Mutex<Vec<f64>>>) -> Arc<Responder<PlaybackSchema>> {
    let responder = Arc::new(Responder::<PlaybackSchema>::accept_all());
    responder.add_event_listener(listener::<GetUri, _>(move |_, _, reply| {
        reply.send(identity.clone());
    }));
    responder.add_event_listener(listener::<ChangePlayback, _>(move |params, _, _| {
        applied.lock().expect("lock").push(params.playback_rate);
    }));
    responder
}

#[tokio::test]
async fn requester_talks_to_the_active_page_only() {
    let runtime = LocalRuntime::new();
    let transport = Arc::new(runtime.clone());

    let first_applied = Arc::new(Mutex::new(Vec::new()));
    let second_applied = Arc::new(Mutex::new(Vec::new()));
    let first = runtime.open_context("https://example.com/a");
    let second = runtime.open_context("https://other.test/");
    let second_id = second.id();

    for (handle, identity, applied) in [
        (
            first,
            PageIdentity::new("https://example.com/a", "example.com"),
            first_applied.clone(),
        ),
        (
            second,
            PageIdentity::new("https://other.test/", "other.test"),
            second_applied.clone(),
        ),
    ] {
        let responder = page_responder(identity, applied);
        let inbox = handle.into_inbox();
        tokio::spawn(async move { responder.run(inbox).await });
    }

    let requester = Requester::<PlaybackSchema>::new(transport.clone());
    assert_eq!(
        requester.request::<GetUri>(GetUriParams {}).await,
        Err(ChannelError::NoActiveContext)
    );

    runtime.activate(second_id);
    let identity = requester
        .request::<GetUri>(GetUriParams {})
        .await
        .expect("identity");
    assert_eq!(identity.hostname, "other.test");

    // Fire-and-forget: the pending response is dropped unawaited.
    drop(
        requester
            .send::<ChangePlayback>(&ChangePlaybackParams { playback_rate: 2.5 })
            .expect("send"),
    );
    let broadcaster = Broadcaster::<PlaybackSchema>::new(transport);
    let ack = broadcaster
        .request::<ChangePlayback>(ChangePlaybackParams { playback_rate: 1.0 })
        .await
        .expect("ack");
    assert_eq!(ack.delivered, 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*first_applied.lock().expect("lock"), vec![1.0]);
    assert_eq!(*second_applied.lock().expect("lock"), vec![2.5, 1.0]);
}

#[tokio::test]
async fn unanswered_event_reports_no_response() {
    let runtime = LocalRuntime::new();
    let page = runtime.open_context("https://example.com/");
    runtime.activate(page.id());

    // No getURI listener on this page.
    let responder = Arc::new(Responder::<PlaybackSchema>::accept_all());
    let inbox = page.into_inbox();
    let worker = responder.clone();
    tokio::spawn(async move { worker.run(inbox).await });

    let requester = Requester::<PlaybackSchema>::with_config(
        Arc::new(runtime),
        RequesterConfig {
            timeout: Duration::from_secs(1),
        },
    );
    assert_eq!(
        requester.request::<GetUri>(GetUriParams {}).await,
        Err(ChannelError::NoResponse { event: "getURI" })
    );
}

#[tokio::test]
async fn client_inbound_only_hears_the_active_page() {
    let runtime = LocalRuntime::new();
    let active = runtime.open_context("https://example.com/a");
    let background = runtime.open_context("https://example.com/b");
    runtime.activate(active.id());

    let heard = Arc::new(Mutex::new(Vec::new()));
    let sink = heard.clone();
    let surface = Responder::<PlaybackSchema>::client();
    surface.add_event_listener(listener::<ChangePlayback, _>(move |params, sender, _| {
        sink.lock()
            .expect("lock")
            .push((sender.url.clone(), params.playback_rate));
    }));
    let mut endpoint = runtime.attach_extension();

    let message = |rate: f64| {
        ChannelMessage::for_event::<ChangePlayback>(&ChangePlaybackParams { playback_rate: rate })
            .expect("frame")
    };
    background.send_to_extension(message(3.0));
    active.send_to_extension(message(0.5));
    assert_eq!(endpoint.pump(&surface), 2);

    assert_eq!(
        *heard.lock().expect("lock"),
        vec![(Some("https://example.com/a".to_string()), 0.5)]
    );
}
