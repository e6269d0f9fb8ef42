//! Channel lifecycle: activation gating, failure, deactivation, shutdown.

mod common;

use calyx::types::*;
use calyx::PluginConfig;
use common::*;

fn count_status(chan: &TestChannel, wanted: ChannelStatus) -> usize {
    chan.recorder
        .lock()
        .unwrap()
        .channel_status
        .iter()
        .filter(|(_, _, s)| *s == wanted)
        .count()
}

#[tokio::test]
async fn activation_reports_channel_available() {
    let chan = start_channel(EncodingMode::FragmentSingleProducer).await;

    let recorder = chan.recorder.lock().unwrap();
    let available: Vec<_> = recorder
        .channel_status
        .iter()
        .filter(|(h, c, s)| *h == ACTIVATE_HANDLE && c == CHANNEL && *s == ChannelStatus::Available)
        .collect();
    assert_eq!(available.len(), 1, "{:?}", recorder.channel_status);
}

#[tokio::test]
async fn channel_waits_for_every_component() {
    let harness = Harness::default();
    harness
        .hold_start
        .lock()
        .unwrap()
        .push("mockEncoding".to_string());
    let chan = build_channel(harness);
    init_and_activate(&chan, EncodingMode::FragmentSingleProducer).await;

    assert_eq!(count_status(&chan, ChannelStatus::Available), 0);

    // the late component reports in; only now does the channel open
    chan.harness
        .encoding_sdk()
        .update_state(ComponentState::Started);
    chan.manager.wait_for_callbacks().await;

    assert_eq!(count_status(&chan, ChannelStatus::Available), 1);
}

#[tokio::test]
async fn failing_components_fail_the_channel_once() {
    let harness = Harness::default();
    harness.fail_components.lock().unwrap().extend([
        "mockTransport".to_string(),
        "mockUserModel".to_string(),
    ]);
    let chan = build_channel(harness);
    init_and_activate(&chan, EncodingMode::FragmentSingleProducer).await;

    assert_eq!(count_status(&chan, ChannelStatus::Available), 0);
    assert_eq!(
        count_status(&chan, ChannelStatus::Failed),
        1,
        "channel failure must be reported exactly once per activation"
    );

    let desc = chan.manager.describe().await;
    assert!(desc.contains("state: failed"), "{desc}");
}

#[tokio::test]
async fn activation_rejects_wrong_channel_id() {
    let chan = build_channel(Harness::default());
    assert_eq!(
        chan.manager.init(PluginConfig::default()).await,
        PluginResponse::Ok
    );
    chan.manager
        .activate_channel(ACTIVATE_HANDLE, "someOtherChannel".to_string(), ROLE.to_string());
    chan.manager.wait_for_callbacks().await;

    {
        let recorder = chan.recorder.lock().unwrap();
        assert!(recorder.channel_status.is_empty());
        assert!(recorder.async_errors.contains(&PluginResponse::Error));
    }
    let desc = chan.manager.describe().await;
    assert!(desc.contains("state: unactivated"), "{desc}");
}

#[tokio::test]
async fn operations_before_init_are_rejected() {
    let chan = build_channel(Harness::default());
    // enqueuing succeeds; the guard rejects at execution time
    chan.manager
        .activate_channel(ACTIVATE_HANDLE, CHANNEL.to_string(), ROLE.to_string());
    chan.manager.wait_for_callbacks().await;

    let recorder = chan.recorder.lock().unwrap();
    assert!(recorder.channel_status.is_empty());
    assert!(recorder.async_errors.contains(&PluginResponse::Error));
}

#[tokio::test]
async fn deactivation_returns_channel_to_enabled() {
    let chan = start_channel(EncodingMode::FragmentSingleProducer).await;
    let link = create_link(&chan).await;

    chan.manager.deactivate_channel(7, CHANNEL.to_string());
    chan.manager.wait_for_callbacks().await;

    {
        let recorder = chan.recorder.lock().unwrap();
        let enabled: Vec<_> = recorder
            .channel_status
            .iter()
            .filter(|(h, c, s)| *h == 7 && c == CHANNEL && *s == ChannelStatus::Enabled)
            .collect();
        assert_eq!(enabled.len(), 1, "{:?}", recorder.channel_status);
    }

    // every sub-manager is empty again and the link is gone
    let desc = chan.manager.describe().await;
    assert!(desc.contains("state: unactivated"), "{desc}");
    assert!(!desc.contains(&link), "{desc}");
    assert!(desc.contains("actions: 0"), "{desc}");

    // post-deactivation operations fail per-call
    chan.manager.create_link(99, CHANNEL.to_string());
    chan.manager.wait_for_callbacks().await;
    assert!(chan
        .recorder
        .lock()
        .unwrap()
        .async_errors
        .contains(&PluginResponse::Error));
}

#[tokio::test]
async fn shutdown_tears_everything_down() {
    let chan = start_channel(EncodingMode::FragmentSingleProducer).await;
    assert_eq!(chan.manager.shutdown().await, PluginResponse::Ok);

    assert_eq!(count_status(&chan, ChannelStatus::Enabled), 1);
    let desc = chan.manager.describe().await;
    assert!(desc.contains("state: shutting-down"), "{desc}");
}

#[tokio::test]
async fn user_input_routes_back_to_requesting_component() {
    let chan = start_channel(EncodingMode::FragmentSingleProducer).await;

    chan.harness
        .transport_sdk()
        .request_plugin_user_input("hostname", "Which hostname?", true);
    chan.manager.wait_for_callbacks().await;

    let request_handle = {
        let recorder = chan.recorder.lock().unwrap();
        let (key, prompt, cache, handle) = recorder.user_input_requests[0].clone();
        assert_eq!(key, "hostname");
        assert_eq!(prompt, "Which hostname?");
        assert!(cache);
        handle
    };

    chan.manager
        .on_user_input_received(request_handle, true, "example.org".to_string());
    chan.manager.wait_for_callbacks().await;

    let inputs = chan.harness.user_inputs.lock().unwrap().clone();
    assert_eq!(inputs.len(), 1);
    assert!(inputs[0].1);
    assert_eq!(inputs[0].2, "example.org");

    // an unknown handle is a per-call error, not a crash
    chan.manager
        .on_user_input_received(424242, false, String::new());
    chan.manager.wait_for_callbacks().await;
    assert!(chan
        .recorder
        .lock()
        .unwrap()
        .async_errors
        .contains(&PluginResponse::Error));
}

#[tokio::test]
async fn transport_events_reach_the_user_model() {
    let chan = start_channel(EncodingMode::FragmentSingleProducer).await;

    chan.harness.transport_sdk().on_event(Event {
        json: r#"{"kind":"window"}"#.to_string(),
    });
    chan.manager.wait_for_callbacks().await;

    assert_eq!(
        chan.harness.events.lock().unwrap().clone(),
        vec![r#"{"kind":"window"}"#.to_string()]
    );
}

#[tokio::test]
async fn unsupported_surface_is_stubbed() {
    let chan = start_channel(EncodingMode::FragmentSingleProducer).await;
    assert_eq!(
        chan.manager.serve_files("l".to_string(), "/tmp/x".to_string()),
        PluginResponse::Error
    );
    assert_eq!(
        chan.manager
            .create_bootstrap_link(1, CHANNEL.to_string(), "pass".to_string()),
        PluginResponse::Error
    );
    assert_eq!(
        chan.manager.flush_channel(1, CHANNEL.to_string(), 0),
        PluginResponse::Ok
    );
}
