//! Shared test doubles: a scripted transport / user model / identity
//! encoding, and a recording host SDK.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use calyx::components::sdk::{EncodingSdk, TransportSdk, UserModelSdk};
use calyx::components::{
    ComponentFactories, Encoding, EncodingFactory, Transport, TransportFactory, UserModel,
    UserModelFactory,
};
use calyx::sdk::{ChannelProperties, ChannelSdk};
use calyx::types::*;
use calyx::{ChannelManager, Composition, PluginConfig};

pub const CHANNEL: &str = "calyxTestChannel";
pub const ROLE: &str = "default";
pub const ACTIVATE_HANDLE: SdkHandle = 2;

pub const OCTET_STREAM: &str = "application/octet-stream";

// ── Recording host SDK ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct Recorder {
    pub channel_status: Vec<(SdkHandle, String, ChannelStatus)>,
    pub link_status: Vec<(SdkHandle, LinkId, LinkStatus)>,
    pub conn_status: Vec<(SdkHandle, ConnectionId, ConnectionStatus)>,
    pub package_status: Vec<(SdkHandle, PackageStatus)>,
    pub received: Vec<(Vec<u8>, Vec<ConnectionId>)>,
    pub unblocked: Vec<ConnectionId>,
    pub async_errors: Vec<PluginResponse>,
    /// `(key, prompt, cache)` per plugin user-input request, with the
    /// handle the mock returned.
    pub user_input_requests: Vec<(String, String, bool, SdkHandle)>,
}

pub struct MockSdk {
    recorder: Arc<Mutex<Recorder>>,
    next_id: AtomicU64,
    next_entropy: AtomicU64,
}

impl MockSdk {
    pub fn new(recorder: Arc<Mutex<Recorder>>) -> Self {
        Self {
            recorder,
            next_id: AtomicU64::new(0),
            next_entropy: AtomicU64::new(1),
        }
    }
}

impl ChannelSdk for MockSdk {
    fn on_channel_status_changed(
        &self,
        handle: SdkHandle,
        channel_id: &str,
        status: ChannelStatus,
        _props: &ChannelProperties,
    ) {
        self.recorder
            .lock()
            .unwrap()
            .channel_status
            .push((handle, channel_id.to_string(), status));
    }

    fn on_link_status_changed(
        &self,
        handle: SdkHandle,
        link_id: &LinkId,
        status: LinkStatus,
        _props: &LinkProperties,
    ) {
        self.recorder
            .lock()
            .unwrap()
            .link_status
            .push((handle, link_id.clone(), status));
    }

    fn on_connection_status_changed(
        &self,
        handle: SdkHandle,
        conn_id: &ConnectionId,
        status: ConnectionStatus,
        _props: &LinkProperties,
    ) {
        self.recorder
            .lock()
            .unwrap()
            .conn_status
            .push((handle, conn_id.clone(), status));
    }

    fn on_package_status_changed(&self, handle: SdkHandle, status: PackageStatus) {
        self.recorder
            .lock()
            .unwrap()
            .package_status
            .push((handle, status));
    }

    fn receive_enc_pkg(&self, pkg: EncPkg, conn_ids: &[ConnectionId]) {
        self.recorder
            .lock()
            .unwrap()
            .received
            .push((pkg.into_bytes(), conn_ids.to_vec()));
    }

    fn unblock_queue(&self, conn_id: &ConnectionId) {
        self.recorder.lock().unwrap().unblocked.push(conn_id.clone());
    }

    fn async_error(&self, _handle: SdkHandle, status: PluginResponse) {
        self.recorder.lock().unwrap().async_errors.push(status);
    }

    fn generate_link_id(&self, channel_id: &str) -> LinkId {
        format!(
            "{channel_id}/link{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn generate_connection_id(&self, link_id: &LinkId) -> ConnectionId {
        format!(
            "{link_id}/conn{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn get_entropy(&self, count: usize) -> Vec<u8> {
        // deterministic, distinct per call
        let seed = self.next_entropy.fetch_add(1, Ordering::Relaxed) as u8;
        vec![seed; count]
    }

    fn request_plugin_user_input(
        &self,
        key: &str,
        prompt: &str,
        cache: bool,
    ) -> calyx::SdkResponse {
        let handle = 9000 + self.next_id.fetch_add(1, Ordering::Relaxed);
        self.recorder.lock().unwrap().user_input_requests.push((
            key.to_string(),
            prompt.to_string(),
            cache,
            handle,
        ));
        calyx::SdkResponse::ok(handle)
    }
}

// ── Scripted components ──────────────────────────────────────────────────────

/// Scripting surface shared between the test body and the mocks.
#[derive(Default)]
pub struct Harness {
    /// Returned by every user-model timeline fetch.
    pub timeline: Mutex<ActionTimeline>,
    /// Drained by the next `on_send_package` call.
    pub send_actions: Mutex<ActionTimeline>,
    pub transport_sdk: Mutex<Option<TransportSdk>>,
    pub usermodel_sdk: Mutex<Option<UserModelSdk>>,
    pub encoding_sdk: Mutex<Option<EncodingSdk>>,
    /// `(action id, wire payload)` per transport enqueue.
    pub enqueued: Mutex<Vec<(u64, Vec<u8>)>>,
    /// `(action id, fragment handles)` per executed action.
    pub do_actions: Mutex<Vec<(u64, Vec<SdkHandle>)>>,
    /// Components that report failed instead of started.
    pub fail_components: Mutex<Vec<String>>,
    /// Components that stay silent at activation (no state report).
    pub hold_start: Mutex<Vec<String>>,
    /// User-input answers delivered to the transport.
    pub user_inputs: Mutex<Vec<(SdkHandle, bool, String)>>,
    /// Events forwarded to the user model.
    pub events: Mutex<Vec<String>>,
}

impl Harness {
    pub fn transport_sdk(&self) -> TransportSdk {
        self.transport_sdk
            .lock()
            .unwrap()
            .clone()
            .expect("transport sdk not captured yet")
    }

    pub fn usermodel_sdk(&self) -> UserModelSdk {
        self.usermodel_sdk
            .lock()
            .unwrap()
            .clone()
            .expect("user-model sdk not captured yet")
    }

    pub fn encoding_sdk(&self) -> EncodingSdk {
        self.encoding_sdk
            .lock()
            .unwrap()
            .clone()
            .expect("encoding sdk not captured yet")
    }

    pub fn schedule(&self, actions: ActionTimeline) {
        *self.timeline.lock().unwrap() = actions;
    }

    pub fn push_send_actions(&self, actions: ActionTimeline) {
        *self.send_actions.lock().unwrap() = actions;
    }
}

/// Action body understood by the mock transport: `"<link>|<max bytes>"`.
pub fn scheduled_action(ts: Timestamp, id: u64, link: &str, max_bytes: usize) -> Action {
    Action {
        timestamp: ts,
        action_id: id,
        json: format!("{link}|{max_bytes}"),
    }
}

fn initial_state(harness: &Harness, name: &str) -> Option<ComponentState> {
    if harness.hold_start.lock().unwrap().iter().any(|n| n == name) {
        None
    } else if harness
        .fail_components
        .lock()
        .unwrap()
        .iter()
        .any(|n| n == name)
    {
        Some(ComponentState::Failed)
    } else {
        Some(ComponentState::Started)
    }
}

pub struct MockTransport {
    harness: Arc<Harness>,
    sdk: TransportSdk,
}

impl Transport for MockTransport {
    fn transport_properties(&mut self) -> TransportProperties {
        TransportProperties {
            supported_actions: HashMap::from([("post".to_string(), vec!["*/*".to_string()])]),
        }
    }

    fn link_properties(&mut self, link_id: &LinkId) -> LinkProperties {
        LinkProperties {
            json: serde_json::json!({"reliable": false, "linkId": link_id}).to_string(),
        }
    }

    fn create_link(&mut self, handle: SdkHandle, link_id: &LinkId) -> ComponentStatus {
        self.sdk
            .on_link_status_changed(handle, link_id, LinkStatus::Created, LinkParameters::default());
        ComponentStatus::Ok
    }

    fn load_link_address(
        &mut self,
        handle: SdkHandle,
        link_id: &LinkId,
        _address: &str,
    ) -> ComponentStatus {
        self.sdk
            .on_link_status_changed(handle, link_id, LinkStatus::Loaded, LinkParameters::default());
        ComponentStatus::Ok
    }

    fn load_link_addresses(
        &mut self,
        handle: SdkHandle,
        link_id: &LinkId,
        _addresses: &[String],
    ) -> ComponentStatus {
        self.sdk
            .on_link_status_changed(handle, link_id, LinkStatus::Loaded, LinkParameters::default());
        ComponentStatus::Ok
    }

    fn create_link_from_address(
        &mut self,
        handle: SdkHandle,
        link_id: &LinkId,
        _address: &str,
    ) -> ComponentStatus {
        self.sdk
            .on_link_status_changed(handle, link_id, LinkStatus::Created, LinkParameters::default());
        ComponentStatus::Ok
    }

    fn destroy_link(&mut self, handle: SdkHandle, link_id: &LinkId) -> ComponentStatus {
        self.sdk.on_link_status_changed(
            handle,
            link_id,
            LinkStatus::Destroyed,
            LinkParameters::default(),
        );
        ComponentStatus::Ok
    }

    fn action_params(&mut self, action: &Action) -> Vec<EncodingParameters> {
        let (link, max_bytes) = action
            .json
            .split_once('|')
            .expect("mock action body must be '<link>|<max>'");
        vec![EncodingParameters {
            link_id: link.to_string(),
            encoding_type: OCTET_STREAM.to_string(),
            encode_package: true,
            json: max_bytes.to_string(),
        }]
    }

    fn enqueue_content(
        &mut self,
        _params: &EncodingParameters,
        action: &Action,
        content: Vec<u8>,
    ) -> ComponentStatus {
        self.harness
            .enqueued
            .lock()
            .unwrap()
            .push((action.action_id, content));
        ComponentStatus::Ok
    }

    fn dequeue_content(&mut self, _action: &Action) -> ComponentStatus {
        ComponentStatus::Ok
    }

    fn do_action(&mut self, fragment_handles: &[SdkHandle], action: &Action) -> ComponentStatus {
        self.harness
            .do_actions
            .lock()
            .unwrap()
            .push((action.action_id, fragment_handles.to_vec()));
        ComponentStatus::Ok
    }

    fn on_user_input_received(
        &mut self,
        handle: SdkHandle,
        answered: bool,
        response: &str,
    ) -> ComponentStatus {
        self.harness
            .user_inputs
            .lock()
            .unwrap()
            .push((handle, answered, response.to_string()));
        ComponentStatus::Ok
    }
}

pub struct MockTransportFactory {
    pub harness: Arc<Harness>,
}

impl TransportFactory for MockTransportFactory {
    fn create_transport(
        &self,
        name: &str,
        sdk: TransportSdk,
        _role_name: &str,
        _config: &PluginConfig,
    ) -> Option<Box<dyn Transport>> {
        *self.harness.transport_sdk.lock().unwrap() = Some(sdk.clone());
        if let Some(state) = initial_state(&self.harness, name) {
            sdk.update_state(state);
        }
        Some(Box::new(MockTransport {
            harness: self.harness.clone(),
            sdk,
        }))
    }
}

pub struct MockUserModel {
    harness: Arc<Harness>,
}

impl UserModel for MockUserModel {
    fn user_model_properties(&mut self) -> UserModelProperties {
        UserModelProperties {
            timeline_length: 60.0,
            timeline_fetch_period: 30.0,
        }
    }

    fn add_link(&mut self, _link_id: &LinkId, _params: &LinkParameters) -> ComponentStatus {
        ComponentStatus::Ok
    }

    fn remove_link(&mut self, _link_id: &LinkId) -> ComponentStatus {
        ComponentStatus::Ok
    }

    fn timeline(&mut self, _start: Timestamp, _end: Timestamp) -> ActionTimeline {
        self.harness.timeline.lock().unwrap().clone()
    }

    fn on_transport_event(&mut self, event: &Event) -> ComponentStatus {
        self.harness.events.lock().unwrap().push(event.json.clone());
        ComponentStatus::Ok
    }

    fn on_send_package(&mut self, _link_id: &LinkId, _bytes: usize) -> ActionTimeline {
        std::mem::take(&mut *self.harness.send_actions.lock().unwrap())
    }
}

pub struct MockUserModelFactory {
    pub harness: Arc<Harness>,
}

impl UserModelFactory for MockUserModelFactory {
    fn create_user_model(
        &self,
        name: &str,
        sdk: UserModelSdk,
        _role_name: &str,
        _config: &PluginConfig,
    ) -> Option<Box<dyn UserModel>> {
        *self.harness.usermodel_sdk.lock().unwrap() = Some(sdk.clone());
        if let Some(state) = initial_state(&self.harness, name) {
            sdk.update_state(state);
        }
        Some(Box::new(MockUserModel {
            harness: self.harness.clone(),
        }))
    }
}

/// Identity codec: encoded content is the input, decoded likewise. The
/// per-parameter capacity comes from the parameter body (set by the mock
/// transport from the scheduled action).
pub struct MockEncoding {
    sdk: EncodingSdk,
}

impl Encoding for MockEncoding {
    fn encoding_properties(&mut self) -> EncodingProperties {
        EncodingProperties {
            encoding_time: 0.0,
            encoding_type: "*/*".to_string(),
        }
    }

    fn properties_for_parameters(
        &mut self,
        params: &EncodingParameters,
    ) -> SpecificEncodingProperties {
        SpecificEncodingProperties {
            max_bytes: params.json.parse().unwrap_or(1024),
        }
    }

    fn encode_bytes(
        &mut self,
        handle: SdkHandle,
        _params: &EncodingParameters,
        bytes: Vec<u8>,
    ) -> ComponentStatus {
        self.sdk.on_bytes_encoded(handle, bytes, EncodingStatus::Ok);
        ComponentStatus::Ok
    }

    fn decode_bytes(
        &mut self,
        handle: SdkHandle,
        _params: &EncodingParameters,
        bytes: Vec<u8>,
    ) -> ComponentStatus {
        self.sdk.on_bytes_decoded(handle, bytes, EncodingStatus::Ok);
        ComponentStatus::Ok
    }
}

pub struct MockEncodingFactory {
    pub harness: Arc<Harness>,
}

impl EncodingFactory for MockEncodingFactory {
    fn create_encoding(
        &self,
        name: &str,
        sdk: EncodingSdk,
        _role_name: &str,
        _config: &PluginConfig,
    ) -> Option<Box<dyn Encoding>> {
        *self.harness.encoding_sdk.lock().unwrap() = Some(sdk.clone());
        if let Some(state) = initial_state(&self.harness, name) {
            sdk.update_state(state);
        }
        Some(Box::new(MockEncoding { sdk }))
    }
}

// ── Channel builder & helpers ────────────────────────────────────────────────

pub struct TestChannel {
    pub manager: ChannelManager,
    pub recorder: Arc<Mutex<Recorder>>,
    pub harness: Arc<Harness>,
}

pub fn build_channel(harness: Harness) -> TestChannel {
    let recorder = Arc::new(Mutex::new(Recorder::default()));
    let harness = Arc::new(harness);
    let sdk = Arc::new(MockSdk::new(recorder.clone()));
    let composition = Composition::new(
        CHANNEL,
        "mockTransport",
        "mockUserModel",
        vec!["mockEncoding".to_string()],
    );
    let factories = ComponentFactories {
        transport: Arc::new(MockTransportFactory {
            harness: harness.clone(),
        }),
        usermodel: Arc::new(MockUserModelFactory {
            harness: harness.clone(),
        }),
        encodings: HashMap::from([(
            "mockEncoding".to_string(),
            Arc::new(MockEncodingFactory {
                harness: harness.clone(),
            }) as Arc<dyn EncodingFactory>,
        )]),
    };
    let manager = ChannelManager::new(sdk, composition, factories);
    TestChannel {
        manager,
        recorder,
        harness,
    }
}

pub async fn init_and_activate(chan: &TestChannel, mode: EncodingMode) {
    let config = PluginConfig {
        encoding_mode: mode,
        ..PluginConfig::default()
    };
    assert_eq!(chan.manager.init(config).await, PluginResponse::Ok);
    assert_eq!(
        chan.manager
            .activate_channel(ACTIVATE_HANDLE, CHANNEL.to_string(), ROLE.to_string()),
        PluginResponse::Ok
    );
    chan.manager.wait_for_callbacks().await;
}

/// Build, init, and activate a channel with default mocks.
pub async fn start_channel(mode: EncodingMode) -> TestChannel {
    let chan = build_channel(Harness::default());
    init_and_activate(&chan, mode).await;
    chan
}

pub async fn create_link(chan: &TestChannel) -> LinkId {
    chan.manager.create_link(10, CHANNEL.to_string());
    chan.manager.wait_for_callbacks().await;
    chan.recorder
        .lock()
        .unwrap()
        .link_status
        .iter()
        .rev()
        .find(|(_, _, s)| matches!(s, LinkStatus::Created | LinkStatus::Loaded))
        .map(|(_, id, _)| id.clone())
        .expect("no link was created")
}

pub async fn open_connection(chan: &TestChannel, link_id: &LinkId) -> ConnectionId {
    chan.manager
        .open_connection(11, LinkType::Bidi, link_id.clone(), String::new(), 0);
    chan.manager.wait_for_callbacks().await;
    chan.recorder
        .lock()
        .unwrap()
        .conn_status
        .iter()
        .rev()
        .find(|(_, _, s)| *s == ConnectionStatus::Open)
        .map(|(_, id, _)| id.clone())
        .expect("no connection was opened")
}

/// Replace the scripted timeline and nudge the manager to re-fetch it.
pub async fn schedule_and_sync(chan: &TestChannel, actions: ActionTimeline) {
    chan.harness.schedule(actions);
    chan.harness.usermodel_sdk().on_timeline_updated();
    chan.manager.wait_for_callbacks().await;
}

/// Encoding parameters as the mock transport emits them for receive paths.
pub fn receive_params(link_id: &LinkId) -> EncodingParameters {
    EncodingParameters {
        link_id: link_id.clone(),
        encoding_type: OCTET_STREAM.to_string(),
        encode_package: true,
        json: String::new(),
    }
}

/// Let the scheduler run for `ms` of wall clock, then drain callbacks.
pub async fn settle(chan: &TestChannel, ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    chan.manager.wait_for_callbacks().await;
}

pub fn now() -> Timestamp {
    now_ts()
}
