//! Component contracts — the three pluggable kinds a channel composes.
//!
//! # Component model
//!
//! A channel is a [`crate::composition::Composition`] of one transport, one
//! user model, and an ordered list of encodings. Each component is owned by
//! a dedicated serial worker task (see [`wrappers`]); the manager only ever
//! talks to a component through its worker queue, so implementations are
//! plain synchronous traits with `&mut self` methods and never need their
//! own locking.
//!
//! Methods that kick off long-running work (encode, decode, link creation,
//! actions) return immediately and report completion later through the
//! component's SDK handle (see [`sdk`]).
//!
//! Factories model the plugin entry points: the lifetime manager calls them
//! during channel activation with the component's SDK handle already wired
//! to the manager. Dynamic library loading is a host concern and lives
//! outside this crate.

pub mod sdk;
pub(crate) mod wrappers;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PluginConfig;
use crate::types::{
    Action, ActionTimeline, ComponentStatus, EncodingParameters, EncodingProperties, Event,
    LinkId, LinkParameters, LinkProperties, SdkHandle, SpecificEncodingProperties, Timestamp,
    TransportProperties, UserModelProperties,
};

use self::sdk::{EncodingSdk, TransportSdk, UserModelSdk};

// ── Contracts ────────────────────────────────────────────────────────────────

/// A transport component: owns links and performs scheduled actions.
pub trait Transport: Send + 'static {
    fn transport_properties(&mut self) -> TransportProperties;

    fn link_properties(&mut self, link_id: &LinkId) -> LinkProperties;

    /// Begin creating a link; report completion via
    /// `on_link_status_changed`.
    fn create_link(&mut self, handle: SdkHandle, link_id: &LinkId) -> ComponentStatus;

    fn load_link_address(
        &mut self,
        handle: SdkHandle,
        link_id: &LinkId,
        address: &str,
    ) -> ComponentStatus;

    fn load_link_addresses(
        &mut self,
        handle: SdkHandle,
        link_id: &LinkId,
        addresses: &[String],
    ) -> ComponentStatus;

    fn create_link_from_address(
        &mut self,
        handle: SdkHandle,
        link_id: &LinkId,
        address: &str,
    ) -> ComponentStatus;

    fn destroy_link(&mut self, handle: SdkHandle, link_id: &LinkId) -> ComponentStatus;

    /// Encoding parameters the manager must satisfy before this action runs.
    fn action_params(&mut self, action: &Action) -> Vec<EncodingParameters>;

    /// Stage encoded content for a future action.
    fn enqueue_content(
        &mut self,
        params: &EncodingParameters,
        action: &Action,
        content: Vec<u8>,
    ) -> ComponentStatus;

    fn dequeue_content(&mut self, action: &Action) -> ComponentStatus;

    /// Execute the action. `fragment_handles` identify the fragments whose
    /// fate the transport must report through `on_package_status_changed`.
    fn do_action(&mut self, fragment_handles: &[SdkHandle], action: &Action) -> ComponentStatus;

    fn on_user_input_received(
        &mut self,
        handle: SdkHandle,
        answered: bool,
        response: &str,
    ) -> ComponentStatus {
        let _ = (handle, answered, response);
        ComponentStatus::Ok
    }
}

/// A user-model component: decides *when* traffic should happen.
pub trait UserModel: Send + 'static {
    fn user_model_properties(&mut self) -> UserModelProperties;

    fn add_link(&mut self, link_id: &LinkId, params: &LinkParameters) -> ComponentStatus;

    fn remove_link(&mut self, link_id: &LinkId) -> ComponentStatus;

    /// All actions intended to happen between `start` and `end`.
    fn timeline(&mut self, start: Timestamp, end: Timestamp) -> ActionTimeline;

    fn on_transport_event(&mut self, event: &Event) -> ComponentStatus;

    /// Hook called when the host submits a package; may return additional
    /// or revised actions to be merged into the timeline.
    fn on_send_package(&mut self, link_id: &LinkId, bytes: usize) -> ActionTimeline {
        let _ = (link_id, bytes);
        ActionTimeline::new()
    }

    fn on_user_input_received(
        &mut self,
        handle: SdkHandle,
        answered: bool,
        response: &str,
    ) -> ComponentStatus {
        let _ = (handle, answered, response);
        ComponentStatus::Ok
    }
}

/// An encoding component: turns bytes into channel-appropriate content and
/// back.
pub trait Encoding: Send + 'static {
    fn encoding_properties(&mut self) -> EncodingProperties;

    fn properties_for_parameters(
        &mut self,
        params: &EncodingParameters,
    ) -> SpecificEncodingProperties;

    /// Encode `bytes` into content; report via `on_bytes_encoded`. The
    /// manager guarantees `bytes` fits the advertised `max_bytes`.
    fn encode_bytes(
        &mut self,
        handle: SdkHandle,
        params: &EncodingParameters,
        bytes: Vec<u8>,
    ) -> ComponentStatus;

    /// Decode received content; report via `on_bytes_decoded`.
    fn decode_bytes(
        &mut self,
        handle: SdkHandle,
        params: &EncodingParameters,
        bytes: Vec<u8>,
    ) -> ComponentStatus;

    fn on_user_input_received(
        &mut self,
        handle: SdkHandle,
        answered: bool,
        response: &str,
    ) -> ComponentStatus {
        let _ = (handle, answered, response);
        ComponentStatus::Ok
    }
}

// ── Factories ────────────────────────────────────────────────────────────────

/// Creates the transport component at activation time. Returning `None`
/// fails the channel.
pub trait TransportFactory: Send + Sync + 'static {
    fn create_transport(
        &self,
        name: &str,
        sdk: TransportSdk,
        role_name: &str,
        config: &PluginConfig,
    ) -> Option<Box<dyn Transport>>;
}

pub trait UserModelFactory: Send + Sync + 'static {
    fn create_user_model(
        &self,
        name: &str,
        sdk: UserModelSdk,
        role_name: &str,
        config: &PluginConfig,
    ) -> Option<Box<dyn UserModel>>;
}

pub trait EncodingFactory: Send + Sync + 'static {
    fn create_encoding(
        &self,
        name: &str,
        sdk: EncodingSdk,
        role_name: &str,
        config: &PluginConfig,
    ) -> Option<Box<dyn Encoding>>;
}

/// Everything needed to instantiate a composition's components.
#[derive(Clone)]
pub struct ComponentFactories {
    pub transport: Arc<dyn TransportFactory>,
    pub usermodel: Arc<dyn UserModelFactory>,
    /// Keyed by encoding component name as listed in the composition.
    pub encodings: HashMap<String, Arc<dyn EncodingFactory>>,
}

// ── MIME matching ────────────────────────────────────────────────────────────

/// Whether an advertised encoding type serves a requested type.
///
/// Both sides are `type/subtype` with `*` as a wildcard on either part;
/// a bare `*` matches anything. Comparison is case-insensitive.
pub fn mime_type_matches(advertised: &str, requested: &str) -> bool {
    fn split(mime: &str) -> (String, String) {
        let lower = mime.trim().to_ascii_lowercase();
        match lower.split_once('/') {
            Some((t, s)) => (t.to_string(), s.to_string()),
            None => (lower, "*".to_string()),
        }
    }

    fn part_matches(a: &str, b: &str) -> bool {
        a == "*" || b == "*" || a == b
    }

    let (at, asub) = split(advertised);
    let (rt, rsub) = split(requested);
    part_matches(&at, &rt) && part_matches(&asub, &rsub)
}
