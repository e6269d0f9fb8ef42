//! Shared types crossing the component boundary.
//!
//! JSON payloads (action bodies, link parameters, events) are opaque
//! strings at this layer: the manager routes them, components interpret
//! them.  Only the wire-framing bytes and the producer id are ever parsed
//! by the manager itself.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds since the unix epoch, fractional.
pub type Timestamp = f64;

/// Stable identifier of a link, assigned by the host SDK.
pub type LinkId = String;

/// Stable identifier of a connection, assigned by the host SDK.
pub type ConnectionId = String;

/// MIME-style encoding type, e.g. `"image/jpeg"` or `"*/*"`.
pub type EncodingType = String;

/// Opaque JSON carried between components.
pub type JsonString = String;

/// Handle correlating an asynchronous request with its later callback.
pub type SdkHandle = u64;

/// Handle value meaning "no correlation".
pub const NULL_SDK_HANDLE: SdkHandle = 0;

/// Current wall-clock time as a [`Timestamp`].
pub fn now_ts() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ── Actions ───────────────────────────────────────────────────────────────────

/// A transport-scheduled opportunity to transmit content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// When the transport intends to perform this action.
    pub timestamp: Timestamp,
    /// Unique id assigned by the user model.
    pub action_id: u64,
    /// Opaque action body interpreted by the transport.
    pub json: JsonString,
}

/// A finite, time-ordered list of actions inside a window.
pub type ActionTimeline = Vec<Action>;

// ── Encoding parameters & properties ─────────────────────────────────────────

/// Per-payload guidance handed to an encoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodingParameters {
    /// Link this content is destined for; `"*"` means any link.
    pub link_id: LinkId,
    /// Encoding type, matched against encoder properties by MIME rules.
    pub encoding_type: EncodingType,
    /// Whether the encoded content carries a package body.
    pub encode_package: bool,
    /// Opaque parameter payload for the encoder.
    pub json: JsonString,
}

/// Global properties of an encoding component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodingProperties {
    /// Worst-case seconds this encoder needs to produce content.
    pub encoding_time: f64,
    /// Advertised encoding type, matched by MIME rules.
    pub encoding_type: EncodingType,
}

/// Parameter-specific properties of an encoding component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecificEncodingProperties {
    /// How many payload bytes fit in content produced with these params.
    pub max_bytes: usize,
}

// ── Transport & user-model properties ────────────────────────────────────────

/// Properties advertised by a transport component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportProperties {
    /// Action class name → ordered encoding types used by that class.
    pub supported_actions: HashMap<String, Vec<EncodingType>>,
}

/// Properties advertised by a user-model component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserModelProperties {
    /// Seconds of timeline returned by a single fetch.
    pub timeline_length: f64,
    /// Seconds between timeline re-fetches.
    pub timeline_fetch_period: f64,
}

impl Default for UserModelProperties {
    fn default() -> Self {
        Self {
            timeline_length: 600.0,
            timeline_fetch_period: 300.0,
        }
    }
}

// ── Opaque envelopes ─────────────────────────────────────────────────────────

/// An external event the transport forwards to the user model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub json: JsonString,
}

/// Link characteristics the transport reports alongside link status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkParameters {
    pub json: JsonString,
}

/// Channel-scoped link properties. Opaque to the manager; fetched from the
/// transport and surfaced to the host on link and connection status changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkProperties {
    pub json: JsonString,
}

/// An opaque encrypted package: the unit the host sends and receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncPkg(Vec<u8>);

impl EncPkg {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn size(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for EncPkg {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

// ── Statuses ─────────────────────────────────────────────────────────────────

/// Hint passed with `open_connection`; accepted but not interpreted here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    #[default]
    Undef,
    Send,
    Recv,
    Bidi,
}

/// Channel lifecycle as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Undef,
    /// All components started; the channel is usable.
    Available,
    /// Enabled but not activated.
    Enabled,
    Disabled,
    Starting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Undef,
    Created,
    Loaded,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Undef,
    Open,
    Closed,
}

/// Terminal and transit states of a package or fragment on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageStatus {
    Undef,
    Sent,
    Received,
    FailedGeneric,
    FailedTimeout,
}

/// Result of an encode or decode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingStatus {
    Ok,
    Failed,
}

/// Return status of a component call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    Ok,
    /// Recoverable; reported to the host as an async error.
    Error,
    /// Unrecoverable; fails the whole channel.
    Fatal,
}

/// Lifecycle state a component reports through `update_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Init,
    Started,
    Failed,
}

/// Outcome of a plugin-surface call, as seen by the host SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginResponse {
    Ok,
    Error,
    /// Transient rejection; retry after `unblock_queue`.
    TempError,
    /// The manager is failed; no further calls will succeed.
    Fatal,
}

// ── Encoding mode ────────────────────────────────────────────────────────────

/// Wire-level framing policy, fixed per manager instance.
///
/// `Single` places one unframed package per action. `Batch` packs whole
/// length-prefixed packages into an action. The fragment modes additionally
/// split packages across actions, prefixing each action's payload with a
/// per-link fragment counter and continuation flags; the multi-producer
/// variant also prepends the link's 16-byte producer id so receivers can
/// keep per-sender reassembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingMode {
    Single,
    Batch,
    FragmentSingleProducer,
    FragmentMultipleProducer,
}

impl Default for EncodingMode {
    fn default() -> Self {
        EncodingMode::FragmentSingleProducer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enc_pkg_roundtrip() {
        let pkg = EncPkg::new(vec![1, 2, 3]);
        assert_eq!(pkg.size(), 3);
        assert_eq!(pkg.as_bytes(), &[1, 2, 3]);
        assert_eq!(pkg.into_bytes(), vec![1, 2, 3]);
    }

    #[test]
    fn user_model_defaults() {
        let props = UserModelProperties::default();
        assert_eq!(props.timeline_length, 600.0);
        assert_eq!(props.timeline_fetch_period, 300.0);
    }

    #[test]
    fn encoding_mode_default_is_single_producer_fragmenting() {
        assert_eq!(EncodingMode::default(), EncodingMode::FragmentSingleProducer);
    }

    #[test]
    fn now_ts_is_positive() {
        assert!(now_ts() > 0.0);
    }
}
