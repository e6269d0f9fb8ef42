//! Host SDK boundary — everything the manager calls *up* into.
//!
//! The host implements [`ChannelSdk`] once and hands it to the manager as
//! an `Arc`. All callbacks are invoked from the manager's dispatcher task
//! and must not block for long; hosts that need to do real work should
//! hand off internally.

use rand_core::{OsRng, RngCore};
use uuid::Uuid;

use crate::types::{
    ChannelStatus, ConnectionId, ConnectionStatus, EncPkg, JsonString, LinkId, LinkProperties,
    LinkStatus, PackageStatus, PluginResponse, SdkHandle, NULL_SDK_HANDLE,
};

/// Channel-wide properties surfaced with channel status changes. Opaque to
/// the manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelProperties {
    pub json: JsonString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkStatus {
    Ok,
    Error,
}

/// Result of a request made to the host (e.g. user input), carrying the
/// handle under which the answer will come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdkResponse {
    pub status: SdkStatus,
    pub handle: SdkHandle,
}

impl SdkResponse {
    pub fn ok(handle: SdkHandle) -> Self {
        Self {
            status: SdkStatus::Ok,
            handle,
        }
    }

    pub fn error() -> Self {
        Self {
            status: SdkStatus::Error,
            handle: NULL_SDK_HANDLE,
        }
    }
}

/// Callbacks and services the host SDK provides to a channel manager.
pub trait ChannelSdk: Send + Sync + 'static {
    fn on_channel_status_changed(
        &self,
        handle: SdkHandle,
        channel_id: &str,
        status: ChannelStatus,
        props: &ChannelProperties,
    );

    fn on_link_status_changed(
        &self,
        handle: SdkHandle,
        link_id: &LinkId,
        status: LinkStatus,
        props: &LinkProperties,
    );

    fn on_connection_status_changed(
        &self,
        handle: SdkHandle,
        conn_id: &ConnectionId,
        status: ConnectionStatus,
        props: &LinkProperties,
    );

    /// One terminal status per package handle, in assignment order.
    fn on_package_status_changed(&self, handle: SdkHandle, status: PackageStatus);

    /// Deliver a reassembled inbound package with the connections it
    /// arrived on.
    fn receive_enc_pkg(&self, pkg: EncPkg, conn_ids: &[ConnectionId]);

    /// The connection's link has capacity again; a sender that saw a
    /// temporary rejection may retry.
    fn unblock_queue(&self, conn_id: &ConnectionId);

    /// Report a failure from an asynchronously executed call.
    fn async_error(&self, handle: SdkHandle, status: PluginResponse);

    fn request_plugin_user_input(&self, key: &str, prompt: &str, cache: bool) -> SdkResponse {
        let _ = (key, prompt, cache);
        SdkResponse::error()
    }

    fn request_common_user_input(&self, key: &str) -> SdkResponse {
        let _ = key;
        SdkResponse::error()
    }

    fn generate_link_id(&self, channel_id: &str) -> LinkId {
        format!("{channel_id}/link-{}", Uuid::new_v4())
    }

    fn generate_connection_id(&self, link_id: &LinkId) -> ConnectionId {
        format!("{link_id}/conn-{}", Uuid::new_v4())
    }

    /// `count` bytes of entropy; used for producer ids among other things.
    fn get_entropy(&self, count: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; count];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSdk;

    impl ChannelSdk for NullSdk {
        fn on_channel_status_changed(
            &self,
            _: SdkHandle,
            _: &str,
            _: ChannelStatus,
            _: &ChannelProperties,
        ) {
        }
        fn on_link_status_changed(&self, _: SdkHandle, _: &LinkId, _: LinkStatus, _: &LinkProperties) {
        }
        fn on_connection_status_changed(
            &self,
            _: SdkHandle,
            _: &ConnectionId,
            _: ConnectionStatus,
            _: &LinkProperties,
        ) {
        }
        fn on_package_status_changed(&self, _: SdkHandle, _: PackageStatus) {}
        fn receive_enc_pkg(&self, _: EncPkg, _: &[ConnectionId]) {}
        fn unblock_queue(&self, _: &ConnectionId) {}
        fn async_error(&self, _: SdkHandle, _: PluginResponse) {}
    }

    #[test]
    fn generated_ids_are_scoped_and_unique() {
        let sdk = NullSdk;
        let a = sdk.generate_link_id("chan");
        let b = sdk.generate_link_id("chan");
        assert!(a.starts_with("chan/link-"));
        assert_ne!(a, b);

        let conn = sdk.generate_connection_id(&a);
        assert!(conn.starts_with(&a));
    }

    #[test]
    fn entropy_has_requested_length() {
        let sdk = NullSdk;
        let bytes = sdk.get_entropy(16);
        assert_eq!(bytes.len(), 16);
        // 16 zero bytes from an OS rng would be astonishing
        assert!(bytes.iter().any(|&b| b != 0));
    }

    #[test]
    fn default_user_input_is_unsupported() {
        let sdk = NullSdk;
        assert_eq!(sdk.request_common_user_input("k").status, SdkStatus::Error);
    }
}
