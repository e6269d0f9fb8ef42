//! Per-kind SDK handles — the narrow surface a component calls back into.
//!
//! Each handle holds the manager's dispatch queue and the owning
//! component's id; every call enqueues an operation on the manager's serial
//! dispatcher and returns immediately with the post id. Components never
//! see the manager itself, only the capability set of their kind.

use crate::manager::{Dispatch, Op};
use crate::types::{
    ComponentState, EncodingParameters, EncodingStatus, Event, LinkId, LinkParameters, LinkStatus,
    PackageStatus, SdkHandle, NULL_SDK_HANDLE,
};

/// Outcome of a call made through a component SDK handle. `handle` is the
/// post id the operation was enqueued under, for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelResponse {
    pub status: ChannelOpStatus,
    pub handle: SdkHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpStatus {
    Ok,
    Error,
}

impl ChannelResponse {
    fn from_post(post_id: Option<u64>) -> Self {
        match post_id {
            Some(id) => Self {
                status: ChannelOpStatus::Ok,
                handle: id,
            },
            None => Self {
                status: ChannelOpStatus::Error,
                handle: NULL_SDK_HANDLE,
            },
        }
    }
}

#[derive(Clone)]
struct SdkCore {
    dispatch: Dispatch,
    component_id: String,
}

impl SdkCore {
    fn post(&self, op: Op) -> ChannelResponse {
        ChannelResponse::from_post(self.dispatch.post(op))
    }

    fn update_state(&self, state: ComponentState) -> ChannelResponse {
        self.post(Op::UpdateState {
            component_id: self.component_id.clone(),
            state,
        })
    }

    fn request_plugin_user_input(&self, key: &str, prompt: &str, cache: bool) -> ChannelResponse {
        self.post(Op::RequestPluginUserInput {
            component_id: self.component_id.clone(),
            key: key.to_string(),
            prompt: prompt.to_string(),
            cache,
        })
    }

    fn request_common_user_input(&self, key: &str) -> ChannelResponse {
        self.post(Op::RequestCommonUserInput {
            component_id: self.component_id.clone(),
            key: key.to_string(),
        })
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

/// Capability handle given to a transport component.
#[derive(Clone)]
pub struct TransportSdk {
    core: SdkCore,
}

impl TransportSdk {
    pub(crate) fn new(dispatch: Dispatch, component_id: String) -> Self {
        Self {
            core: SdkCore {
                dispatch,
                component_id,
            },
        }
    }

    pub fn update_state(&self, state: ComponentState) -> ChannelResponse {
        self.core.update_state(state)
    }

    pub fn request_plugin_user_input(
        &self,
        key: &str,
        prompt: &str,
        cache: bool,
    ) -> ChannelResponse {
        self.core.request_plugin_user_input(key, prompt, cache)
    }

    pub fn request_common_user_input(&self, key: &str) -> ChannelResponse {
        self.core.request_common_user_input(key)
    }

    pub fn on_link_status_changed(
        &self,
        handle: SdkHandle,
        link_id: &LinkId,
        status: LinkStatus,
        params: LinkParameters,
    ) -> ChannelResponse {
        self.core.post(Op::OnLinkStatusChanged {
            handle,
            link_id: link_id.clone(),
            status,
            params,
        })
    }

    /// Report the fate of one fragment previously passed to `do_action`.
    pub fn on_package_status_changed(
        &self,
        fragment_handle: SdkHandle,
        status: PackageStatus,
    ) -> ChannelResponse {
        self.core.post(Op::OnPackageStatusChanged {
            handle: fragment_handle,
            status,
        })
    }

    pub fn on_event(&self, event: Event) -> ChannelResponse {
        self.core.post(Op::OnEvent { event })
    }

    /// Hand received channel content to the manager for decode + reassembly.
    pub fn on_receive(
        &self,
        link_id: &LinkId,
        params: EncodingParameters,
        bytes: Vec<u8>,
    ) -> ChannelResponse {
        self.core.post(Op::OnReceive {
            link_id: link_id.clone(),
            params,
            bytes,
        })
    }
}

// ── User model ───────────────────────────────────────────────────────────────

/// Capability handle given to a user-model component.
#[derive(Clone)]
pub struct UserModelSdk {
    core: SdkCore,
}

impl UserModelSdk {
    pub(crate) fn new(dispatch: Dispatch, component_id: String) -> Self {
        Self {
            core: SdkCore {
                dispatch,
                component_id,
            },
        }
    }

    pub fn update_state(&self, state: ComponentState) -> ChannelResponse {
        self.core.update_state(state)
    }

    pub fn request_plugin_user_input(
        &self,
        key: &str,
        prompt: &str,
        cache: bool,
    ) -> ChannelResponse {
        self.core.request_plugin_user_input(key, prompt, cache)
    }

    pub fn request_common_user_input(&self, key: &str) -> ChannelResponse {
        self.core.request_common_user_input(key)
    }

    /// Nudge the manager to re-fetch the timeline ahead of schedule.
    pub fn on_timeline_updated(&self) -> ChannelResponse {
        self.core.post(Op::OnTimelineUpdated)
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Capability handle given to an encoding component.
#[derive(Clone)]
pub struct EncodingSdk {
    core: SdkCore,
}

impl EncodingSdk {
    pub(crate) fn new(dispatch: Dispatch, component_id: String) -> Self {
        Self {
            core: SdkCore {
                dispatch,
                component_id,
            },
        }
    }

    pub fn update_state(&self, state: ComponentState) -> ChannelResponse {
        self.core.update_state(state)
    }

    pub fn request_plugin_user_input(
        &self,
        key: &str,
        prompt: &str,
        cache: bool,
    ) -> ChannelResponse {
        self.core.request_plugin_user_input(key, prompt, cache)
    }

    pub fn request_common_user_input(&self, key: &str) -> ChannelResponse {
        self.core.request_common_user_input(key)
    }

    pub fn on_bytes_encoded(
        &self,
        handle: SdkHandle,
        bytes: Vec<u8>,
        status: EncodingStatus,
    ) -> ChannelResponse {
        self.core.post(Op::OnBytesEncoded {
            handle,
            bytes,
            status,
        })
    }

    pub fn on_bytes_decoded(
        &self,
        handle: SdkHandle,
        bytes: Vec<u8>,
        status: EncodingStatus,
    ) -> ChannelResponse {
        self.core.post(Op::OnBytesDecoded {
            handle,
            bytes,
            status,
        })
    }
}
