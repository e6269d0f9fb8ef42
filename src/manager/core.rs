//! Manager core — owns every sub-manager and all channel state.
//!
//! The core lives inside the dispatcher task and is only ever touched from
//! there, so no locking is needed; the action scheduler participates by
//! posting ticks instead of sharing state. Cross-manager lookups go through
//! the maps owned by each sub-manager, keyed by ids and handles.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::components::ComponentFactories;
use crate::composition::Composition;
use crate::config::PluginConfig;
use crate::error::ManagerError;
use crate::sdk::{ChannelProperties, ChannelSdk, SdkStatus};
use crate::types::{
    now_ts, ConnectionId, EncPkg, EncodingMode, Event, PluginResponse, SdkHandle,
};

use super::actions::ActionManager;
use super::connections::ConnectionManager;
use super::lifetime::LifetimeManager;
use super::links::LinkManager;
use super::packages::PackageManager;
use super::receive::ReceiveManager;
use super::types::{ManagerState, ACTIVATED_ONLY, COMPONENT_CALLBACK_STATES};
use super::Dispatch;

/// Where to route a pending user-input answer.
pub(crate) struct UserInputRoute {
    pub post_id: u64,
    pub component_id: String,
}

pub(crate) struct ManagerCore {
    pub sdk: Arc<dyn ChannelSdk>,
    pub dispatch: Dispatch,
    pub config: PluginConfig,
    pub mode: EncodingMode,
    pub channel_props: ChannelProperties,
    pub lifetime: LifetimeManager,
    pub links: LinkManager,
    pub connections: ConnectionManager,
    pub actions: ActionManager,
    pub packages: PackageManager,
    pub receive: ReceiveManager,
    pub user_input_map: HashMap<SdkHandle, UserInputRoute>,
}

impl ManagerCore {
    pub fn new(
        sdk: Arc<dyn ChannelSdk>,
        composition: Composition,
        factories: ComponentFactories,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            sdk,
            dispatch,
            config: PluginConfig::default(),
            mode: EncodingMode::default(),
            channel_props: ChannelProperties::default(),
            lifetime: LifetimeManager::new(composition, factories),
            links: LinkManager::new(),
            connections: ConnectionManager::new(),
            actions: ActionManager::new(),
            packages: PackageManager::new(),
            receive: ReceiveManager::new(),
            user_input_map: HashMap::new(),
        }
    }

    pub fn sdk(&self) -> &Arc<dyn ChannelSdk> {
        &self.sdk
    }

    // ── Guards ───────────────────────────────────────────────────────────

    pub fn expect_state(&self, allowed: u8) -> Result<(), ManagerError> {
        let state = self.lifetime.state;
        if state.bit() & allowed == 0 {
            return Err(ManagerError::InvalidState(state.name()));
        }
        Ok(())
    }

    pub fn expect_channel(&self, channel_gid: &str) -> Result<(), ManagerError> {
        if channel_gid != self.lifetime.composition.id {
            return Err(ManagerError::ChannelMismatch(channel_gid.to_string()));
        }
        Ok(())
    }

    // ── Plugin surface (synchronous contract) ────────────────────────────

    pub async fn init(&mut self, config: PluginConfig) -> PluginResponse {
        if self.lifetime.state != ManagerState::Initializing {
            error!(state = self.lifetime.state.name(), "init in unexpected state");
            self.fail().await;
            return PluginResponse::Fatal;
        }
        self.mode = config.encoding_mode;
        self.config = config;
        self.lifetime.state = ManagerState::Unactivated;
        debug!(mode = ?self.mode, "manager initialised");
        PluginResponse::Ok
    }

    pub async fn shutdown(&mut self) -> PluginResponse {
        debug!("shutting down");
        if self.lifetime.has_components() {
            self.deactivate_inner(crate::types::NULL_SDK_HANDLE).await;
        }
        self.lifetime.state = ManagerState::ShuttingDown;
        PluginResponse::Ok
    }

    pub async fn send_package(
        &mut self,
        handle: SdkHandle,
        conn_id: ConnectionId,
        pkg: EncPkg,
        timeout_timestamp: f64,
        batch_id: u64,
    ) -> PluginResponse {
        if self.expect_state(ACTIVATED_ONLY).is_err() {
            error!(state = self.lifetime.state.name(), "send_package in unexpected state");
            return PluginResponse::Error;
        }
        debug!(
            handle,
            conn = %conn_id,
            size = pkg.size(),
            timeout_timestamp,
            batch_id,
            "send package"
        );

        let now = now_ts();

        // Let the user model react first; it may add actions the new
        // package can ride on.
        if let Err(e) = self.usermodel_on_send_package(now, &conn_id, pkg.size()).await {
            warn!(error = %e, "user model rejected send notification");
            if e.is_fatal() {
                self.fail().await;
                return PluginResponse::Fatal;
            }
            return PluginResponse::Error;
        }

        match self.admit_package(now, handle, &conn_id, pkg) {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "send package failed");
                if e.is_fatal() {
                    self.fail().await;
                    PluginResponse::Fatal
                } else {
                    PluginResponse::Error
                }
            }
        }
    }

    // ── Failure & teardown ───────────────────────────────────────────────

    /// Fatal path: tear down and report the channel failed (once).
    pub async fn fail(&mut self) {
        if self.lifetime.state == ManagerState::Failed {
            return;
        }
        error!("tearing down after failure");
        self.teardown().await;
        self.lifetime.state = ManagerState::Failed;
        let handle = self.lifetime.activate_handle;
        self.sdk.on_channel_status_changed(
            handle,
            &self.lifetime.composition.id,
            crate::types::ChannelStatus::Failed,
            &self.channel_props,
        );
    }

    /// Bring every sub-manager back to its constructed state and stop the
    /// child components.
    pub async fn teardown(&mut self) {
        self.actions.teardown();
        self.connections.teardown();
        self.lifetime.teardown().await;
        self.links.teardown();
        self.packages.teardown();
        self.receive.teardown();
        self.user_input_map.clear();
    }

    /// Post-activation setup, run once all components report started.
    pub async fn setup(&mut self) -> Result<(), ManagerError> {
        self.lifetime.setup().await?;
        self.setup_actions().await?;
        Ok(())
    }

    /// Final cleanup when the dispatcher queue closes without a shutdown.
    pub async fn stop(&mut self) {
        if self.lifetime.state != ManagerState::ShuttingDown {
            self.shutdown().await;
        }
    }

    // ── Component plumbing ───────────────────────────────────────────────

    pub fn on_event(&mut self, event: Event) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        let usermodel = self
            .lifetime
            .usermodel
            .as_ref()
            .ok_or_else(|| ManagerError::Internal("no user model".into()))?;
        usermodel.on_transport_event(event);
        Ok(())
    }

    pub fn request_plugin_user_input(
        &mut self,
        post_id: u64,
        component_id: String,
        key: &str,
        prompt: &str,
        cache: bool,
    ) -> Result<(), ManagerError> {
        self.expect_state(COMPONENT_CALLBACK_STATES)?;
        let resp = self.sdk.request_plugin_user_input(key, prompt, cache);
        if resp.status != SdkStatus::Ok {
            warn!(component = %component_id, key, "plugin user input request rejected");
            return Ok(());
        }
        self.user_input_map.insert(
            resp.handle,
            UserInputRoute {
                post_id,
                component_id,
            },
        );
        Ok(())
    }

    pub fn request_common_user_input(
        &mut self,
        post_id: u64,
        component_id: String,
        key: &str,
    ) -> Result<(), ManagerError> {
        self.expect_state(COMPONENT_CALLBACK_STATES)?;
        let resp = self.sdk.request_common_user_input(key);
        if resp.status != SdkStatus::Ok {
            warn!(component = %component_id, key, "common user input request rejected");
            return Ok(());
        }
        self.user_input_map.insert(
            resp.handle,
            UserInputRoute {
                post_id,
                component_id,
            },
        );
        Ok(())
    }

    pub fn on_user_input_received(
        &mut self,
        handle: SdkHandle,
        answered: bool,
        response: String,
    ) -> Result<(), ManagerError> {
        self.expect_state(COMPONENT_CALLBACK_STATES)?;
        let Some(route) = self.user_input_map.remove(&handle) else {
            return Err(ManagerError::Component {
                id: "user-input".into(),
                message: format!("no mapping for handle {handle}"),
            });
        };
        self.lifetime
            .route_user_input(&route.component_id, route.post_id, answered, response)
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "ChannelManager{{state: {}, composition: {}, mode: {:?}",
            self.lifetime.state.name(),
            self.lifetime.composition.id,
            self.mode
        );
        let _ = write!(out, ", actions: {}", self.actions.order.len());
        let _ = write!(
            out,
            ", pending_encodings: {}, pending_decodings: {}",
            self.packages.pending_encodings.len(),
            self.receive.pending_decodings.len()
        );

        let mut link_ids: Vec<_> = self.links.links.keys().cloned().collect();
        link_ids.sort();
        let _ = write!(out, ", links: {{");
        for link_id in link_ids {
            let link = &self.links.links[&link_id];
            let mut conns: Vec<_> = link.connections.iter().cloned().collect();
            conns.sort();
            let _ = write!(
                out,
                "{}: {{connections: {conns:?}, packages: {:?}, actions: {}}}, ",
                link.link_id,
                link.package_queue.iter().map(|h| h.raw()).collect::<Vec<_>>(),
                link.action_queue.len()
            );
        }
        let _ = write!(out, "}}, connections: {:?}}}", {
            let mut ids: Vec<_> = self.connections.connections.keys().cloned().collect();
            ids.sort();
            ids
        });
        out
    }

    /// Drain every component worker queue (test-facing quiescence).
    pub async fn wait_for_components(&mut self) {
        if let Some(transport) = &self.lifetime.transport {
            transport.drain().await;
        }
        if let Some(usermodel) = &self.lifetime.usermodel {
            usermodel.drain().await;
        }
        for (_, encoding) in &self.lifetime.encodings {
            encoding.drain().await;
        }
    }
}
