//! Channel manager — composes a transport, a user model, and encodings
//! into one channel behind the host's plugin surface.
//!
//! # Dispatch model
//!
//! Every externally invoked operation becomes a [`Post`] on one serial
//! queue owned by the dispatcher task; execution order equals post order.
//! Host calls that contractually return a value (`init`, `shutdown`,
//! `send_package`, plus the test-facing helpers) block on a oneshot reply;
//! everything else returns as soon as the post is enqueued. Component
//! callbacks arrive through the same queue via the per-kind SDK handles.
//!
//! A recoverable failure inside an asynchronously executed post is
//! reported through `ChannelSdk::async_error`; a fatal one additionally
//! tears the manager down and emits a failed channel status. A panic
//! escaping an operation is treated as fatal.

pub(crate) mod actions;
pub(crate) mod connections;
pub(crate) mod core;
pub mod framing;
pub(crate) mod lifetime;
pub(crate) mod links;
pub(crate) mod packages;
pub(crate) mod receive;
pub(crate) mod types;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use crate::components::ComponentFactories;
use crate::composition::Composition;
use crate::config::PluginConfig;
use crate::sdk::ChannelSdk;
use crate::types::{
    ComponentState, ConnectionId, EncPkg, EncodingParameters, EncodingStatus, Event, LinkId,
    LinkParameters, LinkStatus, LinkType, PackageStatus, PluginResponse, SdkHandle,
    NULL_SDK_HANDLE,
};

use self::core::ManagerCore;

// ── Operations ───────────────────────────────────────────────────────────────

/// One unit of work on the dispatcher queue.
pub(crate) enum Op {
    // Plugin surface
    Init {
        config: PluginConfig,
        reply: oneshot::Sender<PluginResponse>,
    },
    Shutdown {
        reply: oneshot::Sender<PluginResponse>,
    },
    SendPackage {
        handle: SdkHandle,
        conn_id: ConnectionId,
        pkg: EncPkg,
        timeout_timestamp: f64,
        batch_id: u64,
        reply: oneshot::Sender<PluginResponse>,
    },
    OpenConnection {
        handle: SdkHandle,
        link_type: LinkType,
        link_id: LinkId,
        link_hints: String,
        send_timeout: i32,
    },
    CloseConnection {
        handle: SdkHandle,
        conn_id: ConnectionId,
    },
    CreateLink {
        handle: SdkHandle,
        channel_gid: String,
    },
    LoadLinkAddress {
        handle: SdkHandle,
        channel_gid: String,
        address: String,
    },
    LoadLinkAddresses {
        handle: SdkHandle,
        channel_gid: String,
        addresses: Vec<String>,
    },
    CreateLinkFromAddress {
        handle: SdkHandle,
        channel_gid: String,
        address: String,
    },
    DestroyLink {
        handle: SdkHandle,
        link_id: LinkId,
    },
    ActivateChannel {
        handle: SdkHandle,
        channel_gid: String,
        role_name: String,
    },
    DeactivateChannel {
        handle: SdkHandle,
        channel_gid: String,
    },
    OnUserInputReceived {
        handle: SdkHandle,
        answered: bool,
        response: String,
    },
    OnUserAcknowledgementReceived {
        handle: SdkHandle,
    },

    // Common component callbacks
    RequestPluginUserInput {
        component_id: String,
        key: String,
        prompt: String,
        cache: bool,
    },
    RequestCommonUserInput {
        component_id: String,
        key: String,
    },
    UpdateState {
        component_id: String,
        state: ComponentState,
    },

    // Encoding callbacks
    OnBytesEncoded {
        handle: SdkHandle,
        bytes: Vec<u8>,
        status: EncodingStatus,
    },
    OnBytesDecoded {
        handle: SdkHandle,
        bytes: Vec<u8>,
        status: EncodingStatus,
    },

    // Transport callbacks
    OnLinkStatusChanged {
        handle: SdkHandle,
        link_id: LinkId,
        status: LinkStatus,
        params: LinkParameters,
    },
    OnPackageStatusChanged {
        handle: SdkHandle,
        status: PackageStatus,
    },
    OnEvent {
        event: Event,
    },
    OnReceive {
        link_id: LinkId,
        params: EncodingParameters,
        bytes: Vec<u8>,
    },

    // User-model callbacks
    OnTimelineUpdated,

    // Internal
    SchedulerTick,
    MarkFailed,
    WaitForCallbacks {
        reply: oneshot::Sender<()>,
    },
    Describe {
        reply: oneshot::Sender<String>,
    },
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Init { .. } => "init",
            Op::Shutdown { .. } => "shutdown",
            Op::SendPackage { .. } => "send-package",
            Op::OpenConnection { .. } => "open-connection",
            Op::CloseConnection { .. } => "close-connection",
            Op::CreateLink { .. } => "create-link",
            Op::LoadLinkAddress { .. } => "load-link-address",
            Op::LoadLinkAddresses { .. } => "load-link-addresses",
            Op::CreateLinkFromAddress { .. } => "create-link-from-address",
            Op::DestroyLink { .. } => "destroy-link",
            Op::ActivateChannel { .. } => "activate-channel",
            Op::DeactivateChannel { .. } => "deactivate-channel",
            Op::OnUserInputReceived { .. } => "on-user-input-received",
            Op::OnUserAcknowledgementReceived { .. } => "on-user-ack-received",
            Op::RequestPluginUserInput { .. } => "request-plugin-user-input",
            Op::RequestCommonUserInput { .. } => "request-common-user-input",
            Op::UpdateState { .. } => "update-state",
            Op::OnBytesEncoded { .. } => "on-bytes-encoded",
            Op::OnBytesDecoded { .. } => "on-bytes-decoded",
            Op::OnLinkStatusChanged { .. } => "on-link-status-changed",
            Op::OnPackageStatusChanged { .. } => "on-package-status-changed",
            Op::OnEvent { .. } => "on-event",
            Op::OnReceive { .. } => "on-receive",
            Op::OnTimelineUpdated => "on-timeline-updated",
            Op::SchedulerTick => "scheduler-tick",
            Op::MarkFailed => "mark-failed",
            Op::WaitForCallbacks { .. } => "wait-for-callbacks",
            Op::Describe { .. } => "describe",
        }
    }
}

pub(crate) struct Post {
    pub id: u64,
    pub op: Op,
}

/// Cloneable sender side of the dispatcher queue. Posting assigns a
/// monotonically increasing post id and never blocks.
#[derive(Clone)]
pub(crate) struct Dispatch {
    tx: mpsc::UnboundedSender<Post>,
    next_post_id: Arc<AtomicU64>,
}

impl Dispatch {
    fn new(tx: mpsc::UnboundedSender<Post>) -> Self {
        Self {
            tx,
            next_post_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Enqueue an operation; returns its post id, or `None` when the
    /// dispatcher has stopped.
    pub fn post(&self, op: Op) -> Option<u64> {
        let id = self.next_post_id.fetch_add(1, Ordering::Relaxed);
        trace!(post_id = id, op = op.name(), "posting");
        self.tx.send(Post { id, op }).ok().map(|_| id)
    }
}

// ── Facade ───────────────────────────────────────────────────────────────────

/// The channel-plugin facade the host SDK holds.
///
/// Construction spawns the dispatcher task; the manager starts in the
/// initializing state and expects `init` before anything else. Dropping
/// the facade aborts the dispatcher, which in turn stops every component
/// worker; call [`ChannelManager::shutdown`] for an orderly stop.
pub struct ChannelManager {
    dispatch: Dispatch,
}

impl ChannelManager {
    /// Build a manager for `composition`, wiring host callbacks to `sdk`.
    /// Must be called within a tokio runtime.
    pub fn new(
        sdk: Arc<dyn ChannelSdk>,
        composition: Composition,
        factories: ComponentFactories,
    ) -> Self {
        debug!(composition = %composition.description(), "creating channel manager");
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatch = Dispatch::new(tx);
        let core = ManagerCore::new(sdk, composition, factories, dispatch.clone());
        tokio::spawn(run_dispatcher(core, rx));
        Self { dispatch }
    }

    fn post(&self, op: Op) -> PluginResponse {
        match self.dispatch.post(op) {
            Some(_) => PluginResponse::Ok,
            None => PluginResponse::Error,
        }
    }

    async fn post_sync(
        &self,
        build: impl FnOnce(oneshot::Sender<PluginResponse>) -> Op,
    ) -> PluginResponse {
        let (reply, rx) = oneshot::channel();
        if self.dispatch.post(build(reply)).is_none() {
            return PluginResponse::Error;
        }
        rx.await.unwrap_or(PluginResponse::Error)
    }

    /// Transition to the unactivated state with the given plugin config.
    pub async fn init(&self, config: PluginConfig) -> PluginResponse {
        self.post_sync(|reply| Op::Init { config, reply }).await
    }

    /// Tear everything down and transition to shutting-down.
    pub async fn shutdown(&self) -> PluginResponse {
        self.post_sync(|reply| Op::Shutdown { reply }).await
    }

    /// Submit an outbound package for the given connection.
    ///
    /// `timeout_timestamp` and `batch_id` are carried through for logging
    /// but not enforced by the manager.
    pub async fn send_package(
        &self,
        handle: SdkHandle,
        conn_id: ConnectionId,
        pkg: EncPkg,
        timeout_timestamp: f64,
        batch_id: u64,
    ) -> PluginResponse {
        self.post_sync(|reply| Op::SendPackage {
            handle,
            conn_id,
            pkg,
            timeout_timestamp,
            batch_id,
            reply,
        })
        .await
    }

    pub fn open_connection(
        &self,
        handle: SdkHandle,
        link_type: LinkType,
        link_id: LinkId,
        link_hints: String,
        send_timeout: i32,
    ) -> PluginResponse {
        self.post(Op::OpenConnection {
            handle,
            link_type,
            link_id,
            link_hints,
            send_timeout,
        })
    }

    pub fn close_connection(&self, handle: SdkHandle, conn_id: ConnectionId) -> PluginResponse {
        self.post(Op::CloseConnection { handle, conn_id })
    }

    pub fn create_link(&self, handle: SdkHandle, channel_gid: String) -> PluginResponse {
        self.post(Op::CreateLink {
            handle,
            channel_gid,
        })
    }

    pub fn load_link_address(
        &self,
        handle: SdkHandle,
        channel_gid: String,
        address: String,
    ) -> PluginResponse {
        self.post(Op::LoadLinkAddress {
            handle,
            channel_gid,
            address,
        })
    }

    pub fn load_link_addresses(
        &self,
        handle: SdkHandle,
        channel_gid: String,
        addresses: Vec<String>,
    ) -> PluginResponse {
        self.post(Op::LoadLinkAddresses {
            handle,
            channel_gid,
            addresses,
        })
    }

    pub fn create_link_from_address(
        &self,
        handle: SdkHandle,
        channel_gid: String,
        address: String,
    ) -> PluginResponse {
        self.post(Op::CreateLinkFromAddress {
            handle,
            channel_gid,
            address,
        })
    }

    pub fn destroy_link(&self, handle: SdkHandle, link_id: LinkId) -> PluginResponse {
        self.post(Op::DestroyLink { handle, link_id })
    }

    /// Begin creating the composition's components; the channel becomes
    /// available once every component reports started.
    pub fn activate_channel(
        &self,
        handle: SdkHandle,
        channel_gid: String,
        role_name: String,
    ) -> PluginResponse {
        self.post(Op::ActivateChannel {
            handle,
            channel_gid,
            role_name,
        })
    }

    pub fn deactivate_channel(&self, handle: SdkHandle, channel_gid: String) -> PluginResponse {
        self.post(Op::DeactivateChannel {
            handle,
            channel_gid,
        })
    }

    pub fn on_user_input_received(
        &self,
        handle: SdkHandle,
        answered: bool,
        response: String,
    ) -> PluginResponse {
        self.post(Op::OnUserInputReceived {
            handle,
            answered,
            response,
        })
    }

    pub fn on_user_acknowledgement_received(&self, handle: SdkHandle) -> PluginResponse {
        self.post(Op::OnUserAcknowledgementReceived { handle })
    }

    /// Not supported by composed channels.
    pub fn serve_files(&self, _link_id: LinkId, _path: String) -> PluginResponse {
        PluginResponse::Error
    }

    /// Not supported by composed channels.
    pub fn create_bootstrap_link(
        &self,
        _handle: SdkHandle,
        _channel_gid: String,
        _passphrase: String,
    ) -> PluginResponse {
        PluginResponse::Error
    }

    /// Accepted and ignored; the manager flushes nothing.
    pub fn flush_channel(
        &self,
        _handle: SdkHandle,
        _channel_gid: String,
        _batch_id: u64,
    ) -> PluginResponse {
        PluginResponse::Ok
    }

    /// Test-facing quiescence: resolves once every component worker queue
    /// and the dispatcher queue have been drained. Two rounds are run so
    /// that callbacks posted by drained component calls settle too.
    pub async fn wait_for_callbacks(&self) {
        for _ in 0..2 {
            let (reply, rx) = oneshot::channel();
            if self.dispatch.post(Op::WaitForCallbacks { reply }).is_none() {
                return;
            }
            let _ = rx.await;
        }
    }

    /// One-line snapshot of manager state for diagnostics and tests.
    pub async fn describe(&self) -> String {
        let (reply, rx) = oneshot::channel();
        if self.dispatch.post(Op::Describe { reply }).is_none() {
            return String::from("<dispatcher stopped>");
        }
        rx.await.unwrap_or_else(|_| String::from("<dispatcher stopped>"))
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        // Fire-and-forget shutdown: once the components are torn down,
        // their dispatch clones drop, the queue closes, and the
        // dispatcher task exits on its own.
        let (reply, _discarded) = oneshot::channel();
        let _ = self.dispatch.post(Op::Shutdown { reply });
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

async fn run_dispatcher(mut core: ManagerCore, mut rx: mpsc::UnboundedReceiver<Post>) {
    debug!("dispatcher running");
    while let Some(post) = rx.recv().await {
        let post_id = post.id;
        let op_name = post.op.name();
        trace!(post_id, op = op_name, "executing");

        // The dispatcher restores a consistent state (fail + teardown)
        // after any caught panic, so unwind safety holds.
        let result = std::panic::AssertUnwindSafe(execute(&mut core, post))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(post_id, op = op_name, error = %e, "post failed");
                let status = if e.is_fatal() {
                    core.fail().await;
                    PluginResponse::Fatal
                } else {
                    PluginResponse::Error
                };
                core.sdk().async_error(NULL_SDK_HANDLE, status);
            }
            Err(_) => {
                error!(post_id, op = op_name, "post panicked");
                core.fail().await;
                core.sdk().async_error(NULL_SDK_HANDLE, PluginResponse::Fatal);
            }
        }
    }
    core.stop().await;
    debug!("dispatcher stopped");
}

async fn execute(core: &mut ManagerCore, post: Post) -> Result<(), crate::error::ManagerError> {
    let post_id = post.id;
    match post.op {
        Op::Init { config, reply } => {
            let resp = core.init(config).await;
            let _ = reply.send(resp);
            Ok(())
        }
        Op::Shutdown { reply } => {
            let resp = core.shutdown().await;
            let _ = reply.send(resp);
            Ok(())
        }
        Op::SendPackage {
            handle,
            conn_id,
            pkg,
            timeout_timestamp,
            batch_id,
            reply,
        } => {
            let resp = core
                .send_package(handle, conn_id, pkg, timeout_timestamp, batch_id)
                .await;
            let _ = reply.send(resp);
            Ok(())
        }
        Op::OpenConnection {
            handle,
            link_type,
            link_id,
            link_hints,
            send_timeout,
        } => {
            core.open_connection(handle, link_type, link_id, link_hints, send_timeout)
                .await
        }
        Op::CloseConnection { handle, conn_id } => core.close_connection(handle, conn_id).await,
        Op::CreateLink {
            handle,
            channel_gid,
        } => core.create_link(handle, &channel_gid).await,
        Op::LoadLinkAddress {
            handle,
            channel_gid,
            address,
        } => core.load_link_address(handle, &channel_gid, address).await,
        Op::LoadLinkAddresses {
            handle,
            channel_gid,
            addresses,
        } => {
            core.load_link_addresses(handle, &channel_gid, addresses)
                .await
        }
        Op::CreateLinkFromAddress {
            handle,
            channel_gid,
            address,
        } => {
            core.create_link_from_address(handle, &channel_gid, address)
                .await
        }
        Op::DestroyLink { handle, link_id } => core.destroy_link(handle, link_id).await,
        Op::ActivateChannel {
            handle,
            channel_gid,
            role_name,
        } => core.activate_channel(handle, &channel_gid, &role_name).await,
        Op::DeactivateChannel {
            handle,
            channel_gid,
        } => core.deactivate_channel(handle, &channel_gid).await,
        Op::OnUserInputReceived {
            handle,
            answered,
            response,
        } => core.on_user_input_received(handle, answered, response),
        Op::OnUserAcknowledgementReceived { handle } => {
            trace!(post_id, handle, "user acknowledgement received");
            Ok(())
        }
        Op::RequestPluginUserInput {
            component_id,
            key,
            prompt,
            cache,
        } => core.request_plugin_user_input(post_id, component_id, &key, &prompt, cache),
        Op::RequestCommonUserInput { component_id, key } => {
            core.request_common_user_input(post_id, component_id, &key)
        }
        Op::UpdateState {
            component_id,
            state,
        } => core.update_state(&component_id, state).await,
        Op::OnBytesEncoded {
            handle,
            bytes,
            status,
        } => core.on_bytes_encoded(handle, bytes, status),
        Op::OnBytesDecoded {
            handle,
            bytes,
            status,
        } => core.on_bytes_decoded(handle, bytes, status),
        Op::OnLinkStatusChanged {
            handle,
            link_id,
            status,
            params,
        } => core.on_link_status_changed(handle, link_id, status, params).await,
        Op::OnPackageStatusChanged { handle, status } => {
            core.on_package_status_changed(handle, status)
        }
        Op::OnEvent { event } => core.on_event(event),
        Op::OnReceive {
            link_id,
            params,
            bytes,
        } => core.on_receive(link_id, params, bytes),
        Op::OnTimelineUpdated => core.on_timeline_updated().await,
        Op::SchedulerTick => core.scheduler_tick().await,
        Op::MarkFailed => {
            core.fail().await;
            Ok(())
        }
        Op::WaitForCallbacks { reply } => {
            core.wait_for_components().await;
            let _ = reply.send(());
            Ok(())
        }
        Op::Describe { reply } => {
            let _ = reply.send(core.describe());
            Ok(())
        }
    }
}
