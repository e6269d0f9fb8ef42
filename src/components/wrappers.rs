//! Serial worker per component.
//!
//! Every component is pinned to one tokio task owning an unbounded FIFO of
//! calls; the manager talks to the task through a typed wrapper handle.
//! Getter calls carry a oneshot reply (the dispatcher awaits them), all
//! other calls are fire-and-forget. A component returning an error — or
//! panicking — is reported through the host's async-error channel, and a
//! fatal result marks the whole manager failed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::ManagerError;
use crate::manager::{Dispatch, Op};
use crate::sdk::ChannelSdk;
use crate::types::{
    Action, ActionTimeline, ComponentStatus, EncodingParameters, EncodingProperties, Event,
    LinkId, LinkParameters, LinkProperties, PluginResponse, SdkHandle,
    SpecificEncodingProperties, Timestamp, TransportProperties, UserModelProperties,
    NULL_SDK_HANDLE,
};

use super::{Encoding, Transport, UserModel};

// ── Error reporting shared by the three workers ──────────────────────────────

fn report_status(
    component_id: &str,
    dispatch: &Dispatch,
    sdk: &Arc<dyn ChannelSdk>,
    status: ComponentStatus,
) {
    match status {
        ComponentStatus::Ok => {}
        ComponentStatus::Error => {
            error!(component = %component_id, "component call returned error");
            sdk.async_error(NULL_SDK_HANDLE, PluginResponse::Error);
        }
        ComponentStatus::Fatal => {
            error!(component = %component_id, "component call returned fatal");
            dispatch.post(Op::MarkFailed);
            sdk.async_error(NULL_SDK_HANDLE, PluginResponse::Fatal);
        }
    }
}

/// Run a status-returning component call, converting a panic into a fatal
/// component failure.
fn guarded_call(
    component_id: &str,
    dispatch: &Dispatch,
    sdk: &Arc<dyn ChannelSdk>,
    f: impl FnOnce() -> ComponentStatus,
) {
    let status = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(status) => status,
        Err(_) => {
            error!(component = %component_id, "component call panicked");
            ComponentStatus::Fatal
        }
    };
    report_status(component_id, dispatch, sdk, status);
}

/// Run a value-returning component call; a panic yields the default value
/// and fails the manager.
fn guarded_value<R: Default>(
    component_id: &str,
    dispatch: &Dispatch,
    sdk: &Arc<dyn ChannelSdk>,
    f: impl FnOnce() -> R,
) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error!(component = %component_id, "component call panicked");
            report_status(component_id, dispatch, sdk, ComponentStatus::Fatal);
            R::default()
        }
    }
}

fn worker_stopped(component_id: &str) -> ManagerError {
    ManagerError::Component {
        id: component_id.to_string(),
        message: "component worker stopped".into(),
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub(crate) enum TransportCall {
    TransportProperties {
        reply: oneshot::Sender<TransportProperties>,
    },
    LinkProperties {
        link_id: LinkId,
        reply: oneshot::Sender<LinkProperties>,
    },
    CreateLink {
        handle: SdkHandle,
        link_id: LinkId,
    },
    LoadLinkAddress {
        handle: SdkHandle,
        link_id: LinkId,
        address: String,
    },
    LoadLinkAddresses {
        handle: SdkHandle,
        link_id: LinkId,
        addresses: Vec<String>,
    },
    CreateLinkFromAddress {
        handle: SdkHandle,
        link_id: LinkId,
        address: String,
    },
    DestroyLink {
        handle: SdkHandle,
        link_id: LinkId,
    },
    ActionParams {
        action: Action,
        reply: oneshot::Sender<Vec<EncodingParameters>>,
    },
    EnqueueContent {
        params: EncodingParameters,
        action: Action,
        content: Vec<u8>,
    },
    DequeueContent {
        action: Action,
    },
    DoAction {
        fragment_handles: Vec<SdkHandle>,
        action: Action,
    },
    UserInputReceived {
        handle: SdkHandle,
        answered: bool,
        response: String,
    },
    Drain {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct TransportWrapper {
    component_id: String,
    tx: mpsc::UnboundedSender<TransportCall>,
    task: JoinHandle<()>,
}

impl TransportWrapper {
    pub fn spawn(
        component_id: String,
        component: Box<dyn Transport>,
        dispatch: Dispatch,
        sdk: Arc<dyn ChannelSdk>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = component_id.clone();
        let task = tokio::spawn(run_transport(id, component, rx, dispatch, sdk));
        Self {
            component_id,
            tx,
            task,
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    fn send(&self, call: TransportCall) {
        if self.tx.send(call).is_err() {
            warn!(component = %self.component_id, "transport call dropped: worker stopped");
        }
    }

    async fn request<R>(
        &self,
        rx: oneshot::Receiver<R>,
        sent: Result<(), mpsc::error::SendError<TransportCall>>,
    ) -> Result<R, ManagerError> {
        if sent.is_err() {
            return Err(worker_stopped(&self.component_id));
        }
        rx.await.map_err(|_| worker_stopped(&self.component_id))
    }

    pub async fn transport_properties(&self) -> Result<TransportProperties, ManagerError> {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(TransportCall::TransportProperties { reply });
        self.request(rx, sent).await
    }

    pub async fn link_properties(&self, link_id: &LinkId) -> Result<LinkProperties, ManagerError> {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(TransportCall::LinkProperties {
            link_id: link_id.clone(),
            reply,
        });
        self.request(rx, sent).await
    }

    pub async fn action_params(
        &self,
        action: &Action,
    ) -> Result<Vec<EncodingParameters>, ManagerError> {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(TransportCall::ActionParams {
            action: action.clone(),
            reply,
        });
        self.request(rx, sent).await
    }

    pub fn create_link(&self, handle: SdkHandle, link_id: &LinkId) {
        self.send(TransportCall::CreateLink {
            handle,
            link_id: link_id.clone(),
        });
    }

    pub fn load_link_address(&self, handle: SdkHandle, link_id: &LinkId, address: String) {
        self.send(TransportCall::LoadLinkAddress {
            handle,
            link_id: link_id.clone(),
            address,
        });
    }

    pub fn load_link_addresses(&self, handle: SdkHandle, link_id: &LinkId, addresses: Vec<String>) {
        self.send(TransportCall::LoadLinkAddresses {
            handle,
            link_id: link_id.clone(),
            addresses,
        });
    }

    pub fn create_link_from_address(&self, handle: SdkHandle, link_id: &LinkId, address: String) {
        self.send(TransportCall::CreateLinkFromAddress {
            handle,
            link_id: link_id.clone(),
            address,
        });
    }

    pub fn destroy_link(&self, handle: SdkHandle, link_id: &LinkId) {
        self.send(TransportCall::DestroyLink {
            handle,
            link_id: link_id.clone(),
        });
    }

    pub fn enqueue_content(&self, params: EncodingParameters, action: Action, content: Vec<u8>) {
        self.send(TransportCall::EnqueueContent {
            params,
            action,
            content,
        });
    }

    pub fn dequeue_content(&self, action: Action) {
        self.send(TransportCall::DequeueContent { action });
    }

    pub fn do_action(&self, fragment_handles: Vec<SdkHandle>, action: Action) {
        self.send(TransportCall::DoAction {
            fragment_handles,
            action,
        });
    }

    pub fn on_user_input_received(&self, handle: SdkHandle, answered: bool, response: String) {
        self.send(TransportCall::UserInputReceived {
            handle,
            answered,
            response,
        });
    }

    /// Resolve once every call queued before this one has run.
    pub async fn drain(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(TransportCall::Drain { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn stop(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

async fn run_transport(
    component_id: String,
    mut component: Box<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<TransportCall>,
    dispatch: Dispatch,
    sdk: Arc<dyn ChannelSdk>,
) {
    debug!(component = %component_id, "transport worker running");
    while let Some(call) = rx.recv().await {
        match call {
            TransportCall::TransportProperties { reply } => {
                let value = guarded_value(&component_id, &dispatch, &sdk, || {
                    component.transport_properties()
                });
                let _ = reply.send(value);
            }
            TransportCall::LinkProperties { link_id, reply } => {
                let value = guarded_value(&component_id, &dispatch, &sdk, || {
                    component.link_properties(&link_id)
                });
                let _ = reply.send(value);
            }
            TransportCall::ActionParams { action, reply } => {
                let value = guarded_value(&component_id, &dispatch, &sdk, || {
                    component.action_params(&action)
                });
                let _ = reply.send(value);
            }
            TransportCall::CreateLink { handle, link_id } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.create_link(handle, &link_id)
                });
            }
            TransportCall::LoadLinkAddress {
                handle,
                link_id,
                address,
            } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.load_link_address(handle, &link_id, &address)
                });
            }
            TransportCall::LoadLinkAddresses {
                handle,
                link_id,
                addresses,
            } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.load_link_addresses(handle, &link_id, &addresses)
                });
            }
            TransportCall::CreateLinkFromAddress {
                handle,
                link_id,
                address,
            } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.create_link_from_address(handle, &link_id, &address)
                });
            }
            TransportCall::DestroyLink { handle, link_id } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.destroy_link(handle, &link_id)
                });
            }
            TransportCall::EnqueueContent {
                params,
                action,
                content,
            } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.enqueue_content(&params, &action, content)
                });
            }
            TransportCall::DequeueContent { action } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.dequeue_content(&action)
                });
            }
            TransportCall::DoAction {
                fragment_handles,
                action,
            } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.do_action(&fragment_handles, &action)
                });
            }
            TransportCall::UserInputReceived {
                handle,
                answered,
                response,
            } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.on_user_input_received(handle, answered, &response)
                });
            }
            TransportCall::Drain { reply } => {
                let _ = reply.send(());
            }
        }
    }
    debug!(component = %component_id, "transport worker stopped");
}

// ── User model ───────────────────────────────────────────────────────────────

pub(crate) enum UserModelCall {
    Properties {
        reply: oneshot::Sender<UserModelProperties>,
    },
    AddLink {
        link_id: LinkId,
        params: LinkParameters,
    },
    RemoveLink {
        link_id: LinkId,
    },
    Timeline {
        start: Timestamp,
        end: Timestamp,
        reply: oneshot::Sender<ActionTimeline>,
    },
    OnTransportEvent {
        event: Event,
    },
    OnSendPackage {
        link_id: LinkId,
        bytes: usize,
        reply: oneshot::Sender<ActionTimeline>,
    },
    UserInputReceived {
        handle: SdkHandle,
        answered: bool,
        response: String,
    },
    Drain {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct UserModelWrapper {
    component_id: String,
    tx: mpsc::UnboundedSender<UserModelCall>,
    task: JoinHandle<()>,
}

impl UserModelWrapper {
    pub fn spawn(
        component_id: String,
        component: Box<dyn UserModel>,
        dispatch: Dispatch,
        sdk: Arc<dyn ChannelSdk>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = component_id.clone();
        let task = tokio::spawn(run_user_model(id, component, rx, dispatch, sdk));
        Self {
            component_id,
            tx,
            task,
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    fn send(&self, call: UserModelCall) {
        if self.tx.send(call).is_err() {
            warn!(component = %self.component_id, "user-model call dropped: worker stopped");
        }
    }

    pub async fn user_model_properties(&self) -> Result<UserModelProperties, ManagerError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(UserModelCall::Properties { reply }).is_err() {
            return Err(worker_stopped(&self.component_id));
        }
        rx.await.map_err(|_| worker_stopped(&self.component_id))
    }

    pub async fn timeline(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<ActionTimeline, ManagerError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(UserModelCall::Timeline { start, end, reply })
            .is_err()
        {
            return Err(worker_stopped(&self.component_id));
        }
        rx.await.map_err(|_| worker_stopped(&self.component_id))
    }

    pub async fn on_send_package(
        &self,
        link_id: &LinkId,
        bytes: usize,
    ) -> Result<ActionTimeline, ManagerError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(UserModelCall::OnSendPackage {
                link_id: link_id.clone(),
                bytes,
                reply,
            })
            .is_err()
        {
            return Err(worker_stopped(&self.component_id));
        }
        rx.await.map_err(|_| worker_stopped(&self.component_id))
    }

    pub fn add_link(&self, link_id: &LinkId, params: LinkParameters) {
        self.send(UserModelCall::AddLink {
            link_id: link_id.clone(),
            params,
        });
    }

    pub fn remove_link(&self, link_id: &LinkId) {
        self.send(UserModelCall::RemoveLink {
            link_id: link_id.clone(),
        });
    }

    pub fn on_transport_event(&self, event: Event) {
        self.send(UserModelCall::OnTransportEvent { event });
    }

    pub fn on_user_input_received(&self, handle: SdkHandle, answered: bool, response: String) {
        self.send(UserModelCall::UserInputReceived {
            handle,
            answered,
            response,
        });
    }

    pub async fn drain(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(UserModelCall::Drain { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn stop(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

async fn run_user_model(
    component_id: String,
    mut component: Box<dyn UserModel>,
    mut rx: mpsc::UnboundedReceiver<UserModelCall>,
    dispatch: Dispatch,
    sdk: Arc<dyn ChannelSdk>,
) {
    debug!(component = %component_id, "user-model worker running");
    while let Some(call) = rx.recv().await {
        match call {
            UserModelCall::Properties { reply } => {
                let value = guarded_value(&component_id, &dispatch, &sdk, || {
                    component.user_model_properties()
                });
                let _ = reply.send(value);
            }
            UserModelCall::Timeline { start, end, reply } => {
                let value = guarded_value(&component_id, &dispatch, &sdk, || {
                    component.timeline(start, end)
                });
                let _ = reply.send(value);
            }
            UserModelCall::OnSendPackage {
                link_id,
                bytes,
                reply,
            } => {
                let value = guarded_value(&component_id, &dispatch, &sdk, || {
                    component.on_send_package(&link_id, bytes)
                });
                let _ = reply.send(value);
            }
            UserModelCall::AddLink { link_id, params } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.add_link(&link_id, &params)
                });
            }
            UserModelCall::RemoveLink { link_id } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.remove_link(&link_id)
                });
            }
            UserModelCall::OnTransportEvent { event } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.on_transport_event(&event)
                });
            }
            UserModelCall::UserInputReceived {
                handle,
                answered,
                response,
            } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.on_user_input_received(handle, answered, &response)
                });
            }
            UserModelCall::Drain { reply } => {
                let _ = reply.send(());
            }
        }
    }
    debug!(component = %component_id, "user-model worker stopped");
}

// ── Encoding ─────────────────────────────────────────────────────────────────

pub(crate) enum EncodingCall {
    Properties {
        reply: oneshot::Sender<EncodingProperties>,
    },
    PropertiesForParameters {
        params: EncodingParameters,
        reply: oneshot::Sender<SpecificEncodingProperties>,
    },
    EncodeBytes {
        handle: SdkHandle,
        params: EncodingParameters,
        bytes: Vec<u8>,
    },
    DecodeBytes {
        handle: SdkHandle,
        params: EncodingParameters,
        bytes: Vec<u8>,
    },
    UserInputReceived {
        handle: SdkHandle,
        answered: bool,
        response: String,
    },
    Drain {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct EncodingWrapper {
    component_id: String,
    tx: mpsc::UnboundedSender<EncodingCall>,
    task: JoinHandle<()>,
}

impl EncodingWrapper {
    pub fn spawn(
        component_id: String,
        component: Box<dyn Encoding>,
        dispatch: Dispatch,
        sdk: Arc<dyn ChannelSdk>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = component_id.clone();
        let task = tokio::spawn(run_encoding(id, component, rx, dispatch, sdk));
        Self {
            component_id,
            tx,
            task,
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    fn send(&self, call: EncodingCall) {
        if self.tx.send(call).is_err() {
            warn!(component = %self.component_id, "encoding call dropped: worker stopped");
        }
    }

    pub async fn encoding_properties(&self) -> Result<EncodingProperties, ManagerError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EncodingCall::Properties { reply }).is_err() {
            return Err(worker_stopped(&self.component_id));
        }
        rx.await.map_err(|_| worker_stopped(&self.component_id))
    }

    pub async fn properties_for_parameters(
        &self,
        params: &EncodingParameters,
    ) -> Result<SpecificEncodingProperties, ManagerError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(EncodingCall::PropertiesForParameters {
                params: params.clone(),
                reply,
            })
            .is_err()
        {
            return Err(worker_stopped(&self.component_id));
        }
        rx.await.map_err(|_| worker_stopped(&self.component_id))
    }

    pub fn encode_bytes(&self, handle: SdkHandle, params: EncodingParameters, bytes: Vec<u8>) {
        self.send(EncodingCall::EncodeBytes {
            handle,
            params,
            bytes,
        });
    }

    pub fn decode_bytes(&self, handle: SdkHandle, params: EncodingParameters, bytes: Vec<u8>) {
        self.send(EncodingCall::DecodeBytes {
            handle,
            params,
            bytes,
        });
    }

    pub fn on_user_input_received(&self, handle: SdkHandle, answered: bool, response: String) {
        self.send(EncodingCall::UserInputReceived {
            handle,
            answered,
            response,
        });
    }

    pub async fn drain(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EncodingCall::Drain { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn stop(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

async fn run_encoding(
    component_id: String,
    mut component: Box<dyn Encoding>,
    mut rx: mpsc::UnboundedReceiver<EncodingCall>,
    dispatch: Dispatch,
    sdk: Arc<dyn ChannelSdk>,
) {
    debug!(component = %component_id, "encoding worker running");
    while let Some(call) = rx.recv().await {
        match call {
            EncodingCall::Properties { reply } => {
                let value = guarded_value(&component_id, &dispatch, &sdk, || {
                    component.encoding_properties()
                });
                let _ = reply.send(value);
            }
            EncodingCall::PropertiesForParameters { params, reply } => {
                let value = guarded_value(&component_id, &dispatch, &sdk, || {
                    component.properties_for_parameters(&params)
                });
                let _ = reply.send(value);
            }
            EncodingCall::EncodeBytes {
                handle,
                params,
                bytes,
            } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.encode_bytes(handle, &params, bytes)
                });
            }
            EncodingCall::DecodeBytes {
                handle,
                params,
                bytes,
            } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.decode_bytes(handle, &params, bytes)
                });
            }
            EncodingCall::UserInputReceived {
                handle,
                answered,
                response,
            } => {
                guarded_call(&component_id, &dispatch, &sdk, || {
                    component.on_user_input_received(handle, answered, &response)
                });
            }
            EncodingCall::Drain { reply } => {
                let _ = reply.send(());
            }
        }
    }
    debug!(component = %component_id, "encoding worker stopped");
}
