//! Lifetime manager — creates and tears down the three child components.
//!
//! Activation instantiates the transport, the user model, and each
//! encoding (in composition order), every one on its own serial worker.
//! The channel is reported available only once all of them call back
//! started; a failed component fails the whole channel exactly once per
//! activation.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::components::wrappers::{EncodingWrapper, TransportWrapper, UserModelWrapper};
use crate::components::{sdk as component_sdk, mime_type_matches, ComponentFactories};
use crate::composition::Composition;
use crate::error::ManagerError;
use crate::types::{
    ChannelStatus, ComponentState, EncodingParameters, EncodingType, SdkHandle, NULL_SDK_HANDLE,
};

use super::core::ManagerCore;
use super::types::{ManagerState, COMPONENT_CALLBACK_STATES, DEACTIVATABLE};

/// One activated encoding, resolvable by MIME type in composition order.
pub(crate) struct EncodingBinding {
    pub encoding_type: EncodingType,
    pub encoding_time: f64,
    /// Index into [`LifetimeManager::encodings`].
    pub index: usize,
}

pub(crate) struct LifetimeManager {
    pub state: ManagerState,
    pub composition: Composition,
    factories: ComponentFactories,
    pub transport: Option<TransportWrapper>,
    pub usermodel: Option<UserModelWrapper>,
    /// `(component name, wrapper)` in composition order.
    pub encodings: Vec<(String, EncodingWrapper)>,
    /// Built during setup from each encoding's advertised properties.
    pub bindings: Vec<EncodingBinding>,
    pub component_states: HashMap<String, ComponentState>,
    pub activate_handle: SdkHandle,
}

impl LifetimeManager {
    pub fn new(composition: Composition, factories: ComponentFactories) -> Self {
        Self {
            state: ManagerState::Initializing,
            composition,
            factories,
            transport: None,
            usermodel: None,
            encodings: Vec::new(),
            bindings: Vec::new(),
            component_states: HashMap::new(),
            activate_handle: NULL_SDK_HANDLE,
        }
    }

    pub fn has_components(&self) -> bool {
        self.transport.is_some() || self.usermodel.is_some() || !self.encodings.is_empty()
    }

    /// First activated encoding whose advertised type serves `params`.
    pub fn encoding_for_params(&self, params: &EncodingParameters) -> Option<&EncodingWrapper> {
        self.encoding_for_type(&params.encoding_type)
    }

    pub fn encoding_for_type(&self, encoding_type: &str) -> Option<&EncodingWrapper> {
        self.bindings
            .iter()
            .find(|b| mime_type_matches(&b.encoding_type, encoding_type))
            .map(|b| &self.encodings[b.index].1)
    }

    /// Worst-case encode seconds for one encoding type, by the same match.
    pub fn encoding_time_for_type(&self, encoding_type: &str) -> Option<f64> {
        self.bindings
            .iter()
            .find(|b| mime_type_matches(&b.encoding_type, encoding_type))
            .map(|b| b.encoding_time)
    }

    /// Fetch advertised properties and build the type-resolution table.
    pub async fn setup(&mut self) -> Result<(), ManagerError> {
        self.bindings.clear();
        for (index, (name, wrapper)) in self.encodings.iter().enumerate() {
            let props = wrapper.encoding_properties().await?;
            debug!(
                component = %name,
                encoding_type = %props.encoding_type,
                encoding_time = props.encoding_time,
                "encoding registered"
            );
            self.bindings.push(EncodingBinding {
                encoding_type: props.encoding_type,
                encoding_time: props.encoding_time,
                index,
            });
        }
        Ok(())
    }

    /// Stop all child workers and forget them.
    pub async fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.stop().await;
        }
        if let Some(usermodel) = self.usermodel.take() {
            usermodel.stop().await;
        }
        for (_, encoding) in self.encodings.drain(..) {
            encoding.stop().await;
        }
        self.bindings.clear();
        self.component_states.clear();
    }

    /// Deliver a user-input answer to the component that asked for it.
    pub fn route_user_input(
        &self,
        component_id: &str,
        request_handle: u64,
        answered: bool,
        response: String,
    ) -> Result<(), ManagerError> {
        if let Some(transport) = &self.transport {
            if transport.component_id() == component_id {
                transport.on_user_input_received(request_handle, answered, response);
                return Ok(());
            }
        }
        if let Some(usermodel) = &self.usermodel {
            if usermodel.component_id() == component_id {
                usermodel.on_user_input_received(request_handle, answered, response);
                return Ok(());
            }
        }
        for (name, encoding) in &self.encodings {
            if name == component_id {
                encoding.on_user_input_received(request_handle, answered, response);
                return Ok(());
            }
        }
        Err(ManagerError::Component {
            id: component_id.to_string(),
            message: "no such component for user input".into(),
        })
    }
}

impl Drop for LifetimeManager {
    fn drop(&mut self) {
        // Teardown must run before the manager is dropped; reaching this
        // with live components means lifecycle discipline was violated
        // somewhere upstream.
        if self.has_components() {
            error!("lifetime manager dropped with live components");
        }
    }
}

impl ManagerCore {
    pub(crate) async fn activate_channel(
        &mut self,
        handle: SdkHandle,
        channel_gid: &str,
        role_name: &str,
    ) -> Result<(), ManagerError> {
        self.expect_state(ManagerState::Unactivated.bit())?;
        self.expect_channel(channel_gid)?;
        debug!(handle, channel_gid, role_name, "activating channel");

        self.lifetime.activate_handle = handle;
        self.lifetime.state = ManagerState::CreatingComponents;

        let composition = self.lifetime.composition.clone();

        // Transport first, then user model, then encodings; the creation
        // order is part of the contract with component implementations.
        let transport_name = composition.transport.clone();
        self.lifetime
            .component_states
            .insert(transport_name.clone(), ComponentState::Init);
        let transport_sdk =
            component_sdk::TransportSdk::new(self.dispatch.clone(), transport_name.clone());
        let transport = self
            .lifetime
            .factory_transport()
            .create_transport(&transport_name, transport_sdk, role_name, &self.config)
            .ok_or_else(|| {
                ManagerError::Internal(format!("failed to create transport '{transport_name}'"))
            })?;
        self.lifetime.transport = Some(TransportWrapper::spawn(
            transport_name,
            transport,
            self.dispatch.clone(),
            self.sdk.clone(),
        ));

        let usermodel_name = composition.usermodel.clone();
        self.lifetime
            .component_states
            .insert(usermodel_name.clone(), ComponentState::Init);
        let usermodel_sdk =
            component_sdk::UserModelSdk::new(self.dispatch.clone(), usermodel_name.clone());
        let usermodel = self
            .lifetime
            .factory_usermodel()
            .create_user_model(&usermodel_name, usermodel_sdk, role_name, &self.config)
            .ok_or_else(|| {
                ManagerError::Internal(format!("failed to create user model '{usermodel_name}'"))
            })?;
        self.lifetime.usermodel = Some(UserModelWrapper::spawn(
            usermodel_name,
            usermodel,
            self.dispatch.clone(),
            self.sdk.clone(),
        ));

        for name in &composition.encodings {
            self.lifetime
                .component_states
                .insert(name.clone(), ComponentState::Init);
            let encoding_sdk = component_sdk::EncodingSdk::new(self.dispatch.clone(), name.clone());
            let factory = self.lifetime.factory_encoding(name).ok_or_else(|| {
                ManagerError::Internal(format!("no factory for encoding '{name}'"))
            })?;
            let encoding = factory
                .create_encoding(name, encoding_sdk, role_name, &self.config)
                .ok_or_else(|| {
                    ManagerError::Internal(format!("failed to create encoding '{name}'"))
                })?;
            let wrapper = EncodingWrapper::spawn(
                name.clone(),
                encoding,
                self.dispatch.clone(),
                self.sdk.clone(),
            );
            self.lifetime.encodings.push((name.clone(), wrapper));
        }

        self.lifetime.state = ManagerState::WaitingForComponents;
        self.check_activated().await
    }

    pub(crate) async fn update_state(
        &mut self,
        component_id: &str,
        state: ComponentState,
    ) -> Result<(), ManagerError> {
        self.expect_state(COMPONENT_CALLBACK_STATES)?;
        debug!(component = %component_id, ?state, "component state update");

        if !self.lifetime.component_states.contains_key(component_id) {
            warn!(component = %component_id, "state update from unknown component");
            return Ok(());
        }
        self.lifetime
            .component_states
            .insert(component_id.to_string(), state);

        match state {
            ComponentState::Failed => {
                error!(component = %component_id, "component failed");
                self.fail().await;
                Ok(())
            }
            ComponentState::Started => self.check_activated().await,
            ComponentState::Init => Ok(()),
        }
    }

    async fn check_activated(&mut self) -> Result<(), ManagerError> {
        if self.lifetime.state != ManagerState::WaitingForComponents {
            return Ok(());
        }
        let all_started = self
            .lifetime
            .component_states
            .values()
            .all(|s| *s == ComponentState::Started);
        if !all_started {
            return Ok(());
        }

        self.lifetime.state = ManagerState::Activated;
        self.setup().await?;
        debug!("all components started; channel available");
        self.sdk.on_channel_status_changed(
            self.lifetime.activate_handle,
            &self.lifetime.composition.id,
            ChannelStatus::Available,
            &self.channel_props,
        );
        Ok(())
    }

    pub(crate) async fn deactivate_channel(
        &mut self,
        handle: SdkHandle,
        channel_gid: &str,
    ) -> Result<(), ManagerError> {
        self.expect_state(DEACTIVATABLE)?;
        self.expect_channel(channel_gid)?;
        self.deactivate_inner(handle).await;
        Ok(())
    }

    /// Teardown, status notification, and scheduler join; shared by
    /// deactivation and shutdown.
    pub(crate) async fn deactivate_inner(&mut self, handle: SdkHandle) {
        debug!(handle, "deactivating channel");
        self.teardown().await;
        self.lifetime.state = ManagerState::Unactivated;
        self.sdk.on_channel_status_changed(
            handle,
            &self.lifetime.composition.id,
            ChannelStatus::Enabled,
            &self.channel_props,
        );
        self.actions.join_scheduler().await;
    }
}

impl LifetimeManager {
    fn factory_transport(&self) -> std::sync::Arc<dyn crate::components::TransportFactory> {
        self.factories.transport.clone()
    }

    fn factory_usermodel(&self) -> std::sync::Arc<dyn crate::components::UserModelFactory> {
        self.factories.usermodel.clone()
    }

    fn factory_encoding(
        &self,
        name: &str,
    ) -> Option<std::sync::Arc<dyn crate::components::EncodingFactory>> {
        self.factories.encodings.get(name).cloned()
    }
}
