//! Link manager — owns link records and routes link lifecycle.
//!
//! Link ids come from the host; link creation and destruction are carried
//! out by the transport, which reports back through
//! `on_link_status_changed`. A created or loaded link gets its properties
//! fetched, a fresh 16-byte producer id, and an entry with the user model;
//! destruction cascades through open connections first.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::ManagerError;
use crate::types::{LinkId, LinkParameters, LinkProperties, LinkStatus, SdkHandle, NULL_SDK_HANDLE};

use super::core::ManagerCore;
use super::types::{Link, ACTIVATED_ONLY};

pub(crate) struct LinkManager {
    pub links: HashMap<LinkId, Link>,
}

impl LinkManager {
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
        }
    }

    pub fn get(&self, link_id: &LinkId) -> Result<&Link, ManagerError> {
        self.links
            .get(link_id)
            .ok_or_else(|| ManagerError::UnknownLink(link_id.clone()))
    }

    pub fn get_mut(&mut self, link_id: &LinkId) -> Result<&mut Link, ManagerError> {
        self.links
            .get_mut(link_id)
            .ok_or_else(|| ManagerError::UnknownLink(link_id.clone()))
    }

    /// Link ids in a stable order, for deterministic sweeps.
    pub fn sorted_ids(&self) -> Vec<LinkId> {
        let mut ids: Vec<_> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn teardown(&mut self) {
        self.links.clear();
    }
}

impl ManagerCore {
    pub(crate) async fn create_link(
        &mut self,
        handle: SdkHandle,
        channel_gid: &str,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        self.expect_channel(channel_gid)?;
        let link_id = self.sdk.generate_link_id(&self.lifetime.composition.id);
        debug!(handle, link = %link_id, "creating link");
        self.transport()?.create_link(handle, &link_id);
        // transport reports back through on_link_status_changed
        Ok(())
    }

    pub(crate) async fn load_link_address(
        &mut self,
        handle: SdkHandle,
        channel_gid: &str,
        address: String,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        self.expect_channel(channel_gid)?;
        let link_id = self.sdk.generate_link_id(&self.lifetime.composition.id);
        debug!(handle, link = %link_id, "loading link address");
        self.transport()?.load_link_address(handle, &link_id, address);
        Ok(())
    }

    pub(crate) async fn load_link_addresses(
        &mut self,
        handle: SdkHandle,
        channel_gid: &str,
        addresses: Vec<String>,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        self.expect_channel(channel_gid)?;
        let link_id = self.sdk.generate_link_id(&self.lifetime.composition.id);
        debug!(handle, link = %link_id, count = addresses.len(), "loading link addresses");
        self.transport()?
            .load_link_addresses(handle, &link_id, addresses);
        Ok(())
    }

    pub(crate) async fn create_link_from_address(
        &mut self,
        handle: SdkHandle,
        channel_gid: &str,
        address: String,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        self.expect_channel(channel_gid)?;
        let link_id = self.sdk.generate_link_id(&self.lifetime.composition.id);
        debug!(handle, link = %link_id, "creating link from address");
        self.transport()?
            .create_link_from_address(handle, &link_id, address);
        Ok(())
    }

    pub(crate) async fn destroy_link(
        &mut self,
        handle: SdkHandle,
        link_id: LinkId,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        debug!(handle, link = %link_id, "destroying link");
        self.transport()?.destroy_link(handle, &link_id);
        Ok(())
    }

    /// Transport-reported link status, fanned out to the package and
    /// action managers before the link record itself changes.
    pub(crate) async fn on_link_status_changed(
        &mut self,
        handle: SdkHandle,
        link_id: LinkId,
        status: LinkStatus,
        params: LinkParameters,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        debug!(handle, link = %link_id, ?status, "link status changed");

        if status == LinkStatus::Destroyed {
            self.packages_on_link_destroyed(&link_id);
            self.actions_on_link_destroyed(&link_id);
        }

        match status {
            LinkStatus::Created | LinkStatus::Loaded => {
                let props = self.transport()?.link_properties(&link_id).await?;
                if let Some(usermodel) = &self.lifetime.usermodel {
                    usermodel.add_link(&link_id, params);
                }
                let producer_id = self.sdk.get_entropy(16);
                debug!(link = %link_id, producer = %hex::encode(&producer_id), "link ready");
                self.links.links.insert(
                    link_id.clone(),
                    Link::new(link_id.clone(), props.clone(), producer_id),
                );
                self.sdk
                    .on_link_status_changed(handle, &link_id, status, &props);
            }
            LinkStatus::Destroyed => {
                let snapshot = self.links.links.get(&link_id).map(|link| {
                    (
                        link.props.clone(),
                        link.connections.iter().cloned().collect::<Vec<_>>(),
                    )
                });
                let props = match snapshot {
                    Some((props, conns)) => {
                        for conn_id in conns {
                            // cascades CONNECTION_CLOSED to the host
                            if let Err(e) =
                                self.close_connection(NULL_SDK_HANDLE, conn_id.clone()).await
                            {
                                warn!(conn = %conn_id, error = %e, "cascading close failed");
                            }
                        }
                        self.links.links.remove(&link_id);
                        if let Some(usermodel) = &self.lifetime.usermodel {
                            usermodel.remove_link(&link_id);
                        }
                        props
                    }
                    // already gone; still forward the status
                    None => LinkProperties::default(),
                };
                self.sdk
                    .on_link_status_changed(handle, &link_id, status, &props);
            }
            LinkStatus::Undef => {
                let props = self
                    .links
                    .links
                    .get(&link_id)
                    .map(|l| l.props.clone())
                    .unwrap_or_default();
                self.sdk
                    .on_link_status_changed(handle, &link_id, status, &props);
            }
        }
        Ok(())
    }

    pub(crate) fn transport(
        &self,
    ) -> Result<&crate::components::wrappers::TransportWrapper, ManagerError> {
        self.lifetime
            .transport
            .as_ref()
            .ok_or_else(|| ManagerError::Internal("no transport component".into()))
    }
}
