//! Connection manager — maps connection ids to their links.
//!
//! Connections are host-visible names for a link; the manager interprets
//! neither link hints nor send timeouts, it only keeps the mapping and
//! surfaces open/closed status with the link's properties.

use std::collections::HashMap;

use tracing::debug;

use crate::error::ManagerError;
use crate::types::{ConnectionId, ConnectionStatus, LinkId, LinkType, SdkHandle};

use super::core::ManagerCore;
use super::types::{Connection, ACTIVATED_ONLY};

pub(crate) struct ConnectionManager {
    pub connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    pub fn get(&self, conn_id: &ConnectionId) -> Result<&Connection, ManagerError> {
        self.connections
            .get(conn_id)
            .ok_or_else(|| ManagerError::UnknownConnection(conn_id.clone()))
    }

    pub fn teardown(&mut self) {
        self.connections.clear();
    }
}

impl ManagerCore {
    pub(crate) async fn open_connection(
        &mut self,
        handle: SdkHandle,
        link_type: LinkType,
        link_id: LinkId,
        link_hints: String,
        send_timeout: i32,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        // hints, type, and timeout are accepted but not interpreted here
        debug!(handle, link = %link_id, ?link_type, link_hints, send_timeout, "opening connection");

        let conn_id = self.sdk.generate_connection_id(&link_id);
        let link = self.links.get_mut(&link_id)?;
        link.connections.insert(conn_id.clone());
        let props = link.props.clone();
        self.connections.connections.insert(
            conn_id.clone(),
            Connection {
                conn_id: conn_id.clone(),
                link_id,
            },
        );
        self.sdk
            .on_connection_status_changed(handle, &conn_id, ConnectionStatus::Open, &props);
        Ok(())
    }

    pub(crate) async fn close_connection(
        &mut self,
        handle: SdkHandle,
        conn_id: ConnectionId,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        debug!(handle, conn = %conn_id, "closing connection");

        let Some(conn) = self.connections.connections.remove(&conn_id) else {
            return Err(ManagerError::UnknownConnection(conn_id));
        };
        let props = match self.links.links.get_mut(&conn.link_id) {
            Some(link) => {
                link.connections.remove(&conn.conn_id);
                link.props.clone()
            }
            None => Default::default(),
        };
        self.sdk
            .on_connection_status_changed(handle, &conn.conn_id, ConnectionStatus::Closed, &props);
        Ok(())
    }
}
