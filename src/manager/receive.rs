//! Receive-package manager — decodes inbound content and reassembles
//! fragmented packages.
//!
//! Decoded bytes are de-framed according to the manager's encoding mode.
//! Fragment modes keep per-producer state on the link: a counter gap drops
//! the in-progress buffer (out-of-order delivery is not supported), and a
//! body that continues a lost fragment is discarded rather than delivered
//! as a corrupt package. An empty decode result is cover traffic.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::ManagerError;
use crate::types::{
    ConnectionId, EncPkg, EncodingMode, EncodingParameters, EncodingStatus, LinkId, SdkHandle,
};

use super::core::ManagerCore;
use super::framing::{FrameReader, FLAG_CONTINUE_LAST_PACKAGE, FLAG_CONTINUE_NEXT_PACKAGE};
use super::types::{DecodingHandle, ACTIVATED_ONLY};

pub(crate) struct ReceiveManager {
    /// Decode request → link the content arrived on.
    pub pending_decodings: HashMap<DecodingHandle, LinkId>,
    next_decoding_handle: u64,
}

impl ReceiveManager {
    pub fn new() -> Self {
        Self {
            pending_decodings: HashMap::new(),
            next_decoding_handle: 1,
        }
    }

    pub fn allocate_handle(&mut self) -> DecodingHandle {
        let handle = DecodingHandle(self.next_decoding_handle);
        self.next_decoding_handle += 1;
        handle
    }

    pub fn teardown(&mut self) {
        self.pending_decodings.clear();
    }
}

impl ManagerCore {
    /// Content arrived on a link: pick the matching decoder and kick off
    /// an asynchronous decode.
    pub(crate) fn on_receive(
        &mut self,
        link_id: LinkId,
        params: EncodingParameters,
        bytes: Vec<u8>,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        debug!(link = %link_id, size = bytes.len(), "content received");

        if self.lifetime.encoding_for_params(&params).is_none() {
            return Err(ManagerError::NoEncodingForType(params.encoding_type));
        }
        let handle = self.receive.allocate_handle();
        self.receive.pending_decodings.insert(handle, link_id);
        if let Some(decoder) = self.lifetime.encoding_for_params(&params) {
            decoder.decode_bytes(handle.raw(), params, bytes);
        }
        Ok(())
    }

    pub(crate) fn on_bytes_decoded(
        &mut self,
        handle: SdkHandle,
        bytes: Vec<u8>,
        status: EncodingStatus,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        let Some(link_id) = self
            .receive
            .pending_decodings
            .remove(&DecodingHandle(handle))
        else {
            debug!(handle, "decoded bytes without a pending decode");
            return Ok(());
        };

        if status != EncodingStatus::Ok {
            warn!(handle, link = %link_id, "decode failed");
            return Ok(());
        }
        if bytes.is_empty() {
            // expected result of decoding cover traffic
            debug!(link = %link_id, "empty decode result discarded");
            return Ok(());
        }

        let conn_ids = {
            let Some(link) = self.links.links.get(&link_id) else {
                // link destroyed while the decode was in flight
                debug!(link = %link_id, "decoded bytes for a missing link");
                return Ok(());
            };
            let mut ids: Vec<ConnectionId> = link.connections.iter().cloned().collect();
            ids.sort();
            ids
        };

        match self.mode {
            EncodingMode::Single => {
                self.sdk.receive_enc_pkg(EncPkg::new(bytes), &conn_ids);
                Ok(())
            }
            EncodingMode::Batch => {
                let mut reader = FrameReader::new(&bytes);
                while reader.has_remaining() {
                    let body = reader.read_block()?;
                    self.sdk.receive_enc_pkg(EncPkg::new(body.to_vec()), &conn_ids);
                }
                Ok(())
            }
            EncodingMode::FragmentSingleProducer => {
                let reader = FrameReader::new(&bytes);
                self.receive_fragments(&link_id, Vec::new(), reader, &conn_ids)
            }
            EncodingMode::FragmentMultipleProducer => {
                let mut reader = FrameReader::new(&bytes);
                let producer = reader.read_producer_id()?;
                self.receive_fragments(&link_id, producer.to_vec(), reader, &conn_ids)
            }
        }
    }

    /// Reassembly for the fragment modes; `producer` is empty in
    /// single-producer mode.
    fn receive_fragments(
        &mut self,
        link_id: &LinkId,
        producer: Vec<u8>,
        mut reader: FrameReader<'_>,
        conn_ids: &[ConnectionId],
    ) -> Result<(), ManagerError> {
        let sdk = self.sdk.clone();
        let Some(link) = self.links.links.get_mut(link_id) else {
            return Ok(());
        };
        let queue = link.producer_queues.entry(producer).or_default();

        let fragment_id = reader.read_u32()?;
        if fragment_id != queue.last_fragment_received.wrapping_add(1) {
            // out-of-order delivery is unsupported; drop the old partial
            if !queue.pending_bytes.is_empty() {
                debug!(link = %link_id, fragment_id, "fragment gap; dropping pending bytes");
            }
            queue.pending_bytes.clear();
        }
        queue.last_fragment_received = fragment_id;

        let flags = reader.read_u8()?;
        if flags & FLAG_CONTINUE_LAST_PACKAGE == 0 && !queue.pending_bytes.is_empty() {
            // previous fragment promised a continuation that never came
            debug!(link = %link_id, "clearing stale pending bytes");
            queue.pending_bytes.clear();
        }

        let mut first_body = true;
        while reader.has_remaining() {
            let body = reader.read_block()?;

            if first_body
                && flags & FLAG_CONTINUE_LAST_PACKAGE != 0
                && queue.pending_bytes.is_empty()
            {
                // an earlier fragment of this package was lost; the rest
                // can't be reconstructed
                first_body = false;
                debug!(link = %link_id, "dropping body with missing predecessor");
                continue;
            }
            first_body = false;

            queue.pending_bytes.extend_from_slice(body);

            if flags & FLAG_CONTINUE_NEXT_PACKAGE != 0 && !reader.has_remaining() {
                debug!(link = %link_id, "package continues in a later fragment");
                continue;
            }

            let pkg = EncPkg::new(std::mem::take(&mut queue.pending_bytes));
            sdk.receive_enc_pkg(pkg, conn_ids);
        }
        Ok(())
    }
}
