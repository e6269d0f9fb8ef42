//! Package manager — fragments outbound packages across upcoming actions
//! and drives the encoders.
//!
//! Admission requires at least one upcoming action on the target link with
//! room for part of the package; otherwise the send is rejected as
//! temporary and the host retries after `unblock_queue`. Assigned
//! fragments are byte ranges; the per-action payload is assembled at
//! encode time with the mode's framing (see [`super::framing`]).

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::error::ManagerError;
use crate::types::{
    now_ts, ConnectionId, EncPkg, EncodingMode, EncodingStatus, LinkId, PackageStatus,
    PluginResponse, SdkHandle, Timestamp,
};

use super::core::ManagerCore;
use super::framing::{
    put_block, put_u32, FLAG_CONTINUE_LAST_PACKAGE, FLAG_CONTINUE_NEXT_PACKAGE, LEN_PREFIX_SIZE,
    MULTIPLE_PRODUCER_OVERHEAD, SINGLE_PRODUCER_OVERHEAD,
};
use super::types::{
    ActionInfo, ActionKey, EncodingHandle, EncodingState, FragmentHandle, FragmentState,
    PackageFragmentInfo, PackageHandle, PackageInfo, ACTIVATED_ONLY,
};

/// Encode request in flight, resolved by `on_bytes_encoded`.
pub(crate) struct PendingEncoding {
    pub action: ActionKey,
    /// Index into the action's encoding list.
    pub index: usize,
}

pub(crate) struct PackageManager {
    pub packages: HashMap<PackageHandle, PackageInfo>,
    /// Fragment handle → owning package, across all links.
    pub fragments: HashMap<FragmentHandle, PackageHandle>,
    pub pending_encodings: HashMap<EncodingHandle, PendingEncoding>,
    next_encoding_handle: u64,
    next_fragment_handle: u64,
}

impl PackageManager {
    pub fn new() -> Self {
        Self {
            packages: HashMap::new(),
            fragments: HashMap::new(),
            pending_encodings: HashMap::new(),
            next_encoding_handle: 1,
            next_fragment_handle: 1,
        }
    }

    pub fn allocate_encoding_handle(&mut self) -> EncodingHandle {
        let handle = EncodingHandle(self.next_encoding_handle);
        self.next_encoding_handle += 1;
        handle
    }

    pub fn allocate_fragment_handle(&mut self) -> FragmentHandle {
        let handle = FragmentHandle(self.next_fragment_handle);
        self.next_fragment_handle += 1;
        handle
    }

    pub fn teardown(&mut self) {
        self.packages.clear();
        self.fragments.clear();
        self.pending_encodings.clear();
    }
}

// ── Capacity arithmetic ──────────────────────────────────────────────────────

/// Byte lengths of the fragments currently assigned to `info`.
pub(crate) fn assigned_lens(packages: &PackageManager, info: &ActionInfo) -> Vec<usize> {
    info.fragments
        .iter()
        .filter_map(|fh| {
            let ph = packages.fragments.get(fh)?;
            let pkg = packages.packages.get(ph)?;
            pkg.fragments.iter().find(|f| f.handle == *fh).map(|f| f.len)
        })
        .collect()
}

/// Payload bytes a further fragment could still occupy in this action.
///
/// Zero for actions on their way out, actions whose encodings have already
/// started, and single-mode actions that already carry their one fragment.
pub(crate) fn space_available_in_action(
    mode: EncodingMode,
    info: &ActionInfo,
    assigned: &[usize],
) -> usize {
    if info.to_be_removed {
        return 0;
    }
    if mode == EncodingMode::Single && !info.fragments.is_empty() {
        return 0;
    }
    if info
        .encodings
        .iter()
        .any(|e| e.state != EncodingState::Unencoded)
    {
        return 0;
    }

    let per_fragment = match mode {
        EncodingMode::Single => 0,
        _ => LEN_PREFIX_SIZE,
    };
    let per_action = match mode {
        EncodingMode::Single | EncodingMode::Batch => 0,
        EncodingMode::FragmentSingleProducer => SINGLE_PRODUCER_OVERHEAD,
        EncodingMode::FragmentMultipleProducer => MULTIPLE_PRODUCER_OVERHEAD,
    };

    let max_bytes: usize = info.encodings.iter().map(|e| e.props.max_bytes).sum();
    let filled: usize = per_action + assigned.iter().map(|len| per_fragment + len).sum::<usize>();

    // watch out for underflow
    if max_bytes > filled + per_fragment {
        max_bytes - filled - per_fragment
    } else {
        0
    }
}

/// Whether this action can take the package (whole in non-fragmenting
/// modes, any non-trivial piece otherwise).
pub(crate) fn is_action_able_to_fit(
    mode: EncodingMode,
    info: &ActionInfo,
    assigned: &[usize],
    pkg_size: usize,
) -> bool {
    let space = space_available_in_action(mode, info, assigned);
    const MIN_FRAGMENT_SIZE: usize = 1;
    match mode {
        EncodingMode::Single | EncodingMode::Batch => space > pkg_size,
        _ => space > MIN_FRAGMENT_SIZE,
    }
}

/// An action inside the encode window can no longer accept fragments.
pub(crate) fn is_time_to_encode(now: Timestamp, max_encoding_time: f64, ts: Timestamp) -> bool {
    now + max_encoding_time <= ts
}

/// A package is finished when any fragment failed, or when its fragments
/// cover the whole package and all of them were sent.
pub(crate) fn is_package_finished(pkg: &PackageInfo) -> bool {
    if pkg
        .fragments
        .iter()
        .any(|f| f.state == FragmentState::Failed)
    {
        return true;
    }
    if pkg.fragments.is_empty() || !pkg.fully_covered() {
        return false;
    }
    pkg.fragments.iter().all(|f| f.state == FragmentState::Sent)
}

// ── Core operations ──────────────────────────────────────────────────────────

impl ManagerCore {
    /// Admit and fragment an outbound package, or reject it as temporary
    /// when no upcoming action on the link has room.
    pub(crate) fn admit_package(
        &mut self,
        now: Timestamp,
        handle: SdkHandle,
        conn_id: &ConnectionId,
        pkg: EncPkg,
    ) -> Result<PluginResponse, ManagerError> {
        let link_id = self.connections.get(conn_id)?.link_id.clone();

        let fits = {
            let link = self.links.get(&link_id)?;
            link.action_queue.iter().any(|key| {
                self.actions.actions.get(key).is_some_and(|info| {
                    let valid_link = (info.wildcard_link && info.link_id.is_empty())
                        || info.link_id == link_id;
                    valid_link
                        && is_action_able_to_fit(
                            self.mode,
                            info,
                            &assigned_lens(&self.packages, info),
                            pkg.size(),
                        )
                })
            })
        };
        if !fits {
            debug!(handle, link = %link_id, "no upcoming action fits; temporary rejection");
            return Ok(PluginResponse::TempError);
        }

        let ph = PackageHandle(handle);
        self.packages.packages.insert(
            ph,
            PackageInfo {
                link_id: link_id.clone(),
                handle: ph,
                pkg,
                fragments: Vec::new(),
            },
        );
        self.links.get_mut(&link_id)?.package_queue.push_back(ph);

        if !self.generate_fragments_for_package(now, &link_id, ph)? {
            debug!(handle, "package only partially covered by upcoming actions");
        }
        Ok(PluginResponse::Ok)
    }

    /// Walk the link's action queue assigning byte ranges of the package
    /// to actions with room, pinning wildcard actions on first use.
    /// Returns whether the package is now fully covered.
    fn generate_fragments_for_package(
        &mut self,
        now: Timestamp,
        link_id: &LinkId,
        ph: PackageHandle,
    ) -> Result<bool, ManagerError> {
        let queue: Vec<ActionKey> = self
            .links
            .get(link_id)?
            .action_queue
            .iter()
            .copied()
            .collect();
        let mode = self.mode;
        let max_encoding_time = self.actions.max_encoding_time;

        for key in queue {
            let (offset, size) = match self.packages.packages.get(&ph) {
                Some(pkg) => (pkg.covered_up_to(), pkg.pkg.size()),
                None => return Ok(false),
            };
            if offset >= size {
                return Ok(true);
            }

            let take = {
                let Some(info) = self.actions.actions.get(&key) else {
                    continue;
                };
                if !(info.link_id == *link_id || info.link_id.is_empty()) {
                    continue;
                }
                let lens = assigned_lens(&self.packages, info);
                if !is_action_able_to_fit(mode, info, &lens, size) {
                    continue;
                }
                if !is_time_to_encode(now, max_encoding_time, info.action.timestamp) {
                    continue;
                }
                space_available_in_action(mode, info, &lens).min(size - offset)
            };

            let fh = self.packages.allocate_fragment_handle();
            if let Some(pkg) = self.packages.packages.get_mut(&ph) {
                pkg.fragments.push(PackageFragmentInfo {
                    handle: fh,
                    action: Some(key),
                    offset,
                    len: take,
                    state: FragmentState::Unencoded,
                    mark_for_deletion: false,
                });
            }
            self.packages.fragments.insert(fh, ph);
            if let Some(info) = self.actions.actions.get_mut(&key) {
                info.fragments.push(fh);
                info.link_id = link_id.clone();
            }
            debug!(
                package = %ph,
                fragment = %fh,
                offset,
                len = take,
                link = %link_id,
                "fragment assigned"
            );

            if offset + take >= size {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Assemble and kick off the encoders for one action. Actions without
    /// fragments still encode an empty payload (cover traffic).
    pub(crate) fn encode_for_action(&mut self, key: ActionKey) -> Result<(), ManagerError> {
        let (frag_handles, link_id, action_id) = {
            let Some(info) = self.actions.actions.get(&key) else {
                return Ok(());
            };
            (
                info.fragments.clone(),
                info.link_id.clone(),
                info.action.action_id,
            )
        };
        debug!(action_id, fragments = frag_handles.len(), "encoding for action");

        if link_id.is_empty() && !frag_handles.is_empty() {
            return Err(ManagerError::Internal(
                "action with fragments has no link id".into(),
            ));
        }
        if self.mode == EncodingMode::Single && frag_handles.len() > 1 {
            return Err(ManagerError::Internal(
                "multiple fragments in an action with single mode".into(),
            ));
        }

        let mut payload = Vec::new();
        if !frag_handles.is_empty() {
            // resolve fragment bodies before touching the link counter
            let mut bodies: Vec<(FragmentHandle, Vec<u8>, bool, usize)> = Vec::new();
            for fh in &frag_handles {
                let Some(ph) = self.packages.fragments.get(fh) else {
                    warn!(fragment = %fh, "assigned fragment vanished");
                    continue;
                };
                let Some(pkg) = self.packages.packages.get(ph) else {
                    continue;
                };
                let Some(frag) = pkg.fragments.iter().find(|f| f.handle == *fh) else {
                    continue;
                };
                let body = pkg.pkg.as_bytes()[frag.offset..frag.offset + frag.len].to_vec();
                let is_last_of_package = frag.offset + frag.len >= pkg.pkg.size();
                bodies.push((*fh, body, is_last_of_package, frag.offset));
            }

            let link = self.links.get_mut(&link_id)?;
            if self.mode == EncodingMode::FragmentMultipleProducer {
                payload.extend_from_slice(&link.producer_id);
            }
            if matches!(
                self.mode,
                EncodingMode::FragmentSingleProducer | EncodingMode::FragmentMultipleProducer
            ) {
                put_u32(&mut payload, link.fragment_count);
                link.fragment_count += 1;

                let mut flags = 0u8;
                if let Some((_, _, _, first_offset)) = bodies.first() {
                    if *first_offset != 0 {
                        flags |= FLAG_CONTINUE_LAST_PACKAGE;
                    }
                }
                if let Some((_, _, last_of_package, _)) = bodies.last() {
                    if !*last_of_package {
                        flags |= FLAG_CONTINUE_NEXT_PACKAGE;
                    }
                }
                payload.push(flags);
            }

            for (fh, body, _, _) in &bodies {
                if self.mode == EncodingMode::Single {
                    payload.extend_from_slice(body);
                } else {
                    put_block(&mut payload, body);
                }
                if let Some(ph) = self.packages.fragments.get(fh) {
                    if let Some(pkg) = self.packages.packages.get_mut(ph) {
                        if let Some(frag) = pkg.fragments.iter_mut().find(|f| f.handle == *fh) {
                            frag.state = FragmentState::Encoding;
                        }
                    }
                }
            }
        }

        // one encode request per still-unencoded encoding slot
        let encoding_count = self
            .actions
            .actions
            .get(&key)
            .map(|info| info.encodings.len())
            .unwrap_or(0);
        for index in 0..encoding_count {
            let params = {
                let Some(info) = self.actions.actions.get_mut(&key) else {
                    break;
                };
                let enc = &mut info.encodings[index];
                if enc.state != EncodingState::Unencoded {
                    continue;
                }
                enc.params.link_id = link_id.clone();
                enc.params.clone()
            };

            if self.lifetime.encoding_for_params(&params).is_none() {
                error!(encoding_type = %params.encoding_type, "no encoding for action params");
                continue;
            }

            let encode_handle = self.packages.allocate_encoding_handle();
            self.packages
                .pending_encodings
                .insert(encode_handle, PendingEncoding { action: key, index });
            if let Some(info) = self.actions.actions.get_mut(&key) {
                let enc = &mut info.encodings[index];
                enc.pending_encode_handle = Some(encode_handle);
                enc.state = EncodingState::Encoding;
            }

            if let Some(encoder) = self.lifetime.encoding_for_params(&params) {
                encoder.encode_bytes(encode_handle.raw(), params, payload.clone());
            }
        }
        Ok(())
    }

    /// Encoded content is ready: hand it to the transport and advance the
    /// encoding state machine. Unknown handles are dropped silently — the
    /// action may have been cancelled or already executed.
    pub(crate) fn on_bytes_encoded(
        &mut self,
        handle: SdkHandle,
        bytes: Vec<u8>,
        status: EncodingStatus,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        let Some(pending) = self
            .packages
            .pending_encodings
            .remove(&EncodingHandle(handle))
        else {
            debug!(handle, "no pending encoding; action may have been cancelled");
            return Ok(());
        };

        if status != EncodingStatus::Ok {
            // drop the assignment; a later tick may re-encode
            error!(handle, "encoding failed");
            return Ok(());
        }

        let (params, action, frag_handles) = {
            let Some(info) = self.actions.actions.get_mut(&pending.action) else {
                warn!(handle, "encoded bytes for a vanished action");
                return Ok(());
            };
            let Some(enc) = info.encodings.get_mut(pending.index) else {
                return Ok(());
            };
            enc.state = EncodingState::Enqueued;
            enc.pending_encode_handle = None;

            let all_enqueued = info
                .encodings
                .iter()
                .all(|e| e.state == EncodingState::Enqueued);
            (
                info.encodings[pending.index].params.clone(),
                info.action.clone(),
                if all_enqueued {
                    info.fragments.clone()
                } else {
                    Vec::new()
                },
            )
        };

        self.transport()?.enqueue_content(params, action, bytes);

        for fh in frag_handles {
            if let Some(ph) = self.packages.fragments.get(&fh) {
                if let Some(pkg) = self.packages.packages.get_mut(ph) {
                    if let Some(frag) = pkg.fragments.iter_mut().find(|f| f.handle == fh) {
                        frag.state = FragmentState::Enqueued;
                    }
                }
            }
        }
        Ok(())
    }

    /// Transport verdict for one fragment. When it finishes its package,
    /// the terminal status is surfaced exactly once and any still-unencoded
    /// siblings are reassigned to other actions.
    pub(crate) fn on_package_status_changed(
        &mut self,
        handle: SdkHandle,
        status: PackageStatus,
    ) -> Result<(), ManagerError> {
        self.expect_state(ACTIVATED_ONLY)?;
        let fh = FragmentHandle(handle);
        let Some(ph) = self.packages.fragments.remove(&fh) else {
            debug!(handle, ?status, "status for unknown fragment");
            return Ok(());
        };
        debug!(fragment = %fh, package = %ph, ?status, "fragment status");

        let (link_id, reset_actions) = {
            let Some(pkg) = self.packages.packages.get_mut(&ph) else {
                return Ok(());
            };
            if let Some(frag) = pkg.fragments.iter_mut().find(|f| f.handle == fh) {
                match status {
                    PackageStatus::Sent => frag.state = FragmentState::Sent,
                    PackageStatus::Received => {}
                    _ => frag.state = FragmentState::Failed,
                }
            }
            if !is_package_finished(pkg) {
                return Ok(());
            }

            // actions carrying unencoded parts of this package must give
            // those slots back
            let mut reset_actions: Vec<ActionKey> = pkg
                .fragments
                .iter()
                .filter(|f| f.state == FragmentState::Unencoded)
                .filter_map(|f| f.action)
                .collect();
            reset_actions.dedup();
            (pkg.link_id.clone(), reset_actions)
        };

        let reassign = !reset_actions.is_empty();
        for key in reset_actions {
            let fhs = match self.actions.actions.get_mut(&key) {
                Some(info) => std::mem::take(&mut info.fragments),
                None => continue,
            };
            for fh2 in fhs {
                if let Some(ph2) = self.packages.fragments.get(&fh2).copied() {
                    if let Some(pkg2) = self.packages.packages.get_mut(&ph2) {
                        if let Some(frag) = pkg2.fragments.iter_mut().find(|f| f.handle == fh2) {
                            frag.mark_for_deletion = true;
                            frag.action = None;
                        }
                    }
                }
            }
        }

        // drop the remaining index entries before the package goes away
        if let Some(pkg) = self.packages.packages.get(&ph) {
            let handles: Vec<FragmentHandle> = pkg.fragments.iter().map(|f| f.handle).collect();
            for h in handles {
                self.packages.fragments.remove(&h);
            }
        }

        self.sdk.on_package_status_changed(ph.raw(), status);
        if let Some(link) = self.links.links.get_mut(&link_id) {
            link.package_queue.retain(|p| *p != ph);
        }
        self.packages.packages.remove(&ph);

        if reassign {
            self.generate_fragments_for_all();
        }
        Ok(())
    }

    /// Reset every not-yet-started assignment and redo them round-robin
    /// across links, then unblock connections with remaining capacity.
    pub(crate) fn generate_fragments_for_all(&mut self) {
        let now = now_ts();
        let link_ids = self.links.sorted_ids();
        let max_encoding_time = self.actions.max_encoding_time;

        // reset phase: give back assignments whose encode hasn't started
        for link_id in &link_ids {
            let queue: Vec<ActionKey> = self.links.links[link_id]
                .action_queue
                .iter()
                .copied()
                .collect();
            for key in queue {
                let fhs = {
                    let Some(info) = self.actions.actions.get_mut(&key) else {
                        continue;
                    };
                    if !is_time_to_encode(now, max_encoding_time, info.action.timestamp) {
                        continue;
                    }
                    if info
                        .encodings
                        .iter()
                        .any(|e| e.state != EncodingState::Unencoded)
                    {
                        continue;
                    }
                    if info.wildcard_link {
                        info.link_id.clear();
                    }
                    std::mem::take(&mut info.fragments)
                };
                for fh in fhs {
                    if let Some(ph) = self.packages.fragments.get(&fh).copied() {
                        if let Some(pkg) = self.packages.packages.get_mut(&ph) {
                            if let Some(frag) = pkg.fragments.iter_mut().find(|f| f.handle == fh) {
                                frag.mark_for_deletion = true;
                                frag.action = None;
                            }
                        }
                    }
                }
            }
            self.remove_marked_fragments(link_id);
        }

        // assignment phase: one package slot per link per pass
        let max_packages = link_ids
            .iter()
            .map(|id| self.links.links[id].package_queue.len())
            .max()
            .unwrap_or(0);
        let mut queue_full = vec![false; link_ids.len()];
        for i in 0..max_packages {
            for (j, link_id) in link_ids.iter().enumerate() {
                if queue_full[j] {
                    continue;
                }
                let Some(&ph) = self.links.links[link_id].package_queue.get(i) else {
                    continue;
                };
                if self
                    .packages
                    .packages
                    .get(&ph)
                    .is_none_or(|p| p.fully_covered())
                {
                    continue;
                }
                match self.generate_fragments_for_package(now, link_id, ph) {
                    Ok(true) => {}
                    Ok(false) => queue_full[j] = true,
                    Err(e) => {
                        warn!(link = %link_id, error = %e, "fragment generation failed");
                        queue_full[j] = true;
                    }
                }
            }
        }

        // links with capacity left are no longer blocked; redundant
        // unblocks are harmless
        for (j, link_id) in link_ids.iter().enumerate() {
            if queue_full[j] {
                continue;
            }
            if let Some(link) = self.links.links.get(link_id) {
                let mut conns: Vec<ConnectionId> = link.connections.iter().cloned().collect();
                conns.sort();
                for conn_id in conns {
                    self.sdk.unblock_queue(&conn_id);
                }
            }
        }
    }

    /// Truncate each package's fragment list from the first fragment
    /// marked for deletion; later fragments are detached from their
    /// actions so no stale handle survives.
    fn remove_marked_fragments(&mut self, link_id: &LinkId) {
        let Some(link) = self.links.links.get(link_id) else {
            return;
        };
        let queue: Vec<PackageHandle> = link.package_queue.iter().copied().collect();
        for ph in queue {
            let mut detached: Vec<(FragmentHandle, Option<ActionKey>)> = Vec::new();
            {
                let packages = &mut self.packages;
                let Some(pkg) = packages.packages.get_mut(&ph) else {
                    continue;
                };
                let Some(pos) = pkg.fragments.iter().position(|f| f.mark_for_deletion) else {
                    continue;
                };
                for frag in &pkg.fragments[pos..] {
                    packages.fragments.remove(&frag.handle);
                    detached.push((frag.handle, frag.action));
                }
                pkg.fragments.truncate(pos);
            }
            for (fh, action) in detached {
                if let Some(key) = action {
                    if let Some(info) = self.actions.actions.get_mut(&key) {
                        info.fragments.retain(|h| *h != fh);
                    }
                }
            }
        }
    }

    /// The action executed: retire its encodings and detach its fragments.
    pub(crate) fn action_done(&mut self, key: ActionKey) {
        let (stale, frag_handles) = {
            let Some(info) = self.actions.actions.get_mut(&key) else {
                return;
            };
            let mut stale = Vec::new();
            for enc in &mut info.encodings {
                if let Some(h) = enc.pending_encode_handle.take() {
                    stale.push(h);
                }
                enc.state = EncodingState::Done;
            }
            (stale, info.fragments.clone())
        };

        for h in stale {
            if self.packages.pending_encodings.remove(&h).is_some() {
                warn!(encode_handle = %h, "action completed while encoding still pending");
            }
        }
        for fh in frag_handles {
            if let Some(ph) = self.packages.fragments.get(&fh) {
                if let Some(pkg) = self.packages.packages.get_mut(ph) {
                    if let Some(frag) = pkg.fragments.iter_mut().find(|f| f.handle == fh) {
                        frag.state = FragmentState::Done;
                        frag.action = None;
                    }
                }
            }
        }
    }

    /// The link is gone: cancel its pending encodings, fail every queued
    /// package once, and drop their fragment records.
    pub(crate) fn packages_on_link_destroyed(&mut self, link_id: &LinkId) {
        let Some(link) = self.links.links.get(link_id) else {
            return;
        };
        let action_queue: Vec<ActionKey> = link.action_queue.iter().copied().collect();
        let package_queue: Vec<PackageHandle> = link.package_queue.iter().copied().collect();

        for key in action_queue {
            let stale = {
                let Some(info) = self.actions.actions.get_mut(&key) else {
                    continue;
                };
                let mut stale = Vec::new();
                for enc in &mut info.encodings {
                    if let Some(h) = enc.pending_encode_handle.take() {
                        stale.push(h);
                    }
                    enc.state = EncodingState::Unencoded;
                }
                info.fragments.clear();
                stale
            };
            for h in stale {
                self.packages.pending_encodings.remove(&h);
            }
        }

        for ph in package_queue {
            let Some(pkg) = self.packages.packages.remove(&ph) else {
                continue;
            };
            self.sdk
                .on_package_status_changed(pkg.handle.raw(), PackageStatus::FailedGeneric);
            for frag in &pkg.fragments {
                self.packages.fragments.remove(&frag.handle);
            }
        }
        if let Some(link) = self.links.links.get_mut(link_id) {
            link.package_queue.clear();
        }
    }
}
