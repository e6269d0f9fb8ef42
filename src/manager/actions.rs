//! Action manager — the ordered timeline of transmission opportunities.
//!
//! Keeps the global action deque ordered by `(timestamp, action id)`,
//! merged from user-model timeline fetches, and wakes a dedicated
//! scheduler task at the earliest of three deadlines: re-fetch the
//! timeline, execute the front action, or encode content for actions
//! entering the encode window. The scheduler holds no state; it sleeps on
//! a deadline published over a watch channel and posts a tick back to the
//! dispatcher, which does the actual work.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::ManagerError;
use crate::types::{now_ts, Action, ActionTimeline, ConnectionId, LinkId, Timestamp};

use super::core::ManagerCore;
use super::types::{action_lt, ActionInfo, ActionKey, EncodingInfo, EncodingState, ManagerState};
use super::{Dispatch, Op};

pub(crate) struct ActionManager {
    pub actions: HashMap<ActionKey, ActionInfo>,
    /// Global deque ordered by `(timestamp, action_id)`.
    pub order: VecDeque<ActionKey>,
    next_key: u64,
    /// Worst case seconds from encode kick-off to content ready, over all
    /// supported action classes, plus dispatcher slack.
    pub max_encoding_time: f64,
    pub timeline_length: f64,
    pub timeline_fetch_period: f64,
    pub next_fetch_time: Timestamp,
    pub next_action_time: Timestamp,
    pub next_encode_time: Timestamp,
    pub last_encode_time: Timestamp,
    deadline_tx: watch::Sender<f64>,
    deadline_rx: watch::Receiver<f64>,
    scheduler_token: CancellationToken,
    scheduler_task: Option<JoinHandle<()>>,
}

impl ActionManager {
    pub fn new() -> Self {
        let (deadline_tx, deadline_rx) = watch::channel(f64::INFINITY);
        Self {
            actions: HashMap::new(),
            order: VecDeque::new(),
            next_key: 1,
            max_encoding_time: 0.0,
            timeline_length: 0.0,
            timeline_fetch_period: 0.0,
            next_fetch_time: 0.0,
            next_action_time: f64::INFINITY,
            next_encode_time: f64::INFINITY,
            last_encode_time: 0.0,
            deadline_tx,
            deadline_rx,
            scheduler_token: CancellationToken::new(),
            scheduler_task: None,
        }
    }

    pub fn allocate_key(&mut self) -> ActionKey {
        let key = ActionKey(self.next_key);
        self.next_key += 1;
        key
    }

    pub fn timestamp_of(&self, key: ActionKey) -> Option<Timestamp> {
        self.actions.get(&key).map(|a| a.action.timestamp)
    }

    /// Earliest queued action, or +inf when the deque is empty.
    pub fn update_action_timestamp(&mut self) {
        self.next_action_time = self
            .order
            .front()
            .and_then(|k| self.timestamp_of(*k))
            .unwrap_or(f64::INFINITY);
    }

    /// Encode deadline of the earliest action not yet encoded for.
    pub fn update_encode_timestamp(&mut self) {
        self.next_encode_time = f64::INFINITY;
        for key in &self.order {
            if let Some(info) = self.actions.get(key) {
                if info.action.timestamp <= self.last_encode_time {
                    continue;
                }
                self.next_encode_time = info.action.timestamp - self.max_encoding_time;
                break;
            }
        }
    }

    /// Publish the earliest deadline; the scheduler blocks on this after
    /// every tick, so it must be called even when nothing changed.
    pub fn publish_deadlines(&self) {
        let deadline = self
            .next_fetch_time
            .min(self.next_action_time)
            .min(self.next_encode_time);
        let _ = self.deadline_tx.send(deadline);
    }

    pub fn spawn_scheduler(&mut self, dispatch: Dispatch) {
        let token = CancellationToken::new();
        self.scheduler_token = token.clone();
        self.scheduler_task = Some(tokio::spawn(run_scheduler(
            dispatch,
            self.deadline_rx.clone(),
            token,
        )));
        self.publish_deadlines();
    }

    pub async fn join_scheduler(&mut self) {
        self.scheduler_token.cancel();
        if let Some(task) = self.scheduler_task.take() {
            let _ = task.await;
        }
    }

    pub fn teardown(&mut self) {
        self.actions.clear();
        self.order.clear();
        self.next_fetch_time = 0.0;
        self.next_action_time = f64::INFINITY;
        self.next_encode_time = f64::INFINITY;
        self.last_encode_time = 0.0;
        self.scheduler_token.cancel();
        let _ = self.deadline_tx.send(f64::INFINITY);
    }

    // ── Timeline merging ─────────────────────────────────────────────────

    /// Merge a fetched timeline into the current order. Existing entries
    /// the user model no longer returns are kept but flagged for removal,
    /// unless they predate `start` (outside the fetch window).
    pub fn plan_fetch_merge(&self, new: &[Action], start: Timestamp) -> MergePlan {
        let mut slots = Vec::new();
        let mut removed = Vec::new();

        let old: Vec<ActionKey> = self.order.iter().copied().collect();
        let mut i = 0;

        // entries before the window are preserved as-is
        while i < old.len() {
            match self.actions.get(&old[i]) {
                Some(info) if info.action.timestamp < start => {
                    slots.push(MergeSlot::Existing(old[i]));
                    i += 1;
                }
                _ => break,
            }
        }

        let mut j = 0;
        loop {
            let old_info = old.get(i).and_then(|k| self.actions.get(k));
            match (old_info, new.get(j)) {
                (None, None) => break,
                (None, Some(_)) => {
                    // only in the new timeline
                    slots.push(MergeSlot::Fresh(j));
                    j += 1;
                }
                (Some(_), None) => {
                    // only in the old timeline, inside the window
                    removed.push(old[i]);
                    slots.push(MergeSlot::Existing(old[i]));
                    i += 1;
                }
                (Some(info), Some(fresh)) => {
                    if action_lt(fresh, &info.action) {
                        slots.push(MergeSlot::Fresh(j));
                        j += 1;
                    } else if action_lt(&info.action, fresh) {
                        removed.push(old[i]);
                        slots.push(MergeSlot::Existing(old[i]));
                        i += 1;
                    } else {
                        // same action in both
                        slots.push(MergeSlot::Existing(old[i]));
                        i += 1;
                        j += 1;
                    }
                }
            }
        }

        MergePlan { slots, removed }
    }

    /// Merge user-model-pushed actions without the removal pass.
    pub fn plan_insert_merge(&self, new: &[Action]) -> MergePlan {
        let mut slots = Vec::new();
        let old: Vec<ActionKey> = self.order.iter().copied().collect();
        let mut i = 0;
        let mut j = 0;
        loop {
            let old_info = old.get(i).and_then(|k| self.actions.get(k));
            match (old_info, new.get(j)) {
                (None, None) => break,
                (None, Some(_)) => {
                    slots.push(MergeSlot::Fresh(j));
                    j += 1;
                }
                (Some(_), None) => {
                    slots.push(MergeSlot::Existing(old[i]));
                    i += 1;
                }
                (Some(info), Some(fresh)) => {
                    if action_lt(fresh, &info.action) {
                        slots.push(MergeSlot::Fresh(j));
                        j += 1;
                    } else if action_lt(&info.action, fresh) {
                        slots.push(MergeSlot::Existing(old[i]));
                        i += 1;
                    } else {
                        // already known; keep the existing record and its
                        // fragment assignments
                        slots.push(MergeSlot::Existing(old[i]));
                        i += 1;
                        j += 1;
                    }
                }
            }
        }
        MergePlan {
            slots,
            removed: Vec::new(),
        }
    }
}

pub(crate) enum MergeSlot {
    Existing(ActionKey),
    /// Index into the incoming timeline.
    Fresh(usize),
}

pub(crate) struct MergePlan {
    pub slots: Vec<MergeSlot>,
    pub removed: Vec<ActionKey>,
}

// ── Scheduler task ───────────────────────────────────────────────────────────

async fn run_scheduler(
    dispatch: Dispatch,
    mut deadline_rx: watch::Receiver<f64>,
    token: CancellationToken,
) {
    debug!("action scheduler running");
    loop {
        let deadline = *deadline_rx.borrow_and_update();
        tokio::select! {
            biased;

            _ = token.cancelled() => break,

            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }

            _ = sleep_until_timestamp(deadline) => {
                if dispatch.post(Op::SchedulerTick).is_none() {
                    break;
                }
                // hold off until the dispatcher has recomputed deadlines
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("action scheduler stopped");
}

async fn sleep_until_timestamp(ts: Timestamp) {
    if !ts.is_finite() {
        return std::future::pending().await;
    }
    let delta = ts - now_ts();
    if delta > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(delta)).await;
    }
}

// ── Core operations ──────────────────────────────────────────────────────────

impl ManagerCore {
    pub(crate) fn usermodel(
        &self,
    ) -> Result<&crate::components::wrappers::UserModelWrapper, ManagerError> {
        self.lifetime
            .usermodel
            .as_ref()
            .ok_or_else(|| ManagerError::Internal("no user model component".into()))
    }

    /// Compute the encode horizon, read scheduling properties, fetch the
    /// first timeline, and start the scheduler. Runs once on activation.
    pub(crate) async fn setup_actions(&mut self) -> Result<(), ManagerError> {
        let transport_props = self.transport()?.transport_properties().await?;

        let mut max_encoding_time: f64 = 0.0;
        for encoding_types in transport_props.supported_actions.values() {
            let mut encoding_time = 0.0;
            for ty in encoding_types {
                let t = self
                    .lifetime
                    .encoding_time_for_type(ty)
                    .ok_or_else(|| ManagerError::NoEncodingForType(ty.clone()))?;
                encoding_time += t;
            }
            max_encoding_time = max_encoding_time.max(encoding_time);
        }
        // slack for dispatch latency between deadline and encode kick-off
        self.actions.max_encoding_time = max_encoding_time + 0.1;

        let um_props = self.usermodel()?.user_model_properties().await?;
        self.actions.timeline_length = um_props.timeline_length;
        self.actions.timeline_fetch_period = um_props.timeline_fetch_period;
        debug!(
            max_encoding_time = self.actions.max_encoding_time,
            timeline_length = self.actions.timeline_length,
            fetch_period = self.actions.timeline_fetch_period,
            "action manager configured"
        );

        self.fetch_timeline().await?;
        self.actions.spawn_scheduler(self.dispatch.clone());
        Ok(())
    }

    pub(crate) async fn on_timeline_updated(&mut self) -> Result<(), ManagerError> {
        self.expect_state(super::types::ACTIVATED_ONLY)?;
        self.fetch_timeline().await
    }

    pub(crate) async fn fetch_timeline(&mut self) -> Result<(), ManagerError> {
        let start = now_ts() + self.actions.max_encoding_time;
        let end = start + self.actions.timeline_length;
        debug!(start, end, "fetching timeline");
        let timeline = self.usermodel()?.timeline(start, end).await?;
        self.actions.next_fetch_time = start + self.actions.timeline_fetch_period;
        self.apply_timeline_update(timeline, start).await
    }

    async fn apply_timeline_update(
        &mut self,
        timeline: ActionTimeline,
        start: Timestamp,
    ) -> Result<(), ManagerError> {
        let plan = self.actions.plan_fetch_merge(&timeline, start);
        self.apply_merge_plan(plan, &timeline).await?;
        self.update_link_timelines();
        self.remove_deleted_actions();
        self.actions.update_action_timestamp();
        self.actions.update_encode_timestamp();
        self.actions.publish_deadlines();
        Ok(())
    }

    async fn apply_merge_plan(
        &mut self,
        plan: MergePlan,
        timeline: &[Action],
    ) -> Result<(), ManagerError> {
        let mut new_order = VecDeque::with_capacity(plan.slots.len());
        for slot in plan.slots {
            match slot {
                MergeSlot::Existing(key) => new_order.push_back(key),
                MergeSlot::Fresh(index) => {
                    let key = self.create_action_info(timeline[index].clone()).await?;
                    new_order.push_back(key);
                }
            }
        }
        self.actions.order = new_order;
        for key in plan.removed {
            if let Some(info) = self.actions.actions.get_mut(&key) {
                info.to_be_removed = true;
            }
        }
        Ok(())
    }

    /// Build the bookkeeping record for a newly scheduled action: resolve
    /// its target link (or wildcard) and one encoding slot per parameter.
    async fn create_action_info(&mut self, action: Action) -> Result<ActionKey, ManagerError> {
        let params = self.transport()?.action_params(&action).await?;
        let key = self.actions.allocate_key();
        let mut info = ActionInfo {
            key,
            action,
            wildcard_link: false,
            link_id: LinkId::new(),
            encodings: Vec::new(),
            fragments: Vec::new(),
            to_be_removed: false,
        };

        for param in params {
            if param.encode_package {
                if param.link_id.is_empty() {
                    error!("encoding params with encode_package must set a link id");
                } else if info.link_id.is_empty() {
                    info.link_id = param.link_id.clone();
                } else if info.link_id != param.link_id {
                    return Err(ManagerError::Internal(
                        "actions associated with multiple link ids are not supported".into(),
                    ));
                }
                info.wildcard_link |= param.link_id == "*";
            }

            let encoding = self
                .lifetime
                .encoding_for_params(&param)
                .ok_or_else(|| ManagerError::NoEncodingForType(param.encoding_type.clone()))?;
            let props = encoding.properties_for_parameters(&param).await?;
            info.encodings.push(EncodingInfo {
                params: param,
                props,
                pending_encode_handle: None,
                state: EncodingState::Unencoded,
            });
        }

        if info.wildcard_link {
            info.link_id.clear();
        }

        self.actions.actions.insert(key, info);
        Ok(key)
    }

    /// Rebuild every link's action queue as the matching subsequence of
    /// the global order; wildcard actions land on every link. This is the
    /// only way the package manager learns which actions can carry a
    /// link's packages, so fragment assignments are refreshed afterwards.
    pub(crate) fn update_link_timelines(&mut self) {
        let mut queues: HashMap<LinkId, VecDeque<ActionKey>> = HashMap::new();
        for key in &self.actions.order {
            let Some(info) = self.actions.actions.get(key) else {
                continue;
            };
            if info.wildcard_link {
                for link_id in self.links.links.keys() {
                    queues.entry(link_id.clone()).or_default().push_back(info.key);
                }
            } else if !info.link_id.is_empty() {
                queues
                    .entry(info.link_id.clone())
                    .or_default()
                    .push_back(info.key);
            }
        }
        for (link_id, link) in self.links.links.iter_mut() {
            link.action_queue = queues.remove(link_id).unwrap_or_default();
        }
        self.generate_fragments_for_all();
    }

    fn remove_deleted_actions(&mut self) {
        let removed: Vec<ActionKey> = self
            .actions
            .order
            .iter()
            .copied()
            .filter(|key| {
                self.actions
                    .actions
                    .get(key)
                    .is_none_or(|info| info.to_be_removed)
            })
            .collect();

        for key in &removed {
            let Some(info) = self.actions.actions.remove(key) else {
                continue;
            };
            // detach any fragments still riding on the removed action so
            // no dangling action reference survives
            for fh in info.fragments {
                if let Some(ph) = self.packages.fragments.get(&fh).copied() {
                    if let Some(pkg) = self.packages.packages.get_mut(&ph) {
                        if let Some(frag) = pkg.fragments.iter_mut().find(|f| f.handle == fh) {
                            frag.action = None;
                            frag.mark_for_deletion = true;
                        }
                    }
                }
            }
        }

        if !removed.is_empty() {
            let removed: std::collections::HashSet<ActionKey> = removed.into_iter().collect();
            self.actions.order.retain(|key| !removed.contains(key));
        }
        self.update_link_timelines();
    }

    /// Tell the user model a package is being sent; it may answer with
    /// extra actions, which are clamped to the encode horizon and merged.
    pub(crate) async fn usermodel_on_send_package(
        &mut self,
        now: Timestamp,
        conn_id: &ConnectionId,
        bytes: usize,
    ) -> Result<(), ManagerError> {
        let link_id = self.connections.get(conn_id)?.link_id.clone();
        let mut timeline = self.usermodel()?.on_send_package(&link_id, bytes).await?;
        if timeline.is_empty() {
            return Ok(());
        }

        // an action can't be encoded for in the past
        let floor = now + self.actions.max_encoding_time;
        for action in &mut timeline {
            if action.timestamp < floor {
                action.timestamp = floor;
            }
        }

        let plan = self.actions.plan_insert_merge(&timeline);
        self.apply_merge_plan(plan, &timeline).await?;
        self.update_link_timelines();
        self.actions.update_action_timestamp();
        self.actions.update_encode_timestamp();
        self.actions.publish_deadlines();
        Ok(())
    }

    /// One scheduler wake-up: fetch, execute, or encode — whichever is due
    /// first. Always republishes deadlines; the scheduler blocks on that.
    pub(crate) async fn scheduler_tick(&mut self) -> Result<(), ManagerError> {
        let result = if self.lifetime.state != ManagerState::Activated {
            debug!(state = self.lifetime.state.name(), "tick ignored");
            Ok(())
        } else {
            let now = now_ts();
            if now >= self.actions.next_fetch_time {
                self.fetch_timeline().await
            } else if now >= self.actions.next_action_time {
                self.execute_front_action().await
            } else if now >= self.actions.next_encode_time {
                self.encode_due_actions(now).await
            } else {
                Ok(())
            }
        };
        self.actions.publish_deadlines();
        result
    }

    /// Hand the front action to the transport with its fragment handles,
    /// then retire it everywhere.
    async fn execute_front_action(&mut self) -> Result<(), ManagerError> {
        let Some(&key) = self.actions.order.front() else {
            self.actions.update_action_timestamp();
            return Ok(());
        };
        let (action, wildcard, link_id, handles) = {
            let info = self
                .actions
                .actions
                .get(&key)
                .ok_or_else(|| ManagerError::Internal("front action missing".into()))?;
            (
                info.action.clone(),
                info.wildcard_link,
                info.link_id.clone(),
                info.fragments.iter().map(|f| f.raw()).collect::<Vec<_>>(),
            )
        };
        debug!(
            action_id = action.action_id,
            fragments = handles.len(),
            link = %link_id,
            "executing action"
        );
        self.transport()?.do_action(handles, action);
        self.action_done(key);

        if wildcard {
            for link in self.links.links.values_mut() {
                if link.action_queue.front() == Some(&key) {
                    link.action_queue.pop_front();
                }
            }
        } else if !link_id.is_empty() {
            match self.links.links.get_mut(&link_id) {
                Some(link) => {
                    if link.action_queue.front() == Some(&key) {
                        link.action_queue.pop_front();
                    } else {
                        link.action_queue.retain(|k| *k != key);
                    }
                }
                None => warn!(link = %link_id, "link missing for executed action"),
            }
        }

        self.actions.order.pop_front();
        self.actions.actions.remove(&key);
        self.actions.update_action_timestamp();
        Ok(())
    }

    /// Encode for every action whose timestamp has entered the window
    /// `[next_encode_time + horizon, now + horizon)`.
    async fn encode_due_actions(&mut self, now: Timestamp) -> Result<(), ManagerError> {
        let keys: Vec<ActionKey> = self.actions.order.iter().copied().collect();
        let mut idx = 0;

        // skip actions already encoded for
        while idx < keys.len() {
            match self.actions.timestamp_of(keys[idx]) {
                Some(ts) if ts < self.actions.next_encode_time => idx += 1,
                _ => break,
            }
        }

        let horizon = now + self.actions.max_encoding_time;
        while idx < keys.len() {
            let Some(ts) = self.actions.timestamp_of(keys[idx]) else {
                idx += 1;
                continue;
            };
            if ts >= horizon {
                break;
            }
            self.encode_for_action(keys[idx])?;
            self.actions.last_encode_time = ts;
            idx += 1;
        }

        self.actions.next_encode_time = match keys.get(idx).and_then(|k| self.actions.timestamp_of(*k))
        {
            Some(ts) => ts - self.actions.max_encoding_time,
            None => f64::INFINITY,
        };
        Ok(())
    }

    /// Drop the destroyed link's pinned actions from the global timeline;
    /// wildcard actions pinned to it are released for other links. Runs
    /// after the package manager has reset the affected fragments.
    pub(crate) fn actions_on_link_destroyed(&mut self, link_id: &LinkId) {
        let Some(link) = self.links.links.get_mut(link_id) else {
            return;
        };
        link.action_queue.clear();

        let mut removed = Vec::new();
        {
            let order = &self.actions.order;
            let actions = &mut self.actions.actions;
            for key in order {
                let Some(info) = actions.get_mut(key) else {
                    continue;
                };
                if info.wildcard_link {
                    if info.link_id == *link_id {
                        info.link_id.clear();
                    }
                } else if info.link_id == *link_id {
                    removed.push(*key);
                }
            }
        }
        for key in &removed {
            self.actions.actions.remove(key);
        }
        if !removed.is_empty() {
            let removed: std::collections::HashSet<ActionKey> = removed.into_iter().collect();
            self.actions.order.retain(|key| !removed.contains(key));
        }

        self.actions.update_action_timestamp();
        self.actions.update_encode_timestamp();
        self.actions.publish_deadlines();
    }
}
