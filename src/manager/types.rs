//! Records owned by the channel manager's sub-managers.
//!
//! Cross-references between records are id-indexed lookups, never owning
//! pointers: an action lists the handles of fragments assigned to it, a
//! fragment carries the key of the action it rides on (cleared when the
//! action completes), and each link holds ordered queues of keys into the
//! owning sub-manager's maps.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use crate::types::{
    Action, ConnectionId, EncodingParameters, LinkId, LinkProperties, SpecificEncodingProperties,
};

// ── Manager lifecycle state ──────────────────────────────────────────────────

/// Lifecycle of the whole manager. Discriminants are single bits so the
/// per-operation "allowed states" guard is a mask test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ManagerState {
    Initializing = 1 << 0,
    Unactivated = 1 << 1,
    CreatingComponents = 1 << 2,
    WaitingForComponents = 1 << 3,
    Activated = 1 << 4,
    ShuttingDown = 1 << 5,
    Failed = 1 << 6,
}

impl ManagerState {
    pub fn bit(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            ManagerState::Initializing => "initializing",
            ManagerState::Unactivated => "unactivated",
            ManagerState::CreatingComponents => "creating-components",
            ManagerState::WaitingForComponents => "waiting-for-components",
            ManagerState::Activated => "activated",
            ManagerState::ShuttingDown => "shutting-down",
            ManagerState::Failed => "failed",
        }
    }
}

pub(crate) const ACTIVATED_ONLY: u8 = ManagerState::Activated as u8;
pub(crate) const COMPONENT_CALLBACK_STATES: u8 = ManagerState::CreatingComponents as u8
    | ManagerState::WaitingForComponents as u8
    | ManagerState::Activated as u8;
pub(crate) const DEACTIVATABLE: u8 =
    ManagerState::WaitingForComponents as u8 | ManagerState::Activated as u8;

// ── Handles ──────────────────────────────────────────────────────────────────

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub(crate) struct $name(pub u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle_type!(
    /// Internal key of an [`ActionInfo`] in the action manager's map.
    ActionKey
);
handle_type!(
    /// Handle of one fragment; echoed back by the transport in
    /// package-status callbacks.
    FragmentHandle
);
handle_type!(
    /// Correlates an encode request with its `on_bytes_encoded` callback.
    EncodingHandle
);
handle_type!(
    /// Correlates a decode request with its `on_bytes_decoded` callback.
    DecodingHandle
);
handle_type!(
    /// The host-assigned handle of an outbound package.
    PackageHandle
);

// ── Encoding state machine ───────────────────────────────────────────────────

/// Per-encoding progress for one action. Transitions are monotonic:
/// unencoded → encoding → enqueued → done, or back to unencoded on cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EncodingState {
    Unencoded,
    Encoding,
    Enqueued,
    Done,
}

/// One encoding parameter of an action, tracked until the action executes.
#[derive(Debug, Clone)]
pub(crate) struct EncodingInfo {
    pub params: EncodingParameters,
    pub props: SpecificEncodingProperties,
    pub pending_encode_handle: Option<EncodingHandle>,
    pub state: EncodingState,
}

// ── Actions ──────────────────────────────────────────────────────────────────

/// One scheduled action on the global timeline.
#[derive(Debug, Clone)]
pub(crate) struct ActionInfo {
    pub key: ActionKey,
    pub action: Action,
    /// Action accepts any link; `link_id` is pinned on first assignment.
    pub wildcard_link: bool,
    /// Resolved link; empty while a wildcard action is unpinned.
    pub link_id: LinkId,
    pub encodings: Vec<EncodingInfo>,
    /// Fragments currently assigned to this action, in payload order.
    pub fragments: Vec<FragmentHandle>,
    /// Dropped from the timeline at the end of the current update.
    pub to_be_removed: bool,
}

/// Ordering key used everywhere two actions are compared.
pub(crate) fn action_lt(a: &Action, b: &Action) -> bool {
    a.timestamp < b.timestamp || (a.timestamp == b.timestamp && a.action_id < b.action_id)
}

pub(crate) fn action_eq(a: &Action, b: &Action) -> bool {
    a.timestamp == b.timestamp && a.action_id == b.action_id
}

// ── Packages & fragments ─────────────────────────────────────────────────────

/// Outbound progress of one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FragmentState {
    Unencoded,
    Encoding,
    Enqueued,
    Done,
    Sent,
    Failed,
}

/// A contiguous byte range of a package assigned to exactly one action.
#[derive(Debug, Clone)]
pub(crate) struct PackageFragmentInfo {
    pub handle: FragmentHandle,
    /// Action carrying this fragment; cleared when the action completes.
    pub action: Option<ActionKey>,
    pub offset: usize,
    pub len: usize,
    pub state: FragmentState,
    /// Set while unassigning during regeneration; the fragment and its
    /// successors are truncated from the package on the next sweep.
    pub mark_for_deletion: bool,
}

/// An outbound package queued on a link, with its fragment cover.
#[derive(Debug)]
pub(crate) struct PackageInfo {
    pub link_id: LinkId,
    pub handle: PackageHandle,
    pub pkg: crate::types::EncPkg,
    /// Fragments in offset order; contiguous and non-overlapping.
    pub fragments: Vec<PackageFragmentInfo>,
}

impl PackageInfo {
    /// Offset of the first byte not yet covered by a fragment.
    pub fn covered_up_to(&self) -> usize {
        self.fragments.last().map_or(0, |f| f.offset + f.len)
    }

    pub fn fully_covered(&self) -> bool {
        self.covered_up_to() >= self.pkg.size()
    }
}

// ── Links & connections ──────────────────────────────────────────────────────

/// Receive-side reassembly state for one producer on one link.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProducerQueue {
    pub last_fragment_received: u32,
    pub pending_bytes: Vec<u8>,
}

/// A logical channel endpoint; owns outbound package order and borrows the
/// subsequence of the global timeline that can carry its traffic.
#[derive(Debug)]
pub(crate) struct Link {
    pub link_id: LinkId,
    pub connections: HashSet<ConnectionId>,
    /// Keys of upcoming actions usable by this link, in timeline order.
    pub action_queue: VecDeque<ActionKey>,
    /// Outbound packages in FIFO order.
    pub package_queue: VecDeque<PackageHandle>,
    pub props: LinkProperties,
    /// 16 bytes of entropy identifying this sender in multi-producer mode;
    /// fixed for the link's lifetime.
    pub producer_id: Vec<u8>,
    /// Outbound fragment counter; strictly monotonic on the wire.
    pub fragment_count: u32,
    /// Keyed by producer id (empty key in single-producer mode).
    pub producer_queues: HashMap<Vec<u8>, ProducerQueue>,
}

impl Link {
    pub fn new(link_id: LinkId, props: LinkProperties, producer_id: Vec<u8>) -> Self {
        Self {
            link_id,
            connections: HashSet::new(),
            action_queue: VecDeque::new(),
            package_queue: VecDeque::new(),
            props,
            producer_id,
            fragment_count: 0,
            producer_queues: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Connection {
    pub conn_id: ConnectionId,
    pub link_id: LinkId,
}
