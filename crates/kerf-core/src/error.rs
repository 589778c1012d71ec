//! Error types for kerf-core operations

use thiserror::Error;

use crate::delta::TxStatus;
use crate::types::{InstanceId, NodeId, TransactionId};
use crate::violation::{error_count, Violation};

/// Errors from the text parsers (CPU lists, sizes, addresses, references)
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid CPU list '{input}': {reason}")]
    CpuList { input: String, reason: String },

    #[error("invalid size '{0}'")]
    Size(String),

    #[error("invalid address '{0}'")]
    Address(String),

    #[error("invalid device reference '{0}'")]
    DeviceClaim(String),

    #[error("unknown {kind} '{value}'")]
    UnknownName { kind: &'static str, value: String },
}

impl ParseError {
    pub fn cpu_list(input: &str, reason: impl Into<String>) -> Self {
        ParseError::CpuList {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unknown(kind: &'static str, value: &str) -> Self {
        ParseError::UnknownName {
            kind,
            value: value.to_string(),
        }
    }
}

/// Errors from the topology-aware allocator
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),

    #[error("NUMA placement requested but the inventory has no topology")]
    TopologyRequired,

    #[error("NUMA node {0} does not exist")]
    UnknownNumaNode(NodeId),

    #[error("insufficient CPUs: requested {requested}, {available} free")]
    InsufficientCapacity { requested: u32, available: u32 },

    #[error(
        "insufficient local capacity: requested {requested} CPUs, largest single-node free set has {largest}"
    )]
    InsufficientLocalCapacity { requested: u32, largest: u32 },

    #[error("no free memory region of {bytes:#x} bytes in the pool")]
    NoSpace { bytes: u64 },

    #[error("no free memory region of {bytes:#x} bytes in local NUMA nodes {nodes:?}")]
    NoSpaceInLocalNodes { bytes: u64, nodes: Vec<NodeId> },

    #[error("no free memory region of {bytes:#x} bytes in bound NUMA nodes {nodes:?}")]
    NoSpaceInBoundNodes { bytes: u64, nodes: Vec<NodeId> },

    #[error("no free memory region of {bytes:#x} bytes on NUMA node {node} for interleaving")]
    NoSpaceForInterleave { bytes: u64, node: NodeId },
}

impl AllocationError {
    /// Stable kebab-case error kind
    pub fn kind(&self) -> &'static str {
        match self {
            AllocationError::InvalidRequest(_) => "invalid-request",
            AllocationError::TopologyRequired => "topology-required",
            AllocationError::UnknownNumaNode(_) => "unknown-numa-node",
            AllocationError::InsufficientCapacity { .. } => "insufficient-capacity",
            AllocationError::InsufficientLocalCapacity { .. } => "insufficient-local-capacity",
            AllocationError::NoSpace { .. } => "no-space",
            AllocationError::NoSpaceInLocalNodes { .. } => "no-space-in-local-nodes",
            AllocationError::NoSpaceInBoundNodes { .. } => "no-space-in-bound-nodes",
            AllocationError::NoSpaceForInterleave { .. } => "no-space-for-interleave",
        }
    }
}

/// Errors from applying an overlay to an instance set
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum OverlayError {
    #[error("instance '{0}' already exists")]
    InstanceExists(String),

    #[error("instance '{0}' does not exist")]
    InstanceMissing(String),

    #[error("instance '{name}' field {field} does not match the value recorded in the overlay")]
    StaleField { name: String, field: &'static str },

    #[error("instance '{0}' does not match the snapshot recorded in the overlay")]
    StaleSnapshot(String),

    #[error("overlay does not reproduce the planned state")]
    Inconsistent,

    #[error("overlay result failed validation with {} error(s)", error_count(.0))]
    Invalid(Vec<Violation>),
}

/// Errors from session operations (plan, submit, acknowledge, rollback)
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error("validation failed with {} error(s)", error_count(.0))]
    Validation(Vec<Violation>),

    #[error("instance '{0}' already exists")]
    DuplicateInstance(String),

    #[error("instance '{0}' not found")]
    UnknownInstance(String),

    #[error("no free instance id in 1..={0}")]
    IdsExhausted(InstanceId),

    #[error("change has no effect on instance '{0}'")]
    NoChange(String),

    #[error("transaction {0} is still pending")]
    TransactionPending(TransactionId),

    #[error("transaction {0} not found")]
    UnknownTransaction(TransactionId),

    #[error("transaction {tx} is {actual:?}, expected {expected:?}")]
    InvalidTransactionState {
        tx: TransactionId,
        actual: TxStatus,
        expected: TxStatus,
    },

    #[error("acknowledgement must be applied or failed, got {0:?}")]
    InvalidAcknowledgement(TxStatus),

    #[error("transaction {tx} is out of order (last was {last})")]
    OutOfOrder {
        tx: TransactionId,
        last: TransactionId,
    },

    #[error("plan was computed against an older state")]
    StalePlan,
}

impl SessionError {
    /// Violations carried by the error, if any
    pub fn violations(&self) -> &[Violation] {
        match self {
            SessionError::Validation(v) => v,
            SessionError::Overlay(OverlayError::Invalid(v)) => v,
            _ => &[],
        }
    }
}

/// Errors from loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
