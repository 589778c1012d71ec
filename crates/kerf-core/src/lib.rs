//! kerf core - Multikernel Resource Partitioning Model
//!
//! This crate contains the **pure** model that decides how one host's
//! hardware is split among independently booted kernel instances. It
//! computes and checks the *description* of a partitioning; it never
//! touches hardware, files or the kernel interface.
//!
//! # Design Principles
//!
//! 1. **Whole-state validation**: every change is checked together with
//!    every existing instance, never incrementally
//! 2. **No partial results**: a state that fails validation is never
//!    materialized, and all findings are reported at once
//! 3. **Immutable snapshots**: `Inventory` and `ValidatedState` are values;
//!    changes build new candidates
//! 4. **Deterministic**: same input, same findings in the same order
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        kerf-core                            │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                    │
//! │   │   Inventory   │    │   Allocator   │                    │
//! │   │  - cpus       │───▶│  count-based  │                    │
//! │   │  - memory     │    │  → concrete   │                    │
//! │   │  - topology   │    └───────┬───────┘                    │
//! │   │  - devices    │            │ proposes                   │
//! │   └───────┬───────┘            ▼                            │
//! │           │            ┌───────────────┐                    │
//! │           └───────────▶│   Validator   │──▶ [Violation]     │
//! │                        │  fixed passes │                    │
//! │                        └───────┬───────┘                    │
//! │                                │ ValidatedState             │
//! │                                ▼                            │
//! │   ┌───────────────┐    ┌───────────────┐                    │
//! │   │    Session    │◀──▶│ OverlayEngine │                    │
//! │   │ plan / submit │    │ diff / verify │                    │
//! │   │ ack / rollback│    └───────────────┘                    │
//! │   └───────┬───────┘                                         │
//! │           │ Journal (hash chain)                            │
//! └───────────┼─────────────────────────────────────────────────┘
//!             │ overlays
//!             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         kerf-dt                             │
//! │        (device-tree text/binary codec and schemas)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Ids, policies, memory regions, device claims
//! - `inventory` - Hardware catalog and its consistency checks
//! - `instance` - Concrete instances and count-based requests
//! - `violation` - Structured findings with remediations
//! - `invariants` - The validator
//! - `state` - `ValidatedState`, obtainable only through validation
//! - `freespace` - Free CPU, memory, sub-resource and id queries
//! - `allocator` - Topology-aware placement
//! - `delta` - Overlays, diff, inverse and self-check
//! - `journal` - Hash-chained transaction log
//! - `session` - Transaction lifecycle over one inventory
//! - `parse` - CPU list, size, address and reference parsers
//! - `report` - Usage summary, text and JSON rendering
//! - `config` - Tunables
//! - `error` - Error types

pub mod allocator;
pub mod config;
pub mod delta;
pub mod error;
pub mod freespace;
pub mod instance;
pub mod invariants;
pub mod inventory;
pub mod journal;
pub mod parse;
pub mod report;
pub mod session;
pub mod state;
pub mod types;
pub mod violation;

// Re-export the public surface for convenient access
pub use allocator::{AllocationRequest, Allocator, AllocatorConfig, ConcreteClaim};
pub use config::Config;
pub use delta::{diff_instances, FieldChange, Overlay, OverlayEngine, OverlayOp, TxStatus};
pub use error::{AllocationError, ConfigError, OverlayError, ParseError, SessionError};
pub use freespace::Occupancy;
pub use instance::{CpuRequest, Instance, InstanceRequest, InstanceUpdate, MemoryRequest};
pub use invariants::{validate, Validator, ValidatorConfig};
pub use inventory::{
    CpuPlacement, CpuSet, Device, DeviceResources, Inventory, MemoryPool, NumaNode,
    SubResourceSpace, Topology,
};
pub use journal::{Journal, JournalEntry};
pub use report::ResourceUsage;
pub use session::{Change, Plan, Session};
pub use state::ValidatedState;
pub use types::{
    CpuAffinity, CpuId, DeviceClaim, InstanceId, MemoryPolicy, MemoryRegion, NodeId,
    SubResource, TransactionId, MAX_INSTANCE_ID, PAGE_SIZE,
};
pub use violation::{Category, Conflict, Remediation, Severity, Violation};
