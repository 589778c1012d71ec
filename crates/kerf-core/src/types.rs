//! Core partitioning types
//!
//! This module contains the small value types shared by the inventory, the
//! validator, the allocator and the overlay engine. All types here are pure
//! data - no behavior that depends on the host or the kernel interface.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical CPU identifier
pub type CpuId = u32;

/// NUMA node identifier
pub type NodeId = u32;

/// Numeric instance identifier
pub type InstanceId = u32;

/// Overlay transaction identifier (monotonic within a session)
pub type TransactionId = u64;

/// Default page granularity for memory regions
pub const PAGE_SIZE: u64 = 0x1000;

/// Highest instance ID the kernel interface accepts
pub const MAX_INSTANCE_ID: InstanceId = 511;

/// Round `value` up to a multiple of `align`.
///
/// Returns `None` on overflow or when `align` is zero.
pub fn align_up(value: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return None;
    }
    let rem = value % align;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(align - rem)
    }
}

// ============================================================================
// Placement policies
// ============================================================================

/// CPU affinity policy for count-based requests
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuAffinity {
    /// Single NUMA node, tightest core grouping
    #[default]
    Compact,
    /// Round-robin across as many NUMA nodes as possible
    Spread,
    /// Compact, with memory constrained to the CPUs' node(s)
    Local,
}

impl CpuAffinity {
    /// Name as used in documents and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuAffinity::Compact => "compact",
            CpuAffinity::Spread => "spread",
            CpuAffinity::Local => "local",
        }
    }
}

impl fmt::Display for CpuAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory placement policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPolicy {
    /// Memory on the same node(s) as the CPUs
    Local,
    /// Memory split across the chosen nodes
    Interleave,
    /// Memory restricted to exactly the requested nodes
    Bind,
}

impl MemoryPolicy {
    /// Name as used in documents and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPolicy::Local => "local",
            MemoryPolicy::Interleave => "interleave",
            MemoryPolicy::Bind => "bind",
        }
    }
}

impl fmt::Display for MemoryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Memory regions
// ============================================================================

/// A contiguous physical memory region `[base, base + bytes)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// Physical base address
    pub base: u64,
    /// Length in bytes
    pub bytes: u64,
}

impl MemoryRegion {
    /// Create a region from base and length
    pub const fn new(base: u64, bytes: u64) -> Self {
        Self { base, bytes }
    }

    /// Exclusive end address (saturating)
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.bytes)
    }

    /// True if the two regions share at least one byte
    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.bytes > 0 && other.bytes > 0 && self.base < other.end() && other.base < self.end()
    }

    /// True if `other` lies entirely within `self`
    pub fn contains(&self, other: &MemoryRegion) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    /// Shared sub-region, if any
    pub fn intersection(&self, other: &MemoryRegion) -> Option<MemoryRegion> {
        if !self.overlaps(other) {
            return None;
        }
        let base = self.base.max(other.base);
        let end = self.end().min(other.end());
        Some(MemoryRegion::new(base, end - base))
    }

    /// True if the base is a multiple of `page_size`
    pub fn is_aligned(&self, page_size: u64) -> bool {
        page_size == 0 || self.base % page_size == 0
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.base, self.end())
    }
}

// ============================================================================
// Device claims
// ============================================================================

/// Sub-resource selector within a device
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubResource {
    /// The whole device (plain devices only)
    Whole,
    /// SR-IOV virtual function
    Vf(u32),
    /// Storage namespace
    Namespace(u32),
}

impl SubResource {
    /// Numeric sub-resource ID, if any
    pub fn id(&self) -> Option<u32> {
        match self {
            SubResource::Whole => None,
            SubResource::Vf(id) | SubResource::Namespace(id) => Some(*id),
        }
    }
}

/// A `(device, sub-resource)` pair claimed by one instance
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceClaim {
    /// Device name in the inventory catalog
    pub device: String,
    /// Claimed sub-resource
    pub sub: SubResource,
}

impl DeviceClaim {
    /// Claim an entire device
    pub fn whole(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            sub: SubResource::Whole,
        }
    }

    /// Claim one SR-IOV virtual function
    pub fn vf(device: impl Into<String>, id: u32) -> Self {
        Self {
            device: device.into(),
            sub: SubResource::Vf(id),
        }
    }

    /// Claim one storage namespace
    pub fn namespace(device: impl Into<String>, id: u32) -> Self {
        Self {
            device: device.into(),
            sub: SubResource::Namespace(id),
        }
    }

    /// Two claims conflict if they name the same device and either is a
    /// whole-device claim or both select the same sub-resource.
    pub fn conflicts_with(&self, other: &DeviceClaim) -> bool {
        self.device == other.device
            && (self.sub == SubResource::Whole
                || other.sub == SubResource::Whole
                || self.sub == other.sub)
    }
}

impl fmt::Display for DeviceClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub {
            SubResource::Whole => f.write_str(&self.device),
            SubResource::Vf(id) => write!(f, "{}_vf{}", self.device, id),
            SubResource::Namespace(id) => write!(f, "{}_ns{}", self.device, id),
        }
    }
}
