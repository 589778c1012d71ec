//! Structured validation findings
//!
//! Every check in the validator produces a [`Violation`]: a severity, a
//! stable category, the instance(s) involved, the concrete conflicting
//! values, a human-readable message and, where one can be computed, a
//! machine-readable remediation.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{CpuId, DeviceClaim, InstanceId, MemoryRegion, NodeId};

/// Severity of a finding
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Advisory: the state is still accepted
    Warning,
    /// Fatal: the state is rejected
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// Stable category of a finding, in validator pass order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    // === Inventory ===
    InventoryInvalid,
    TopologyMismatch,

    // === Per-instance existence and range ===
    EmptyCpus,
    CpuOutOfRange,
    EmptyMemory,
    MemoryOutOfPool,
    MisalignedBase,
    DanglingReference,
    SubresourceOutOfRange,
    InvalidId,

    // === Host reservation ===
    CpuReserved,
    SubresourceReserved,

    // === Cross-instance ===
    DuplicateName,
    DuplicateId,
    CpuOverlap,
    MemoryOverlap,
    DeviceOverlap,

    // === Aggregate capacity ===
    CpuExhausted,
    MemoryExhausted,

    // === Policy advisories ===
    NumaRemote,
    AffinityMismatch,
    PolicyMismatch,
}

impl Category {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::InventoryInvalid => "inventory_invalid",
            Category::TopologyMismatch => "topology_mismatch",
            Category::EmptyCpus => "empty_cpus",
            Category::CpuOutOfRange => "cpu_out_of_range",
            Category::EmptyMemory => "empty_memory",
            Category::MemoryOutOfPool => "memory_out_of_pool",
            Category::MisalignedBase => "misaligned_base",
            Category::DanglingReference => "dangling_reference",
            Category::SubresourceOutOfRange => "subresource_out_of_range",
            Category::InvalidId => "invalid_id",
            Category::CpuReserved => "cpu_reserved",
            Category::SubresourceReserved => "subresource_reserved",
            Category::DuplicateName => "duplicate_name",
            Category::DuplicateId => "duplicate_id",
            Category::CpuOverlap => "cpu_overlap",
            Category::MemoryOverlap => "memory_overlap",
            Category::DeviceOverlap => "device_overlap",
            Category::CpuExhausted => "cpu_exhausted",
            Category::MemoryExhausted => "memory_exhausted",
            Category::NumaRemote => "numa_remote",
            Category::AffinityMismatch => "affinity_mismatch",
            Category::PolicyMismatch => "policy_mismatch",
        }
    }

    /// Process exit code a command-line front end reports for this category.
    ///
    /// Codes are grouped by validator pass: 2x inventory, 3x range,
    /// 4x reservation, 5x cross-instance, 6x capacity, 7x policy.
    pub fn exit_code(&self) -> i32 {
        match self {
            Category::InventoryInvalid => 20,
            Category::TopologyMismatch => 21,
            Category::EmptyCpus => 30,
            Category::CpuOutOfRange => 31,
            Category::EmptyMemory => 32,
            Category::MemoryOutOfPool => 33,
            Category::MisalignedBase => 34,
            Category::DanglingReference => 35,
            Category::SubresourceOutOfRange => 36,
            Category::InvalidId => 37,
            Category::CpuReserved => 40,
            Category::SubresourceReserved => 41,
            Category::DuplicateName => 50,
            Category::DuplicateId => 51,
            Category::CpuOverlap => 52,
            Category::MemoryOverlap => 53,
            Category::DeviceOverlap => 54,
            Category::CpuExhausted => 60,
            Category::MemoryExhausted => 61,
            Category::NumaRemote => 70,
            Category::AffinityMismatch => 71,
            Category::PolicyMismatch => 72,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The concrete values a finding is about
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conflict {
    /// Nothing beyond the message
    None,
    /// Offending CPU ids
    Cpus { cpus: BTreeSet<CpuId> },
    /// A region and the bound it violates (pool, node range)
    Region {
        region: MemoryRegion,
        bound: MemoryRegion,
    },
    /// The overlapping part of two regions
    Overlap { region: MemoryRegion },
    /// An unaligned address
    Address { base: u64 },
    /// Conflicting or invalid device claims
    Claims { claims: Vec<DeviceClaim> },
    /// Offending ids (instance ids or sub-resource ids)
    Ids { ids: Vec<u32> },
    /// A duplicated or unknown name
    Name { name: String },
    /// Requested total versus what exists
    Capacity { requested: u64, limit: u64 },
    /// Offending NUMA nodes
    Nodes { nodes: Vec<NodeId> },
}

/// Machine-readable fix suggestion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Remediation {
    /// Use this CPU set instead
    Cpus { cpus: Vec<CpuId> },
    /// Use this memory base instead
    MemoryBase { base: u64 },
    /// Use this device claim instead
    SubResource { claim: DeviceClaim },
    /// Use this instance id instead
    InstanceId { id: InstanceId },
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remediation::Cpus { cpus } => {
                let list: Vec<String> = cpus.iter().map(|c| c.to_string()).collect();
                write!(f, "use CPUs {}", list.join(","))
            }
            Remediation::MemoryBase { base } => write!(f, "use memory base {:#x}", base),
            Remediation::SubResource { claim } => write!(f, "use {}", claim),
            Remediation::InstanceId { id } => write!(f, "use instance id {}", id),
        }
    }
}

/// A single validation finding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub severity: Severity,
    pub category: Category,
    /// Instance name(s) involved: none, one, or an (earlier, later) pair
    pub subjects: Vec<String>,
    pub conflict: Conflict,
    pub message: String,
    pub remediation: Option<Remediation>,
}

impl Violation {
    /// A fatal finding
    pub fn error(
        category: Category,
        subjects: &[&str],
        conflict: Conflict,
        message: impl Into<String>,
    ) -> Self {
        Self::new(Severity::Error, category, subjects, conflict, message)
    }

    /// An advisory finding
    pub fn warning(
        category: Category,
        subjects: &[&str],
        conflict: Conflict,
        message: impl Into<String>,
    ) -> Self {
        Self::new(Severity::Warning, category, subjects, conflict, message)
    }

    fn new(
        severity: Severity,
        category: Category,
        subjects: &[&str],
        conflict: Conflict,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            conflict,
            message: message.into(),
            remediation: None,
        }
    }

    /// Attach a remediation when one could be computed
    pub fn with_remediation(mut self, remediation: Option<Remediation>) -> Self {
        self.remediation = remediation;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.severity.as_str(), self.category)?;
        if !self.subjects.is_empty() {
            write!(f, " {}", self.subjects.join(", "))?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(remediation) = &self.remediation {
            write!(f, " (suggestion: {})", remediation)?;
        }
        Ok(())
    }
}

/// True if any finding is fatal
pub fn has_errors(violations: &[Violation]) -> bool {
    violations.iter().any(Violation::is_error)
}

/// Count fatal findings
pub fn error_count(violations: &[Violation]) -> usize {
    violations.iter().filter(|v| v.is_error()).count()
}

/// Exit code for a finding list: 0 when nothing is fatal, otherwise the
/// code of the first fatal category.
pub fn exit_code(violations: &[Violation]) -> i32 {
    violations
        .iter()
        .find(|v| v.is_error())
        .map(|v| v.category.exit_code())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_subjects_and_remediation() {
        let v = Violation::error(
            Category::CpuOverlap,
            &["web", "db"],
            Conflict::Cpus {
                cpus: [4, 5].into_iter().collect(),
            },
            "CPUs 4-5 claimed by both instances",
        )
        .with_remediation(Some(Remediation::Cpus {
            cpus: vec![8, 9, 10, 11],
        }));

        let text = v.to_string();
        assert!(text.starts_with("error[cpu_overlap] web, db:"));
        assert!(text.contains("use CPUs 8,9,10,11"));
    }

    #[test]
    fn test_exit_code_ignores_warnings() {
        let warn = Violation::warning(
            Category::MisalignedBase,
            &["a"],
            Conflict::Address { base: 0x1001 },
            "unaligned",
        );
        assert_eq!(exit_code(&[warn.clone()]), 0);

        let err = Violation::error(Category::DuplicateId, &["a", "b"], Conflict::None, "dup");
        assert_eq!(exit_code(&[warn, err]), 51);
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&Category::SubresourceOutOfRange).unwrap();
        assert_eq!(json, "\"subresource_out_of_range\"");
    }
}
