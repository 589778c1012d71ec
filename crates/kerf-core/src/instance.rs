//! Instances and instance requests
//!
//! An [`Instance`] is a concrete claim: every CPU, memory region and device
//! sub-resource is named. An [`InstanceRequest`] may instead ask for counts
//! and sizes, which the allocator turns into concrete values.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{CpuAffinity, CpuId, DeviceClaim, InstanceId, MemoryPolicy, MemoryRegion, NodeId};

/// A named spawn-kernel instance with concrete resource claims
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub id: InstanceId,
    pub cpus: BTreeSet<CpuId>,
    /// Memory regions; the first region's base is the instance's memory base
    pub memory: Vec<MemoryRegion>,
    pub devices: BTreeSet<DeviceClaim>,
    pub numa_nodes: Option<BTreeSet<NodeId>>,
    pub cpu_affinity: Option<CpuAffinity>,
    pub memory_policy: Option<MemoryPolicy>,
}

impl Instance {
    /// Instance with one memory region and no devices or policies
    pub fn new(
        name: impl Into<String>,
        id: InstanceId,
        cpus: impl IntoIterator<Item = CpuId>,
        memory: MemoryRegion,
    ) -> Self {
        Self {
            name: name.into(),
            id,
            cpus: cpus.into_iter().collect(),
            memory: vec![memory],
            devices: BTreeSet::new(),
            numa_nodes: None,
            cpu_affinity: None,
            memory_policy: None,
        }
    }

    pub fn with_devices(mut self, devices: impl IntoIterator<Item = DeviceClaim>) -> Self {
        self.devices = devices.into_iter().collect();
        self
    }

    pub fn with_regions(mut self, regions: impl IntoIterator<Item = MemoryRegion>) -> Self {
        self.memory = regions.into_iter().collect();
        self
    }

    pub fn with_numa_nodes(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.numa_nodes = Some(nodes.into_iter().collect());
        self
    }

    pub fn with_cpu_affinity(mut self, affinity: CpuAffinity) -> Self {
        self.cpu_affinity = Some(affinity);
        self
    }

    pub fn with_memory_policy(mut self, policy: MemoryPolicy) -> Self {
        self.memory_policy = Some(policy);
        self
    }

    /// Base of the first region (0 when there is none)
    pub fn memory_base(&self) -> u64 {
        self.memory.first().map(|r| r.base).unwrap_or(0)
    }

    /// Total bytes over all regions
    pub fn memory_bytes(&self) -> u64 {
        self.memory
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.bytes))
    }
}

/// CPU half of a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuRequest {
    Explicit(BTreeSet<CpuId>),
    Count(u32),
}

/// Memory half of a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryRequest {
    Explicit(MemoryRegion),
    Size(u64),
}

/// A request for a new instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub name: String,
    /// `None` lets the session pick the lowest free id
    pub id: Option<InstanceId>,
    pub cpus: CpuRequest,
    pub memory: MemoryRequest,
    pub devices: BTreeSet<DeviceClaim>,
    pub numa_nodes: Option<BTreeSet<NodeId>>,
    pub cpu_affinity: Option<CpuAffinity>,
    pub memory_policy: Option<MemoryPolicy>,
}

impl InstanceRequest {
    pub fn new(name: impl Into<String>, cpus: CpuRequest, memory: MemoryRequest) -> Self {
        Self {
            name: name.into(),
            id: None,
            cpus,
            memory,
            devices: BTreeSet::new(),
            numa_nodes: None,
            cpu_affinity: None,
            memory_policy: None,
        }
    }

    pub fn with_id(mut self, id: InstanceId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_devices(mut self, devices: impl IntoIterator<Item = DeviceClaim>) -> Self {
        self.devices = devices.into_iter().collect();
        self
    }

    pub fn with_numa_nodes(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.numa_nodes = Some(nodes.into_iter().collect());
        self
    }

    pub fn with_cpu_affinity(mut self, affinity: CpuAffinity) -> Self {
        self.cpu_affinity = Some(affinity);
        self
    }

    pub fn with_memory_policy(mut self, policy: MemoryPolicy) -> Self {
        self.memory_policy = Some(policy);
        self
    }
}

/// Partial update of an existing instance; `None` keeps the current value.
///
/// An empty `numa_nodes` set clears the node restriction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceUpdate {
    pub id: Option<InstanceId>,
    pub cpus: Option<CpuRequest>,
    pub memory: Option<MemoryRequest>,
    pub devices: Option<BTreeSet<DeviceClaim>>,
    pub numa_nodes: Option<BTreeSet<NodeId>>,
    pub cpu_affinity: Option<CpuAffinity>,
    pub memory_policy: Option<MemoryPolicy>,
}

impl InstanceUpdate {
    pub fn cpus(mut self, cpus: CpuRequest) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn memory(mut self, memory: MemoryRequest) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn devices(mut self, devices: impl IntoIterator<Item = DeviceClaim>) -> Self {
        self.devices = Some(devices.into_iter().collect());
        self
    }

    pub fn id(mut self, id: InstanceId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &InstanceUpdate::default()
    }
}
