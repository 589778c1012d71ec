//! State and violation reports
//!
//! Pure presentation over validated data: a usage summary, a plain-text
//! rendering and a JSON rendering via serde.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::instance::Instance;
use crate::invariants::format_ids;
use crate::inventory::Inventory;
use crate::state::ValidatedState;
use crate::violation::Violation;

/// Claimed versus available sub-resources of one device
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceUsage {
    pub allocated: usize,
    pub available: usize,
}

/// Aggregate resource usage of a state
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub instances: usize,
    pub cpus_allocated: usize,
    pub cpus_available: usize,
    pub memory_allocated: u64,
    pub memory_pool: u64,
    pub devices: BTreeMap<String, DeviceUsage>,
}

impl ResourceUsage {
    pub fn of(state: &ValidatedState) -> Self {
        let inventory = state.inventory();
        let occupancy = state.occupancy(None);

        let devices = inventory
            .devices
            .iter()
            .map(|(name, device)| {
                let allocated = occupancy.claims.iter().filter(|c| &c.device == name).count();
                let available = device
                    .resources
                    .space()
                    .map(|s| s.available.len())
                    .unwrap_or(1);
                (
                    name.clone(),
                    DeviceUsage {
                        allocated,
                        available,
                    },
                )
            })
            .collect();

        Self {
            instances: state.len(),
            cpus_allocated: occupancy.cpus.len(),
            cpus_available: inventory.cpus.available.len(),
            memory_allocated: state.instances().map(Instance::memory_bytes).sum(),
            memory_pool: inventory.memory.pool_bytes,
            devices,
        }
    }

    /// Percentage of available CPUs in use
    pub fn cpu_percent(&self) -> f64 {
        percent(self.cpus_allocated as u64, self.cpus_available as u64)
    }

    /// Percentage of the memory pool in use
    pub fn memory_percent(&self) -> f64 {
        percent(self.memory_allocated, self.memory_pool)
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

#[derive(Serialize)]
struct StateReport<'a> {
    inventory: &'a Inventory,
    instances: Vec<&'a Instance>,
    usage: ResourceUsage,
    warnings: &'a [Violation],
}

/// JSON rendering of a state with its usage summary
pub fn state_to_json(state: &ValidatedState) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&StateReport {
        inventory: state.inventory(),
        instances: state.instances().collect(),
        usage: ResourceUsage::of(state),
        warnings: state.warnings(),
    })
}

/// JSON rendering of a finding list
pub fn violations_to_json(violations: &[Violation]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(violations)
}

/// Plain-text rendering of a state
pub fn render_state(state: &ValidatedState) -> String {
    let usage = ResourceUsage::of(state);
    let mut out = String::new();

    let _ = writeln!(out, "Resource usage");
    let _ = writeln!(
        out,
        "  CPUs:   {}/{} ({:.1}%)",
        usage.cpus_allocated,
        usage.cpus_available,
        usage.cpu_percent()
    );
    let _ = writeln!(
        out,
        "  Memory: {}/{} ({:.1}%)",
        format_bytes(usage.memory_allocated),
        format_bytes(usage.memory_pool),
        usage.memory_percent()
    );
    for (name, device) in &usage.devices {
        let _ = writeln!(
            out,
            "  {}: {}/{} allocated",
            name, device.allocated, device.available
        );
    }

    let _ = writeln!(out, "Instances ({})", usage.instances);
    for inst in state.instances() {
        let _ = writeln!(out, "  {} (id {})", inst.name, inst.id);
        let _ = writeln!(out, "    cpus:   {}", format_ids(&inst.cpus));
        for region in &inst.memory {
            let _ = writeln!(out, "    memory: {} ({})", region, format_bytes(region.bytes));
        }
        if !inst.devices.is_empty() {
            let devices: Vec<String> = inst.devices.iter().map(|d| d.to_string()).collect();
            let _ = writeln!(out, "    devices: {}", devices.join(", "));
        }
        if let Some(nodes) = &inst.numa_nodes {
            let _ = writeln!(out, "    numa-nodes: {}", format_ids(nodes));
        }
        if let Some(affinity) = inst.cpu_affinity {
            let _ = writeln!(out, "    cpu-affinity: {}", affinity);
        }
        if let Some(policy) = inst.memory_policy {
            let _ = writeln!(out, "    memory-policy: {}", policy);
        }
    }

    if !state.warnings().is_empty() {
        out.push_str(&render_violations(state.warnings()));
    }
    out
}

/// Plain-text rendering of findings, one per line
pub fn render_violations(violations: &[Violation]) -> String {
    let mut out = String::new();
    for violation in violations {
        let _ = writeln!(out, "{}", violation);
    }
    out
}

/// Human-readable byte count in binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [("TB", 1 << 40), ("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10)];
    for (unit, size) in UNITS {
        if bytes >= size {
            if bytes % size == 0 {
                return format!("{}{}", bytes / size, unit);
            }
            return format!("{:.1}{}", bytes as f64 / size as f64, unit);
        }
    }
    format!("{}B", bytes)
}
