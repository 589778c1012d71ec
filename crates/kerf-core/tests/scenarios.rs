//! End-to-end partitioning scenarios over the public API.

use std::collections::BTreeMap;
use std::sync::Arc;

use kerf_core::{
    diff_instances, validate, AllocationRequest, Allocator, Category, Change, Config, Conflict,
    CpuAffinity, CpuPlacement, CpuRequest, CpuSet, FieldChange, Instance, InstanceRequest,
    Inventory, MemoryPool, MemoryRegion, MemoryRequest, NumaNode, OverlayOp, Session, Severity,
    Topology, TxStatus,
};

const GB: u64 = 1 << 30;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn inventory() -> Inventory {
    Inventory {
        cpus: CpuSet::new(32, 0..4),
        memory: MemoryPool {
            total_bytes: 16 * GB,
            host_reserved_bytes: 2 * GB,
            pool_base: 0x8000_0000,
            pool_bytes: 0x3_8000_0000,
        },
        topology: None,
        devices: BTreeMap::new(),
    }
}

/// 16 CPUs on two nodes of 8; CPUs 0-1 reserved, so node 0 has 6 free
fn two_node_inventory() -> Inventory {
    let mut cpus = BTreeMap::new();
    for cpu in 0..16 {
        cpus.insert(
            cpu,
            CpuPlacement {
                socket: cpu / 8,
                core: cpu,
                numa_node: cpu / 8,
            },
        );
    }
    let mut nodes = BTreeMap::new();
    nodes.insert(
        0,
        NumaNode {
            memory: MemoryRegion::new(0, 8 * GB),
            cpus: (0..8).collect(),
        },
    );
    nodes.insert(
        1,
        NumaNode {
            memory: MemoryRegion::new(8 * GB, 8 * GB),
            cpus: (8..16).collect(),
        },
    );
    Inventory {
        cpus: CpuSet::new(16, 0..2),
        memory: MemoryPool {
            total_bytes: 16 * GB,
            host_reserved_bytes: 2 * GB,
            pool_base: 2 * GB,
            pool_bytes: 14 * GB,
        },
        topology: Some(Topology {
            cpus,
            nodes,
            distances: vec![0, 21, 21, 0],
        }),
        devices: BTreeMap::new(),
    }
}

fn explicit(name: &str, cpus: &[u32], base: u64, bytes: u64) -> Change {
    Change::Create(InstanceRequest::new(
        name,
        CpuRequest::Explicit(cpus.iter().copied().collect()),
        MemoryRequest::Explicit(MemoryRegion::new(base, bytes)),
    ))
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_create_instance_with_explicit_cpus() {
    init_tracing();
    let mut session = Session::new(inventory(), &Config::default()).unwrap();
    session
        .execute(explicit("A", &[4, 5, 6, 7], 0x8000_0000, GB))
        .unwrap();

    let a = session.current().instance("A").unwrap();
    assert_eq!(a.cpus, (4..8).collect());
    assert!(session.current().warnings().is_empty());
}

#[test]
fn test_overlapping_create_is_rejected() {
    init_tracing();
    let mut session = Session::new(inventory(), &Config::default()).unwrap();
    session
        .execute(explicit("A", &[4, 5, 6, 7], 0x8000_0000, GB))
        .unwrap();

    let err = session
        .plan(explicit("B", &[6, 7, 8, 9], 0x8000_0000 + GB, GB))
        .unwrap_err();
    let violations = err.violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].severity, Severity::Error);
    assert_eq!(violations[0].category, Category::CpuOverlap);
    assert_eq!(violations[0].subjects, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(
        violations[0].conflict,
        Conflict::Cpus {
            cpus: [6, 7].into_iter().collect()
        }
    );

    // Nothing was committed
    assert_eq!(session.current().len(), 1);
    assert!(session.pending_transaction().is_none());
}

#[test]
fn test_misaligned_base_is_advisory() {
    init_tracing();
    let a = Instance::new("A", 1, [4], MemoryRegion::new(0x8000_0001, 0x1000));
    let state = validate(Arc::new(inventory()), vec![a]).unwrap();

    assert_eq!(state.warnings().len(), 1);
    let warning = &state.warnings()[0];
    assert_eq!(warning.severity, Severity::Warning);
    assert_eq!(warning.category, Category::MisalignedBase);
    assert_eq!(warning.conflict, Conflict::Address { base: 0x8000_0001 });
    assert!(warning.remediation.is_some());

    let strict = Config::from_json(r#"{"strict-alignment": true}"#).unwrap();
    let session = Session::new(inventory(), &strict).unwrap();
    let err = session
        .plan(explicit("A", &[4], 0x8000_0001, 0x1000))
        .unwrap_err();
    assert_eq!(err.violations()[0].category, Category::MisalignedBase);
    assert_eq!(err.violations()[0].severity, Severity::Error);
}

#[test]
fn test_compact_falls_short_then_spread_succeeds() {
    init_tracing();
    let state = validate(Arc::new(two_node_inventory()), vec![]).unwrap();
    let allocator = Allocator::default();

    let compact = AllocationRequest::new(8, GB)
        .with_cpu_affinity(CpuAffinity::Compact)
        .with_numa_nodes([0]);
    let err = allocator.allocate(&state, &compact).unwrap_err();
    assert_eq!(err.kind(), "insufficient-local-capacity");
    assert!(state.is_empty());

    let spread = AllocationRequest::new(8, GB)
        .with_cpu_affinity(CpuAffinity::Spread)
        .with_numa_nodes([0, 1]);
    let claim = allocator.allocate(&state, &spread).unwrap();
    assert_eq!(claim.cpus.len(), 8);
    assert!(claim.cpus.iter().any(|c| *c < 8));
    assert!(claim.cpus.iter().any(|c| *c >= 8));
    assert!(claim.cpus.iter().all(|c| *c >= 2));

    // The allocator proposes, the validator disposes
    let inst = Instance {
        cpus: claim.cpus,
        memory: claim.memory,
        ..Instance::new("A", 1, std::iter::empty(), MemoryRegion::new(0, 0))
    };
    assert!(validate(Arc::new(two_node_inventory()), vec![inst]).is_ok());
}

#[test]
fn test_diff_reports_added_removed_modified() {
    init_tracing();
    let inv = Arc::new(inventory());
    let a = Instance::new("A", 1, 4..8, MemoryRegion::new(0x8000_0000, GB));
    let b = Instance::new("B", 2, 8..12, MemoryRegion::new(0x8000_0000 + GB, GB));
    let c = Instance::new("C", 3, 12..16, MemoryRegion::new(0x8000_0000 + 4 * GB, GB));
    let mut a2 = a.clone();
    a2.memory = vec![MemoryRegion::new(0x8000_0000 + 2 * GB, 2 * GB)];

    let old = validate(inv.clone(), vec![a.clone(), b.clone()]).unwrap();
    let new = validate(inv, vec![a2.clone(), c.clone()]).unwrap();
    let ops = diff_instances(old.instance_map(), new.instance_map());

    assert_eq!(
        ops,
        vec![
            OverlayOp::RemoveInstance { instance: b },
            OverlayOp::ModifyInstance {
                name: "A".to_string(),
                changes: vec![FieldChange::Memory {
                    old: a.memory,
                    new: a2.memory,
                }],
            },
            OverlayOp::AddInstance { instance: c },
        ]
    );
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[test]
fn test_count_based_create_on_numa_host() {
    init_tracing();
    let mut session = Session::new(two_node_inventory(), &Config::default()).unwrap();
    let request = InstanceRequest::new("db", CpuRequest::Count(4), MemoryRequest::Size(GB))
        .with_numa_nodes([1])
        .with_cpu_affinity(CpuAffinity::Local);
    let tx = session.execute(Change::Create(request)).unwrap();

    let db = session.current().instance("db").unwrap();
    assert_eq!(db.cpus, (8..12).collect());
    assert_eq!(db.memory, vec![MemoryRegion::new(8 * GB, GB)]);
    assert!(session.current().warnings().is_empty());
    assert_eq!(session.journal().get(tx).unwrap().status(), TxStatus::Applied);
}

#[test]
fn test_rollback_then_replay_matches() {
    init_tracing();
    let mut session = Session::new(inventory(), &Config::default()).unwrap();
    session
        .execute(explicit("A", &[4, 5], 0x8000_0000, GB))
        .unwrap();
    let tx = session
        .execute(explicit("B", &[6, 7], 0x8000_0000 + GB, GB))
        .unwrap();
    session.rollback(tx).unwrap();

    let overlays = session
        .journal()
        .entries()
        .iter()
        .map(|e| e.overlay.clone());
    let restored = Session::restore(inventory(), &Config::default(), overlays).unwrap();
    assert!(restored.current().same_as(session.current()));
    assert!(restored.journal().verify_integrity());
}
