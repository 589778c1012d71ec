//! Transactional session
//!
//! A [`Session`] owns one inventory, the current validated state and the
//! ordered journal of overlays. State only moves forward through the
//! transaction cycle:
//!
//! ```text
//! plan(change) ──▶ Plan { state', overlay }        (dry run, no side effects)
//!      │
//!  submit(plan) ──▶ overlay journaled as pending   (one at a time)
//!      │
//!  acknowledge(tx, applied) ──▶ current = state'
//!  acknowledge(tx, failed)  ──▶ current unchanged
//!      │
//!  rollback(tx) ──▶ current = current + inverse(tx), tx removed
//! ```
//!
//! A previously validated state is never mutated: every change builds a
//! new candidate, validates it as a whole and only then replaces the
//! current state.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::allocator::{AllocationRequest, Allocator, AllocatorConfig};
use crate::config::Config;
use crate::delta::{Overlay, OverlayEngine, TxStatus};
use crate::error::{AllocationError, OverlayError, SessionError};
use crate::freespace::Occupancy;
use crate::instance::{CpuRequest, Instance, InstanceRequest, InstanceUpdate, MemoryRequest};
use crate::invariants::{Validator, ValidatorConfig};
use crate::inventory::Inventory;
use crate::journal::Journal;
use crate::state::ValidatedState;
use crate::types::{CpuAffinity, CpuId, InstanceId, MemoryPolicy, MemoryRegion, NodeId, TransactionId};
use crate::violation::Violation;

/// A requested change to the instance set
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Create(InstanceRequest),
    Update {
        name: String,
        update: InstanceUpdate,
    },
    Delete {
        name: String,
    },
}

/// Result of planning a change: the validated target state and the
/// overlay that reaches it
#[derive(Clone, Debug)]
pub struct Plan {
    generation: u64,
    state: ValidatedState,
    overlay: Overlay,
}

impl Plan {
    pub fn state(&self) -> &ValidatedState {
        &self.state
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// Advisory findings on the target state
    pub fn warnings(&self) -> &[Violation] {
        self.state.warnings()
    }
}

#[derive(Clone, Debug)]
struct PendingTx {
    tx: TransactionId,
    state: ValidatedState,
}

/// One inventory, its current state and the transaction journal
#[derive(Debug)]
pub struct Session {
    current: ValidatedState,
    journal: Journal,
    engine: OverlayEngine,
    validator: Validator,
    allocator: Allocator,
    max_instance_id: InstanceId,
    /// Bumped on every change of `current`
    generation: u64,
    pending: Option<PendingTx>,
}

impl Session {
    /// Start a session with no instances
    pub fn new(inventory: Inventory, config: &Config) -> Result<Self, SessionError> {
        let validator = Validator::new(ValidatorConfig::from(config));
        let current = validator
            .validate(Arc::new(inventory), Vec::new())
            .map_err(SessionError::Validation)?;

        Ok(Self {
            current,
            journal: Journal::new(),
            engine: OverlayEngine::new(),
            validator,
            allocator: Allocator::new(AllocatorConfig::from(config)),
            max_instance_id: config.max_instance_id,
            generation: 0,
            pending: None,
        })
    }

    /// Rebuild a session from a baseline and its overlays, in transaction
    /// order. Failed and removed overlays are journaled but not applied.
    pub fn restore(
        inventory: Inventory,
        config: &Config,
        overlays: impl IntoIterator<Item = Overlay>,
    ) -> Result<Self, SessionError> {
        let mut session = Session::new(inventory, config)?;

        for mut overlay in overlays {
            let tx = overlay.transaction;
            if let Some(last) = session.journal.last_transaction() {
                if tx <= last {
                    return Err(SessionError::OutOfOrder { tx, last });
                }
            }

            match overlay.status {
                TxStatus::Failed | TxStatus::Removed => {}
                TxStatus::Pending | TxStatus::Applied => {
                    let instances = overlay.apply(session.current.instance_map())?;
                    session.current = session
                        .validator
                        .validate(
                            session.current.inventory_arc().clone(),
                            instances.into_values().collect(),
                        )
                        .map_err(|v| SessionError::Overlay(OverlayError::Invalid(v)))?;
                    overlay.status = TxStatus::Applied;
                    session.generation += 1;
                }
            }
            session.journal.append(overlay);
            session.engine = OverlayEngine::starting_after(tx);
        }

        info!(
            transactions = session.journal.len(),
            instances = session.current.len(),
            "restored session"
        );
        Ok(session)
    }

    pub fn current(&self) -> &ValidatedState {
        &self.current
    }

    pub fn inventory(&self) -> &Inventory {
        self.current.inventory()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn pending_transaction(&self) -> Option<TransactionId> {
        self.pending.as_ref().map(|p| p.tx)
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    // ========================================================================
    // Planning
    // ========================================================================

    /// Resolve, validate and diff a change without committing anything
    pub fn plan(&self, change: Change) -> Result<Plan, SessionError> {
        let (subject, instances) = match change {
            Change::Create(request) => {
                if self.current.instance(&request.name).is_some() {
                    return Err(SessionError::DuplicateInstance(request.name));
                }
                let created = self.resolve_create(&request)?;
                let mut instances = self.current.to_instances();
                instances.push(created);
                (request.name, instances)
            }
            Change::Update { name, update } => {
                let existing = self
                    .current
                    .instance(&name)
                    .ok_or_else(|| SessionError::UnknownInstance(name.clone()))?;
                if update.is_empty() {
                    return Err(SessionError::NoChange(name));
                }
                let updated = self.resolve_update(existing, &update)?;
                let instances = self
                    .current
                    .instances()
                    .map(|inst| {
                        if inst.name == name {
                            updated.clone()
                        } else {
                            inst.clone()
                        }
                    })
                    .collect();
                (name, instances)
            }
            Change::Delete { name } => {
                if self.current.instance(&name).is_none() {
                    return Err(SessionError::UnknownInstance(name));
                }
                let instances = self
                    .current
                    .instances()
                    .filter(|inst| inst.name != name)
                    .cloned()
                    .collect();
                (name, instances)
            }
        };

        let state = self
            .validator
            .validate(self.current.inventory_arc().clone(), instances)
            .map_err(SessionError::Validation)?;

        let overlay = self.engine.diff(&self.current, &state);
        if overlay.is_empty() {
            return Err(SessionError::NoChange(subject));
        }
        self.engine
            .verify(&self.validator, &self.current, &overlay, &state)?;

        debug!(
            instance = %subject,
            tx = overlay.transaction,
            warnings = state.warnings().len(),
            "planned change"
        );
        Ok(Plan {
            generation: self.generation,
            state,
            overlay,
        })
    }

    fn resolve_create(&self, request: &InstanceRequest) -> Result<Instance, SessionError> {
        let occupancy = self.current.occupancy(None);
        let id = match request.id {
            Some(id) => id,
            None => occupancy
                .free_id(self.max_instance_id)
                .ok_or(SessionError::IdsExhausted(self.max_instance_id))?,
        };

        let placement = Placement {
            numa_nodes: request.numa_nodes.clone(),
            cpu_affinity: request.cpu_affinity,
            memory_policy: request.memory_policy,
        };
        let cpus = self.resolve_cpus(&occupancy, &request.cpus, &placement)?;
        let memory = self.resolve_memory(&occupancy, &request.memory, &placement, &cpus)?;

        Ok(Instance {
            name: request.name.clone(),
            id,
            cpus,
            memory,
            devices: request.devices.clone(),
            numa_nodes: placement.numa_nodes,
            cpu_affinity: placement.cpu_affinity,
            memory_policy: placement.memory_policy,
        })
    }

    fn resolve_update(
        &self,
        existing: &Instance,
        update: &InstanceUpdate,
    ) -> Result<Instance, SessionError> {
        let occupancy = self.current.occupancy(Some(&existing.name));

        let numa_nodes = match &update.numa_nodes {
            Some(nodes) if nodes.is_empty() => None,
            Some(nodes) => Some(nodes.clone()),
            None => existing.numa_nodes.clone(),
        };
        let placement = Placement {
            numa_nodes,
            cpu_affinity: update.cpu_affinity.or(existing.cpu_affinity),
            memory_policy: update.memory_policy.or(existing.memory_policy),
        };

        let cpus = match &update.cpus {
            Some(request) => self.resolve_cpus(&occupancy, request, &placement)?,
            None => existing.cpus.clone(),
        };
        let memory = match &update.memory {
            Some(request) => self.resolve_memory(&occupancy, request, &placement, &cpus)?,
            None => existing.memory.clone(),
        };

        Ok(Instance {
            name: existing.name.clone(),
            id: update.id.unwrap_or(existing.id),
            cpus,
            memory,
            devices: update
                .devices
                .clone()
                .unwrap_or_else(|| existing.devices.clone()),
            numa_nodes: placement.numa_nodes,
            cpu_affinity: placement.cpu_affinity,
            memory_policy: placement.memory_policy,
        })
    }

    fn resolve_cpus(
        &self,
        occupancy: &Occupancy,
        request: &CpuRequest,
        placement: &Placement,
    ) -> Result<BTreeSet<CpuId>, AllocationError> {
        match request {
            CpuRequest::Explicit(cpus) => Ok(cpus.clone()),
            CpuRequest::Count(count) => self.allocator.select_cpus(
                self.current.inventory(),
                occupancy,
                &placement.request(*count, 0),
            ),
        }
    }

    fn resolve_memory(
        &self,
        occupancy: &Occupancy,
        request: &MemoryRequest,
        placement: &Placement,
        cpus: &BTreeSet<CpuId>,
    ) -> Result<Vec<MemoryRegion>, AllocationError> {
        match request {
            MemoryRequest::Explicit(region) => Ok(vec![*region]),
            MemoryRequest::Size(bytes) => self.allocator.place_memory(
                self.current.inventory(),
                occupancy,
                &placement.request(cpus.len() as u32, *bytes),
                cpus,
            ),
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Journal a plan's overlay as the pending transaction
    pub fn submit(&mut self, plan: Plan) -> Result<TransactionId, SessionError> {
        if let Some(pending) = &self.pending {
            return Err(SessionError::TransactionPending(pending.tx));
        }
        if plan.generation != self.generation || plan.overlay.transaction != self.engine.peek() {
            return Err(SessionError::StalePlan);
        }

        let tx = self.engine.advance();
        self.journal.append(plan.overlay);
        self.pending = Some(PendingTx {
            tx,
            state: plan.state,
        });

        info!(tx, "submitted overlay");
        Ok(tx)
    }

    /// Record the consumer's verdict on the pending transaction
    pub fn acknowledge(&mut self, tx: TransactionId, status: TxStatus) -> Result<(), SessionError> {
        if !matches!(status, TxStatus::Applied | TxStatus::Failed) {
            return Err(SessionError::InvalidAcknowledgement(status));
        }
        let pending = match self.pending.take() {
            Some(pending) if pending.tx == tx => pending,
            other => {
                self.pending = other;
                return Err(match self.journal.get(tx) {
                    Some(entry) => SessionError::InvalidTransactionState {
                        tx,
                        actual: entry.status(),
                        expected: TxStatus::Pending,
                    },
                    None => SessionError::UnknownTransaction(tx),
                });
            }
        };

        self.journal.set_status(tx, status);
        if status == TxStatus::Applied {
            self.current = pending.state;
            self.generation += 1;
            info!(tx, instances = self.current.len(), "transaction applied");
        } else {
            warn!(tx, "transaction failed");
        }
        Ok(())
    }

    /// Undo an applied transaction by applying its inverse.
    ///
    /// Returns the inverse overlay, which is what removing the
    /// transaction amounts to for the consumer.
    pub fn rollback(&mut self, tx: TransactionId) -> Result<Overlay, SessionError> {
        if let Some(pending) = &self.pending {
            return Err(SessionError::TransactionPending(pending.tx));
        }
        let entry = self
            .journal
            .get(tx)
            .ok_or(SessionError::UnknownTransaction(tx))?;
        if entry.status() != TxStatus::Applied {
            return Err(SessionError::InvalidTransactionState {
                tx,
                actual: entry.status(),
                expected: TxStatus::Applied,
            });
        }

        let inverse = entry.overlay.inverse();
        let instances = inverse.apply(self.current.instance_map())?;
        let state = self
            .validator
            .validate(
                self.current.inventory_arc().clone(),
                instances.into_values().collect(),
            )
            .map_err(|v| SessionError::Overlay(OverlayError::Invalid(v)))?;

        self.journal.set_status(tx, TxStatus::Removed);
        self.current = state;
        self.generation += 1;
        info!(tx, "transaction rolled back");
        Ok(inverse)
    }

    /// Plan, submit and acknowledge as applied in one step
    pub fn execute(&mut self, change: Change) -> Result<TransactionId, SessionError> {
        let plan = self.plan(change)?;
        let tx = self.submit(plan)?;
        self.acknowledge(tx, TxStatus::Applied)?;
        Ok(tx)
    }
}

/// NUMA placement fields shared by CPU and memory resolution
struct Placement {
    numa_nodes: Option<BTreeSet<NodeId>>,
    cpu_affinity: Option<CpuAffinity>,
    memory_policy: Option<MemoryPolicy>,
}

impl Placement {
    fn request(&self, cpu_count: u32, memory_bytes: u64) -> AllocationRequest {
        AllocationRequest {
            cpu_count,
            memory_bytes,
            numa_nodes: self.numa_nodes.clone(),
            cpu_affinity: self.cpu_affinity,
            memory_policy: self.memory_policy,
        }
    }
}
