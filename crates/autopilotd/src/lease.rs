//! Lease manager: time-bounded exclusive execution claims on task ids.
//!
//! The lease table and the in-flight dispatch set live under one mutex so a
//! task reserved by one dispatch tick cannot be leased by another tick that
//! re-enters mid-dispatch. Expiry is `now - acquired_at > ttl`; an expired
//! lease no longer blocks acquisition even before the reaper removes it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use autopilot_core::Id;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::Clock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("task {task_id} is leased by {holder}")]
    Conflict { task_id: String, holder: String },
    #[error("task {0} is already being dispatched")]
    InFlight(String),
    #[error("task {task_id} has no live lease held by {holder}")]
    NotHeld { task_id: String, holder: String },
}

pub type Result<T> = std::result::Result<T, LeaseError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub task_id: Id,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.acquired_at)
            .to_std()
            .is_ok_and(|elapsed| elapsed > self.ttl)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.acquired_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug, Default)]
struct LeaseTable {
    leases: HashMap<Id, Lease>,
    in_flight: HashSet<Id>,
}

impl LeaseTable {
    fn live_holder(&self, task_id: &Id, now: DateTime<Utc>) -> Option<&str> {
        self.leases
            .get(task_id)
            .filter(|lease| !lease.is_expired(now))
            .map(|lease| lease.holder.as_str())
    }

    fn insert(
        &mut self,
        task_id: &Id,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Lease {
        let lease = Lease {
            task_id: task_id.clone(),
            holder: holder.to_string(),
            acquired_at: now,
            ttl,
        };
        self.leases.insert(task_id.clone(), lease.clone());
        lease
    }
}

type SharedTable = Arc<Mutex<LeaseTable>>;

fn lock(table: &SharedTable) -> MutexGuard<'_, LeaseTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LeaseManager {
    table: SharedTable,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl LeaseManager {
    pub fn new(clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(LeaseTable::default())),
            clock,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Mark a task in-flight for the current dispatch. Fails if it is already
    /// reserved or holds a live lease.
    pub fn reserve(&self, task_id: &Id) -> Result<DispatchReservation> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        if let Some(holder) = table.live_holder(task_id, now) {
            return Err(LeaseError::Conflict {
                task_id: task_id.to_string(),
                holder: holder.to_string(),
            });
        }
        if !table.in_flight.insert(task_id.clone()) {
            return Err(LeaseError::InFlight(task_id.to_string()));
        }
        Ok(DispatchReservation {
            table: Arc::clone(&self.table),
            clock: Arc::clone(&self.clock),
            task_id: task_id.clone(),
            default_ttl: self.default_ttl,
        })
    }

    /// Acquire a lease outside of a dispatch reservation. Fails without side
    /// effects if a live lease exists or a dispatch has the task reserved.
    pub fn acquire_lease(
        &self,
        task_id: &Id,
        holder: &str,
        ttl: Option<Duration>,
    ) -> Result<Lease> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        if let Some(current) = table.live_holder(task_id, now) {
            return Err(LeaseError::Conflict {
                task_id: task_id.to_string(),
                holder: current.to_string(),
            });
        }
        if table.in_flight.contains(task_id) {
            return Err(LeaseError::InFlight(task_id.to_string()));
        }
        let lease = table.insert(task_id, holder, ttl.unwrap_or(self.default_ttl), now);
        debug!(task_id = %task_id, holder, "lease acquired");
        Ok(lease)
    }

    /// Idempotent. Returns whether a lease was removed.
    pub fn release_lease(&self, task_id: &Id) -> bool {
        let removed = lock(&self.table).leases.remove(task_id).is_some();
        if removed {
            debug!(task_id = %task_id, "lease released");
        }
        removed
    }

    /// Release on behalf of `holder`. Another holder's live lease is left in
    /// place; an expired or missing lease releases as a no-op.
    pub fn release_held(&self, task_id: &Id, holder: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        if let Some(current) = table.live_holder(task_id, now) {
            if current != holder {
                return Err(LeaseError::Conflict {
                    task_id: task_id.to_string(),
                    holder: current.to_string(),
                });
            }
        }
        let removed = table.leases.remove(task_id).is_some();
        if removed {
            debug!(task_id = %task_id, holder, "lease released by holder");
        }
        Ok(removed)
    }

    /// Extend a live lease held by `holder`.
    pub fn renew(&self, task_id: &Id, holder: &str) -> Result<Lease> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        match table.leases.get_mut(task_id) {
            Some(lease) if lease.holder == holder && !lease.is_expired(now) => {
                lease.acquired_at = now;
                Ok(lease.clone())
            }
            _ => Err(LeaseError::NotHeld {
                task_id: task_id.to_string(),
                holder: holder.to_string(),
            }),
        }
    }

    /// Remove and return every expired lease.
    pub fn reap_expired(&self) -> Vec<Lease> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        let expired: Vec<Id> = table
            .leases
            .values()
            .filter(|lease| lease.is_expired(now))
            .map(|lease| lease.task_id.clone())
            .collect();
        let reaped: Vec<Lease> = expired
            .iter()
            .filter_map(|id| table.leases.remove(id))
            .collect();
        for lease in &reaped {
            info!(task_id = %lease.task_id, holder = %lease.holder, "lease expired");
        }
        reaped
    }

    pub fn get(&self, task_id: &Id) -> Option<Lease> {
        let now = self.clock.now();
        lock(&self.table)
            .leases
            .get(task_id)
            .filter(|lease| !lease.is_expired(now))
            .cloned()
    }

    pub fn is_leased(&self, task_id: &Id) -> bool {
        self.get(task_id).is_some()
    }

    pub fn is_in_flight(&self, task_id: &Id) -> bool {
        lock(&self.table).in_flight.contains(task_id)
    }

    /// Live leases plus reservations that have not yet become leases.
    pub fn occupied_count(&self) -> usize {
        let now = self.clock.now();
        let table = lock(&self.table);
        let live = table.leases.values().filter(|l| !l.is_expired(now)).count();
        let pending = table
            .in_flight
            .iter()
            .filter(|id| !table.leases.contains_key(*id))
            .count();
        live + pending
    }

    pub fn active_leases(&self) -> Vec<Lease> {
        let now = self.clock.now();
        lock(&self.table)
            .leases
            .values()
            .filter(|l| !l.is_expired(now))
            .cloned()
            .collect()
    }
}

/// In-flight mark for one task during a dispatch tick. Cleared on drop.
pub struct DispatchReservation {
    table: SharedTable,
    clock: Arc<dyn Clock>,
    task_id: Id,
    default_ttl: Duration,
}

impl DispatchReservation {
    pub fn task_id(&self) -> &Id {
        &self.task_id
    }

    /// Convert the reservation into a lease under the same lock.
    pub fn acquire(self, holder: &str, ttl: Option<Duration>) -> Result<LeaseGuard> {
        let now = self.clock.now();
        let lease = {
            let mut table = lock(&self.table);
            if let Some(current) = table.live_holder(&self.task_id, now) {
                return Err(LeaseError::Conflict {
                    task_id: self.task_id.to_string(),
                    holder: current.to_string(),
                });
            }
            table.insert(&self.task_id, holder, ttl.unwrap_or(self.default_ttl), now)
        };
        debug!(task_id = %self.task_id, holder, "lease acquired from reservation");
        Ok(LeaseGuard {
            table: Arc::clone(&self.table),
            lease,
        })
    }
}

impl Drop for DispatchReservation {
    fn drop(&mut self) {
        lock(&self.table).in_flight.remove(&self.task_id);
    }
}

/// Releases its lease on drop, unless the lease has since been reaped and
/// reassigned to another holder.
#[derive(Debug)]
pub struct LeaseGuard {
    table: SharedTable,
    lease: Lease,
}

impl LeaseGuard {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn task_id(&self) -> &Id {
        &self.lease.task_id
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        let ours = table
            .leases
            .get(&self.lease.task_id)
            .is_some_and(|l| {
                l.holder == self.lease.holder && l.acquired_at >= self.lease.acquired_at
            });
        if ours {
            table.leases.remove(&self.lease.task_id);
        }
    }
}
