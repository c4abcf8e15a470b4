//! Resource state machine.
//!
//! Every managed resource lives in a slot holding its committed fields and at
//! most one pending job. A slot's mutex is the per-resource critical section:
//!
//! - accepting a mutating request reserves the slot for a new job, which
//!   fails with a conflict while another job is pending;
//! - the executor commits or releases the slot when that job terminates.
//!
//! Readers only ever see committed fields. A rule that is still being created
//! has no committed fields yet and is invisible until its job succeeds.
//!
//! Lock order is always slot before index. Operations that go through the
//! index clone the slot handle and drop the index lock before locking the
//! slot.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use jobplane_id::{JobId, MachineId, RuleId};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::model::{Machine, Rule};

/// Resource state machine errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("{kind} {id} already has a pending job ({pending_job})")]
    Conflict {
        kind: &'static str,
        id: String,
        pending_job: JobId,
    },

    #[error("{kind} {id} is not reserved by job {job_id}")]
    NotReserved {
        kind: &'static str,
        id: String,
        job_id: JobId,
    },
}

#[derive(Debug)]
struct Slot<T> {
    committed: Option<T>,
    pending_job: Option<JobId>,
    retired: bool,
}

impl<T> Slot<T> {
    fn is_visible(&self) -> bool {
        !self.retired && self.committed.is_some()
    }
}

type SlotHandle<T> = Arc<Mutex<Slot<T>>>;

struct Index<K, T> {
    slots: HashMap<K, SlotHandle<T>>,
    order: Vec<K>,
}

/// Table of resources of one kind, keyed by id, in insertion order.
pub struct ResourceTable<K, T> {
    kind: &'static str,
    index: RwLock<Index<K, T>>,
}

impl<K, T> ResourceTable<K, T>
where
    K: Clone + Eq + Hash + Display + Send + Sync,
    T: Clone + Send + Sync,
{
    /// Create an empty table. `kind` names the resource in errors.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            index: RwLock::new(Index {
                slots: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    fn not_found(&self, id: &K) -> ResourceError {
        ResourceError::NotFound {
            kind: self.kind,
            id: id.to_string(),
        }
    }

    async fn handle(&self, id: &K) -> Option<SlotHandle<T>> {
        self.index.read().await.slots.get(id).cloned()
    }

    async fn add(&self, id: K, slot: Slot<T>) -> Result<(), ResourceError> {
        let mut index = self.index.write().await;
        if index.slots.contains_key(&id) {
            return Err(ResourceError::AlreadyExists {
                kind: self.kind,
                id: id.to_string(),
            });
        }
        index.order.push(id.clone());
        index.slots.insert(id, Arc::new(Mutex::new(slot)));
        Ok(())
    }

    async fn remove(&self, id: &K) {
        let mut index = self.index.write().await;
        index.slots.remove(id);
        index.order.retain(|k| k != id);
    }

    /// Insert a committed resource with no pending job.
    pub async fn insert(&self, id: K, fields: T) -> Result<(), ResourceError> {
        self.add(
            id,
            Slot {
                committed: Some(fields),
                pending_job: None,
                retired: false,
            },
        )
        .await
    }

    /// Insert a provisional resource owned by the job that will create it.
    pub async fn insert_reserved(&self, id: K, job_id: JobId) -> Result<(), ResourceError> {
        self.add(
            id,
            Slot {
                committed: None,
                pending_job: Some(job_id),
                retired: false,
            },
        )
        .await
    }

    /// Committed fields of a resource.
    pub async fn get(&self, id: &K) -> Option<T> {
        let handle = self.handle(id).await?;
        let slot = handle.lock().await;
        if slot.retired {
            return None;
        }
        slot.committed.clone()
    }

    /// Committed resources, in insertion order.
    pub async fn list(&self) -> Vec<T> {
        let handles: Vec<SlotHandle<T>> = {
            let index = self.index.read().await;
            index
                .order
                .iter()
                .filter_map(|id| index.slots.get(id).cloned())
                .collect()
        };

        let mut items = Vec::with_capacity(handles.len());
        for handle in handles {
            let slot = handle.lock().await;
            if slot.is_visible() {
                if let Some(fields) = &slot.committed {
                    items.push(fields.clone());
                }
            }
        }
        items
    }

    /// The job currently reserving a resource, if any.
    pub async fn pending_job(&self, id: &K) -> Option<JobId> {
        let handle = self.handle(id).await?;
        let slot = handle.lock().await;
        slot.pending_job
    }

    /// Atomically check that a committed resource has no pending job and
    /// reserve it for `job_id`. Returns the committed fields.
    pub async fn reserve(&self, id: &K, job_id: JobId) -> Result<T, ResourceError> {
        let handle = self.handle(id).await.ok_or_else(|| self.not_found(id))?;
        let mut slot = handle.lock().await;

        if slot.retired {
            return Err(self.not_found(id));
        }
        if let Some(pending_job) = slot.pending_job {
            return Err(ResourceError::Conflict {
                kind: self.kind,
                id: id.to_string(),
                pending_job,
            });
        }
        let fields = slot.committed.clone().ok_or_else(|| self.not_found(id))?;

        slot.pending_job = Some(job_id);
        Ok(fields)
    }

    /// Enter the critical section of one resource.
    pub async fn lock(&self, id: &K) -> Option<SlotGuard<'_, K, T>> {
        let handle = self.handle(id).await?;
        let guard = handle.lock_owned().await;
        if guard.retired {
            return None;
        }
        Some(SlotGuard {
            table: self,
            id: id.clone(),
            guard,
        })
    }

    /// Clear `job_id`'s reservation without changing committed fields.
    pub async fn release(&self, id: &K, job_id: JobId) -> Result<(), ResourceError> {
        let slot = self.lock(id).await.ok_or_else(|| self.not_found(id))?;
        slot.release(job_id).await
    }
}

/// Exclusive access to one resource slot.
pub struct SlotGuard<'a, K, T>
where
    K: Clone + Eq + Hash + Display + Send + Sync,
    T: Clone + Send + Sync,
{
    table: &'a ResourceTable<K, T>,
    id: K,
    guard: OwnedMutexGuard<Slot<T>>,
}

impl<K, T> SlotGuard<'_, K, T>
where
    K: Clone + Eq + Hash + Display + Send + Sync,
    T: Clone + Send + Sync,
{
    pub fn committed(&self) -> Option<&T> {
        self.guard.committed.as_ref()
    }

    pub fn pending_job(&self) -> Option<JobId> {
        self.guard.pending_job
    }

    fn check_reserved(&self, job_id: JobId) -> Result<(), ResourceError> {
        if self.guard.pending_job == Some(job_id) {
            Ok(())
        } else {
            Err(ResourceError::NotReserved {
                kind: self.table.kind,
                id: self.id.to_string(),
                job_id,
            })
        }
    }

    /// Commit the result of `job_id` and clear its reservation.
    /// `None` removes the resource.
    pub async fn commit(mut self, job_id: JobId, next: Option<T>) -> Result<(), ResourceError> {
        self.check_reserved(job_id)?;
        self.guard.pending_job = None;
        self.guard.committed = next;
        self.retire_if_empty().await;
        Ok(())
    }

    /// Clear the reservation held by `job_id` and keep committed fields.
    /// A provisional resource is discarded.
    pub async fn release(mut self, job_id: JobId) -> Result<(), ResourceError> {
        self.check_reserved(job_id)?;
        self.guard.pending_job = None;
        self.retire_if_empty().await;
        Ok(())
    }

    async fn retire_if_empty(&mut self) {
        if self.guard.committed.is_none() {
            self.guard.retired = true;
            self.table.remove(&self.id).await;
        }
    }
}

/// All resource tables managed by the control plane.
pub struct Resources {
    pub rules: ResourceTable<RuleId, Rule>,
    pub machines: ResourceTable<MachineId, Machine>,
}

impl Resources {
    pub fn new() -> Self {
        Self {
            rules: ResourceTable::new("rule"),
            machines: ResourceTable::new("machine"),
        }
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ResourceTable<RuleId, Rule> {
        ResourceTable::new("rule")
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order() {
        let table = rules();
        assert!(table.list().await.is_empty());

        let ids: Vec<RuleId> = (0..5).map(|_| RuleId::new()).collect();
        for (n, id) in ids.iter().enumerate() {
            table
                .insert(*id, Rule::new(*id, format!("rule {n}")))
                .await
                .unwrap();
        }

        let listed: Vec<RuleId> = table.list().await.into_iter().map(|r| r.id).collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_reserve_conflicts_while_pending() {
        let table = rules();
        let id = RuleId::new();
        table.insert(id, Rule::new(id, "r")).await.unwrap();

        let first = JobId::new();
        table.reserve(&id, first).await.unwrap();

        let err = table.reserve(&id, JobId::new()).await.unwrap_err();
        assert_eq!(
            err,
            ResourceError::Conflict {
                kind: "rule",
                id: id.to_string(),
                pending_job: first,
            }
        );

        table.release(&id, first).await.unwrap();
        assert!(table.reserve(&id, JobId::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_reserve_unknown_resource() {
        let table = rules();
        let err = table.reserve(&RuleId::new(), JobId::new()).await.unwrap_err();
        assert!(matches!(err, ResourceError::NotFound { kind: "rule", .. }));
    }

    #[tokio::test]
    async fn test_provisional_resource_is_invisible_until_committed() {
        let table = rules();
        let id = RuleId::new();
        let job = JobId::new();
        table.insert_reserved(id, job).await.unwrap();

        assert!(table.get(&id).await.is_none());
        assert!(table.list().await.is_empty());
        assert!(matches!(
            table.reserve(&id, JobId::new()).await,
            Err(ResourceError::Conflict { .. })
        ));

        let slot = table.lock(&id).await.unwrap();
        slot.commit(job, Some(Rule::new(id, "r"))).await.unwrap();

        assert_eq!(table.get(&id).await.unwrap().rule, "r");
        assert_eq!(table.pending_job(&id).await, None);
    }

    #[tokio::test]
    async fn test_released_provisional_resource_is_discarded() {
        let table = rules();
        let id = RuleId::new();
        let job = JobId::new();
        table.insert_reserved(id, job).await.unwrap();

        table.release(&id, job).await.unwrap();
        assert!(table.lock(&id).await.is_none());
        assert!(matches!(
            table.reserve(&id, JobId::new()).await,
            Err(ResourceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_commit_none_removes_resource() {
        let table = rules();
        let id = RuleId::new();
        table.insert(id, Rule::new(id, "r")).await.unwrap();
        let job = JobId::new();
        table.reserve(&id, job).await.unwrap();

        let slot = table.lock(&id).await.unwrap();
        slot.commit(job, None).await.unwrap();

        assert!(table.get(&id).await.is_none());
        assert!(table.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_only_reserving_job_may_commit() {
        let table = rules();
        let id = RuleId::new();
        table.insert(id, Rule::new(id, "r")).await.unwrap();
        let job = JobId::new();
        table.reserve(&id, job).await.unwrap();

        let intruder = JobId::new();
        let slot = table.lock(&id).await.unwrap();
        let err = slot.commit(intruder, None).await.unwrap_err();
        assert!(matches!(err, ResourceError::NotReserved { job_id, .. } if job_id == intruder));

        assert_eq!(table.pending_job(&id).await, Some(job));
        assert!(table.get(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_reservations_admit_exactly_one() {
        let table = Arc::new(rules());
        let id = RuleId::new();
        table.insert(id, Rule::new(id, "r")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                table.reserve(&id, JobId::new()).await.is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let table = rules();
        let id = RuleId::new();
        table.insert(id, Rule::new(id, "r")).await.unwrap();
        assert!(matches!(
            table.insert(id, Rule::new(id, "r")).await,
            Err(ResourceError::AlreadyExists { .. })
        ));
    }
}
