//! Named shared resources guarded by per-name locks.
//!
//! A resource is created lazily the first time its name is used and then lives as long
//! as the store. The value type is fixed by that first use; later uses with another type
//! are rejected instead of being coerced.
//!
//! Every acquisition is reported to a [`ResourceClaims`] record: the name is marked as
//! *wanted* before the lock is requested and moved to *held* once it is granted. The
//! deadlock watchdog only ever looks at these records.

use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{SchedulerError, SchedulerResult};

/// Snapshot of the names a task currently holds and waits for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimSnapshot {
    /// Names whose lock the task currently owns.
    pub held: BTreeSet<String>,
    /// Names the task is blocked on (or about to block on).
    pub wanted: BTreeSet<String>,
}

/// Held/wanted bookkeeping for one task.
#[derive(Debug, Default)]
pub struct ResourceClaims {
    sets: Mutex<ClaimSnapshot>,
}

impl ResourceClaims {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn want(&self, name: &str) {
        self.sets.lock().wanted.insert(name.to_owned());
    }

    fn acquired(&self, name: &str) {
        let mut sets = self.sets.lock();
        sets.wanted.remove(name);
        sets.held.insert(name.to_owned());
    }

    fn released(&self, name: &str) {
        self.sets.lock().held.remove(name);
    }

    fn holds(&self, name: &str) -> bool {
        self.sets.lock().held.contains(name)
    }

    /// Copy of the current sets.
    #[must_use]
    pub fn snapshot(&self) -> ClaimSnapshot {
        self.sets.lock().clone()
    }
}

/// Removes a name from the held set on scope exit, including unwinding.
struct HeldGuard<'a> {
    claims: &'a ResourceClaims,
    name: &'a str,
}

impl Drop for HeldGuard<'_> {
    fn drop(&mut self) {
        self.claims.released(self.name);
    }
}

struct ResourceCell {
    type_id: TypeId,
    type_name: &'static str,
    /// Always an `Option<T>` for the `T` recorded in `type_id`.
    value: Mutex<Box<dyn Any + Send>>,
}

impl ResourceCell {
    fn check<T: Any>(&self, name: &str) -> SchedulerResult<()> {
        if self.type_id == TypeId::of::<T>() {
            Ok(())
        } else {
            Err(self.mismatch::<T>(name))
        }
    }

    fn mismatch<T: Any>(&self, name: &str) -> SchedulerError {
        SchedulerError::ResourceTypeMismatch {
            name: name.to_owned(),
            expected: self.type_name,
            found: type_name::<T>(),
        }
    }
}

/// Map from resource name to a typed, individually locked value.
///
/// Unrelated names never contend with each other: the map lock is only held while a
/// cell is looked up or created, never while a mutator runs.
#[derive(Default)]
pub struct ResourceStore {
    cells: Mutex<HashMap<String, Arc<ResourceCell>>>,
}

impl ResourceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cell<T: Any + Send>(&self, name: &str) -> SchedulerResult<Arc<ResourceCell>> {
        let mut cells = self.cells.lock();
        let cell = cells.entry(name.to_owned()).or_insert_with(|| {
            debug!(resource = name, value_type = type_name::<T>(), "creating shared resource");
            Arc::new(ResourceCell {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
                value: Mutex::new(Box::new(None::<T>)),
            })
        });
        cell.check::<T>(name)?;
        Ok(Arc::clone(cell))
    }

    /// Run `mutator` inside the critical section of resource `name`.
    ///
    /// The mutator gets the stored value in place (`None` on first use) and may read,
    /// change or replace it. The lock is held for the whole call, including any blocking
    /// work the mutator performs. `claims` is updated so that the name is wanted while
    /// the caller waits and held while the mutator runs.
    ///
    /// A panicking mutator releases the lock and the held claim. The value keeps
    /// whatever state the mutator left it in.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ResourceTypeMismatch` if `name` was created with a value
    /// type other than `T`, and `SchedulerError::NestedResource` if `claims` already
    /// holds `name` (the lock is not reentrant). Nothing is locked or recorded in either
    /// case.
    pub fn use_resource<T, F>(
        &self,
        name: &str,
        claims: &ResourceClaims,
        mutator: F,
    ) -> SchedulerResult<()>
    where
        T: Any + Send,
        F: FnOnce(&mut Option<T>),
    {
        if claims.holds(name) {
            return Err(SchedulerError::NestedResource {
                name: name.to_owned(),
            });
        }
        let cell = self.cell::<T>(name)?;

        claims.want(name);
        trace!(resource = name, "waiting for resource");
        let mut slot = cell.value.lock();
        claims.acquired(name);
        let _held = HeldGuard { claims, name };
        trace!(resource = name, "resource acquired");

        let value = (**slot)
            .downcast_mut::<Option<T>>()
            .ok_or_else(|| cell.mismatch::<T>(name))?;
        mutator(value);
        Ok(())
    }

    /// Clone the current value of `name` without recording any claim.
    ///
    /// Blocks while another task holds the resource. Returns `Ok(None)` for names that
    /// were never used or that no mutator has filled yet.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ResourceTypeMismatch` if `name` holds another type.
    pub fn read<T>(&self, name: &str) -> SchedulerResult<Option<T>>
    where
        T: Any + Send + Clone,
    {
        let cell = {
            let cells = self.cells.lock();
            match cells.get(name) {
                Some(cell) => Arc::clone(cell),
                None => return Ok(None),
            }
        };
        cell.check::<T>(name)?;
        let slot = cell.value.lock();
        Ok((**slot)
            .downcast_ref::<Option<T>>()
            .cloned()
            .flatten())
    }

    /// Names of every resource created so far, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cells.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("names", &self.names())
            .finish()
    }
}
