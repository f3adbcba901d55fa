//! Keyed state repositories
//!
//! Each store keeps its per-key state behind a [`KeyedRepository`]. The trait
//! is the only way state is read or mutated, and every mutation of one key is
//! a single atomic read-modify-write scoped to that key, so unrelated keys
//! never contend.
//!
//! The in-memory implementation is a sharded [`dashmap::DashMap`] and never
//! fails. The semantics are single-node: running several engine instances
//! behind a load balancer requires an implementation backed by a shared keyed
//! store, otherwise counters and lockouts are per instance.
//!
//! # Trait Hierarchy
//!
//! - [`KeyedRepository<T>`] defines the operations for any record type
//! - [`AttemptRepository`], [`IpRepository`] and [`RateWindowRepository`] name
//!   the three record types the stores use and are implemented for every
//!   matching `KeyedRepository`

pub mod memory;

pub use memory::InMemoryRepository;

use crate::{
    error::StoreError,
    storage::{AttemptRecord, IpEntry, RateWindow},
};

pub trait KeyedRepository<T>: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<T>, StoreError>;

    /// Atomically apply `apply` to the record for `key`, inserting the value
    /// produced by `create` first when the key is absent. Returns the record
    /// as left by `apply`.
    ///
    /// `apply` runs while the key is locked and must not touch the repository.
    fn update(
        &self,
        key: &str,
        create: &mut dyn FnMut() -> T,
        apply: &mut dyn FnMut(&mut T),
    ) -> Result<T, StoreError>;

    /// Like [`update`](Self::update) but never creates: returns `None` when
    /// the key is not tracked.
    fn update_existing(
        &self,
        key: &str,
        apply: &mut dyn FnMut(&mut T),
    ) -> Result<Option<T>, StoreError>;

    /// Drop every record for which `keep` returns `false`. Returns the number
    /// of records removed.
    fn retain(&self, keep: &mut dyn FnMut(&T) -> bool) -> Result<usize, StoreError>;

    /// Point-in-time copy of all records, for read-only aggregation.
    fn snapshot(&self) -> Result<Vec<T>, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;
}

/// Repository of failed-attempt records, keyed by normalized identifier.
pub trait AttemptRepository: KeyedRepository<AttemptRecord> {}
impl<R: KeyedRepository<AttemptRecord>> AttemptRepository for R {}

/// Repository of IP reputation entries, keyed by canonical address.
pub trait IpRepository: KeyedRepository<IpEntry> {}
impl<R: KeyedRepository<IpEntry>> IpRepository for R {}

/// Repository of rate limit windows, keyed by rate key.
pub trait RateWindowRepository: KeyedRepository<RateWindow> {}
impl<R: KeyedRepository<RateWindow>> RateWindowRepository for R {}
