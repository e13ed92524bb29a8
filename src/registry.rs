// SPDX-License-Identifier: MPL-2.0

//! The process-wide pool table (spec.md §9 "Global mutable state"): pools
//! are looked up and constructed through a registry keyed by the pool
//! device identifier, refcounted so the underlying [`Pool`] is only ever
//! torn down once every holder has released it.
//!
//! Grounded on `aster-nix`'s `thread_table` (a `lazy_static`-initialized
//! `SpinLock<BTreeMap<_, Arc<_>>>` behind free functions), generalized here
//! with an explicit refcount per entry rather than relying solely on `Arc`'s
//! own count, since spec.md §9 describes `get_or_create`/`release` as the
//! registry's own operations distinct from `Pool`'s internal `Arc` sharing
//! (a caller can `release` its registry handle while other components still
//! hold a cloned `Pool` directly).

use std::collections::BTreeMap;

use spin::Mutex;

use crate::pool::Pool;

struct Entry {
    pool: Pool,
    refs: usize,
}

lazy_static::lazy_static! {
    static ref POOLS: Mutex<BTreeMap<String, Entry>> = Mutex::new(BTreeMap::new());
}

/// Looks up the pool registered under `key`, constructing it with `build`
/// and registering it with a refcount of one if it doesn't yet exist.
/// Every other caller that observes an existing entry for `key` gets a
/// clone of the same `Pool` and bumps its refcount (spec.md §9: "lifetime =
/// refcounted").
pub fn get_or_create(
    key: &str,
    build: impl FnOnce() -> Result<Pool, crate::error::PoolError>,
) -> Result<Pool, crate::error::PoolError> {
    let mut pools = POOLS.lock();
    if let Some(entry) = pools.get_mut(key) {
        entry.refs += 1;
        return Ok(entry.pool.clone());
    }
    let pool = build()?;
    pools.insert(
        key.to_string(),
        Entry {
            pool: pool.clone(),
            refs: 1,
        },
    );
    Ok(pool)
}

/// Returns the pool registered under `key` without affecting its refcount,
/// for callers that merely want to look up an already-open pool (spec.md
/// §6's `open_thin` style accessors are per-pool, but the pool itself must
/// first be found this way).
pub fn lookup(key: &str) -> Option<Pool> {
    POOLS.lock().get(key).map(|entry| entry.pool.clone())
}

/// Releases one reference to the pool registered under `key`. Once the
/// refcount reaches zero the entry is removed from the table; the `Pool`
/// itself is destroyed only once every `Arc`-backed clone — registry and
/// otherwise — has dropped (spec.md §3 "Ownership").
pub fn release(key: &str) {
    let mut pools = POOLS.lock();
    let remove = match pools.get_mut(key) {
        Some(entry) => {
            entry.refs = entry.refs.saturating_sub(1);
            entry.refs == 0
        }
        None => false,
    };
    if remove {
        pools.remove(key);
    }
}
