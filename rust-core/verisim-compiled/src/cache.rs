// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Process-wide compiled plan cache.
//!
//! Lookups are lock-free reads on a sharded map. A miss compiles outside of
//! any lock; the first plan published for a key wins and every racing caller
//! returns that published plan, so all callers observe one shared
//! `Arc<CompiledPlan>` per key. Failed compiles publish nothing.
//!
//! Entries live for the lifetime of the cache. There is no eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::compiler::CompiledPlan;
use crate::error::Result;
use crate::key::CacheKey;

/// Aggregate statistics about cache behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Plans currently cached.
    pub entries: usize,
    /// Lookups served by an existing plan.
    pub hits: u64,
    /// Lookups that had to compile.
    pub misses: u64,
    /// Successful compiles, including ones that lost a publish race.
    pub compiles: u64,
    /// Compiled plans dropped because another caller published first.
    pub discarded_compiles: u64,
    /// `hits / (hits + misses)`, or 0.0 before any lookup.
    pub hit_ratio: f64,
}

/// Cache of compiled plans keyed by [`CacheKey`].
#[derive(Debug, Default)]
pub struct PlanCache {
    plans: DashMap<CacheKey, Arc<CompiledPlan>>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    compile_count: AtomicU64,
    discarded_count: AtomicU64,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the plan for `key`, compiling it with `compile` on first use.
    ///
    /// `compile` may run more than once when callers race on a cold key,
    /// but only one result is ever published.
    pub fn get_or_compile<F>(&self, key: CacheKey, compile: F) -> Result<Arc<CompiledPlan>>
    where
        F: FnOnce() -> Result<CompiledPlan>,
    {
        if let Some(plan) = self.plans.get(&key).map(|entry| Arc::clone(entry.value())) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, plan_id = %plan.id(), "plan cache hit");
            return Ok(plan);
        }

        self.miss_count.fetch_add(1, Ordering::Relaxed);
        let compiled = Arc::new(compile()?);
        self.compile_count.fetch_add(1, Ordering::Relaxed);

        let published = Arc::clone(
            self.plans
                .entry(key.clone())
                .or_insert_with(|| Arc::clone(&compiled))
                .value(),
        );

        if Arc::ptr_eq(&published, &compiled) {
            debug!(key = %key, plan_id = %published.id(), "published compiled plan");
        } else {
            self.discarded_count.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, plan_id = %published.id(), "lost publish race, reusing published plan");
        }
        Ok(published)
    }

    /// Cached plan for `key`, without compiling or touching statistics.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CompiledPlan>> {
        self.plans.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of cached plans.
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// True when no plan has been published yet.
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Point-in-time counters; `hit_ratio` is computed from hits and misses.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hit_count.load(Ordering::Relaxed);
        let misses = self.miss_count.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.plans.len(),
            hits,
            misses,
            compiles: self.compile_count.load(Ordering::Relaxed),
            discarded_compiles: self.discarded_count.load(Ordering::Relaxed),
            hit_ratio: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}
