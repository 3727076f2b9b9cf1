// SPDX-License-Identifier: PMPL-1.0-or-later
//! Cache keys.
//!
//! `key(a) == key(b)` must imply that `a` and `b` can be served by the same
//! compiled plan. Type-only keys never look at member values; value keys
//! defer to the template's own `Eq + Hash` contract.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CompiledQueryError, Result};
use crate::template::{template_name, CompiledQuery};

/// How template instances map to cache keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    /// One plan per template type, whatever the member values.
    #[default]
    TypeOnly,
    /// One plan per template type and equality class of instances.
    ValueEquatable,
}

// ---------------------------------------------------------------------------
// EqualityKey
// ---------------------------------------------------------------------------

trait KeyValue: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_dyn(&self, other: &dyn Any) -> bool;
    fn hash_dyn(&self, state: &mut dyn Hasher);
}

impl<T> KeyValue for T
where
    T: Eq + Hash + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|other| self == other)
    }

    fn hash_dyn(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state);
    }
}

/// Type-erased equality snapshot of a template instance.
#[derive(Clone)]
pub struct EqualityKey(Arc<dyn KeyValue>);

impl EqualityKey {
    pub fn new<T>(value: T) -> Self
    where
        T: Eq + Hash + Send + Sync + 'static,
    {
        Self(Arc::new(value))
    }
}

impl PartialEq for EqualityKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_dyn(other.0.as_any())
    }
}

impl Eq for EqualityKey {}

impl Hash for EqualityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_dyn(state);
    }
}

impl fmt::Debug for EqualityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EqualityKey(..)")
    }
}

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Identity used to look up compiled plans.
#[derive(Clone, Debug)]
pub struct CacheKey {
    template: TypeId,
    name: &'static str,
    snapshot: Option<EqualityKey>,
}

impl CacheKey {
    /// Display name of the keyed template.
    pub fn template_name(&self) -> &'static str {
        self.name
    }

    /// True when the key carries an equality snapshot.
    pub fn is_value_keyed(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.template == other.template && self.snapshot == other.snapshot
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.template.hash(state);
        self.snapshot.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.snapshot.is_some() {
            write!(f, "{}(by value)", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

// ---------------------------------------------------------------------------
// KeyDeriver
// ---------------------------------------------------------------------------

/// Derives cache keys, remembering per template type whether it supports
/// value equality.
#[derive(Debug, Default)]
pub struct KeyDeriver {
    equatable: DashMap<TypeId, bool>,
}

impl KeyDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn derive_key<Q: CompiledQuery>(&self, template: &Q, mode: KeyMode) -> Result<CacheKey> {
        let name = template_name::<Q>();
        let template_id = TypeId::of::<Q>();

        let snapshot = match mode {
            KeyMode::TypeOnly => None,
            KeyMode::ValueEquatable => {
                if !self.supports_equality(template) {
                    return Err(CompiledQueryError::EqualityContractMissing(name));
                }
                Some(
                    template
                        .equality_key()
                        .ok_or(CompiledQueryError::EqualityContractMissing(name))?,
                )
            }
        };

        Ok(CacheKey {
            template: template_id,
            name,
            snapshot,
        })
    }

    /// Whether `Q` provides an equality contract, checked once per type.
    pub fn supports_equality<Q: CompiledQuery>(&self, template: &Q) -> bool {
        let template_id = TypeId::of::<Q>();
        if let Some(known) = self.equatable.get(&template_id).map(|e| *e.value()) {
            return known;
        }
        *self
            .equatable
            .entry(template_id)
            .or_insert_with(|| {
                let supported = template.equality_key().is_some();
                debug!(template = template_name::<Q>(), supported, "checked equality contract");
                supported
            })
            .value()
    }

    /// Number of template types whose equality support has been checked.
    pub fn checked_types(&self) -> usize {
        self.equatable.len()
    }
}
