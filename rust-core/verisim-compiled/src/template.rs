// SPDX-License-Identifier: PMPL-1.0-or-later
//! The template contract.
//!
//! A compiled query template is a plain data holder implementing
//! [`CompiledQuery`]: its members parameterize the query, and
//! [`query_is`](CompiledQuery::query_is) describes the query's shape once.
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use verisim_compiled::expr::{field, member, QueryExpr, Queryable};
//! use verisim_compiled::template::{CompiledQuery, Document, TemplateContext};
//! use verisim_compiled::{ParamType, ParamValue};
//!
//! #[derive(Serialize, Deserialize)]
//! struct User {
//!     #[serde(rename = "UserName")]
//!     user_name: String,
//! }
//!
//! impl Document for User {
//!     fn collection() -> &'static str {
//!         "user"
//!     }
//! }
//!
//! struct UserByUsername {
//!     user_name: String,
//! }
//!
//! impl CompiledQuery for UserByUsername {
//!     type Document = User;
//!     type Output = Option<User>;
//!
//!     fn query_is(&self, query: Queryable<User>, _ctx: &TemplateContext<'_>) -> QueryExpr<Option<User>> {
//!         query.filter(field("UserName").eq(member("UserName"))).first_or_default()
//!     }
//!
//!     fn members(&self) -> &'static [(&'static str, ParamType)] {
//!         &[("UserName", ParamType::Text)]
//!     }
//!
//!     fn read_member(&self, name: &str) -> Option<ParamValue> {
//!         match name {
//!             "UserName" => Some(ParamValue::from(&self.user_name)),
//!             _ => None,
//!         }
//!     }
//! }
//! ```

use std::any::TypeId;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::command::{ParamType, ParamValue};
use crate::expr::{QueryExpr, Queryable};
use crate::key::EqualityKey;

/// A stored document type.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical collection holding documents of this type.
    fn collection() -> &'static str;
}

/// A reusable, strongly-typed query template.
pub trait CompiledQuery: Send + Sync + 'static {
    /// Document type queried.
    type Document: Document;
    /// Result type fixed by the terminal operation.
    type Output: Send + 'static;

    /// Describe the query. Runs only when no plan is cached for this
    /// template's key, so it must not carry per-execution side effects;
    /// use `ctx` for invocation counting.
    fn query_is(
        &self,
        query: Queryable<Self::Document>,
        ctx: &TemplateContext<'_>,
    ) -> QueryExpr<Self::Output>;

    /// Members that may appear as parameters, with their declared types.
    ///
    /// Slot types come from this list, never from the values of whichever
    /// instance compiles first. `ParamType::Unknown` accepts any value.
    fn members(&self) -> &'static [(&'static str, ParamType)] {
        &[]
    }

    /// Current value of a member; `None` when no such member exists.
    fn read_member(&self, _name: &str) -> Option<ParamValue> {
        None
    }

    /// Equality snapshot for value-equatable keying.
    ///
    /// Templates whose `query_is` branches on member values implement
    /// `Eq + Hash` over exactly what drives those branches and return
    /// `Some(EqualityKey::new(self.clone()))`.
    fn equality_key(&self) -> Option<EqualityKey> {
        None
    }
}

/// Short type name of a template, used in logs and errors.
///
/// Not unique: same-named templates in different modules share it.
pub fn template_name<Q: ?Sized>() -> &'static str {
    let full = std::any::type_name::<Q>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// ---------------------------------------------------------------------------
// Instrumentation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TemplateCounter {
    name: &'static str,
    count: AtomicU64,
}

/// Externally observable `query_is` invocation counters, keyed by template
/// type.
#[derive(Debug, Default)]
pub struct InvocationCounters {
    counts: DashMap<TypeId, TemplateCounter>,
}

impl InvocationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one invocation for `template`; returns the new total.
    pub fn increment(&self, template: TypeId, name: &'static str) -> u64 {
        self.counts
            .entry(template)
            .or_insert_with(|| TemplateCounter {
                name,
                count: AtomicU64::new(0),
            })
            .count
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    /// Invocations recorded for template type `Q`.
    pub fn count_of<Q: ?Sized + 'static>(&self) -> u64 {
        self.counts
            .get(&TypeId::of::<Q>())
            .map(|c| c.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Invocations summed over every template displayed as `name`.
    pub fn get(&self, name: &str) -> u64 {
        self.counts
            .iter()
            .filter(|entry| entry.value().name == name)
            .map(|entry| entry.value().count.load(Ordering::Relaxed))
            .sum()
    }

    /// Sorted `(name, count)` pairs, one per template type.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let mut all: Vec<_> = self
            .counts
            .iter()
            .map(|entry| (entry.value().name, entry.value().count.load(Ordering::Relaxed)))
            .collect();
        all.sort();
        all
    }
}

/// Context handed to [`CompiledQuery::query_is`].
pub struct TemplateContext<'a> {
    template: TypeId,
    name: &'static str,
    counters: &'a InvocationCounters,
}

impl<'a> TemplateContext<'a> {
    pub(crate) fn of<Q: ?Sized + 'static>(counters: &'a InvocationCounters) -> Self {
        Self {
            template: TypeId::of::<Q>(),
            name: template_name::<Q>(),
            counters,
        }
    }

    /// Display name of the compiling template.
    pub fn template(&self) -> &'static str {
        self.name
    }

    /// Count one invocation of the calling template's `query_is`.
    pub fn record_invocation(&self) -> u64 {
        self.counters.increment(self.template, self.name)
    }
}
