// SPDX-License-Identifier: PMPL-1.0-or-later
//! VeriSim Compiled Queries
//!
//! Reusable, strongly-typed query templates for the VeriSimDB document layer.
//! A template describes its query once; the engine translates that
//! description into a parameterized command a single time per cache key and
//! afterwards only re-binds member values and executes.

pub mod binder;
pub mod cache;
pub mod command;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod expr;
pub mod key;
pub mod result;
pub mod storage;
pub mod template;
pub mod translate;

pub use binder::ParameterBinder;
pub use cache::{CacheStats, PlanCache};
pub use command::{BoundCommand, BoundParameter, CommandShape, ParamType, ParamValue, ResultShape};
pub use compiler::{CompiledPlan, PlanCompiler, PlanId};
pub use config::CompiledQueryConfig;
pub use diagnostics::{CommandPreview, PlanExplanation};
pub use error::{CompiledQueryError, Result};
pub use executor::CompiledQueryEngine;
pub use expr::{field, literal, member, Predicate, QueryExpr, QueryExpression, Queryable};
pub use key::{CacheKey, EqualityKey, KeyDeriver, KeyMode};
pub use storage::{InMemoryDocumentStore, Row, StorageError, StorageExecutor};
pub use template::{CompiledQuery, Document, InvocationCounters, TemplateContext};
pub use translate::{ExpressionTranslator, SqlTranslator, TemplateMember, TranslateError, TranslatedCommand};
