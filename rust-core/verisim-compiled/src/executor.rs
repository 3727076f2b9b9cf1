// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! The compiled query engine.
//!
//! Every facade operation follows the same pipeline: derive the template's
//! cache key, fetch or compile its plan, bind the instance's member values,
//! then hand the bound command to storage (or to the caller, for previews).
//! Only the storage round trip of the async operations suspends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{instrument, warn};

use crate::binder::ParameterBinder;
use crate::cache::{CacheStats, PlanCache};
use crate::command::BoundCommand;
use crate::compiler::{CompiledPlan, PlanCompiler};
use crate::config::CompiledQueryConfig;
use crate::diagnostics::{CommandPreview, PlanExplanation};
use crate::error::{CompiledQueryError, Result};
use crate::key::KeyDeriver;
use crate::result::shape_rows;
use crate::storage::{Row, StorageExecutor};
use crate::template::{template_name, CompiledQuery, InvocationCounters};
use crate::translate::{ExpressionTranslator, SqlTranslator};

/// Compiles, caches and executes query templates against one storage
/// executor.
pub struct CompiledQueryEngine<S: StorageExecutor> {
    config: CompiledQueryConfig,
    keys: KeyDeriver,
    compiler: PlanCompiler,
    cache: PlanCache,
    storage: Arc<S>,
    counters: Arc<InvocationCounters>,
}

impl<S: StorageExecutor> CompiledQueryEngine<S> {
    /// Engine rendering the JSONB document dialect for `config`'s schema.
    pub fn new(config: CompiledQueryConfig, storage: Arc<S>) -> Result<Self> {
        config.validate()?;
        let translator = Arc::new(SqlTranslator::new(
            config.schema.clone(),
            config.table_prefix.clone(),
        ));
        Ok(Self::with_translator(config, storage, translator))
    }

    /// Engine using a caller-supplied translator.
    pub fn with_translator(
        config: CompiledQueryConfig,
        storage: Arc<S>,
        translator: Arc<dyn ExpressionTranslator>,
    ) -> Self {
        let counters = Arc::new(InvocationCounters::new());
        let compiler = PlanCompiler::new(translator, Arc::clone(&counters), config.slow_compile_ms);
        Self {
            config,
            keys: KeyDeriver::new(),
            compiler,
            cache: PlanCache::new(),
            storage,
            counters,
        }
    }

    /// The cached plan for `template`'s key, compiled on first use.
    pub fn plan_for<Q: CompiledQuery>(&self, template: &Q) -> Result<Arc<CompiledPlan>> {
        let key = self.keys.derive_key(template, self.config.key_mode)?;
        self.cache.get_or_compile(key, || self.compiler.compile(template))
    }

    /// Run `template` and map the rows per its declared terminal.
    #[instrument(skip_all, fields(template = template_name::<Q>()))]
    pub fn execute<Q: CompiledQuery>(&self, template: &Q) -> Result<Q::Output> {
        let (plan, command) = self.prepare(template)?;
        let rows = self.storage.run(&command)?;
        materialize::<Q>(&plan, rows)
    }

    /// Async counterpart of [`execute`](Self::execute). Dropping the returned
    /// future abandons the storage round trip.
    #[instrument(skip_all, fields(template = template_name::<Q>()))]
    pub async fn execute_async<Q: CompiledQuery>(&self, template: &Q) -> Result<Q::Output> {
        let (plan, command) = self.prepare(template)?;
        let rows = self.storage.run_async(&command).await?;
        materialize::<Q>(&plan, rows)
    }

    /// [`execute_async`](Self::execute_async) bounded by `limit`. A plan
    /// compiled before the deadline stays cached.
    pub async fn execute_with_timeout<Q: CompiledQuery>(
        &self,
        template: &Q,
        limit: Duration,
    ) -> Result<Q::Output> {
        let started = Instant::now();
        match tokio::time::timeout(limit, self.execute_async(template)).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis();
                warn!(
                    template = template_name::<Q>(),
                    elapsed_ms = elapsed_ms as u64,
                    limit_ms = limit.as_millis() as u64,
                    "compiled query timed out"
                );
                Err(CompiledQueryError::Cancelled {
                    template: template_name::<Q>(),
                    elapsed_ms,
                })
            }
        }
    }

    /// The exact command `execute` would send for `template`.
    #[instrument(skip_all, fields(template = template_name::<Q>()))]
    pub fn preview_command<Q: CompiledQuery>(&self, template: &Q) -> Result<CommandPreview> {
        let (_, command) = self.prepare(template)?;
        Ok(command.into())
    }

    /// Preview plus the store's plan and the compiled plan's metadata.
    #[instrument(skip_all, fields(template = template_name::<Q>()))]
    pub fn explain_plan<Q: CompiledQuery>(&self, template: &Q) -> Result<PlanExplanation> {
        let (plan, command) = self.prepare(template)?;
        let storage_plan = self.storage.explain(&command)?;
        Ok(PlanExplanation::new(&plan, command, storage_plan))
    }

    /// Snapshot of the plan cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// `query_is` invocation counters, one per template type.
    pub fn counters(&self) -> &InvocationCounters {
        &self.counters
    }

    /// Configuration this engine was built with.
    pub fn config(&self) -> &CompiledQueryConfig {
        &self.config
    }

    /// Underlying storage executor.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    fn prepare<Q: CompiledQuery>(&self, template: &Q) -> Result<(Arc<CompiledPlan>, BoundCommand)> {
        let plan = self.plan_for(template)?;
        let command = ParameterBinder::bind(&plan, template)?;
        Ok((plan, command))
    }
}

fn materialize<Q: CompiledQuery>(plan: &CompiledPlan, rows: Vec<Row>) -> Result<Q::Output> {
    let handler = plan.materializer::<Q::Output>()?;
    let shaped = shape_rows(plan.result_shape(), rows, plan.template_name())?;
    handler(shaped)
}
