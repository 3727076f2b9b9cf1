// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Plan compilation.
//!
//! [`PlanCompiler::compile`] runs a template's `query_is` exactly once,
//! checks that every member the expression references is declared, hands
//! the expression to the configured [`ExpressionTranslator`], and packages
//! the result as an immutable [`CompiledPlan`]. Compilation caches nothing;
//! that is the [`PlanCache`](crate::cache::PlanCache)'s job.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::command::{CommandShape, Condition, ResultShape, SlotSource};
use crate::error::{CompiledQueryError, Result};
use crate::expr::{QueryExpr, Queryable};
use crate::result::Materializer;
use crate::template::{template_name, CompiledQuery, InvocationCounters, TemplateContext};
use crate::translate::{ExpressionTranslator, TemplateMember};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Identifier of a compiled plan.
///
/// SHA-256 fingerprint of the command text and result shape, so two keys
/// that compile to the same command share an id.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlanId(String);

impl PlanId {
    /// SHA-256 over the command text and the result shape.
    pub fn fingerprint(text: &str, shape: ResultShape) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(b"\n");
        hasher.update(shape.to_string().as_bytes());
        let digest = hasher.finalize();
        Self(digest.iter().map(|byte| format!("{:02x}", byte)).collect())
    }

    /// Full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plan_{}", &self.0[..12.min(self.0.len())])
    }
}

/// Immutable product of compiling one template key.
///
/// Shared through an `Arc` by every execution of that key; nothing in it
/// changes after construction.
pub struct CompiledPlan {
    id: PlanId,
    template: TypeId,
    template_name: &'static str,
    command: CommandShape,
    member_slots: Vec<(String, Vec<usize>)>,
    shape: ResultShape,
    handler: Box<dyn Any + Send + Sync>,
    compiled_at: DateTime<Utc>,
}

impl CompiledPlan {
    /// Fingerprint of this plan.
    pub fn id(&self) -> &PlanId {
        &self.id
    }

    /// Runtime type of the template that compiled this plan.
    pub fn template_id(&self) -> TypeId {
        self.template
    }

    /// Display name of the compiling template.
    pub fn template_name(&self) -> &'static str {
        self.template_name
    }

    /// Translated command shape, before binding.
    pub fn command(&self) -> &CommandShape {
        &self.command
    }

    /// Each referenced member with the slot positions it fills, in order of
    /// first use.
    pub fn member_slots(&self) -> &[(String, Vec<usize>)] {
        &self.member_slots
    }

    /// Declared result handling.
    pub fn result_shape(&self) -> ResultShape {
        self.shape
    }

    /// When the plan was compiled (UTC).
    pub fn compiled_at(&self) -> DateTime<Utc> {
        self.compiled_at
    }

    /// The typed result handler for output type `O`.
    pub(crate) fn materializer<O: 'static>(&self) -> Result<Materializer<O>> {
        self.handler
            .downcast_ref::<Materializer<O>>()
            .copied()
            .ok_or_else(|| {
                CompiledQueryError::ShapeMismatch(format!(
                    "plan {} was not compiled for output {}",
                    self.id,
                    std::any::type_name::<O>()
                ))
            })
    }
}

impl fmt::Debug for CompiledPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledPlan")
            .field("id", &self.id)
            .field("template", &self.template_name)
            .field("command", &self.command.text)
            .field("member_slots", &self.member_slots)
            .field("shape", &self.shape)
            .field("compiled_at", &self.compiled_at)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Turns template instances into compiled plans.
pub struct PlanCompiler {
    translator: Arc<dyn ExpressionTranslator>,
    counters: Arc<InvocationCounters>,
    slow_compile_ms: f64,
}

impl PlanCompiler {
    pub fn new(
        translator: Arc<dyn ExpressionTranslator>,
        counters: Arc<InvocationCounters>,
        slow_compile_ms: f64,
    ) -> Self {
        Self {
            translator,
            counters,
            slow_compile_ms,
        }
    }

    /// Compile `template` into a plan.
    ///
    /// Runs `query_is` once. Slot types come from the template's declared
    /// members, so every instance sharing the key binds against the same
    /// types. Translator output whose slots are out of place is rejected.
    pub fn compile<Q: CompiledQuery>(&self, template: &Q) -> Result<CompiledPlan> {
        let name = template_name::<Q>();
        let started = Instant::now();

        let ctx = TemplateContext::of::<Q>(&self.counters);
        let QueryExpr {
            expression,
            materialize,
        } = template.query_is(Queryable::root(), &ctx);

        let declared = template.members();
        if let Some(unknown) = expression
            .member_references()
            .into_iter()
            .find(|referenced| !declared.iter().any(|(known, _)| known == referenced))
        {
            return Err(CompiledQueryError::UnknownMember {
                template: name,
                member: unknown.to_string(),
            });
        }

        let members: Vec<TemplateMember> = declared
            .iter()
            .map(|&(member, param_type)| TemplateMember {
                name: member.to_string(),
                param_type,
            })
            .collect();

        let translated = self
            .translator
            .translate(&expression, &members)
            .map_err(|e| CompiledQueryError::UnsupportedExpression {
                template: name,
                reason: e.to_string(),
            })?;

        check_slots(&translated.command)
            .map_err(|reason| CompiledQueryError::UnsupportedExpression { template: name, reason })?;

        let member_slots = group_member_slots(&translated.command);
        let id = PlanId::fingerprint(&translated.command.text, translated.shape);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        debug!(
            template = name,
            plan_id = %id,
            shape = %translated.shape,
            slots = translated.command.slots.len(),
            elapsed_ms,
            "compiled query plan"
        );
        if elapsed_ms >= self.slow_compile_ms {
            warn!(
                template = name,
                plan_id = %id,
                elapsed_ms,
                threshold_ms = self.slow_compile_ms,
                "slow compiled query plan"
            );
        }

        Ok(CompiledPlan {
            id,
            template: TypeId::of::<Q>(),
            template_name: name,
            command: translated.command,
            member_slots,
            shape: translated.shape,
            handler: Box::new(materialize),
            compiled_at: Utc::now(),
        })
    }
}

/// Every slot must sit at its own position, and every slot the statement
/// references must exist.
fn check_slots(command: &CommandShape) -> std::result::Result<(), String> {
    let count = command.slots.len();
    if let Some((index, slot)) = command
        .slots
        .iter()
        .enumerate()
        .find(|(index, slot)| slot.position != *index)
    {
        return Err(format!(
            "slot {} reports position {} at index {}",
            slot.name, slot.position, index
        ));
    }

    let mut referenced = Vec::new();
    if let Some(filter) = &command.statement.filter {
        collect_slots(filter, &mut referenced);
    }
    referenced.extend(command.statement.limit_slot);
    match referenced.into_iter().find(|&slot| slot >= count) {
        Some(slot) => Err(format!("statement references slot {} of {}", slot, count)),
        None => Ok(()),
    }
}

fn collect_slots(condition: &Condition, out: &mut Vec<usize>) {
    match condition {
        Condition::Compare { slot, .. } => out.push(*slot),
        Condition::In { slots, .. } => out.extend(slots.iter().copied()),
        Condition::IsNull(_) | Condition::IsNotNull(_) => {}
        Condition::And(terms) | Condition::Or(terms) => {
            for term in terms {
                collect_slots(term, out);
            }
        }
        Condition::Not(inner) => collect_slots(inner, out),
    }
}

fn group_member_slots(command: &CommandShape) -> Vec<(String, Vec<usize>)> {
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for slot in &command.slots {
        if let SlotSource::Member(member) = &slot.source {
            match groups.iter_mut().find(|(name, _)| name == member) {
                Some((_, positions)) => positions.push(slot.position),
                None => groups.push((member.clone(), vec![slot.position])),
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ParamType, ParamValue};
    use crate::expr::{field, member, QueryExpression};
    use crate::result::Materialized;
    use crate::storage::Row;
    use crate::template::Document;
    use crate::translate::{SqlTranslator, TranslateError, TranslatedCommand};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Person {
        name: String,
        age: i64,
    }

    impl Document for Person {
        fn collection() -> &'static str {
            "person"
        }
    }

    struct Named {
        name: Option<String>,
    }

    impl CompiledQuery for Named {
        type Document = Person;
        type Output = Option<Person>;

        fn query_is(&self, query: Queryable<Person>, ctx: &TemplateContext<'_>) -> QueryExpr<Option<Person>> {
            ctx.record_invocation();
            query
                .filter(field("name").eq(member("Name")).or(field("alias").eq(member("Name"))))
                .first_or_default()
        }

        fn members(&self) -> &'static [(&'static str, ParamType)] {
            &[("Name", ParamType::Text)]
        }

        fn read_member(&self, name: &str) -> Option<ParamValue> {
            (name == "Name").then(|| ParamValue::from(self.name.clone()))
        }
    }

    struct Undeclared;

    impl CompiledQuery for Undeclared {
        type Document = Person;
        type Output = Vec<Person>;

        fn query_is(&self, query: Queryable<Person>, _ctx: &TemplateContext<'_>) -> QueryExpr<Vec<Person>> {
            query.filter(field("age").gt(member("MinAge"))).to_list()
        }
    }

    struct QuotedField;

    impl CompiledQuery for QuotedField {
        type Document = Person;
        type Output = i64;

        fn query_is(&self, query: Queryable<Person>, _ctx: &TemplateContext<'_>) -> QueryExpr<i64> {
            query.filter(field("na'me").is_null()).count()
        }
    }

    fn compiler() -> (PlanCompiler, Arc<InvocationCounters>) {
        let counters = Arc::new(InvocationCounters::new());
        let compiler = PlanCompiler::new(Arc::new(SqlTranslator::default()), Arc::clone(&counters), 50.0);
        (compiler, counters)
    }

    #[test]
    fn test_compile_runs_template_once_and_groups_slots() {
        let (compiler, counters) = compiler();
        let plan = compiler.compile(&Named { name: Some("ann".into()) }).unwrap();

        assert_eq!(counters.count_of::<Named>(), 1);
        assert_eq!(plan.template_name(), "Named");
        assert_eq!(plan.template_id(), TypeId::of::<Named>());
        assert_eq!(plan.member_slots(), &[("Name".to_string(), vec![0, 1])]);
        assert_eq!(plan.command().slots[0].param_type, ParamType::Text);
        assert_eq!(plan.result_shape(), ResultShape::SingleOptional { unique: false });
        assert!(plan.id().to_string().starts_with("plan_"));
        assert_eq!(plan.id().to_string().len(), "plan_".len() + 12);
    }

    #[test]
    fn test_slot_types_ignore_the_compiling_instance() {
        let (compiler, _) = compiler();
        let blank = compiler.compile(&Named { name: None }).unwrap();
        let named = compiler.compile(&Named { name: Some("ann".into()) }).unwrap();
        assert_eq!(blank.command().slots, named.command().slots);
        assert_eq!(blank.command().slots[0].param_type, ParamType::Text);
    }

    /// Wraps the SQL translator and moves slots out of place.
    struct Shifting {
        position_offset: usize,
        limit_slot: Option<usize>,
    }

    impl ExpressionTranslator for Shifting {
        fn translate(
            &self,
            expression: &QueryExpression,
            members: &[TemplateMember],
        ) -> std::result::Result<TranslatedCommand, TranslateError> {
            let mut out = SqlTranslator::default().translate(expression, members)?;
            for slot in &mut out.command.slots {
                slot.position += self.position_offset;
            }
            if self.limit_slot.is_some() {
                Arc::make_mut(&mut out.command.statement).limit_slot = self.limit_slot;
            }
            Ok(out)
        }
    }

    fn compile_with(translator: Shifting) -> Result<CompiledPlan> {
        PlanCompiler::new(Arc::new(translator), Arc::new(InvocationCounters::new()), 50.0)
            .compile(&Named { name: Some("ann".into()) })
    }

    #[test]
    fn test_misplaced_slots_are_rejected() {
        let err = compile_with(Shifting {
            position_offset: 1,
            limit_slot: None,
        })
        .unwrap_err();
        match err {
            CompiledQueryError::UnsupportedExpression { template, reason } => {
                assert_eq!(template, "Named");
                assert_eq!(reason, "slot p0 reports position 1 at index 0");
            }
            other => panic!("expected UnsupportedExpression, got {:?}", other),
        }

        let err = compile_with(Shifting {
            position_offset: 0,
            limit_slot: Some(9),
        })
        .unwrap_err();
        match err {
            CompiledQueryError::UnsupportedExpression { reason, .. } => {
                assert_eq!(reason, "statement references slot 9 of 3");
            }
            other => panic!("expected UnsupportedExpression, got {:?}", other),
        }
    }

    #[test]
    fn test_same_text_same_id() {
        let (compiler, _) = compiler();
        let a = compiler.compile(&Named { name: Some("a".into()) }).unwrap();
        let b = compiler.compile(&Named { name: Some("b".into()) }).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.command().text, b.command().text);
    }

    #[test]
    fn test_undeclared_member_is_rejected() {
        let (compiler, _) = compiler();
        let err = compiler.compile(&Undeclared).unwrap_err();
        match err {
            CompiledQueryError::UnknownMember { template, member } => {
                assert_eq!(template, "Undeclared");
                assert_eq!(member, "MinAge");
            }
            other => panic!("expected UnknownMember, got {:?}", other),
        }
    }

    #[test]
    fn test_translator_failure_becomes_unsupported_expression() {
        let (compiler, _) = compiler();
        let err = compiler.compile(&QuotedField).unwrap_err();
        assert!(matches!(
            err,
            CompiledQueryError::UnsupportedExpression { template: "QuotedField", .. }
        ));
    }

    #[test]
    fn test_materializer_is_typed() {
        let (compiler, _) = compiler();
        let plan = compiler.compile(&Named { name: None }).unwrap();
        let handler = plan.materializer::<Option<Person>>().unwrap();
        let person = handler(Materialized::One(Some(Row::new(r#"{"name":"ann","age":3}"#)))).unwrap();
        assert_eq!(person.map(|p| p.age), Some(3));
        assert!(plan.materializer::<Vec<Person>>().is_err());
    }
}
