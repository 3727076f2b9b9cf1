// SPDX-License-Identifier: PMPL-1.0-or-later
//! Parameter binding.
//!
//! Binding reads each referenced member of the executing instance once and
//! writes the value into every slot that member feeds. Constant slots keep
//! the value fixed at translation. The plan itself is never touched, so any
//! number of bindings of one plan can run at the same time.

use tracing::trace;

use crate::command::{BoundCommand, BoundParameter, ParamType, ParamValue, SlotSource};
use crate::compiler::CompiledPlan;
use crate::error::{CompiledQueryError, Result};
use crate::template::{template_name, CompiledQuery};

/// Fills a compiled plan's parameter slots from a template instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterBinder;

impl ParameterBinder {
    /// Bind `template`'s current member values into a fresh command for `plan`.
    pub fn bind<Q: CompiledQuery>(plan: &CompiledPlan, template: &Q) -> Result<BoundCommand> {
        if plan.template_id() != std::any::TypeId::of::<Q>() {
            return Err(CompiledQueryError::TemplateTypeMismatch {
                expected: plan.template_name(),
                actual: template_name::<Q>(),
            });
        }

        let slots = &plan.command().slots;
        let mut values: Vec<Option<ParamValue>> = slots
            .iter()
            .map(|slot| match &slot.source {
                SlotSource::Constant(value) => Some(value.clone()),
                SlotSource::Member(_) => None,
            })
            .collect();

        for (member, positions) in plan.member_slots() {
            let value = template
                .read_member(member)
                .ok_or_else(|| CompiledQueryError::UnknownMember {
                    template: plan.template_name(),
                    member: member.clone(),
                })?;
            for &position in positions {
                let slot = &slots[position];
                values[position] = Some(coerce(slot.param_type, value.clone()).ok_or_else(|| {
                    CompiledQueryError::ParameterType {
                        slot: slot.name.clone(),
                        member: member.clone(),
                        expected: slot.param_type,
                        found: value.param_type(),
                    }
                })?);
            }
        }

        let parameters = slots
            .iter()
            .zip(values)
            .map(|(slot, value)| {
                let value = value.unwrap_or(ParamValue::Null);
                let param_type = match slot.param_type {
                    ParamType::Unknown => value.param_type(),
                    declared => declared,
                };
                BoundParameter {
                    name: slot.name.clone(),
                    param_type,
                    value,
                }
            })
            .collect::<Vec<_>>();

        trace!(
            template = plan.template_name(),
            plan_id = %plan.id(),
            parameters = parameters.len(),
            "bound compiled plan"
        );

        Ok(BoundCommand {
            text: plan.command().text.clone(),
            parameters,
            statement: std::sync::Arc::clone(&plan.command().statement),
        })
    }
}

/// Fit `value` into a slot of type `expected`. NULL fits anywhere; an
/// integer widens into a float slot.
fn coerce(expected: ParamType, value: ParamValue) -> Option<ParamValue> {
    match (expected, value) {
        (_, ParamValue::Null) => Some(ParamValue::Null),
        (ParamType::Unknown, value) => Some(value),
        (ParamType::Float, ParamValue::Int(i)) => Some(ParamValue::Float(i as f64)),
        (expected, value) if value.param_type() == expected => Some(value),
        _ => None,
    }
}
