// SPDX-License-Identifier: PMPL-1.0-or-later
//! Command previews and plan explanations.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{BoundCommand, BoundParameter, ResultShape};
use crate::compiler::CompiledPlan;

/// The exact command a template instance would send, without sending it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPreview {
    pub command_text: String,
    pub parameters: Vec<BoundParameter>,
}

impl From<BoundCommand> for CommandPreview {
    fn from(command: BoundCommand) -> Self {
        Self {
            command_text: command.text,
            parameters: command.parameters,
        }
    }
}

impl fmt::Display for CommandPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command_text)?;
        for parameter in &self.parameters {
            write!(f, "\n  :{} = {} ({})", parameter.name, parameter.value, parameter.param_type)?;
        }
        Ok(())
    }
}

/// A compiled plan described together with the store's own plan for one
/// binding of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExplanation {
    pub plan_id: String,
    pub template: String,
    pub command: CommandPreview,
    pub result_shape: ResultShape,
    pub member_slots: Vec<(String, Vec<usize>)>,
    pub compiled_at: DateTime<Utc>,
    /// Storage-reported plan text.
    pub storage_plan: String,
}

impl PlanExplanation {
    pub(crate) fn new(plan: &CompiledPlan, command: BoundCommand, storage_plan: String) -> Self {
        Self {
            plan_id: plan.id().to_string(),
            template: plan.template_name().to_string(),
            command: command.into(),
            result_shape: plan.result_shape(),
            member_slots: plan.member_slots().to_vec(),
            compiled_at: plan.compiled_at(),
            storage_plan,
        }
    }

    /// Render as a human-readable text block.
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        out.push_str("=== VeriSimDB COMPILED QUERY ===\n\n");
        out.push_str(&format!("Plan ID: {}\n", self.plan_id));
        out.push_str(&format!("Template: {}\n", self.template));
        out.push_str(&format!("Result: {}\n", self.result_shape));
        out.push_str(&format!("Compiled: {}\n\n", self.compiled_at.to_rfc3339()));

        out.push_str("--- Command ---\n");
        out.push_str(&format!("  {}\n", self.command.command_text));
        for parameter in &self.command.parameters {
            out.push_str(&format!(
                "  :{} = {} ({})\n",
                parameter.name, parameter.value, parameter.param_type
            ));
        }

        if !self.member_slots.is_empty() {
            out.push_str("\n--- Members ---\n");
            for (member, positions) in &self.member_slots {
                let slots: Vec<String> = positions.iter().map(|p| format!(":p{}", p)).collect();
                out.push_str(&format!("  {} -> {}\n", member, slots.join(", ")));
            }
        }

        out.push_str("\n--- Storage Plan ---\n");
        for line in self.storage_plan.lines() {
            out.push_str(&format!("  {}\n", line));
        }

        out
    }
}

impl fmt::Display for PlanExplanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PlanExplanation(plan={}, template={}, shape={})",
            self.plan_id, self.template, self.result_shape
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ParamType, ParamValue};

    fn preview() -> CommandPreview {
        CommandPreview {
            command_text: "select d.data from public.vs_doc_user as d where d.data ->> 'UserName' = :p0 LIMIT :p1"
                .to_string(),
            parameters: vec![
                BoundParameter {
                    name: "p0".to_string(),
                    param_type: ParamType::Text,
                    value: ParamValue::from("jdm"),
                },
                BoundParameter {
                    name: "p1".to_string(),
                    param_type: ParamType::Integer,
                    value: ParamValue::Int(1),
                },
            ],
        }
    }

    #[test]
    fn test_preview_display_lists_parameters() {
        let text = preview().to_string();
        assert!(text.starts_with("select d.data"));
        assert!(text.contains(":p0 = 'jdm' (text)"));
        assert!(text.contains(":p1 = 1 (integer)"));
    }

    #[test]
    fn test_render_text_sections() {
        let explanation = PlanExplanation {
            plan_id: "plan_0123456789ab".to_string(),
            template: "UserByUsername".to_string(),
            command: preview(),
            result_shape: ResultShape::SingleOptional { unique: false },
            member_slots: vec![("UserName".to_string(), vec![0])],
            compiled_at: Utc::now(),
            storage_plan: "Seq Scan on public.vs_doc_user (documents=5, matched=1)\n  Limit: 1\n".to_string(),
        };
        let text = explanation.render_text();
        assert!(text.contains("Plan ID: plan_0123456789ab"));
        assert!(text.contains("Result: first_or_default"));
        assert!(text.contains("UserName -> :p0"));
        assert!(text.contains("--- Storage Plan ---\n  Seq Scan on public.vs_doc_user"));
        assert_eq!(
            explanation.to_string(),
            "PlanExplanation(plan=plan_0123456789ab, template=UserByUsername, shape=first_or_default)"
        );
    }
}
