// SPDX-License-Identifier: PMPL-1.0-or-later
//! Expression translation.
//!
//! The [`ExpressionTranslator`] trait is the seam to the query dialect.
//! [`SqlTranslator`] renders the PostgreSQL JSONB dialect the document layer
//! speaks:
//!
//! ```text
//! select d.data from public.vs_doc_user as d where d.data ->> 'UserName' = :p0 LIMIT :p1
//! ```
//!
//! Every operand becomes a named `:pN` slot, literals included, so command
//! text depends only on the expression's shape.

use std::sync::Arc;

use thiserror::Error;

use crate::command::{
    CommandShape, Condition, ParamType, ParamValue, ParameterSlot, RawLayout, ResultShape,
    Selection, SlotSource, SortKey, Statement,
};
use crate::expr::{FieldPath, JsonTerminal, Operand, Predicate, Projection, QueryExpression, Terminal};

/// Translator output: command shape plus declared result handling.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedCommand {
    pub command: CommandShape,
    pub shape: ResultShape,
}

/// Declared type information about one template member.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMember {
    pub name: String,
    pub param_type: ParamType,
}

/// The translator could not render an expression.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct TranslateError(pub String);

/// Turns a query expression into an executable command shape.
pub trait ExpressionTranslator: Send + Sync {
    fn translate(
        &self,
        expression: &QueryExpression,
        members: &[TemplateMember],
    ) -> Result<TranslatedCommand, TranslateError>;
}

// ---------------------------------------------------------------------------
// SqlTranslator
// ---------------------------------------------------------------------------

/// Renders expressions into JSONB-document SQL.
#[derive(Debug, Clone)]
pub struct SqlTranslator {
    schema: String,
    table_prefix: String,
}

impl SqlTranslator {
    pub fn new(schema: impl Into<String>, table_prefix: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table_prefix: table_prefix.into(),
        }
    }

    /// Qualified table for a collection (`public.vs_doc_user`).
    pub fn table_name(&self, collection: &str) -> String {
        format!("{}.{}{}", self.schema, self.table_prefix, collection)
    }
}

impl Default for SqlTranslator {
    fn default() -> Self {
        Self::new("public", "vs_doc_")
    }
}

impl ExpressionTranslator for SqlTranslator {
    fn translate(
        &self,
        expression: &QueryExpression,
        members: &[TemplateMember],
    ) -> Result<TranslatedCommand, TranslateError> {
        check_identifier(expression.collection, "collection name")?;

        let mut render = Render {
            members,
            slots: Vec::new(),
        };

        let (shape, limit) = shape_of(expression.terminal);
        let selection = selection_of(expression)?;
        let aggregate = matches!(selection, Selection::Count | Selection::Exists);
        if aggregate && !expression.order_by.is_empty() {
            return Err(TranslateError(
                "ordering cannot be combined with count or any".to_string(),
            ));
        }

        let table = self.table_name(expression.collection);
        let mut text = format!("select {} from {} as d", render_selection(&selection), table);

        let filter = match expression.filters.len() {
            0 => None,
            1 => Some(render.condition(&expression.filters[0])?),
            _ => Some(Condition::And(
                expression
                    .filters
                    .iter()
                    .map(|p| render.condition(p))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
        };
        if let Some(condition) = &filter {
            text.push_str(" where ");
            text.push_str(&render_condition(condition, &render.slots, true));
        }

        let mut order_by = Vec::with_capacity(expression.order_by.len());
        for (i, order) in expression.order_by.iter().enumerate() {
            check_path(&order.path)?;
            text.push_str(if i == 0 { " order by " } else { ", " });
            text.push_str(&json_locator(&order.path, true));
            if order.descending {
                text.push_str(" desc");
            }
            order_by.push(SortKey {
                path: order.path.clone(),
                descending: order.descending,
            });
        }

        let limit_slot = limit.map(|rows| {
            let slot = render.constant(ParamValue::Int(rows));
            text.push_str(&format!(" LIMIT :{}", render.slots[slot].name));
            slot
        });

        Ok(TranslatedCommand {
            command: CommandShape {
                text,
                slots: render.slots,
                statement: Arc::new(Statement {
                    collection: expression.collection.to_string(),
                    table,
                    selection,
                    filter,
                    order_by,
                    limit_slot,
                }),
            },
            shape,
        })
    }
}

/// Result shape and row limit implied by a terminal. Unique terminals fetch
/// two rows so that a second match can be detected.
fn shape_of(terminal: Terminal) -> (ResultShape, Option<i64>) {
    match terminal {
        Terminal::First => (ResultShape::SingleRequired { unique: false }, Some(1)),
        Terminal::FirstOrDefault => (ResultShape::SingleOptional { unique: false }, Some(1)),
        Terminal::Single => (ResultShape::SingleRequired { unique: true }, Some(2)),
        Terminal::SingleOrDefault => (ResultShape::SingleOptional { unique: true }, Some(2)),
        Terminal::ToList => (ResultShape::List, None),
        Terminal::Count | Terminal::Any => (ResultShape::Scalar, None),
        Terminal::Json(json) => {
            let single = |required, unique| {
                ResultShape::RawSerialized(RawLayout::Single { required, unique })
            };
            match json {
                JsonTerminal::First => (single(true, false), Some(1)),
                JsonTerminal::FirstOrDefault => (single(false, false), Some(1)),
                JsonTerminal::Single => (single(true, true), Some(2)),
                JsonTerminal::SingleOrDefault => (single(false, true), Some(2)),
                JsonTerminal::Array => (ResultShape::RawSerialized(RawLayout::Array), None),
            }
        }
    }
}

fn selection_of(expression: &QueryExpression) -> Result<Selection, TranslateError> {
    match expression.terminal {
        Terminal::Count => return Ok(Selection::Count),
        Terminal::Any => return Ok(Selection::Exists),
        _ => {}
    }
    match &expression.projection {
        Projection::Document => Ok(Selection::Document),
        Projection::Field(path) => {
            check_path(path)?;
            Ok(Selection::Field(path.clone()))
        }
        Projection::Object(fields) => {
            if fields.is_empty() {
                return Err(TranslateError("projection selects no fields".to_string()));
            }
            for (alias, path) in fields {
                check_identifier(alias, "projection alias")?;
                check_path(path)?;
            }
            Ok(Selection::Object(fields.clone()))
        }
    }
}

fn render_selection(selection: &Selection) -> String {
    match selection {
        Selection::Document => "d.data".to_string(),
        Selection::Field(path) => json_locator(path, false),
        Selection::Object(fields) => {
            let args: Vec<String> = fields
                .iter()
                .map(|(alias, path)| format!("'{}', {}", alias, json_locator(path, false)))
                .collect();
            format!("jsonb_build_object({})", args.join(", "))
        }
        Selection::Count => "count(*)".to_string(),
        Selection::Exists => "count(*) > 0".to_string(),
    }
}

/// `d.data -> 'Address' ->> 'City'`; `as_text` picks `->>` for the last step.
fn json_locator(path: &FieldPath, as_text: bool) -> String {
    let segments = path.segments();
    let mut out = String::from("d.data");
    for (i, segment) in segments.iter().enumerate() {
        let arrow = if as_text && i + 1 == segments.len() { "->>" } else { "->" };
        out.push_str(&format!(" {} '{}'", arrow, segment));
    }
    out
}

fn check_identifier(name: &str, what: &str) -> Result<(), TranslateError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(TranslateError(format!("{} {:?} is not a plain identifier", what, name)))
    }
}

fn check_path(path: &FieldPath) -> Result<(), TranslateError> {
    path.segments()
        .iter()
        .try_for_each(|segment| check_identifier(segment, "field path segment"))
}

struct Render<'a> {
    members: &'a [TemplateMember],
    slots: Vec<ParameterSlot>,
}

impl Render<'_> {
    fn push(&mut self, param_type: ParamType, source: SlotSource) -> usize {
        let position = self.slots.len();
        self.slots.push(ParameterSlot {
            name: format!("p{}", position),
            position,
            param_type,
            source,
        });
        position
    }

    fn constant(&mut self, value: ParamValue) -> usize {
        self.push(value.param_type(), SlotSource::Constant(value))
    }

    fn operand(&mut self, operand: &Operand) -> usize {
        match operand {
            Operand::Literal(value) => self.constant(value.clone()),
            Operand::Member(name) => {
                let param_type = self
                    .members
                    .iter()
                    .find(|m| &m.name == name)
                    .map(|m| m.param_type)
                    .unwrap_or(ParamType::Unknown);
                self.push(param_type, SlotSource::Member(name.clone()))
            }
        }
    }

    fn condition(&mut self, predicate: &Predicate) -> Result<Condition, TranslateError> {
        Ok(match predicate {
            Predicate::Compare { path, op, operand } => {
                check_path(path)?;
                Condition::Compare {
                    path: path.clone(),
                    op: *op,
                    slot: self.operand(operand),
                }
            }
            Predicate::In { path, operands } => {
                check_path(path)?;
                if operands.is_empty() {
                    return Err(TranslateError(format!("empty IN list on {}", path)));
                }
                Condition::In {
                    path: path.clone(),
                    slots: operands.iter().map(|o| self.operand(o)).collect(),
                }
            }
            Predicate::IsNull(path) => {
                check_path(path)?;
                Condition::IsNull(path.clone())
            }
            Predicate::IsNotNull(path) => {
                check_path(path)?;
                Condition::IsNotNull(path.clone())
            }
            Predicate::And(terms) => Condition::And(self.terms("and", terms)?),
            Predicate::Or(terms) => Condition::Or(self.terms("or", terms)?),
            Predicate::Not(inner) => Condition::Not(Box::new(self.condition(inner)?)),
        })
    }

    fn terms(
        &mut self,
        connective: &str,
        terms: &[Predicate],
    ) -> Result<Vec<Condition>, TranslateError> {
        if terms.is_empty() {
            return Err(TranslateError(format!("empty {} predicate", connective)));
        }
        terms.iter().map(|t| self.condition(t)).collect()
    }
}

fn render_condition(condition: &Condition, slots: &[ParameterSlot], top: bool) -> String {
    match condition {
        Condition::Compare { path, op, slot } => format!(
            "{} {} :{}",
            json_locator(path, true),
            op.symbol(),
            slots[*slot].name
        ),
        Condition::In { path, slots: members } => {
            let names: Vec<String> = members.iter().map(|s| format!(":{}", slots[*s].name)).collect();
            format!("{} in ({})", json_locator(path, true), names.join(", "))
        }
        Condition::IsNull(path) => format!("{} is null", json_locator(path, true)),
        Condition::IsNotNull(path) => format!("{} is not null", json_locator(path, true)),
        Condition::And(terms) | Condition::Or(terms) => {
            let joiner = if matches!(condition, Condition::And(_)) { " and " } else { " or " };
            let parts: Vec<String> = terms
                .iter()
                .map(|t| render_condition(t, slots, false))
                .collect();
            let joined = parts.join(joiner);
            if top && matches!(condition, Condition::And(_)) {
                joined
            } else {
                format!("({})", joined)
            }
        }
        Condition::Not(inner) => format!("not ({})", render_condition(inner, slots, true)),
    }
}
