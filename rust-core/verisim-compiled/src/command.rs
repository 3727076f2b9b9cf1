// SPDX-License-Identifier: PMPL-1.0-or-later
//! Command shapes, parameter slots and bound commands.
//!
//! A [`CommandShape`] is what the translator hands back: renderable command
//! text with `:pN` placeholders, the ordered parameter slots behind those
//! placeholders, and a structured [`Statement`] the storage layer can run.
//! A [`BoundCommand`] is the same text with concrete values in every slot.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::expr::{CompareOp, FieldPath};

// ---------------------------------------------------------------------------
// Parameter values
// ---------------------------------------------------------------------------

/// A value bound into a parameter slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    /// A UTF-8 string value.
    String(String),
    /// A signed 64-bit integer.
    Int(i64),
    /// A 64-bit floating-point number.
    Float(f64),
    /// A boolean value.
    Bool(bool),
    /// An explicit SQL-style NULL.
    Null,
}

impl ParamValue {
    /// Declared type of this value. `Null` carries no type information.
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::String(_) => ParamType::Text,
            ParamValue::Int(_) => ParamType::Integer,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Bool(_) => ParamType::Boolean,
            ParamValue::Null => ParamType::Unknown,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }

    /// JSON form of the value, as the storage layer compares it.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::String(s) => serde_json::Value::String(s.clone()),
            ParamValue::Int(i) => serde_json::Value::from(*i),
            ParamValue::Float(f) => serde_json::Value::from(*f),
            ParamValue::Bool(b) => serde_json::Value::Bool(*b),
            ParamValue::Null => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::String(s) => write!(f, "'{}'", s),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Null => write!(f, "NULL"),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<&String> for ParamValue {
    fn from(value: &String) -> Self {
        ParamValue::String(value.clone())
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ParamValue::Null, Into::into)
    }
}

/// Declared type of a parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Text,
    Integer,
    Float,
    Boolean,
    /// Accepts any value; a bound parameter reports the value's own type.
    Unknown,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Text => write!(f, "text"),
            ParamType::Integer => write!(f, "integer"),
            ParamType::Float => write!(f, "float"),
            ParamType::Boolean => write!(f, "boolean"),
            ParamType::Unknown => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Slots and command shapes
// ---------------------------------------------------------------------------

/// Where a parameter slot gets its runtime value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSource {
    /// Re-read from the named template member on every bind.
    Member(String),
    /// Fixed when the plan was translated (literals, row limits).
    Constant(ParamValue),
}

/// One named, positional placeholder in a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSlot {
    /// Placeholder name as it appears in the text, without the colon (`p0`).
    pub name: String,
    /// Zero-based position; equals the index in [`CommandShape::slots`].
    pub position: usize,
    pub param_type: ParamType,
    pub source: SlotSource,
}

/// The translated, not yet bound, form of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandShape {
    /// Renderable command text with `:pN` placeholders.
    pub text: String,
    /// Slots in placeholder order.
    pub slots: Vec<ParameterSlot>,
    /// Structured form of the same command.
    pub statement: Arc<Statement>,
}

/// Structured document query the storage layer evaluates.
///
/// Conditions and limits reference parameter slots by position, so one
/// statement serves every binding of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Logical collection name (`user`).
    pub collection: String,
    /// Qualified table name as rendered (`public.vs_doc_user`).
    pub table: String,
    pub selection: Selection,
    pub filter: Option<Condition>,
    pub order_by: Vec<SortKey>,
    /// Slot holding the row limit, if any.
    pub limit_slot: Option<usize>,
}

/// What each matched document contributes to the output.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// The stored document text, verbatim.
    Document,
    /// A single JSON value at a path.
    Field(FieldPath),
    /// A JSON object built from `(alias, path)` pairs.
    Object(Vec<(String, FieldPath)>),
    /// One row holding the match count.
    Count,
    /// One row holding whether anything matched.
    Exists,
}

/// Filter condition over a document, with operands held in slots.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        path: FieldPath,
        op: CompareOp,
        slot: usize,
    },
    In {
        path: FieldPath,
        slots: Vec<usize>,
    },
    IsNull(FieldPath),
    IsNotNull(FieldPath),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

/// Ordering term of a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub path: FieldPath,
    pub descending: bool,
}

// ---------------------------------------------------------------------------
// Result shapes
// ---------------------------------------------------------------------------

/// Declared result handling of a compiled plan.
///
/// Sync and async execution share the same shape; asynchrony is only an
/// execution-time concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    /// Exactly one row is required. `unique` rejects more than one.
    SingleRequired { unique: bool },
    /// Zero rows yield an empty result. `unique` rejects more than one.
    SingleOptional { unique: bool },
    /// Ordered sequence of rows.
    List,
    /// One scalar value.
    Scalar,
    /// Storage-native serialized form, returned without materialization.
    RawSerialized(RawLayout),
}

/// Layout of a raw-serialized result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawLayout {
    Single { required: bool, unique: bool },
    /// `[` + rows joined by `,` + `]`.
    Array,
}

impl fmt::Display for ResultShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultShape::SingleRequired { unique: true } => write!(f, "single"),
            ResultShape::SingleRequired { unique: false } => write!(f, "first"),
            ResultShape::SingleOptional { unique: true } => write!(f, "single_or_default"),
            ResultShape::SingleOptional { unique: false } => write!(f, "first_or_default"),
            ResultShape::List => write!(f, "list"),
            ResultShape::Scalar => write!(f, "scalar"),
            ResultShape::RawSerialized(RawLayout::Array) => write!(f, "json_array"),
            ResultShape::RawSerialized(RawLayout::Single { required, unique }) => {
                let base = if *unique { "single" } else { "first" };
                if *required {
                    write!(f, "json_{}", base)
                } else {
                    write!(f, "json_{}_or_default", base)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bound commands
// ---------------------------------------------------------------------------

/// A parameter with its value for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundParameter {
    pub name: String,
    pub param_type: ParamType,
    pub value: ParamValue,
}

/// A plan's command with every slot filled, ready to send to storage.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundCommand {
    pub text: String,
    /// Parameters in slot order.
    pub parameters: Vec<BoundParameter>,
    pub statement: Arc<Statement>,
}

impl BoundCommand {
    /// Value bound at a slot position.
    pub fn value_at(&self, position: usize) -> Option<&ParamValue> {
        self.parameters.get(position).map(|p| &p.value)
    }

    /// Value bound to a named placeholder (`p0`).
    pub fn parameter(&self, name: &str) -> Option<&ParamValue> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}
