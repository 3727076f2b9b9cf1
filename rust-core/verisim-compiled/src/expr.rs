// SPDX-License-Identifier: PMPL-1.0-or-later
//! Declarative query expressions.
//!
//! Templates build a [`QueryExpression`] through the typed [`Queryable`]
//! handle. Template members enter the expression as [`Operand::Member`]
//! references, never as baked-in values, so one compiled plan can be re-bound
//! with whatever values the next instance carries.
//!
//! ```rust
//! use verisim_compiled::expr::{field, member};
//!
//! let by_name = field("UserName").eq(member("UserName"));
//! let adult = field("Age").ge(18);
//! let predicate = by_name.and(adult);
//! assert_eq!(predicate.member_references(), vec!["UserName"]);
//! ```

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::command::ParamValue;
use crate::result::{self, Materializer};
use crate::template::Document;

// ---------------------------------------------------------------------------
// Fields and operands
// ---------------------------------------------------------------------------

/// Dotted path into a JSON document (`Address.City`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Split a dotted path (`Address.City`) into segments.
    pub fn parse(path: &str) -> Self {
        Self(path.split('.').map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Read from the named template member at bind time.
    Member(String),
    /// Fixed value, still sent as a parameter.
    Literal(ParamValue),
}

/// Reference a template member by name.
pub fn member(name: &str) -> Operand {
    Operand::Member(name.to_string())
}

/// A fixed operand value.
pub fn literal(value: impl Into<ParamValue>) -> Operand {
    Operand::Literal(value.into())
}

impl From<ParamValue> for Operand {
    fn from(value: ParamValue) -> Self {
        Operand::Literal(value)
    }
}

macro_rules! literal_operand {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Operand {
                fn from(value: $ty) -> Self {
                    Operand::Literal(ParamValue::from(value))
                }
            }
        )*
    };
}

literal_operand!(&str, String, i64, i32, f64, bool);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}

/// Handle for building predicates over one document field.
#[derive(Debug, Clone)]
pub struct FieldRef(FieldPath);

/// Start a predicate on a document field.
pub fn field(path: &str) -> FieldRef {
    FieldRef(FieldPath::parse(path))
}

impl FieldRef {
    fn compare(self, op: CompareOp, operand: impl Into<Operand>) -> Predicate {
        Predicate::Compare {
            path: self.0,
            op,
            operand: operand.into(),
        }
    }

    pub fn eq(self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Eq, operand)
    }

    pub fn ne(self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Ne, operand)
    }

    pub fn gt(self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Gt, operand)
    }

    pub fn ge(self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Ge, operand)
    }

    pub fn lt(self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Lt, operand)
    }

    pub fn le(self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Le, operand)
    }

    pub fn is_in<I, O>(self, operands: I) -> Predicate
    where
        I: IntoIterator<Item = O>,
        O: Into<Operand>,
    {
        Predicate::In {
            path: self.0,
            operands: operands.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(self) -> Predicate {
        Predicate::IsNull(self.0)
    }

    pub fn is_not_null(self) -> Predicate {
        Predicate::IsNotNull(self.0)
    }
}

/// Filter predicate over a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        path: FieldPath,
        op: CompareOp,
        operand: Operand,
    },
    In {
        path: FieldPath,
        operands: Vec<Operand>,
    },
    IsNull(FieldPath),
    IsNotNull(FieldPath),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Predicate::And(mut terms) => {
                terms.push(other);
                Predicate::And(terms)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Predicate {
        match self {
            Predicate::Or(mut terms) => {
                terms.push(other);
                Predicate::Or(terms)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }

    /// Member names referenced by this predicate, in order of first use.
    pub fn member_references(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_members(&mut names);
        names
    }

    fn collect_members<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Predicate::Compare { operand, .. } => push_member(names, operand),
            Predicate::In { operands, .. } => {
                for operand in operands {
                    push_member(names, operand);
                }
            }
            Predicate::IsNull(_) | Predicate::IsNotNull(_) => {}
            Predicate::And(terms) | Predicate::Or(terms) => {
                for term in terms {
                    term.collect_members(names);
                }
            }
            Predicate::Not(inner) => inner.collect_members(names),
        }
    }
}

fn push_member<'a>(names: &mut Vec<&'a str>, operand: &'a Operand) {
    if let Operand::Member(name) = operand {
        if !names.contains(&name.as_str()) {
            names.push(name.as_str());
        }
    }
}

// ---------------------------------------------------------------------------
// Query expression
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub path: FieldPath,
    pub descending: bool,
}

/// What each matching document is projected to.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Document,
    Field(FieldPath),
    /// `(alias, source path)` pairs building a new object.
    Object(Vec<(String, FieldPath)>),
}

/// Terminal operation, fixing the result's cardinality and form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    ToList,
    Count,
    Any,
    Json(JsonTerminal),
}

/// Terminals that return the store's serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonTerminal {
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    Array,
}

/// Untyped, declarative query description handed to the translator.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryExpression {
    pub collection: &'static str,
    /// AND-combined filters in declaration order.
    pub filters: Vec<Predicate>,
    pub order_by: Vec<OrderBy>,
    pub projection: Projection,
    pub terminal: Terminal,
}

impl QueryExpression {
    /// Member names referenced anywhere in the expression, in order of
    /// first use.
    pub fn member_references(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for filter in &self.filters {
            for name in filter.member_references() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

// ---------------------------------------------------------------------------
// Typed builder
// ---------------------------------------------------------------------------

/// Abstract queryable handle passed to
/// [`CompiledQuery::query_is`](crate::template::CompiledQuery::query_is).
///
/// `T` is the row type produced so far: the document type, or a projection.
pub struct Queryable<T> {
    collection: &'static str,
    filters: Vec<Predicate>,
    order_by: Vec<OrderBy>,
    projection: Projection,
    _row: PhantomData<fn() -> T>,
}

impl<D: Document> Queryable<D> {
    pub(crate) fn root() -> Self {
        Self {
            collection: D::collection(),
            filters: Vec::new(),
            order_by: Vec::new(),
            projection: Projection::Document,
            _row: PhantomData,
        }
    }
}

impl<T> Queryable<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Add a filter; repeated calls are AND-combined.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filters.push(predicate);
        self
    }

    pub fn order_by(mut self, path: &str) -> Self {
        self.order_by.push(OrderBy {
            path: FieldPath::parse(path),
            descending: false,
        });
        self
    }

    pub fn order_by_descending(mut self, path: &str) -> Self {
        self.order_by.push(OrderBy {
            path: FieldPath::parse(path),
            descending: true,
        });
        self
    }

    /// Project each row into a new object of `(alias, source path)` pairs.
    pub fn select<P>(self, fields: &[(&str, &str)]) -> Queryable<P> {
        let fields = fields
            .iter()
            .map(|(alias, path)| (alias.to_string(), FieldPath::parse(path)))
            .collect();
        self.project(Projection::Object(fields))
    }

    /// Project each row to the value of one field.
    pub fn select_field<V>(self, path: &str) -> Queryable<V> {
        self.project(Projection::Field(FieldPath::parse(path)))
    }

    fn project<P>(self, projection: Projection) -> Queryable<P> {
        Queryable {
            collection: self.collection,
            filters: self.filters,
            order_by: self.order_by,
            projection,
            _row: PhantomData,
        }
    }

    fn finish<O>(self, terminal: Terminal, materialize: Materializer<O>) -> QueryExpr<O> {
        QueryExpr {
            expression: QueryExpression {
                collection: self.collection,
                filters: self.filters,
                order_by: self.order_by,
                projection: self.projection,
                terminal,
            },
            materialize,
        }
    }

    /// First row; zero rows is an error.
    pub fn first(self) -> QueryExpr<T> {
        self.finish(Terminal::First, result::one::<T>)
    }

    /// First row, or `None`.
    pub fn first_or_default(self) -> QueryExpr<Option<T>> {
        self.finish(Terminal::FirstOrDefault, result::optional::<T>)
    }

    /// Exactly one row.
    pub fn single(self) -> QueryExpr<T> {
        self.finish(Terminal::Single, result::one::<T>)
    }

    /// Zero or one row; more than one is an error.
    pub fn single_or_default(self) -> QueryExpr<Option<T>> {
        self.finish(Terminal::SingleOrDefault, result::optional::<T>)
    }

    /// All matching documents, in storage or `order_by` order.
    pub fn to_list(self) -> QueryExpr<Vec<T>> {
        self.finish(Terminal::ToList, result::list::<T>)
    }

    /// Number of matching documents.
    pub fn count(self) -> QueryExpr<i64> {
        self.finish(Terminal::Count, result::scalar::<i64>)
    }

    /// Whether at least one document matches.
    pub fn any(self) -> QueryExpr<bool> {
        self.finish(Terminal::Any, result::scalar::<bool>)
    }

    /// Switch to terminals returning the store's serialized JSON.
    pub fn as_json(self) -> JsonQueryable<T> {
        JsonQueryable(self)
    }

    /// All rows as one JSON array, built from the stored text.
    pub fn to_json_array(self) -> QueryExpr<String> {
        self.finish(Terminal::Json(JsonTerminal::Array), result::json)
    }
}

/// Queryable whose terminals return raw JSON text.
pub struct JsonQueryable<T>(Queryable<T>);

impl<T> JsonQueryable<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn first(self) -> QueryExpr<String> {
        self.0.finish(Terminal::Json(JsonTerminal::First), result::json)
    }

    pub fn first_or_default(self) -> QueryExpr<Option<String>> {
        self.0
            .finish(Terminal::Json(JsonTerminal::FirstOrDefault), result::json_optional)
    }

    pub fn single(self) -> QueryExpr<String> {
        self.0.finish(Terminal::Json(JsonTerminal::Single), result::json)
    }

    pub fn single_or_default(self) -> QueryExpr<Option<String>> {
        self.0
            .finish(Terminal::Json(JsonTerminal::SingleOrDefault), result::json_optional)
    }

    pub fn to_array(self) -> QueryExpr<String> {
        self.0.finish(Terminal::Json(JsonTerminal::Array), result::json)
    }
}

/// A finished, typed query expression: the declarative part plus the
/// handler turning shaped rows into `O`.
pub struct QueryExpr<O> {
    pub(crate) expression: QueryExpression,
    pub(crate) materialize: Materializer<O>,
}

impl<O> QueryExpr<O> {
    /// The query shape this terminal closes over.
    pub fn expression(&self) -> &QueryExpression {
        &self.expression
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Account {
        owner: String,
    }

    impl Document for Account {
        fn collection() -> &'static str {
            "account"
        }
    }

    #[test]
    fn test_field_path_parse() {
        let path = FieldPath::parse("Address.City");
        assert_eq!(path.segments(), &["Address".to_string(), "City".to_string()]);
        assert_eq!(path.to_string(), "Address.City");
    }

    #[test]
    fn test_and_flattens() {
        let p = field("A")
            .eq(member("A"))
            .and(field("B").eq(1))
            .and(field("C").is_null());
        match p {
            Predicate::And(terms) => assert_eq!(terms.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_member_references_dedup_in_order() {
        let p = field("B")
            .eq(member("Second"))
            .or(field("A").is_in([member("First"), member("Second")]))
            .and(field("C").eq(member("First")).not());
        assert_eq!(p.member_references(), vec!["Second", "First"]);
    }

    #[test]
    fn test_builder_produces_expression() {
        let expr = Queryable::<Account>::root()
            .filter(field("owner").eq(member("Owner")))
            .order_by_descending("owner")
            .select_field::<String>("owner")
            .to_list();
        let e = expr.expression();
        assert_eq!(e.collection, "account");
        assert_eq!(e.terminal, Terminal::ToList);
        assert_eq!(e.projection, Projection::Field(FieldPath::parse("owner")));
        assert!(e.order_by[0].descending);
        assert_eq!(e.member_references(), vec!["Owner"]);
    }

    #[test]
    fn test_json_terminals() {
        let expr = Queryable::<Account>::root().as_json().single();
        assert_eq!(expr.expression().terminal, Terminal::Json(JsonTerminal::Single));
        let array = Queryable::<Account>::root().to_json_array();
        assert_eq!(array.expression().terminal, Terminal::Json(JsonTerminal::Array));
    }
}
