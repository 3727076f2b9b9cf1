// SPDX-License-Identifier: PMPL-1.0-or-later
//! Storage execution.
//!
//! [`StorageExecutor`] is the boundary between compiled plans and whatever
//! actually holds the documents. [`InMemoryDocumentStore`] evaluates a
//! bound command's structured [`Statement`] over JSON documents held in
//! memory and keeps a log of every command text it was asked to run.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use crate::command::{BoundCommand, Condition, ParamValue, Selection, SortKey, Statement};
use crate::expr::{CompareOp, FieldPath};
use crate::template::Document;

/// Errors raised by a storage executor.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("no value bound for parameter slot {0}")]
    MissingParameter(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("document store lock poisoned")]
    Poisoned,
}

/// One result row in the store's serialized form.
#[derive(Debug, Clone, PartialEq)]
pub struct Row(String);

impl Row {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Raw JSON text of the row.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the row, returning its JSON text.
    pub fn into_json(self) -> String {
        self.0
    }
}

/// Runs bound commands against a document store.
#[async_trait]
pub trait StorageExecutor: Send + Sync {
    /// Run a command to completion on the calling thread.
    fn run(&self, command: &BoundCommand) -> Result<Vec<Row>, StorageError>;

    /// Run a command without blocking the async runtime.
    async fn run_async(&self, command: &BoundCommand) -> Result<Vec<Row>, StorageError>;

    /// Describe how the store would run a command, without logging it as
    /// executed.
    fn explain(&self, command: &BoundCommand) -> Result<String, StorageError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredDocument {
    raw: String,
    value: Value,
}

/// JSON document store held in memory.
#[derive(Debug)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<StoredDocument>>>,
    next_id: AtomicU64,
    latency: Option<Duration>,
    available: AtomicBool,
    executed: Mutex<Vec<String>>,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            latency: None,
            available: AtomicBool::new(true),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Delay every async execution by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store a document, returning its id.
    pub fn store<D: Document>(&self, document: &D) -> Result<u64, StorageError> {
        let raw = serde_json::to_string(document)?;
        self.insert_raw(D::collection(), raw)
    }

    /// Store already-serialized JSON text verbatim.
    pub fn insert_raw(&self, collection: &str, raw: impl Into<String>) -> Result<u64, StorageError> {
        let raw = raw.into();
        let value: Value = serde_json::from_str(&raw)?;
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let mut collections = self.collections.write().map_err(|_| StorageError::Poisoned)?;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(StoredDocument { raw, value });
        debug!(collection, id, "stored document");
        Ok(id)
    }

    /// Number of documents in a collection.
    pub fn document_count(&self, collection: &str) -> Result<usize, StorageError> {
        let collections = self.collections.read().map_err(|_| StorageError::Poisoned)?;
        Ok(collections.get(collection).map_or(0, Vec::len))
    }

    /// Simulate an outage: while unavailable every run fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
    }

    /// Command texts run so far, oldest first.
    pub fn executed_commands(&self) -> Result<Vec<String>, StorageError> {
        let executed = self.executed.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(executed.clone())
    }

    fn evaluate(&self, command: &BoundCommand) -> Result<(Vec<Row>, usize, usize), StorageError> {
        let statement = &command.statement;
        let collections = self.collections.read().map_err(|_| StorageError::Poisoned)?;
        let documents = collections
            .get(&statement.collection)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let mut matched = Vec::new();
        for document in documents {
            let keep = match &statement.filter {
                Some(condition) => satisfies(condition, &document.value, command)?,
                None => true,
            };
            if keep {
                matched.push(document);
            }
        }
        let matched_count = matched.len();

        match statement.selection {
            Selection::Count => {
                let count = Row::new(matched_count.to_string());
                return Ok((vec![count], documents.len(), matched_count));
            }
            Selection::Exists => {
                let exists = if matched_count > 0 { "true" } else { "false" };
                return Ok((vec![Row::new(exists)], documents.len(), matched_count));
            }
            _ => {}
        }

        if !statement.order_by.is_empty() {
            matched.sort_by(|a, b| compare_documents(&statement.order_by, &a.value, &b.value));
        }

        if let Some(limit) = limit_of(statement, command)? {
            matched.truncate(limit);
        }

        let rows = matched
            .into_iter()
            .map(|document| project(&statement.selection, document))
            .collect::<Result<Vec<_>, _>>()?;
        trace!(
            collection = %statement.collection,
            rows = rows.len(),
            "evaluated statement"
        );
        Ok((rows, documents.len(), matched_count))
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.available.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("in-memory store is offline".to_string()))
        }
    }

    fn log_command(&self, command: &BoundCommand) -> Result<(), StorageError> {
        let mut executed = self.executed.lock().map_err(|_| StorageError::Poisoned)?;
        executed.push(command.text.clone());
        Ok(())
    }
}

#[async_trait]
impl StorageExecutor for InMemoryDocumentStore {
    fn run(&self, command: &BoundCommand) -> Result<Vec<Row>, StorageError> {
        self.check_available()?;
        self.log_command(command)?;
        let (rows, _, _) = self.evaluate(command)?;
        Ok(rows)
    }

    async fn run_async(&self, command: &BoundCommand) -> Result<Vec<Row>, StorageError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.run(command)
    }

    fn explain(&self, command: &BoundCommand) -> Result<String, StorageError> {
        self.check_available()?;
        let statement = &command.statement;
        let (_, scanned, matched) = self.evaluate(command)?;

        let mut out = format!(
            "Seq Scan on {} (documents={}, matched={})\n",
            statement.table, scanned, matched
        );
        if let Some(condition) = &statement.filter {
            out.push_str(&format!("  Filter: {}\n", describe_condition(condition, command)));
        }
        if !statement.order_by.is_empty() {
            let keys: Vec<String> = statement
                .order_by
                .iter()
                .map(|k| if k.descending { format!("{} DESC", k.path) } else { k.path.to_string() })
                .collect();
            out.push_str(&format!("  Sort Key: {}\n", keys.join(", ")));
        }
        if let Some(limit) = limit_of(statement, command)? {
            out.push_str(&format!("  Limit: {}\n", limit));
        }
        out.push_str(&format!("  Output: {}\n", describe_selection(&statement.selection)));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn lookup<'v>(value: &'v Value, path: &FieldPath) -> Option<&'v Value> {
    path.segments()
        .iter()
        .try_fold(value, |current, segment| current.get(segment.as_str()))
}

fn bound<'c>(command: &'c BoundCommand, slot: usize) -> Result<&'c ParamValue, StorageError> {
    command.value_at(slot).ok_or(StorageError::MissingParameter(slot))
}

fn limit_of(statement: &Statement, command: &BoundCommand) -> Result<Option<usize>, StorageError> {
    let Some(slot) = statement.limit_slot else {
        return Ok(None);
    };
    match bound(command, slot)? {
        ParamValue::Int(n) => Ok(Some(usize::try_from(*n).unwrap_or(0))),
        _ => Err(StorageError::MissingParameter(slot)),
    }
}

/// Ordering of a stored value against a parameter. `None` when either side
/// is null or the types are not comparable.
fn compare_value(stored: &Value, param: &ParamValue) -> Option<Ordering> {
    match (stored, param) {
        (_, ParamValue::Null) | (Value::Null, _) => None,
        (Value::Number(n), ParamValue::Int(i)) => match n.as_i64() {
            Some(stored) => Some(stored.cmp(i)),
            None => n.as_f64()?.partial_cmp(&(*i as f64)),
        },
        (Value::Number(n), ParamValue::Float(f)) => n.as_f64()?.partial_cmp(f),
        (Value::String(s), ParamValue::String(p)) => Some(s.as_str().cmp(p.as_str())),
        (Value::Bool(b), ParamValue::Bool(p)) => Some(b.cmp(p)),
        _ => None,
    }
}

fn satisfies(condition: &Condition, document: &Value, command: &BoundCommand) -> Result<bool, StorageError> {
    Ok(match condition {
        Condition::Compare { path, op, slot } => {
            let param = bound(command, *slot)?;
            let ordering = lookup(document, path).and_then(|v| compare_value(v, param));
            match (ordering, op) {
                (None, _) => false,
                (Some(o), CompareOp::Eq) => o == Ordering::Equal,
                (Some(o), CompareOp::Ne) => o != Ordering::Equal,
                (Some(o), CompareOp::Gt) => o == Ordering::Greater,
                (Some(o), CompareOp::Ge) => o != Ordering::Less,
                (Some(o), CompareOp::Lt) => o == Ordering::Less,
                (Some(o), CompareOp::Le) => o != Ordering::Greater,
            }
        }
        Condition::In { path, slots } => {
            let Some(stored) = lookup(document, path) else {
                return Ok(false);
            };
            for slot in slots {
                if compare_value(stored, bound(command, *slot)?) == Some(Ordering::Equal) {
                    return Ok(true);
                }
            }
            false
        }
        Condition::IsNull(path) => lookup(document, path).map_or(true, Value::is_null),
        Condition::IsNotNull(path) => lookup(document, path).is_some_and(|v| !v.is_null()),
        Condition::And(terms) => {
            for term in terms {
                if !satisfies(term, document, command)? {
                    return Ok(false);
                }
            }
            true
        }
        Condition::Or(terms) => {
            for term in terms {
                if satisfies(term, document, command)? {
                    return Ok(true);
                }
            }
            false
        }
        Condition::Not(inner) => !satisfies(inner, document, command)?,
    })
}

/// Ascending order puts missing and null values last.
fn compare_documents(keys: &[SortKey], a: &Value, b: &Value) -> Ordering {
    for key in keys {
        let left = lookup(a, &key.path).filter(|v| !v.is_null());
        let right = lookup(b, &key.path).filter(|v| !v.is_null());
        let ordering = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(l), Some(r)) => compare_json(l, r),
        };
        let ordering = if key.descending { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_json(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn project(selection: &Selection, document: &StoredDocument) -> Result<Row, StorageError> {
    match selection {
        // Aggregates never reach projection.
        Selection::Document | Selection::Count | Selection::Exists => Ok(Row::new(document.raw.clone())),
        Selection::Field(path) => {
            let value = lookup(&document.value, path).unwrap_or(&Value::Null);
            Ok(Row::new(serde_json::to_string(value)?))
        }
        Selection::Object(fields) => {
            let mut object = serde_json::Map::new();
            for (alias, path) in fields {
                let value = lookup(&document.value, path).cloned().unwrap_or(Value::Null);
                object.insert(alias.clone(), value);
            }
            Ok(Row::new(serde_json::to_string(&Value::Object(object))?))
        }
    }
}

fn describe_condition(condition: &Condition, command: &BoundCommand) -> String {
    let value = |slot: usize| {
        command
            .value_at(slot)
            .map_or_else(|| "?".to_string(), ToString::to_string)
    };
    match condition {
        Condition::Compare { path, op, slot } => format!("{} {} {}", path, op.symbol(), value(*slot)),
        Condition::In { path, slots } => {
            let values: Vec<String> = slots.iter().map(|s| value(*s)).collect();
            format!("{} IN ({})", path, values.join(", "))
        }
        Condition::IsNull(path) => format!("{} IS NULL", path),
        Condition::IsNotNull(path) => format!("{} IS NOT NULL", path),
        Condition::And(terms) | Condition::Or(terms) => {
            let joiner = if matches!(condition, Condition::And(_)) { " AND " } else { " OR " };
            let parts: Vec<String> = terms.iter().map(|t| describe_condition(t, command)).collect();
            format!("({})", parts.join(joiner))
        }
        Condition::Not(inner) => format!("NOT {}", describe_condition(inner, command)),
    }
}

fn describe_selection(selection: &Selection) -> String {
    match selection {
        Selection::Document => "document".to_string(),
        Selection::Field(path) => format!("field {}", path),
        Selection::Object(fields) => {
            let aliases: Vec<&str> = fields.iter().map(|(alias, _)| alias.as_str()).collect();
            format!("object ({})", aliases.join(", "))
        }
        Selection::Count => "count".to_string(),
        Selection::Exists => "exists".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BoundParameter, ParamType};
    use std::sync::Arc;

    fn store_with_users() -> InMemoryDocumentStore {
        let store = InMemoryDocumentStore::new();
        for raw in [
            r#"{"UserName":"jdm","FirstName":"Jeremy","Age":40}"#,
            r#"{"UserName":"jens","FirstName":"Jens","Age":35}"#,
            r#"{"UserName":"jeff","FirstName":"Jeff","Age":null}"#,
        ] {
            store.insert_raw("user", raw).unwrap();
        }
        store
    }

    fn command(statement: Statement, values: Vec<ParamValue>) -> BoundCommand {
        BoundCommand {
            text: format!("select from {}", statement.table),
            parameters: values
                .into_iter()
                .enumerate()
                .map(|(i, value)| BoundParameter {
                    name: format!("p{}", i),
                    param_type: value.param_type(),
                    value,
                })
                .collect(),
            statement: Arc::new(statement),
        }
    }

    fn statement(filter: Option<Condition>) -> Statement {
        Statement {
            collection: "user".to_string(),
            table: "public.vs_doc_user".to_string(),
            selection: Selection::Document,
            filter,
            order_by: vec![],
            limit_slot: None,
        }
    }

    fn by_name() -> Condition {
        Condition::Compare {
            path: FieldPath::parse("UserName"),
            op: CompareOp::Eq,
            slot: 0,
        }
    }

    #[test]
    fn test_equality_filter_returns_verbatim_text() {
        let store = store_with_users();
        let rows = store
            .run(&command(statement(Some(by_name())), vec![ParamValue::from("jens")]))
            .unwrap();
        assert_eq!(rows, vec![Row::new(r#"{"UserName":"jens","FirstName":"Jens","Age":35}"#)]);
    }

    #[test]
    fn test_null_parameter_never_matches() {
        let store = store_with_users();
        let rows = store
            .run(&command(statement(Some(by_name())), vec![ParamValue::Null]))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_numeric_comparison_skips_nulls() {
        let store = store_with_users();
        let filter = Condition::Compare {
            path: FieldPath::parse("Age"),
            op: CompareOp::Ge,
            slot: 0,
        };
        let rows = store
            .run(&command(statement(Some(filter)), vec![ParamValue::Float(35.0)]))
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let store = InMemoryDocumentStore::new();
        store.insert_raw("user", r#"{"UserName":"a","Id":9007199254740993}"#).unwrap();
        store.insert_raw("user", r#"{"UserName":"b","Id":9007199254740992}"#).unwrap();
        let filter = Condition::Compare {
            path: FieldPath::parse("Id"),
            op: CompareOp::Eq,
            slot: 0,
        };
        let rows = store
            .run(&command(statement(Some(filter)), vec![ParamValue::Int(9_007_199_254_740_993)]))
            .unwrap();
        assert_eq!(rows, vec![Row::new(r#"{"UserName":"a","Id":9007199254740993}"#)]);
    }

    #[test]
    fn test_order_limit_and_projection() {
        let store = store_with_users();
        let mut stmt = statement(None);
        stmt.order_by.push(SortKey {
            path: FieldPath::parse("Age"),
            descending: false,
        });
        stmt.selection = Selection::Field(FieldPath::parse("UserName"));
        stmt.limit_slot = Some(0);
        let rows = store.run(&command(stmt, vec![ParamValue::Int(3)])).unwrap();
        let names: Vec<&str> = rows.iter().map(Row::as_str).collect();
        assert_eq!(names, vec![r#""jens""#, r#""jdm""#, r#""jeff""#]);
    }

    #[test]
    fn test_count_and_exists() {
        let store = store_with_users();
        let mut stmt = statement(Some(Condition::IsNull(FieldPath::parse("Age"))));
        stmt.selection = Selection::Count;
        assert_eq!(store.run(&command(stmt, vec![])).unwrap(), vec![Row::new("1")]);

        let mut stmt = statement(Some(by_name()));
        stmt.selection = Selection::Exists;
        let rows = store.run(&command(stmt, vec![ParamValue::from("nobody")])).unwrap();
        assert_eq!(rows, vec![Row::new("false")]);
    }

    #[test]
    fn test_missing_parameter_is_reported() {
        let store = store_with_users();
        let err = store.run(&command(statement(Some(by_name())), vec![])).unwrap_err();
        assert!(matches!(err, StorageError::MissingParameter(0)));
    }

    #[test]
    fn test_unavailable_store_fails_and_logs_nothing() {
        let store = store_with_users();
        store.set_available(false);
        let err = store
            .run(&command(statement(None), vec![]))
            .unwrap_err();
        assert_eq!(err.to_string(), "storage unavailable: in-memory store is offline");
        assert!(store.executed_commands().unwrap().is_empty());
    }

    #[test]
    fn test_explain_describes_statement_without_logging() {
        let store = store_with_users();
        let mut stmt = statement(Some(by_name()));
        stmt.limit_slot = Some(1);
        let cmd = command(stmt, vec![ParamValue::from("jdm"), ParamValue::Int(1)]);
        let text = store.explain(&cmd).unwrap();
        assert!(text.starts_with("Seq Scan on public.vs_doc_user (documents=3, matched=1)"));
        assert!(text.contains("Filter: UserName = 'jdm'"));
        assert!(text.contains("Limit: 1"));
        assert!(text.contains("Output: document"));
        assert!(store.executed_commands().unwrap().is_empty());
        assert_eq!(cmd.parameters[1].param_type, ParamType::Integer);
    }

    #[tokio::test]
    async fn test_run_async_logs_command() {
        let store = store_with_users().with_latency(Duration::from_millis(1));
        let cmd = command(statement(None), vec![]);
        let rows = store.run_async(&cmd).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(store.executed_commands().unwrap(), vec![cmd.text.clone()]);
        assert_eq!(store.document_count("user").unwrap(), 3);
    }
}
