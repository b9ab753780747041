//! In-process document store: schema-validated collections and the
//! aggregation reporting engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use gamedex_core::{FieldSpec, FieldType};

pub const CRATE_NAME: &str = "gamedex-store";

/// A persisted document: JSON object map keyed by schema field name.
pub type Document = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schema violation on field `{field}`: {reason}")]
    SchemaViolation { field: String, reason: String },
    #[error("duplicate primary key {0}")]
    DuplicateKey(i64),
    #[error("no document matched the given filter")]
    NotFound,
    #[error("collection `{0}` already exists")]
    DuplicateCollection(String),
    #[error("collection `{0}` does not exist")]
    UnknownCollection(String),
}

/// Collection-level schema: the enumerable field table plus the name of
/// the integer primary-key field.
#[derive(Debug, Clone)]
pub struct Schema {
    pub primary_key: &'static str,
    pub fields: &'static [FieldSpec],
}

impl Schema {
    pub fn new(primary_key: &'static str, fields: &'static [FieldSpec]) -> Self {
        Self { primary_key, fields }
    }

    /// The single integrity checkpoint: every required field must be
    /// present with its declared type and satisfy its numeric minimum.
    pub fn validate(&self, doc: &Document) -> Result<(), StoreError> {
        for spec in self.fields {
            let value = match doc.get(spec.name) {
                Some(v) => v,
                None if spec.required => {
                    return Err(StoreError::SchemaViolation {
                        field: spec.name.to_string(),
                        reason: "required field is missing".into(),
                    })
                }
                None => continue,
            };
            check_type(spec, value)?;
        }
        Ok(())
    }

    fn key_of(&self, doc: &Document) -> Result<i64, StoreError> {
        doc.get(self.primary_key)
            .and_then(Value::as_i64)
            .ok_or_else(|| StoreError::SchemaViolation {
                field: self.primary_key.to_string(),
                reason: "primary key must be an integer".into(),
            })
    }
}

fn check_type(spec: &FieldSpec, value: &Value) -> Result<(), StoreError> {
    let violation = |reason: &str| StoreError::SchemaViolation {
        field: spec.name.to_string(),
        reason: reason.into(),
    };
    match spec.field_type {
        FieldType::String => {
            if !value.is_string() {
                return Err(violation("expected a string"));
            }
        }
        FieldType::Int => {
            let n = value.as_i64().ok_or_else(|| violation("expected an integer"))?;
            if let Some(min) = spec.minimum {
                if (n as f64) < min {
                    return Err(violation("below declared minimum"));
                }
            }
        }
        FieldType::Double => {
            let n = value.as_f64().ok_or_else(|| violation("expected a number"))?;
            if let Some(min) = spec.minimum {
                if n < min {
                    return Err(violation("below declared minimum"));
                }
            }
        }
        FieldType::StringArray => {
            let items = value.as_array().ok_or_else(|| violation("expected an array"))?;
            if items.iter().any(|v| !v.is_string()) {
                return Err(violation("expected an array of strings"));
            }
        }
    }
    Ok(())
}

/// Field-level query filter. Clauses combine with AND; an empty filter
/// matches every document.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    eq: Vec<(String, Value)>,
    ne: Vec<(String, Value)>,
    gte: Vec<(String, f64)>,
    lte: Vec<(String, f64)>,
    contains_any: Vec<(String, Vec<String>)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((field.into(), value.into()));
        self
    }

    pub fn ne(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ne.push((field.into(), value.into()));
        self
    }

    pub fn gte(mut self, field: impl Into<String>, bound: f64) -> Self {
        self.gte.push((field.into(), bound));
        self
    }

    pub fn lte(mut self, field: impl Into<String>, bound: f64) -> Self {
        self.lte.push((field.into(), bound));
        self
    }

    /// Matches documents whose array field shares at least one element
    /// with `values`.
    pub fn contains_any(mut self, field: impl Into<String>, values: Vec<String>) -> Self {
        self.contains_any.push((field.into(), values));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.eq.iter().all(|(f, v)| doc.get(f) == Some(v))
            && self.ne.iter().all(|(f, v)| doc.get(f) != Some(v))
            && self.gte.iter().all(|(f, b)| {
                doc.get(f).and_then(Value::as_f64).map(|n| n >= *b).unwrap_or(false)
            })
            && self.lte.iter().all(|(f, b)| {
                doc.get(f).and_then(Value::as_f64).map(|n| n <= *b).unwrap_or(false)
            })
            && self.contains_any.iter().all(|(f, values)| {
                doc.get(f)
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .any(|s| values.iter().any(|v| v == s))
                    })
                    .unwrap_or(false)
            })
    }
}

/// One stage of a declarative aggregation pipeline. Stages compose
/// left-to-right, each consuming the previous stage's output rows, and
/// never mutate the underlying collection.
#[derive(Debug, Clone)]
pub enum Stage {
    /// Flatten an array field into one row per element.
    Unwind { field: String },
    /// Attach a computed field to every row.
    AddField { name: String, expr: Expr },
    /// Group rows by one or more key fields, averaging a numeric field.
    /// The key lands under `_id`; the average under `output`.
    GroupAvg {
        by: Vec<String>,
        source: String,
        output: String,
    },
    Sort { field: String, descending: bool },
    Limit(usize),
}

#[derive(Debug, Clone)]
pub enum Expr {
    /// First `len` characters of a string field. Used for year
    /// extraction from release-date strings; deliberately no calendar
    /// parsing or digit validation.
    Prefix { field: String, len: usize },
}

fn eval_expr(expr: &Expr, doc: &Document) -> Option<Value> {
    match expr {
        Expr::Prefix { field, len } => doc
            .get(field)
            .and_then(Value::as_str)
            .map(|s| Value::from(s.chars().take(*len).collect::<String>())),
    }
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}

fn run_stage(stage: &Stage, rows: Vec<Document>) -> Vec<Document> {
    match stage {
        Stage::Unwind { field } => {
            let mut out = Vec::new();
            for row in rows {
                let Some(items) = row.get(field).and_then(Value::as_array).cloned() else {
                    continue;
                };
                for item in items {
                    let mut unwound = row.clone();
                    unwound.insert(field.clone(), item);
                    out.push(unwound);
                }
            }
            out
        }
        Stage::AddField { name, expr } => rows
            .into_iter()
            .map(|mut row| {
                if let Some(value) = eval_expr(expr, &row) {
                    row.insert(name.clone(), value);
                }
                row
            })
            .collect(),
        Stage::GroupAvg { by, source, output } => {
            // First-seen key order is preserved.
            let mut groups: Vec<(Value, f64, u64)> = Vec::new();
            for row in &rows {
                let key = if by.len() == 1 {
                    row.get(&by[0]).cloned().unwrap_or(Value::Null)
                } else {
                    let mut composite = Map::new();
                    for field in by {
                        composite.insert(
                            field.clone(),
                            row.get(field).cloned().unwrap_or(Value::Null),
                        );
                    }
                    Value::Object(composite)
                };
                let sample = row.get(source).and_then(Value::as_f64);
                match groups.iter_mut().find(|(k, _, _)| *k == key) {
                    Some((_, sum, count)) => {
                        if let Some(n) = sample {
                            *sum += n;
                            *count += 1;
                        }
                    }
                    None => groups.push((key, sample.unwrap_or(0.0), sample.is_some() as u64)),
                }
            }
            groups
                .into_iter()
                .map(|(key, sum, count)| {
                    let mut row = Map::new();
                    row.insert("_id".into(), key);
                    let avg = if count > 0 {
                        Value::from(sum / count as f64)
                    } else {
                        Value::Null
                    };
                    row.insert(output.clone(), avg);
                    row
                })
                .collect()
        }
        Stage::Sort { field, descending } => {
            let mut rows = rows;
            rows.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                );
                if *descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
            rows
        }
        Stage::Limit(n) => {
            let mut rows = rows;
            rows.truncate(*n);
            rows
        }
    }
}

/// One schema-validated collection of documents, ordered by primary key.
#[derive(Debug)]
pub struct Collection {
    schema: Schema,
    rows: BTreeMap<i64, Document>,
}

impl Collection {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Validates against the schema and persists. Rejected documents
    /// are never stored, protecting every downstream reader from
    /// partially-populated records.
    pub fn insert(&mut self, doc: Document) -> Result<(), StoreError> {
        self.schema.validate(&doc)?;
        let key = self.schema.key_of(&doc)?;
        if self.rows.contains_key(&key) {
            return Err(StoreError::DuplicateKey(key));
        }
        self.rows.insert(key, doc);
        Ok(())
    }

    pub fn find_by_id(&self, id: i64) -> Option<&Document> {
        self.rows.get(&id)
    }

    /// Swaps in a full replacement for the document sharing its primary
    /// key. Validation happens before the swap, so a rejected
    /// replacement leaves the original untouched.
    pub fn replace(&mut self, doc: Document) -> Result<(), StoreError> {
        self.schema.validate(&doc)?;
        let key = self.schema.key_of(&doc)?;
        if !self.rows.contains_key(&key) {
            return Err(StoreError::NotFound);
        }
        self.rows.insert(key, doc);
        Ok(())
    }

    /// Returns matching documents in primary-key order. A non-empty
    /// projection keeps only the named fields.
    pub fn find(&self, filter: &Filter, projection: &[String]) -> Vec<Document> {
        self.rows
            .values()
            .filter(|doc| filter.matches(doc))
            .map(|doc| project(doc, projection))
            .collect()
    }

    /// Applies `patch` fields to every matching document. All patched
    /// results are validated before any is committed.
    pub fn update(&mut self, filter: &Filter, patch: &Document) -> Result<usize, StoreError> {
        let mut staged: Vec<(i64, Document)> = Vec::new();
        for (key, doc) in &self.rows {
            if !filter.matches(doc) {
                continue;
            }
            let mut patched = doc.clone();
            for (field, value) in patch {
                if field == self.schema.primary_key {
                    continue;
                }
                patched.insert(field.clone(), value.clone());
            }
            self.schema.validate(&patched)?;
            staged.push((*key, patched));
        }
        if staged.is_empty() {
            return Err(StoreError::NotFound);
        }
        let count = staged.len();
        for (key, patched) in staged {
            self.rows.insert(key, patched);
        }
        Ok(count)
    }

    pub fn delete(&mut self, filter: &Filter) -> Result<usize, StoreError> {
        let doomed: Vec<i64> = self
            .rows
            .iter()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(key, _)| *key)
            .collect();
        if doomed.is_empty() {
            return Err(StoreError::NotFound);
        }
        for key in &doomed {
            self.rows.remove(key);
        }
        Ok(doomed.len())
    }

    /// Runs a read-only aggregation pipeline over the collection.
    pub fn aggregate(&self, pipeline: &[Stage]) -> Vec<Document> {
        let mut rows: Vec<Document> = self.rows.values().cloned().collect();
        for stage in pipeline {
            rows = run_stage(stage, rows);
        }
        rows
    }
}

fn project(doc: &Document, projection: &[String]) -> Document {
    if projection.is_empty() {
        return doc.clone();
    }
    let mut out = Map::new();
    for field in projection {
        if let Some(value) = doc.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}

/// The process-wide set of named collections. Constructed once at the
/// composition root and passed by handle; there is no ambient global.
#[derive(Debug, Default)]
pub struct Catalog {
    collections: HashMap<String, Collection>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_collection(&mut self, name: &str, schema: Schema) -> Result<(), StoreError> {
        if self.collections.contains_key(name) {
            debug!(collection = name, "collection already exists");
            return Err(StoreError::DuplicateCollection(name.to_string()));
        }
        self.collections.insert(name.to_string(), Collection::new(schema));
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Result<&Collection, StoreError> {
        self.collections
            .get(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
    }

    pub fn collection_mut(&mut self, name: &str) -> Result<&mut Collection, StoreError> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
    }
}

/// Shared catalog handle used by the pipeline and request handlers.
#[derive(Debug, Clone, Default)]
pub struct SharedCatalog {
    inner: Arc<RwLock<Catalog>>,
}

impl SharedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Catalog> {
        self.inner.read().expect("catalog lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.inner.write().expect("catalog lock poisoned")
    }
}
