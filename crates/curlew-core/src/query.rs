// crates/curlew-core/src/query.rs
// ============================================================================
// Module: Retrieve Query Model
// Description: Serde model of the JSON query schema for reading retrieval.
// Purpose: Give the storage engine a typed view of retrieval requests.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! The retrieval surface accepts a JSON object with optional `aggregate`,
//! `return`, `modifier`, `where`, `timebucket`, and `limit` keys. An empty
//! payload dumps the readings. `aggregate.operation == "all"` selects the
//! timebucket path that computes min/max/average/count/sum for every
//! datapoint. The model here is deliberately permissive; semantic
//! validation happens in the SQL builder, which fails closed on anything it
//! does not recognize.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde_json::Value;

// ============================================================================
// SECTION: Query
// ============================================================================

/// A retrieval request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrieveQuery {
    /// Numeric aggregation, or the `all` timebucket path.
    #[serde(default)]
    pub aggregate: Option<AggregateSpec>,
    /// Projection list.
    #[serde(default, rename = "return")]
    pub returns: Option<Vec<ReturnColumn>>,
    /// Raw SQL modifier inserted after `SELECT` (e.g. `DISTINCT`).
    #[serde(default)]
    pub modifier: Option<String>,
    /// Recursive filter clause.
    #[serde(default, rename = "where")]
    pub where_clause: Option<WhereClause>,
    /// Time bucketing of the result.
    #[serde(default)]
    pub timebucket: Option<Timebucket>,
    /// Row limit.
    #[serde(default)]
    pub limit: Option<u64>,
}

impl RetrieveQuery {
    /// True when the request selects the timebucket-all aggregation path.
    #[must_use]
    pub fn is_aggregate_all(&self) -> bool {
        match &self.aggregate {
            Some(AggregateSpec::Single(aggregate)) => aggregate.operation == "all",
            _ => false,
        }
    }
}

/// One aggregate, or a list applied together.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AggregateSpec {
    /// A single aggregate object.
    Single(Aggregate),
    /// Several aggregates in one projection.
    Many(Vec<Aggregate>),
}

/// A single aggregation request.
#[derive(Debug, Clone, Deserialize)]
pub struct Aggregate {
    /// One of `min`, `max`, `avg`, `sum`, `count`, or `all`.
    pub operation: String,
    /// Plain column to aggregate.
    #[serde(default)]
    pub column: Option<String>,
    /// JSON sub-selector to aggregate instead of a plain column.
    #[serde(default)]
    pub json: Option<JsonSelector>,
    /// Output column alias.
    #[serde(default)]
    pub alias: Option<String>,
}

/// Selector for a property inside a JSON column.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonSelector {
    /// The JSON column, normally `reading`.
    pub column: String,
    /// Property name or path inside the JSON object.
    pub properties: JsonProperties,
}

/// A single property name or a path of nested names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonProperties {
    /// One property.
    One(String),
    /// Nested property path, outermost first.
    Path(Vec<String>),
}

impl JsonProperties {
    /// Renders the selector as a SQLite JSON path expression.
    #[must_use]
    pub fn json_path(&self) -> String {
        match self {
            Self::One(name) => format!("$.{name}"),
            Self::Path(names) => {
                let mut path = String::from("$");
                for name in names {
                    path.push('.');
                    path.push_str(name);
                }
                path
            }
        }
    }
}

/// One entry of the `return` projection list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReturnColumn {
    /// Bare column name.
    Name(String),
    /// Column with formatting, timezone, alias, or a JSON sub-selector.
    Spec(ReturnSpec),
}

/// A projection entry with display options.
#[derive(Debug, Clone, Deserialize)]
pub struct ReturnSpec {
    /// Plain column to project.
    #[serde(default)]
    pub column: Option<String>,
    /// JSON sub-selector to project instead of a plain column.
    #[serde(default)]
    pub json: Option<JsonSelector>,
    /// `strftime` date format for datetime columns.
    #[serde(default)]
    pub format: Option<String>,
    /// `utc` or `localtime`.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Output column alias.
    #[serde(default)]
    pub alias: Option<String>,
}

/// Recursive filter clause.
///
/// # Invariants
/// - `and`/`or` chain further clauses onto this one; both may be present.
#[derive(Debug, Clone, Deserialize)]
pub struct WhereClause {
    /// Column the condition applies to.
    pub column: String,
    /// Comparison operator (`=`, `!=`, `<`, `>`, `<=`, `>=`, `like`, `in`,
    /// `isnull`, `notnull`, `older`, `newer`).
    pub condition: String,
    /// Comparison value; absent for null tests.
    #[serde(default)]
    pub value: Option<Value>,
    /// Conjunction with a further clause.
    #[serde(default)]
    pub and: Option<Box<WhereClause>>,
    /// Disjunction with a further clause.
    #[serde(default)]
    pub or: Option<Box<WhereClause>>,
}

/// Time bucketing of query output.
#[derive(Debug, Clone, Deserialize)]
pub struct Timebucket {
    /// Datetime column the buckets are computed from.
    pub timestamp: String,
    /// Bucket size in seconds; fractional sizes select sub-second output.
    #[serde(default)]
    pub size: Option<String>,
    /// `strftime` format for the bucket column.
    #[serde(default)]
    pub format: Option<String>,
    /// Output alias for the bucket column.
    #[serde(default)]
    pub alias: Option<String>,
}

impl Timebucket {
    /// Bucket size in seconds, defaulting to one.
    #[must_use]
    pub fn size_seconds(&self) -> f64 {
        let parsed = self.size.as_deref().and_then(|raw| raw.parse::<f64>().ok()).unwrap_or(1.0);
        if parsed > 0.0 { parsed } else { 1.0 }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
