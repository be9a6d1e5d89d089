// crates/curlew-store-sqlite/src/query.rs
// ============================================================================
// Module: Retrieval SQL Builder
// Description: SQL generation from the JSON query model plus row mapping.
// Purpose: Answer dump, projection, aggregate, and timebucket requests over
//          the readings table union.
// Dependencies: curlew-core, rusqlite, serde_json
// ============================================================================

//! ## Overview
//! Queries run over a `UNION ALL` of the catalogued readings tables exposing
//! `(id, asset_code, reading, user_ts, ts)`. Identifiers and literals from
//! the request are validated or escaped before they reach SQL text; anything
//! unrecognized fails closed with an invalid-request error.
//!
//! The timebucket-all path builds the original three-level query: the
//! innermost SELECT explodes each reading's JSON object into `(key, value)`
//! rows with `json_each`, the middle level aggregates
//! min/max/average/count/sum per datapoint per bucket, and the outer level
//! concatenates the per-datapoint objects into one JSON object per
//! `(bucket, asset_code)`. The bucket key is
//! `round((julianday(ts) − 2440587.5) × 86400 / size) × size`, the unix time
//! of the bucket expressed through the julian day of the epoch.

// ============================================================================
// SECTION: Imports
// ============================================================================

use curlew_core::Aggregate;
use curlew_core::AggregateSpec;
use curlew_core::RetrieveQuery;
use curlew_core::ReturnColumn;
use curlew_core::ReturnSpec;
use curlew_core::Timebucket;
use curlew_core::WhereClause;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use serde_json::Value;
use serde_json::json;

use crate::engine::SqliteStoreError;
use crate::retry::RetryCounters;
use crate::retry::RetryPolicy;
use crate::retry::with_retry;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Julian day of 1970-01-01 00:00 UTC.
const JULIAN_DAY_START_UNIXTIME: &str = "2440587.5";
/// Seconds per day, as SQL text.
const SECONDS_PER_DAY: &str = "86400.0";
/// Datetime rendering to whole seconds.
const F_DATEH24_SEC: &str = "%Y-%m-%d %H:%M:%S";
/// Datetime rendering with fractional seconds.
const F_DATEH24_MS: &str = "%Y-%m-%d %H:%M:%f";

// ============================================================================
// SECTION: Escaping
// ============================================================================

/// Renders a string as a quoted SQL literal.
#[must_use]
pub(crate) fn escape_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

/// Validates a bare SQL identifier from the request.
fn identifier(raw: &str) -> Result<&str, SqliteStoreError> {
    let valid = !raw.is_empty()
        && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !raw.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(raw)
    } else {
        Err(SqliteStoreError::Invalid(format!("invalid column name: {raw}")))
    }
}

/// Renders a JSON scalar as a SQL literal.
fn literal(value: &Value) -> Result<String, SqliteStoreError> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(flag) => Ok(if *flag { "1" } else { "0" }.to_string()),
        Value::Number(number) => Ok(number.to_string()),
        Value::String(text) => Ok(escape_literal(text)),
        Value::Array(_) | Value::Object(_) => {
            Err(SqliteStoreError::Invalid("unsupported literal in where clause".to_string()))
        }
    }
}

/// Maps a `timezone` request onto a SQLite datetime modifier. Stored values
/// are UTC, so `utc` needs no conversion and `localtime` converts outward.
fn timezone_modifier(timezone: Option<&str>) -> Result<Option<&'static str>, SqliteStoreError> {
    match timezone {
        None => Ok(Some("localtime")),
        Some(tz) if tz.eq_ignore_ascii_case("utc") => Ok(None),
        Some(tz) if tz.eq_ignore_ascii_case("localtime") => Ok(Some("localtime")),
        Some(tz) => {
            Err(SqliteStoreError::Invalid(format!("unsupported timezone in query: {tz}")))
        }
    }
}

/// Renders a datetime column through `strftime` with an optional modifier.
fn strftime(format: &str, column: &str, modifier: Option<&str>) -> String {
    let escaped = format.replace('\'', "''");
    match modifier {
        Some(modifier) => format!("strftime('{escaped}', {column}, '{modifier}')"),
        None => format!("strftime('{escaped}', {column})"),
    }
}

/// Rendering of `user_ts` preserving the microsecond fraction.
fn user_ts_expr(modifier: Option<&str>) -> String {
    format!(
        "{} || substr(user_ts, instr(user_ts, '.'), 7)",
        strftime(F_DATEH24_SEC, "user_ts", modifier)
    )
}

// ============================================================================
// SECTION: Where Clauses
// ============================================================================

/// Renders a recursive where clause.
fn where_clause_sql(clause: &WhereClause, sql: &mut String) -> Result<(), SqliteStoreError> {
    let column = identifier(&clause.column)?;
    let condition = clause.condition.to_ascii_lowercase();
    match condition.as_str() {
        "isnull" => sql.push_str(&format!("{column} IS NULL")),
        "notnull" => sql.push_str(&format!("{column} IS NOT NULL")),
        "older" | "newer" => {
            let seconds = clause
                .value
                .as_ref()
                .and_then(Value::as_i64)
                .ok_or_else(|| {
                    SqliteStoreError::Invalid(format!("{condition} requires a numeric value"))
                })?;
            let operator = if condition == "older" { "<" } else { ">=" };
            sql.push_str(&format!(
                "{column} {operator} datetime('now', '-{seconds} seconds')"
            ));
        }
        "in" => {
            let Some(Value::Array(values)) = clause.value.as_ref() else {
                return Err(SqliteStoreError::Invalid(
                    "in condition requires an array value".to_string(),
                ));
            };
            let rendered: Result<Vec<String>, SqliteStoreError> =
                values.iter().map(literal).collect();
            sql.push_str(&format!("{column} IN ({})", rendered?.join(", ")));
        }
        "=" | "!=" | "<>" | "<" | ">" | "<=" | ">=" | "like" => {
            let value = clause.value.as_ref().ok_or_else(|| {
                SqliteStoreError::Invalid(format!("{condition} requires a value"))
            })?;
            let keyword = if condition == "like" { "LIKE" } else { condition.as_str() };
            sql.push_str(&format!("{column} {keyword} {}", literal(value)?));
        }
        _ => {
            return Err(SqliteStoreError::Invalid(format!(
                "unsupported where condition: {}",
                clause.condition
            )));
        }
    }
    if let Some(and) = &clause.and {
        sql.push_str(" AND ");
        where_clause_sql(and, sql)?;
    }
    if let Some(or) = &clause.or {
        sql.push_str(" OR ");
        where_clause_sql(or, sql)?;
    }
    Ok(())
}

// ============================================================================
// SECTION: Projections
// ============================================================================

/// Default dump projection.
fn default_projection() -> String {
    format!(
        "id, asset_code, reading, {} AS user_ts, {} AS ts",
        user_ts_expr(Some("localtime")),
        strftime(F_DATEH24_MS, "ts", Some("localtime"))
    )
}

/// Renders one `return` projection entry.
fn return_column_sql(column: &ReturnColumn) -> Result<String, SqliteStoreError> {
    match column {
        ReturnColumn::Name(name) => match name.as_str() {
            "user_ts" => Ok(format!("{} AS user_ts", user_ts_expr(Some("localtime")))),
            "ts" => Ok(format!("{} AS ts", strftime(F_DATEH24_MS, "ts", Some("localtime")))),
            other => Ok(identifier(other)?.to_string()),
        },
        ReturnColumn::Spec(spec) => return_spec_sql(spec),
    }
}

/// Renders a projection entry with format, timezone, alias, or JSON
/// sub-selection.
fn return_spec_sql(spec: &ReturnSpec) -> Result<String, SqliteStoreError> {
    let mut rendered = if let Some(json) = &spec.json {
        format!(
            "json_extract({}, '{}')",
            identifier(&json.column)?,
            json.properties.json_path().replace('\'', "''")
        )
    } else if let Some(column) = &spec.column {
        let column = identifier(column)?;
        let modifier = timezone_modifier(spec.timezone.as_deref())?;
        if let Some(format) = &spec.format {
            strftime(format, column, modifier)
        } else if spec.timezone.is_some() || column == "user_ts" || column == "ts" {
            if column == "user_ts" {
                user_ts_expr(modifier)
            } else {
                strftime(F_DATEH24_MS, column, modifier)
            }
        } else {
            column.to_string()
        }
    } else {
        return Err(SqliteStoreError::Invalid(
            "return object must have either a column or json property".to_string(),
        ));
    };

    if let Some(alias) = &spec.alias {
        rendered.push_str(&format!(" AS \"{}\"", alias.replace('"', "")));
    } else if let Some(column) = &spec.column
        && (spec.format.is_some()
            || spec.timezone.is_some()
            || column == "user_ts"
            || column == "ts")
    {
        rendered.push_str(&format!(" AS {}", identifier(column)?));
    }
    Ok(rendered)
}

/// Renders the aggregate projection list.
fn aggregate_projection(spec: &AggregateSpec) -> Result<String, SqliteStoreError> {
    let aggregates: Vec<&Aggregate> = match spec {
        AggregateSpec::Single(aggregate) => vec![aggregate],
        AggregateSpec::Many(aggregates) => aggregates.iter().collect(),
    };
    let mut rendered = Vec::with_capacity(aggregates.len());
    for aggregate in aggregates {
        let operation = aggregate.operation.to_ascii_lowercase();
        if !matches!(operation.as_str(), "min" | "max" | "avg" | "sum" | "count") {
            return Err(SqliteStoreError::Invalid(format!(
                "unsupported aggregate operation: {}",
                aggregate.operation
            )));
        }
        let (target, name) = if let Some(json) = &aggregate.json {
            let target = format!(
                "json_extract({}, '{}')",
                identifier(&json.column)?,
                json.properties.json_path().replace('\'', "''")
            );
            let leaf = match &json.properties {
                curlew_core::query::JsonProperties::One(name) => name.clone(),
                curlew_core::query::JsonProperties::Path(names) => {
                    names.last().cloned().unwrap_or_default()
                }
            };
            (target, leaf)
        } else if let Some(column) = &aggregate.column {
            (identifier(column)?.to_string(), column.clone())
        } else {
            return Err(SqliteStoreError::Invalid(
                "aggregate must have either a column or json property".to_string(),
            ));
        };
        let alias = aggregate
            .alias
            .clone()
            .unwrap_or_else(|| format!("{operation}_{name}"));
        rendered.push(format!("{operation}({target}) AS \"{}\"", alias.replace('"', "")));
    }
    Ok(rendered.join(", "))
}

// ============================================================================
// SECTION: Timebuckets
// ============================================================================

/// Bucket size rendered the way the grouping expression needs it.
fn bucket_size_sql(size: f64) -> String {
    if size.fract() == 0.0 {
        format!("{}", size as i64)
    } else {
        format!("{size}")
    }
}

/// Grouping expression: the bucket ordinal of the time column.
fn bucket_group_expr(timebucket: &Timebucket) -> Result<String, SqliteStoreError> {
    let column = identifier(&timebucket.timestamp)?;
    let size = timebucket.size_seconds();
    let divisor = if (size - 1.0).abs() < f64::EPSILON {
        "1".to_string()
    } else {
        bucket_size_sql(size)
    };
    Ok(format!(
        "round((julianday({column}) - {JULIAN_DAY_START_UNIXTIME}) * {SECONDS_PER_DAY} / \
         {divisor})"
    ))
}

/// Select expression: the bucket key as a datetime (or raw unix seconds for
/// sub-second buckets).
fn bucket_select_expr(timebucket: &Timebucket) -> Result<String, SqliteStoreError> {
    let size = timebucket.size_seconds();
    let group = bucket_group_expr(timebucket)?;
    let scaled = if (size - 1.0).abs() < f64::EPSILON {
        group
    } else {
        format!("{} * {group}", bucket_size_sql(size))
    };
    if size >= 1.0 {
        Ok(format!("datetime({scaled}, 'unixepoch')"))
    } else {
        Ok(format!("({scaled})"))
    }
}

// ============================================================================
// SECTION: Statement Assembly
// ============================================================================

/// Builds the SQL for every non-timebucket-all retrieval.
pub(crate) fn build_retrieve_sql(
    query: &RetrieveQuery,
    union: &str,
) -> Result<String, SqliteStoreError> {
    let mut sql = String::from("SELECT ");
    if let Some(modifier) = &query.modifier {
        sql.push_str(identifier(modifier)?);
        sql.push(' ');
    }

    let mut group_by = None;
    if let Some(aggregate) = &query.aggregate {
        if let Some(timebucket) = &query.timebucket {
            let alias = timebucket.alias.as_deref().unwrap_or("timestamp");
            sql.push_str(&bucket_select_expr(timebucket)?);
            sql.push_str(&format!(" AS \"{}\", ", alias.replace('"', "")));
            group_by = Some(bucket_group_expr(timebucket)?);
        }
        sql.push_str(&aggregate_projection(aggregate)?);
    } else if let Some(returns) = &query.returns {
        if query.timebucket.is_some() {
            return Err(SqliteStoreError::Invalid(
                "timebucket requires an aggregate".to_string(),
            ));
        }
        let rendered: Result<Vec<String>, SqliteStoreError> =
            returns.iter().map(return_column_sql).collect();
        sql.push_str(&rendered?.join(", "));
    } else {
        if query.timebucket.is_some() {
            return Err(SqliteStoreError::Invalid(
                "timebucket requires an aggregate".to_string(),
            ));
        }
        sql.push_str(&default_projection());
    }

    sql.push_str(&format!(" FROM ({union})"));
    if let Some(clause) = &query.where_clause {
        sql.push_str(" WHERE ");
        where_clause_sql(clause, &mut sql)?;
    }
    if let Some(group) = group_by {
        sql.push_str(&format!(" GROUP BY {group}"));
    }
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    Ok(sql)
}

/// Builds the three-level timebucket-all SQL.
pub(crate) fn build_aggregate_all_sql(
    query: &RetrieveQuery,
    union: &str,
) -> Result<String, SqliteStoreError> {
    let Some(timebucket) = &query.timebucket else {
        return Err(SqliteStoreError::Invalid(
            "aggregate all is missing the timebucket property".to_string(),
        ));
    };
    let Some(where_clause) = &query.where_clause else {
        return Err(SqliteStoreError::Invalid(
            "aggregate all is missing the where property".to_string(),
        ));
    };
    let column = identifier(&timebucket.timestamp)?;
    let size = timebucket.size_seconds();

    // Outer bucket column: formatted when requested, sub-second composite
    // below one-second buckets, otherwise the raw bucket datetime.
    let mut time_expr = if let Some(format) = &timebucket.format
        && size >= 1.0
    {
        strftime(format, "timestamp", Some("localtime"))
    } else if size < 1.0 {
        format!(
            "{} || substr({column}, instr({column}, '.'), 7)",
            strftime(F_DATEH24_SEC, column, Some("localtime"))
        )
    } else {
        "timestamp".to_string()
    };
    if let Some(alias) = &timebucket.alias {
        time_expr.push_str(&format!(" AS \"{}\"", alias.replace('"', "")));
    }

    let mut sql = format!(
        "SELECT asset_code, {time_expr}, \
         '{{' || group_concat('\"' || x || '\" : ' || resd, ', ') || '}}' AS reading \
         FROM ( SELECT x, asset_code, max(timestamp) AS timestamp, \
         '{{\"min\" : ' || min(theval) || ', \
         \"max\" : ' || max(theval) || ', \
         \"average\" : ' || avg(theval) || ', \
         \"count\" : ' || count(theval) || ', \
         \"sum\" : ' || sum(theval) || '}}' AS resd"
    );
    if size < 1.0 {
        sql.push_str(&format!(", max({column}) AS {column}"));
    }
    sql.push_str(&format!(
        " FROM ( SELECT asset_code, {column}, {} AS \"timestamp\", reading, \
         json_each.key AS x, json_each.value AS theval \
         FROM ({union}) readings, json_each(readings.reading) WHERE ",
        bucket_select_expr(timebucket)?
    ));
    where_clause_sql(where_clause, &mut sql)?;
    sql.push_str(&format!(
        " ) tmp GROUP BY x, asset_code, {} ) tbl \
         GROUP BY timestamp, asset_code ORDER BY timestamp DESC",
        bucket_group_expr(timebucket)?
    ));
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    Ok(sql)
}

// ============================================================================
// SECTION: Result Mapping
// ============================================================================

/// Runs a SELECT and maps the rows into `{count, rows}`. Text values that
/// carry JSON (the `reading` column and the timebucket concatenations) are
/// emitted as objects, everything else as scalars.
pub(crate) fn map_result_set(
    connection: &Connection,
    counters: &RetryCounters,
    sql: &str,
) -> Result<Value, SqliteStoreError> {
    let rows = with_retry(RetryPolicy::Statement, counters, "retrieve", || {
        let mut stmt = connection.prepare(sql)?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(ToString::to_string).collect();
        let mut mapped = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut object = serde_json::Map::with_capacity(column_names.len());
            for (index, name) in column_names.iter().enumerate() {
                let value = match row.get_ref(index)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(integer) => json!(integer),
                    ValueRef::Real(real) => json!(real),
                    ValueRef::Text(bytes) => text_value(String::from_utf8_lossy(bytes).as_ref()),
                    ValueRef::Blob(_) => Value::Null,
                };
                object.insert(name.clone(), value);
            }
            mapped.push(Value::Object(object));
        }
        Ok(mapped)
    })?;
    Ok(json!({"count": rows.len(), "rows": rows}))
}

/// Emits JSON-looking text as parsed JSON, other text verbatim.
fn text_value(text: &str) -> Value {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
    } else {
        Value::String(text.to_string())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
