use chrono::NaiveDate;
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &[
    "audit_logs",
    "bookings",
    "customers",
    "processed_stripe_events",
    "rent_transactions",
];

pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            query.push(" AND ");
            push_match_clause(&mut query, validate_identifier(key)?, value);
        }
    }
    query
        .push(" ORDER BY t.")
        .push(order_name)
        .push(if ascending { " ASC" } else { " DESC" })
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, 1000));

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

/// Fetch one row by a unique column, `None` when absent.
pub async fn find_row(
    pool: &sqlx::PgPool,
    table: &str,
    value: &str,
    id_field: &str,
) -> Result<Option<Value>, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_match_clause(&mut query, id_name, &Value::String(value.to_string()));
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;
    Ok(row.and_then(read_row))
}

pub async fn create_row(
    pool: &sqlx::PgPool,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let mut created = create_rows(pool, table, std::slice::from_ref(payload)).await?;
    created
        .pop()
        .ok_or_else(|| AppError::Internal(format!("Could not create {table} record.")))
}

/// Insert many rows in one statement. PostgreSQL resolves column types
/// (uuid, date, numeric, enums) from the table definition through
/// `jsonb_populate_recordset`. The column list is the union of payload keys,
/// so only columns absent from every payload take the table default.
pub async fn create_rows(
    pool: &sqlx::PgPool,
    table: &str,
    payloads: &[Map<String, Value>],
) -> Result<Vec<Value>, AppError> {
    if payloads.is_empty() {
        return Ok(Vec::new());
    }
    let mut query = build_insert(table, payloads)?;
    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    if rows.len() != payloads.len() {
        return Err(AppError::Internal(format!(
            "Inserted {} of {} {table} records.",
            rows.len(),
            payloads.len()
        )));
    }
    Ok(read_rows(rows))
}

/// Compare-and-set update: the patch only applies while every column in
/// `expected` still holds the given value (`null` matches `IS NULL`).
/// Returns `None` when the row is missing or was changed by someone else.
pub async fn update_row_if(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
    expected: &Map<String, Value>,
    payload: &Map<String, Value>,
) -> Result<Option<Value>, AppError> {
    let mut query = build_guarded_update(table, row_id, id_field, expected, payload)?;
    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;
    Ok(row.and_then(read_row))
}

/// Update every row matching `filters`; returns the number of rows touched.
pub async fn update_rows_where(
    pool: &sqlx::PgPool,
    table: &str,
    filters: &Map<String, Value>,
    payload: &Map<String, Value>,
) -> Result<u64, AppError> {
    if filters.is_empty() {
        return Err(AppError::BadRequest(
            "Refusing to update without filters.".to_string(),
        ));
    }
    let table_name = validate_table(table)?;
    let keys = sorted_keys(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    push_assignments(&mut query, &keys);
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE 1=1");
    for (key, value) in filters {
        query.push(" AND ");
        push_match_clause(&mut query, validate_identifier(key)?, value);
    }

    let result = query.build().execute(pool).await.map_err(map_db_error)?;
    Ok(result.rows_affected())
}

pub async fn delete_rows_where(
    pool: &sqlx::PgPool,
    table: &str,
    column: &str,
    value: &str,
) -> Result<u64, AppError> {
    let table_name = validate_table(table)?;
    let column_name = validate_identifier(column)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE ");
    push_match_clause(&mut query, column_name, &Value::String(value.to_string()));

    let result = query.build().execute(pool).await.map_err(map_db_error)?;
    Ok(result.rows_affected())
}

fn build_insert<'a>(
    table: &'a str,
    payloads: &[Map<String, Value>],
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    let table_name = validate_table(table)?;

    let mut keys = payloads
        .iter()
        .flat_map(|payload| payload.keys().cloned())
        .collect::<Vec<_>>();
    keys.sort_unstable();
    keys.dedup();
    if keys.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }
    for key in &keys {
        validate_identifier(key)?;
    }

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.clone());
        }
    }
    query.push(") SELECT ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push("r.");
            separated.push_unseparated(key.clone());
        }
    }
    query
        .push(" FROM jsonb_populate_recordset(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Array(
        payloads.iter().cloned().map(Value::Object).collect(),
    ));
    query
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");
    Ok(query)
}

fn build_guarded_update<'a>(
    table: &'a str,
    row_id: &str,
    id_field: &str,
    expected: &Map<String, Value>,
    payload: &Map<String, Value>,
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?.to_string();
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    let keys = sorted_keys(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    push_assignments(&mut query, &keys);
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE ");
    push_match_clause(&mut query, &id_name, &Value::String(row_id.to_string()));
    for (key, value) in expected {
        query.push(" AND ");
        push_match_clause(&mut query, validate_identifier(key)?, value);
    }
    query.push(" RETURNING row_to_json(t) AS row");
    Ok(query)
}

fn sorted_keys(payload: &Map<String, Value>) -> Result<Vec<String>, AppError> {
    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }
    Ok(keys)
}

fn push_assignments(query: &mut QueryBuilder<Postgres>, keys: &[String]) {
    let mut separated = query.separated(", ");
    for key in keys {
        separated.push(key.clone());
        separated.push_unseparated(" = r.");
        separated.push_unseparated(key.clone());
    }
}

/// Append `t.<column> <op> <value>`, binding with the column's natural type.
fn push_match_clause(query: &mut QueryBuilder<Postgres>, column: &str, value: &Value) {
    query.push("t.").push(column.to_string());
    match value {
        Value::Null => {
            query.push(" IS NULL");
        }
        Value::Array(items) => {
            let texts = items.iter().map(render_scalar).collect::<Vec<_>>();
            query.push("::text = ANY(").push_bind(texts).push(")");
        }
        Value::Bool(flag) => {
            query.push(" = ").push_bind(*flag);
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_identifier(column) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    query.push(" = ").push_bind(parsed);
                    return;
                }
            }
            if is_date_identifier(column) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    query.push(" = ").push_bind(parsed);
                    return;
                }
            }
            query.push("::text = ").push_bind(text.clone());
        }
        other => {
            query.push("::text = ").push_bind(render_scalar(other));
        }
    }
}

fn read_row(row: PgRow) -> Option<Value> {
    row.try_get::<Option<Value>, _>("row").ok().flatten()
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter().filter_map(read_row).collect()
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    let valid_chars = trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    });
    let starts_with_digit = trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_digit());
    if !valid_chars || starts_with_digit {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn is_uuid_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized == "id" || (normalized.ends_with("_id") && !normalized.starts_with("stripe_"))
}

fn is_date_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_date")
}

fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if let sqlx::Error::Database(db_error) = &error {
        if db_error.code().as_deref() == Some("23505") {
            return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
        }
    }
    AppError::Dependency("Database operation failed.".to_string())
}
