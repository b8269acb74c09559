use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::{repository::table_service::create_row, services::rent_store::AuditEntry};

/// Append an audit row. Failures are logged and swallowed so a lost audit
/// entry never fails the business operation that produced it.
pub async fn write_audit_log(pool: Option<&PgPool>, entry: AuditEntry) {
    let Some(pool) = pool else {
        return;
    };

    let record = audit_record(entry);
    if let Err(error) = create_row(pool, "audit_logs", &record).await {
        tracing::warn!(error = %error, "Could not write audit log");
    }
}

fn audit_record(entry: AuditEntry) -> Map<String, Value> {
    let mut record = Map::new();
    if let Some(actor) = entry.actor_user_id {
        record.insert("actor_user_id".to_string(), Value::String(actor));
    }
    record.insert("action".to_string(), Value::String(entry.action));
    record.insert(
        "entity_name".to_string(),
        Value::String(entry.entity_name.to_string()),
    );
    record.insert("entity_id".to_string(), Value::String(entry.entity_id));
    if let Some(before) = entry.before {
        record.insert("before_state".to_string(), before);
    }
    if let Some(after) = entry.after {
        record.insert("after_state".to_string(), after);
    }
    record
}
