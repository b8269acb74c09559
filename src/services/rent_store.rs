use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{
        create_row, create_rows, delete_rows_where, find_row, list_rows, update_row_if, update_rows_where,
    },
    services::{
        audit::write_audit_log,
        rent_lifecycle::{
            BookingPaymentStatus, CollectionMethod, MandateStatus, TransactionStatus,
            TransactionType,
        },
    },
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    pub customer_id: String,
    #[serde(default)]
    pub room_id: Option<String>,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub rent_price: f64,
    #[serde(default)]
    pub deposit_amount: f64,
    pub payment_collection_method: CollectionMethod,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment_status: Option<BookingPaymentStatus>,
    #[serde(default)]
    pub stripe_payment_intent_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Booking {
    /// Version marker used to key processor idempotency.
    pub fn version(&self) -> &str {
        self.updated_at
            .as_deref()
            .or(self.created_at.as_deref())
            .unwrap_or("initial")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub stripe_customer_id: Option<String>,
    #[serde(default)]
    pub stripe_payment_method_id: Option<String>,
    #[serde(default)]
    pub stripe_mandate_status: Option<String>,
}

impl Customer {
    pub fn mandate_status(&self) -> MandateStatus {
        MandateStatus::parse(self.stripe_mandate_status.as_deref().unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentTransaction {
    pub id: String,
    pub booking_id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    pub due_date: NaiveDate,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub status: TransactionStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub stripe_payment_intent_id: Option<String>,
    #[serde(default)]
    pub stripe_invoice_id: Option<String>,
    #[serde(default)]
    pub paid_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl RentTransaction {
    pub fn version(&self) -> &str {
        self.updated_at
            .as_deref()
            .or(self.created_at.as_deref())
            .unwrap_or("initial")
    }
}

/// Processor-side reference used to find the transaction an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorRef {
    PaymentIntent(String),
    Invoice(String),
}

impl ProcessorRef {
    pub fn column(&self) -> &'static str {
        match self {
            Self::PaymentIntent(_) => "stripe_payment_intent_id",
            Self::Invoice(_) => "stripe_invoice_id",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::PaymentIntent(value) | Self::Invoice(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub actor_user_id: Option<String>,
    pub action: String,
    pub entity_name: &'static str,
    pub entity_id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Persistence seam of the rent lifecycle. Guarded updates take the column
/// values read before the decision and return `None` when another writer
/// got there first.
#[async_trait]
pub trait RentStore: Send + Sync {
    async fn booking(&self, booking_id: &str) -> AppResult<Option<Booking>>;
    async fn customer(&self, customer_id: &str) -> AppResult<Option<Customer>>;
    async fn transaction(&self, transaction_id: &str) -> AppResult<Option<RentTransaction>>;
    async fn booking_transactions(&self, booking_id: &str) -> AppResult<Vec<RentTransaction>>;
    async fn transaction_by_ref(&self, reference: &ProcessorRef)
        -> AppResult<Option<RentTransaction>>;

    async fn insert_booking(&self, record: &Map<String, Value>) -> AppResult<Booking>;
    async fn insert_transactions(
        &self,
        records: &[Map<String, Value>],
    ) -> AppResult<Vec<RentTransaction>>;

    async fn update_booking(
        &self,
        booking_id: &str,
        expected: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) -> AppResult<Option<Booking>>;
    async fn update_transaction(
        &self,
        transaction_id: &str,
        expected: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) -> AppResult<Option<RentTransaction>>;
    async fn update_mandate_status(
        &self,
        stripe_payment_method_id: &str,
        status: &MandateStatus,
    ) -> AppResult<u64>;

    /// Remember a processor event id. `false` when it was already recorded.
    async fn record_processed_event(&self, event_id: &str, event_type: &str) -> AppResult<bool>;

    /// Forget a recorded event so a processor retry is handled again.
    async fn release_processed_event(&self, event_id: &str) -> AppResult<()>;

    /// Best-effort; never fails the caller.
    async fn audit(&self, entry: AuditEntry);
}

#[derive(Clone)]
pub struct PgRentStore {
    pool: PgPool,
}

impl PgRentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RentStore for PgRentStore {
    async fn booking(&self, booking_id: &str) -> AppResult<Option<Booking>> {
        find_typed(&self.pool, "bookings", booking_id, "id").await
    }

    async fn customer(&self, customer_id: &str) -> AppResult<Option<Customer>> {
        find_typed(&self.pool, "customers", customer_id, "id").await
    }

    async fn transaction(&self, transaction_id: &str) -> AppResult<Option<RentTransaction>> {
        find_typed(&self.pool, "rent_transactions", transaction_id, "id").await
    }

    async fn booking_transactions(&self, booking_id: &str) -> AppResult<Vec<RentTransaction>> {
        let mut filters = Map::new();
        filters.insert(
            "booking_id".to_string(),
            Value::String(booking_id.to_string()),
        );
        let rows = list_rows(
            &self.pool,
            "rent_transactions",
            Some(&filters),
            1000,
            "due_date",
            true,
        )
        .await?;
        rows.into_iter().map(decode_row).collect()
    }

    async fn transaction_by_ref(
        &self,
        reference: &ProcessorRef,
    ) -> AppResult<Option<RentTransaction>> {
        find_typed(
            &self.pool,
            "rent_transactions",
            reference.value(),
            reference.column(),
        )
        .await
    }

    async fn insert_booking(&self, record: &Map<String, Value>) -> AppResult<Booking> {
        decode_row(create_row(&self.pool, "bookings", record).await?)
    }

    async fn insert_transactions(
        &self,
        records: &[Map<String, Value>],
    ) -> AppResult<Vec<RentTransaction>> {
        let rows = create_rows(&self.pool, "rent_transactions", records).await?;
        rows.into_iter().map(decode_row).collect()
    }

    async fn update_booking(
        &self,
        booking_id: &str,
        expected: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) -> AppResult<Option<Booking>> {
        let patch = with_updated_at(patch);
        update_row_if(&self.pool, "bookings", booking_id, "id", expected, &patch)
            .await?
            .map(decode_row)
            .transpose()
    }

    async fn update_transaction(
        &self,
        transaction_id: &str,
        expected: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) -> AppResult<Option<RentTransaction>> {
        let patch = with_updated_at(patch);
        update_row_if(
            &self.pool,
            "rent_transactions",
            transaction_id,
            "id",
            expected,
            &patch,
        )
        .await?
        .map(decode_row)
        .transpose()
    }

    async fn update_mandate_status(
        &self,
        stripe_payment_method_id: &str,
        status: &MandateStatus,
    ) -> AppResult<u64> {
        let mut filters = Map::new();
        filters.insert(
            "stripe_payment_method_id".to_string(),
            Value::String(stripe_payment_method_id.to_string()),
        );
        let mut patch = Map::new();
        patch.insert(
            "stripe_mandate_status".to_string(),
            Value::String(status.as_str().to_string()),
        );
        update_rows_where(&self.pool, "customers", &filters, &patch).await
    }

    async fn record_processed_event(&self, event_id: &str, event_type: &str) -> AppResult<bool> {
        let mut record = Map::new();
        record.insert(
            "stripe_event_id".to_string(),
            Value::String(event_id.to_string()),
        );
        record.insert(
            "stripe_event_type".to_string(),
            Value::String(event_type.to_string()),
        );
        match create_row(&self.pool, "processed_stripe_events", &record).await {
            Ok(_) => Ok(true),
            Err(AppError::Conflict(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn release_processed_event(&self, event_id: &str) -> AppResult<()> {
        delete_rows_where(
            &self.pool,
            "processed_stripe_events",
            "stripe_event_id",
            event_id,
        )
        .await
        .map(|_| ())
    }

    async fn audit(&self, entry: AuditEntry) {
        write_audit_log(Some(&self.pool), entry).await;
    }
}

async fn find_typed<T: DeserializeOwned>(
    pool: &PgPool,
    table: &str,
    value: &str,
    column: &str,
) -> AppResult<Option<T>> {
    find_row(pool, table, value, column)
        .await?
        .map(decode_row)
        .transpose()
}

pub fn decode_row<T: DeserializeOwned>(row: Value) -> AppResult<T> {
    serde_json::from_value(row).map_err(|error| {
        tracing::error!(error = %error, "Stored row does not match the expected shape");
        AppError::Internal("Stored record has an unexpected shape.".to_string())
    })
}

fn with_updated_at(patch: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = patch.clone();
    patch
        .entry("updated_at".to_string())
        .or_insert_with(|| json!(chrono::Utc::now().to_rfc3339()));
    patch
}
