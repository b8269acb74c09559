//! In-memory fakes for the rent store and the payment gateway.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    services::{
        rent_lifecycle::MandateStatus,
        rent_store::{
            decode_row, AuditEntry, Booking, Customer, ProcessorRef, RentStore, RentTransaction,
        },
        stripe::{
            GatewayError, IntentRequest, InvoiceRequest, PaymentGateway, PaymentIntent,
            ScheduledInvoice,
        },
    },
};

type Table = BTreeMap<String, Map<String, Value>>;

#[derive(Default)]
pub struct InMemoryStore {
    bookings: Mutex<Table>,
    customers: Mutex<Table>,
    transactions: Mutex<Table>,
    events: Mutex<HashSet<String>>,
    audits: Mutex<Vec<AuditEntry>>,
    clock: AtomicUsize,
    writes: AtomicUsize,
    fail_booking_updates: AtomicBool,
    fail_transaction_inserts: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_booking(&self, row: Value) {
        insert_seed(&self.bookings, row);
    }

    pub fn seed_customer(&self, row: Value) {
        insert_seed(&self.customers, row);
    }

    pub fn seed_transaction(&self, row: Value) {
        insert_seed(&self.transactions, row);
    }

    /// Stored rows come back as `Value` so missing columns index to null.
    pub fn booking_row(&self, id: &str) -> Value {
        read_row(&self.bookings, id)
    }

    pub fn transaction_row(&self, id: &str) -> Value {
        read_row(&self.transactions, id)
    }

    pub fn customer_row(&self, id: &str) -> Value {
        read_row(&self.customers, id)
    }

    pub fn transaction_rows(&self) -> Vec<Value> {
        lock(&self.transactions)
            .values()
            .cloned()
            .map(Value::Object)
            .collect()
    }

    pub fn booking_count(&self) -> usize {
        lock(&self.bookings).len()
    }

    /// Number of successful mutations, seeds excluded.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn audit_actions(&self) -> Vec<String> {
        lock(&self.audits)
            .iter()
            .map(|entry| entry.action.clone())
            .collect()
    }

    /// Statuses a row was written into, oldest first, read from its audit trail.
    pub fn status_history(&self, entity_id: &str) -> Vec<String> {
        lock(&self.audits)
            .iter()
            .filter(|entry| entry.entity_id == entity_id)
            .filter_map(|entry| entry.after.as_ref()?.get("status")?.as_str().map(str::to_owned))
            .collect()
    }

    pub fn fail_booking_updates(&self) {
        self.fail_booking_updates.store(true, Ordering::SeqCst);
    }

    pub fn fail_transaction_inserts(&self) {
        self.fail_transaction_inserts.store(true, Ordering::SeqCst);
    }

    fn tick(&self) -> String {
        let n = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        format!("2026-01-01T00:00:{n:02}+00:00")
    }

    fn guarded_update<T: DeserializeOwned>(
        &self,
        table: &Mutex<Table>,
        id: &str,
        expected: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) -> AppResult<Option<T>> {
        let mut rows = lock(table);
        let Some(row) = rows.get_mut(id) else {
            return Ok(None);
        };
        let matches = expected
            .iter()
            .all(|(key, value)| row.get(key).unwrap_or(&Value::Null) == value);
        if !matches {
            return Ok(None);
        }
        for (key, value) in patch {
            row.insert(key.clone(), value.clone());
        }
        row.insert("updated_at".to_string(), Value::String(self.tick()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        decode_row(Value::Object(row.clone())).map(Some)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_row(table: &Mutex<Table>, id: &str) -> Value {
    lock(table)
        .get(id)
        .cloned()
        .map_or(Value::Null, Value::Object)
}

fn insert_seed(table: &Mutex<Table>, row: Value) {
    let Value::Object(map) = row else {
        panic!("seed rows must be objects");
    };
    let id = map
        .get("id")
        .and_then(Value::as_str)
        .expect("seed rows need an id")
        .to_string();
    lock(table).insert(id, map);
}

fn find_typed<T: DeserializeOwned>(table: &Mutex<Table>, id: &str) -> AppResult<Option<T>> {
    lock(table)
        .get(id)
        .cloned()
        .map(|row| decode_row(Value::Object(row)))
        .transpose()
}

#[async_trait]
impl RentStore for InMemoryStore {
    async fn booking(&self, booking_id: &str) -> AppResult<Option<Booking>> {
        find_typed(&self.bookings, booking_id)
    }

    async fn customer(&self, customer_id: &str) -> AppResult<Option<Customer>> {
        find_typed(&self.customers, customer_id)
    }

    async fn transaction(&self, transaction_id: &str) -> AppResult<Option<RentTransaction>> {
        find_typed(&self.transactions, transaction_id)
    }

    async fn booking_transactions(&self, booking_id: &str) -> AppResult<Vec<RentTransaction>> {
        let rows: Vec<Map<String, Value>> = lock(&self.transactions)
            .values()
            .filter(|row| row.get("booking_id").and_then(Value::as_str) == Some(booking_id))
            .cloned()
            .collect();
        let mut transactions = rows
            .into_iter()
            .map(|row| decode_row::<RentTransaction>(Value::Object(row)))
            .collect::<AppResult<Vec<_>>>()?;
        transactions.sort_by(|a, b| a.due_date.cmp(&b.due_date));
        Ok(transactions)
    }

    async fn transaction_by_ref(
        &self,
        reference: &ProcessorRef,
    ) -> AppResult<Option<RentTransaction>> {
        let row = lock(&self.transactions)
            .values()
            .find(|row| {
                row.get(reference.column()).and_then(Value::as_str) == Some(reference.value())
            })
            .cloned();
        row.map(|row| decode_row(Value::Object(row))).transpose()
    }

    async fn insert_booking(&self, record: &Map<String, Value>) -> AppResult<Booking> {
        let mut row = record.clone();
        let id = format!("booking-{}", self.booking_count() + 1);
        row.entry("id".to_string())
            .or_insert_with(|| Value::String(id.clone()));
        row.insert("created_at".to_string(), Value::String(self.tick()));
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(&id)
            .to_string();
        lock(&self.bookings).insert(id, row.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        decode_row(Value::Object(row))
    }

    async fn insert_transactions(
        &self,
        records: &[Map<String, Value>],
    ) -> AppResult<Vec<RentTransaction>> {
        if self.fail_transaction_inserts.load(Ordering::SeqCst) {
            return Err(AppError::Dependency(
                "Database operation failed.".to_string(),
            ));
        }
        let mut created = Vec::with_capacity(records.len());
        let mut table = lock(&self.transactions);
        for record in records {
            let mut row = record.clone();
            let id = format!("tx-{}", table.len() + 1);
            row.insert("id".to_string(), Value::String(id.clone()));
            row.insert("created_at".to_string(), Value::String(self.tick()));
            table.insert(id, row.clone());
            created.push(decode_row(Value::Object(row))?);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn update_booking(
        &self,
        booking_id: &str,
        expected: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) -> AppResult<Option<Booking>> {
        if self.fail_booking_updates.load(Ordering::SeqCst) {
            return Err(AppError::Dependency(
                "Database operation failed.".to_string(),
            ));
        }
        self.guarded_update(&self.bookings, booking_id, expected, patch)
    }

    async fn update_transaction(
        &self,
        transaction_id: &str,
        expected: &Map<String, Value>,
        patch: &Map<String, Value>,
    ) -> AppResult<Option<RentTransaction>> {
        self.guarded_update(&self.transactions, transaction_id, expected, patch)
    }

    async fn update_mandate_status(
        &self,
        stripe_payment_method_id: &str,
        status: &MandateStatus,
    ) -> AppResult<u64> {
        let mut updated = 0;
        for row in lock(&self.customers).values_mut() {
            if row.get("stripe_payment_method_id").and_then(Value::as_str)
                == Some(stripe_payment_method_id)
            {
                row.insert("stripe_mandate_status".to_string(), json!(status.as_str()));
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn record_processed_event(&self, event_id: &str, _event_type: &str) -> AppResult<bool> {
        Ok(lock(&self.events).insert(event_id.to_string()))
    }

    async fn release_processed_event(&self, event_id: &str) -> AppResult<()> {
        lock(&self.events).remove(event_id);
        Ok(())
    }

    async fn audit(&self, entry: AuditEntry) {
        lock(&self.audits).push(entry);
    }
}

/// Gateway fake that records every request. Replays the same intent for a
/// repeated idempotency key, like the processor does.
#[derive(Default)]
pub struct RecordingGateway {
    intents: Mutex<Vec<IntentRequest>>,
    invoices: Mutex<Vec<InvoiceRequest>>,
    issued: Mutex<HashMap<String, String>>,
    fail_intents: AtomicBool,
    fail_invoices: AtomicBool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let gateway = Self::default();
        gateway.fail_intents.store(true, Ordering::SeqCst);
        gateway
    }

    pub fn fail_invoices(&self) {
        self.fail_invoices.store(true, Ordering::SeqCst);
    }

    pub fn intents(&self) -> Vec<IntentRequest> {
        lock(&self.intents).clone()
    }

    pub fn invoices(&self) -> Vec<InvoiceRequest> {
        lock(&self.invoices).clone()
    }
}

#[async_trait]
impl PaymentGateway for RecordingGateway {
    async fn create_off_session_intent(
        &self,
        request: &IntentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        lock(&self.intents).push(request.clone());
        if self.fail_intents.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 402,
                message: "The mandate was revoked.".to_string(),
            });
        }
        let mut issued = lock(&self.issued);
        let next = format!("pi_test_{}", issued.len() + 1);
        let id = issued
            .entry(request.idempotency_key.clone())
            .or_insert(next)
            .clone();
        Ok(PaymentIntent {
            id,
            status: "processing".to_string(),
        })
    }

    async fn schedule_invoice(
        &self,
        request: &InvoiceRequest,
    ) -> Result<ScheduledInvoice, GatewayError> {
        let mut invoices = lock(&self.invoices);
        invoices.push(request.clone());
        if self.fail_invoices.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection reset".to_string()));
        }
        Ok(ScheduledInvoice {
            id: format!("in_test_{}", invoices.len()),
        })
    }
}
