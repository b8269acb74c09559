use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    services::{
        charges::{
            audit_booking, audit_transaction, booking_charge_rows, log_transition, status_guard,
            status_patch,
        },
        rent_lifecycle::{
            booking_status_after, next_state, BookingPaymentStatus, LifecycleAction,
            MandateStatus, ProcessorOutcome, TransactionStatus,
        },
        rent_store::{Booking, ProcessorRef, RentStore, RentTransaction},
    },
};

/// What a webhook delivery did, echoed back to the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Applied,
    Ignored(&'static str),
    Duplicate,
}

impl Reconciliation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Ignored(_) => "ignored",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Apply one verified processor event. Each event id is handled once;
/// a failed attempt releases the id so the processor's retry is handled.
pub async fn reconcile_event(store: &dyn RentStore, event: &Value) -> AppResult<Value> {
    let event_id = text(event, "id")
        .ok_or_else(|| AppError::BadRequest("Stripe event is missing its id.".to_string()))?;
    let event_type = text(event, "type").unwrap_or_default();
    let object = event
        .get("data")
        .and_then(|data| data.get("object"))
        .cloned()
        .unwrap_or(Value::Null);

    let outcome = if store.record_processed_event(&event_id, &event_type).await? {
        match dispatch(store, &event_type, &object).await {
            Ok(outcome) => outcome,
            Err(error) => {
                if let Err(release_error) = store.release_processed_event(&event_id).await {
                    tracing::error!(event_id = %event_id, error = %release_error, "Could not release failed Stripe event");
                }
                return Err(error);
            }
        }
    } else {
        Reconciliation::Duplicate
    };

    tracing::info!(
        event_id = %event_id,
        event_type = %event_type,
        outcome = outcome.as_str(),
        "Handled Stripe event"
    );

    let mut body = json!({
        "received": true,
        "event_id": event_id,
        "event_type": event_type,
        "outcome": outcome.as_str(),
    });
    if let (Reconciliation::Ignored(reason), Value::Object(map)) = (&outcome, &mut body) {
        map.insert("reason".to_string(), Value::String((*reason).to_string()));
    }
    Ok(body)
}

async fn dispatch(
    store: &dyn RentStore,
    event_type: &str,
    object: &Value,
) -> AppResult<Reconciliation> {
    match event_type {
        "payment_intent.processing" => {
            payment_intent_event(store, object, ProcessorOutcome::Processing).await
        }
        "payment_intent.succeeded" => {
            payment_intent_event(store, object, ProcessorOutcome::Succeeded).await
        }
        "payment_intent.payment_failed" => {
            payment_intent_event(store, object, ProcessorOutcome::Failed).await
        }
        "invoice.paid" => invoice_event(store, object, ProcessorOutcome::Succeeded).await,
        "invoice.payment_failed" => invoice_event(store, object, ProcessorOutcome::Failed).await,
        "mandate.updated" => mandate_event(store, object).await,
        _ => Ok(Reconciliation::Ignored("unhandled event type")),
    }
}

async fn payment_intent_event(
    store: &dyn RentStore,
    object: &Value,
    outcome: ProcessorOutcome,
) -> AppResult<Reconciliation> {
    let Some(intent_id) = text(object, "id") else {
        return Ok(Reconciliation::Ignored("payment intent has no id"));
    };
    let transaction_id = metadata(object, "transaction_id");
    let booking_id = metadata(object, "booking_id");

    let transaction = match &transaction_id {
        Some(id) => store.transaction(id).await?,
        None if booking_id.is_none() => {
            store
                .transaction_by_ref(&ProcessorRef::PaymentIntent(intent_id.clone()))
                .await?
        }
        None => None,
    };

    if let Some(transaction) = transaction {
        return apply_to_transaction(store, &transaction, outcome, Some(&intent_id)).await;
    }
    if transaction_id.is_none() {
        if let Some(booking_id) = booking_id {
            return apply_to_booking(store, &booking_id, &intent_id, outcome).await;
        }
    }
    tracing::warn!(payment_intent_id = %intent_id, "No local record for Stripe payment intent");
    Ok(Reconciliation::Ignored("no matching booking or transaction"))
}

async fn invoice_event(
    store: &dyn RentStore,
    object: &Value,
    outcome: ProcessorOutcome,
) -> AppResult<Reconciliation> {
    let Some(invoice_id) = text(object, "id") else {
        return Ok(Reconciliation::Ignored("invoice has no id"));
    };

    let mut transaction = store
        .transaction_by_ref(&ProcessorRef::Invoice(invoice_id.clone()))
        .await?;
    if transaction.is_none() {
        if let Some(id) = metadata(object, "transaction_id") {
            transaction = store.transaction(&id).await?;
        }
    }
    let Some(transaction) = transaction else {
        tracing::warn!(stripe_invoice_id = %invoice_id, "No local transaction for Stripe invoice");
        return Ok(Reconciliation::Ignored("no matching transaction"));
    };

    let intent_id = text(object, "payment_intent");
    apply_to_transaction(store, &transaction, outcome, intent_id.as_deref()).await
}

async fn mandate_event(store: &dyn RentStore, object: &Value) -> AppResult<Reconciliation> {
    let Some(payment_method) = text(object, "payment_method") else {
        return Ok(Reconciliation::Ignored("mandate has no payment method"));
    };
    let status = MandateStatus::parse(&text(object, "status").unwrap_or_default());
    let updated = store.update_mandate_status(&payment_method, &status).await?;
    tracing::info!(
        payment_method = %payment_method,
        mandate_status = status.as_str(),
        customers = updated,
        "Updated customer mandate status"
    );
    Ok(Reconciliation::Applied)
}

async fn apply_to_transaction(
    store: &dyn RentStore,
    transaction: &RentTransaction,
    outcome: ProcessorOutcome,
    intent_id: Option<&str>,
) -> AppResult<Reconciliation> {
    if let (Some(stored), Some(incoming)) =
        (transaction.stripe_payment_intent_id.as_deref(), intent_id)
    {
        if stored != incoming {
            tracing::warn!(
                transaction_id = %transaction.id,
                stored_payment_intent_id = %stored,
                payment_intent_id = %incoming,
                "Ignoring event for a superseded payment intent"
            );
            return Ok(Reconciliation::Ignored("superseded payment intent"));
        }
    }

    advance_transaction(store, transaction, outcome, intent_id).await
}

/// Move a row to what the processor reports. A row that never started a
/// charge is moved to processing first, so no row carries a payment-intent
/// without having been processing.
async fn advance_transaction(
    store: &dyn RentStore,
    transaction: &RentTransaction,
    outcome: ProcessorOutcome,
    intent_id: Option<&str>,
) -> AppResult<Reconciliation> {
    let action = match outcome.transaction_action() {
        Some(action) => action,
        // A processing event only repairs a lost local write.
        None if transaction.status == TransactionStatus::Processing => {
            return Ok(Reconciliation::Ignored("already processing"));
        }
        None => LifecycleAction::StartCharge,
    };

    let mut current = transaction.clone();
    if action != LifecycleAction::StartCharge && current.status == TransactionStatus::Scheduled {
        let started =
            write_transition(store, transaction, LifecycleAction::StartCharge, intent_id).await?;
        current = match started {
            Ok(started) => started,
            Err(ignored) => return Ok(ignored),
        };
    }

    match write_transition(store, &current, action, intent_id).await? {
        Ok(_) => Ok(Reconciliation::Applied),
        Err(ignored) => Ok(ignored),
    }
}

/// Outer error: the store failed or lost the race. Inner error: the
/// transition does not apply and was logged.
async fn write_transition(
    store: &dyn RentStore,
    transaction: &RentTransaction,
    action: LifecycleAction,
    intent_id: Option<&str>,
) -> AppResult<Result<RentTransaction, Reconciliation>> {
    let next = match next_state(transaction.status, action) {
        Ok(next) => next,
        Err(rejection) => {
            tracing::warn!(
                transaction_id = %transaction.id,
                from = %transaction.status,
                action = action.as_str(),
                reason = %rejection,
                "Reconciliation hazard: processor outcome does not apply to the local state"
            );
            return Ok(Err(Reconciliation::Ignored("transition not allowed")));
        }
    };

    let mut patch = status_patch(next);
    if let Some(intent_id) = intent_id {
        patch.insert(
            "stripe_payment_intent_id".to_string(),
            Value::String(intent_id.to_string()),
        );
    }
    if next == TransactionStatus::Paid {
        patch.insert(
            "paid_at".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
    }

    let Some(updated) = store
        .update_transaction(&transaction.id, &status_guard(transaction.status), &patch)
        .await?
    else {
        return Err(AppError::Conflict(format!(
            "Transaction {} changed while the event was applied.",
            transaction.id
        )));
    };

    log_transition(transaction, updated.status);
    audit_transaction(store, None, "stripe_webhook", transaction, &updated).await;
    Ok(Ok(updated))
}

async fn apply_to_booking(
    store: &dyn RentStore,
    booking_id: &str,
    intent_id: &str,
    outcome: ProcessorOutcome,
) -> AppResult<Reconciliation> {
    let Some(booking) = store.booking(booking_id).await? else {
        tracing::warn!(booking_id = %booking_id, payment_intent_id = %intent_id, "Stripe event names an unknown booking");
        return Ok(Reconciliation::Ignored("no matching booking"));
    };

    if let Some(stored) = booking.stripe_payment_intent_id.as_deref() {
        if stored != intent_id {
            tracing::warn!(
                booking_id = %booking.id,
                stored_payment_intent_id = %stored,
                payment_intent_id = %intent_id,
                "Ignoring event for a superseded payment intent"
            );
            return Ok(Reconciliation::Ignored("superseded payment intent"));
        }
    }

    if booking.payment_status == Some(BookingPaymentStatus::PaidManual)
        || (booking.payment_status == Some(BookingPaymentStatus::PaidStripe)
            && outcome != ProcessorOutcome::Succeeded)
    {
        tracing::warn!(
            booking_id = %booking.id,
            payment_intent_id = %intent_id,
            "Reconciliation hazard: processor outcome for a settled booking"
        );
        return Ok(Reconciliation::Ignored("booking already settled"));
    }

    let booking_outcome = update_booking_status(store, &booking, intent_id, outcome).await?;

    let mut rows_applied = false;
    for row in booking_charge_rows(store, &booking).await? {
        let follows_intent = match row.stripe_payment_intent_id.as_deref() {
            Some(stored) => stored == intent_id || row.status == TransactionStatus::Failed,
            None => true,
        };
        if !follows_intent || row.status == TransactionStatus::Pending || row.status.is_terminal()
        {
            continue;
        }
        if advance_transaction(store, &row, outcome, Some(intent_id)).await?
            == Reconciliation::Applied
        {
            rows_applied = true;
        }
    }

    if rows_applied {
        return Ok(Reconciliation::Applied);
    }
    Ok(booking_outcome)
}

async fn update_booking_status(
    store: &dyn RentStore,
    booking: &Booking,
    intent_id: &str,
    outcome: ProcessorOutcome,
) -> AppResult<Reconciliation> {
    let Some(next) = booking_status_after(booking.payment_status, outcome) else {
        return Ok(Reconciliation::Ignored("booking already up to date"));
    };

    let mut expected = Map::new();
    expected.insert("payment_status".to_string(), json!(booking.payment_status));
    let mut patch = Map::new();
    patch.insert("payment_status".to_string(), json!(next));
    // Restores the intent id when the post-charge write was lost.
    patch.insert(
        "stripe_payment_intent_id".to_string(),
        Value::String(intent_id.to_string()),
    );

    let Some(updated) = store
        .update_booking(&booking.id, &expected, &patch)
        .await?
    else {
        return Err(AppError::Conflict(format!(
            "Booking {} changed while the event was applied.",
            booking.id
        )));
    };

    tracing::info!(
        booking_id = %booking.id,
        payment_intent_id = %intent_id,
        from = booking.payment_status.map(|status| status.as_str()).unwrap_or("null"),
        to = next.as_str(),
        "Booking payment status reconciled"
    );
    audit_booking(store, None, "stripe_webhook", booking, &updated).await;
    Ok(Reconciliation::Applied)
}

fn metadata(object: &Value, key: &str) -> Option<String> {
    object.get("metadata").and_then(|meta| text(meta, key))
}

fn text(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::reconcile_event;
    use crate::test_support::InMemoryStore;

    fn event(id: &str, kind: &str, object: Value) -> Value {
        json!({ "id": id, "type": kind, "data": { "object": object } })
    }

    fn store_with_booking(payment_status: Value, intent: Value) -> InMemoryStore {
        let store = InMemoryStore::new();
        store.seed_booking(json!({
            "id": "book-1",
            "customer_id": "cust-1",
            "start_date": "2026-01-15",
            "rent_price": 1000.0,
            "deposit_amount": 2000.0,
            "payment_collection_method": "automatic",
            "payment_status": payment_status,
            "stripe_payment_intent_id": intent,
        }));
        store
    }

    fn seed_transaction(store: &InMemoryStore, id: &str, status: &str, intent: Value) {
        store.seed_transaction(json!({
            "id": id,
            "booking_id": "book-1",
            "due_date": "2026-02-01",
            "amount": 1000.0,
            "type": "rent",
            "status": status,
            "stripe_payment_intent_id": intent,
            "stripe_invoice_id": "in_1",
        }));
    }

    #[tokio::test]
    async fn succeeded_intent_marks_booking_paid() {
        let store = store_with_booking(json!("processing_stripe"), json!("pi_1"));
        let body = reconcile_event(
            &store,
            &event(
                "evt_1",
                "payment_intent.succeeded",
                json!({"id": "pi_1", "metadata": {"booking_id": "book-1"}}),
            ),
        )
        .await
        .expect("handled");

        assert_eq!(body["outcome"], json!("applied"));
        assert_eq!(
            store.booking_row("book-1")["payment_status"],
            json!("paid_stripe")
        );
    }

    #[tokio::test]
    async fn event_restores_lost_intent_id() {
        let store = store_with_booking(Value::Null, Value::Null);
        reconcile_event(
            &store,
            &event(
                "evt_1",
                "payment_intent.processing",
                json!({"id": "pi_9", "metadata": {"booking_id": "book-1"}}),
            ),
        )
        .await
        .expect("handled");

        let row = store.booking_row("book-1");
        assert_eq!(row["payment_status"], json!("processing_stripe"));
        assert_eq!(row["stripe_payment_intent_id"], json!("pi_9"));
    }

    #[tokio::test]
    async fn manual_payment_is_never_overridden() {
        let store = store_with_booking(json!("paid_manual"), json!("pi_1"));
        let body = reconcile_event(
            &store,
            &event(
                "evt_1",
                "payment_intent.payment_failed",
                json!({"id": "pi_1", "metadata": {"booking_id": "book-1"}}),
            ),
        )
        .await
        .expect("handled");

        assert_eq!(body["outcome"], json!("ignored"));
        assert_eq!(
            store.booking_row("book-1")["payment_status"],
            json!("paid_manual")
        );
    }

    #[tokio::test]
    async fn duplicate_events_are_acknowledged_once() {
        let store = store_with_booking(json!("processing_stripe"), json!("pi_1"));
        let payload = event(
            "evt_1",
            "payment_intent.payment_failed",
            json!({"id": "pi_1", "metadata": {"booking_id": "book-1"}}),
        );

        reconcile_event(&store, &payload).await.expect("first");
        let writes = store.write_count();
        let body = reconcile_event(&store, &payload).await.expect("second");

        assert_eq!(body["outcome"], json!("duplicate"));
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn transaction_intent_settles_processing_row() {
        let store = store_with_booking(Value::Null, Value::Null);
        seed_transaction(&store, "tx-1", "processing", json!("pi_7"));

        reconcile_event(
            &store,
            &event(
                "evt_1",
                "payment_intent.succeeded",
                json!({"id": "pi_7", "metadata": {"transaction_id": "tx-1", "booking_id": "book-1"}}),
            ),
        )
        .await
        .expect("handled");

        let row = store.transaction_row("tx-1");
        assert_eq!(row["status"], json!("paid"));
        assert!(row["paid_at"].is_string());
        assert_eq!(store.booking_row("book-1")["payment_status"], Value::Null);
    }

    #[tokio::test]
    async fn outcome_after_manual_switch_is_logged_not_applied() {
        let store = store_with_booking(Value::Null, Value::Null);
        seed_transaction(&store, "tx-1", "pending", json!("pi_7"));

        let body = reconcile_event(
            &store,
            &event(
                "evt_1",
                "payment_intent.succeeded",
                json!({"id": "pi_7", "metadata": {"transaction_id": "tx-1"}}),
            ),
        )
        .await
        .expect("acknowledged");

        assert_eq!(body["outcome"], json!("ignored"));
        assert_eq!(store.transaction_row("tx-1")["status"], json!("pending"));
    }

    #[tokio::test]
    async fn invoice_events_resolve_by_invoice_id() {
        let store = store_with_booking(Value::Null, Value::Null);
        seed_transaction(&store, "tx-1", "scheduled", Value::Null);

        reconcile_event(
            &store,
            &event(
                "evt_1",
                "invoice.payment_failed",
                json!({"id": "in_1", "payment_intent": "pi_inv"}),
            ),
        )
        .await
        .expect("handled");

        let row = store.transaction_row("tx-1");
        assert_eq!(row["status"], json!("failed"));
        assert_eq!(row["stripe_payment_intent_id"], json!("pi_inv"));
        assert_eq!(store.status_history("tx-1"), vec!["processing", "failed"]);

        reconcile_event(
            &store,
            &event(
                "evt_2",
                "invoice.paid",
                json!({"id": "in_1", "payment_intent": "pi_inv"}),
            ),
        )
        .await
        .expect("handled");
        assert_eq!(store.transaction_row("tx-1")["status"], json!("paid"));
    }

    #[tokio::test]
    async fn outcome_for_a_scheduled_row_goes_through_processing() {
        let store = store_with_booking(Value::Null, Value::Null);
        seed_transaction(&store, "tx-1", "scheduled", Value::Null);

        let body = reconcile_event(
            &store,
            &event(
                "evt_1",
                "payment_intent.succeeded",
                json!({"id": "pi_5", "metadata": {"transaction_id": "tx-1", "booking_id": "book-1"}}),
            ),
        )
        .await
        .expect("handled");

        assert_eq!(body["outcome"], json!("applied"));
        let row = store.transaction_row("tx-1");
        assert_eq!(row["status"], json!("paid"));
        assert_eq!(row["stripe_payment_intent_id"], json!("pi_5"));
        assert_eq!(store.status_history("tx-1"), vec!["processing", "paid"]);
    }

    #[tokio::test]
    async fn booking_outcome_settles_its_deposit_and_first_rent() {
        let store = store_with_booking(json!("processing_stripe"), json!("pi_1"));
        for (id, due_date, kind, status, intent) in [
            ("tx-dep", "2026-01-15", "deposit", "processing", json!("pi_1")),
            ("tx-first", "2026-01-15", "rent", "processing", json!("pi_1")),
            ("tx-later", "2026-02-01", "rent", "scheduled", Value::Null),
        ] {
            store.seed_transaction(json!({
                "id": id,
                "booking_id": "book-1",
                "due_date": due_date,
                "amount": 1000.0,
                "type": kind,
                "status": status,
                "stripe_payment_intent_id": intent,
            }));
        }

        reconcile_event(
            &store,
            &event(
                "evt_1",
                "payment_intent.succeeded",
                json!({"id": "pi_1", "metadata": {"booking_id": "book-1"}}),
            ),
        )
        .await
        .expect("handled");

        assert_eq!(
            store.booking_row("book-1")["payment_status"],
            json!("paid_stripe")
        );
        assert_eq!(store.transaction_row("tx-dep")["status"], json!("paid"));
        assert_eq!(store.transaction_row("tx-first")["status"], json!("paid"));
        assert_eq!(store.transaction_row("tx-later")["status"], json!("scheduled"));
    }

    #[tokio::test]
    async fn booking_outcome_links_rows_whose_intent_write_was_lost() {
        let store = store_with_booking(Value::Null, Value::Null);
        store.seed_transaction(json!({
            "id": "tx-dep",
            "booking_id": "book-1",
            "due_date": "2026-01-15",
            "amount": 2000.0,
            "type": "deposit",
            "status": "scheduled",
        }));

        reconcile_event(
            &store,
            &event(
                "evt_1",
                "payment_intent.payment_failed",
                json!({"id": "pi_2", "metadata": {"booking_id": "book-1"}}),
            ),
        )
        .await
        .expect("handled");

        let row = store.transaction_row("tx-dep");
        assert_eq!(row["status"], json!("failed"));
        assert_eq!(row["stripe_payment_intent_id"], json!("pi_2"));
        assert_eq!(store.status_history("tx-dep"), vec!["processing", "failed"]);
    }

    #[tokio::test]
    async fn mandate_updates_reach_matching_customers() {
        let store = InMemoryStore::new();
        store.seed_customer(json!({
            "id": "cust-1",
            "stripe_payment_method_id": "pm_1",
            "stripe_mandate_status": "pending",
        }));

        reconcile_event(
            &store,
            &event(
                "evt_1",
                "mandate.updated",
                json!({"id": "mandate_1", "status": "active", "payment_method": "pm_1"}),
            ),
        )
        .await
        .expect("handled");

        assert_eq!(
            store.customer_row("cust-1")["stripe_mandate_status"],
            json!("active")
        );
    }

    #[tokio::test]
    async fn unknown_event_types_are_ignored() {
        let store = InMemoryStore::new();
        let body = reconcile_event(&store, &event("evt_1", "customer.created", json!({})))
            .await
            .expect("acknowledged");
        assert_eq!(body["outcome"], json!("ignored"));
        assert_eq!(body["reason"], json!("unhandled event type"));
    }
}
