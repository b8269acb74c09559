use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    services::{
        rent_lifecycle::{
            amount_in_minor_units, booking_charge_amount, charge_idempotency_key,
            covered_by_booking_charge, ensure_booking_chargeable, ensure_customer_chargeable, ensure_positive_amount,
            next_state, BookingPaymentStatus, ChargeRejection, ChargeTarget, CollectionMethod,
            LifecycleAction, TransactionStatus, TransitionRejection,
        },
        rent_store::{AuditEntry, Booking, RentStore, RentTransaction},
        stripe::{IntentRequest, PaymentGateway},
    },
};

const NOT_ALLOWED: &str = "Action Not Allowed";

/// Charge a booking's first rent plus deposit as one off-session SEPA debit.
/// The deposit and first-rent rows follow the booking's payment-intent.
pub async fn initiate_booking_charge(
    store: &dyn RentStore,
    gateway: &dyn PaymentGateway,
    actor_user_id: Option<&str>,
    booking_id: &str,
) -> AppResult<Value> {
    let booking = store
        .booking(booking_id)
        .await?
        .ok_or(ChargeRejection::NotFound("Booking"))?;
    ensure_booking_chargeable(booking.payment_status)?;
    let amount = booking_charge_amount(booking.rent_price, booking.deposit_amount)?;
    let covered = booking_charge_rows(store, &booking).await?;
    if let Some(settled) = covered.iter().find(|row| row.status.is_terminal()) {
        return Err(ChargeRejection::AlreadyCollected(settled.id.clone()).into());
    }
    let target = load_charge_target(store, &booking.customer_id).await?;

    let request = IntentRequest {
        amount,
        customer_id: target.stripe_customer_id,
        payment_method_id: target.stripe_payment_method_id,
        description: format!("Booking {}: first rent and deposit", booking.id),
        metadata: vec![("booking_id", booking.id.clone())],
        idempotency_key: charge_idempotency_key("booking", &booking.id, booking.version()),
    };
    let expected = booking_guard(&booking);

    let intent = match gateway.create_off_session_intent(&request).await {
        Ok(intent) => intent,
        Err(error) => {
            tracing::warn!(booking_id = %booking.id, error = %error, "Booking charge failed at the processor");
            let mut patch = Map::new();
            patch.insert(
                "payment_status".to_string(),
                json!(BookingPaymentStatus::FailedStripe),
            );
            patch.insert("stripe_payment_intent_id".to_string(), Value::Null);
            match store.update_booking(&booking.id, &expected, &patch).await {
                Ok(Some(updated)) => {
                    audit_booking(store, actor_user_id, "charge_failed", &booking, &updated).await;
                }
                Ok(None) => {
                    tracing::warn!(booking_id = %booking.id, "Booking changed before the failure could be recorded");
                }
                Err(write_error) => {
                    tracing::error!(booking_id = %booking.id, error = %write_error, "Could not record failed booking charge");
                }
            }
            return Err(error.into());
        }
    };

    tracing::info!(
        booking_id = %booking.id,
        payment_intent_id = %intent.id,
        intent_status = %intent.status,
        amount,
        "Created booking payment intent"
    );

    let mut patch = Map::new();
    patch.insert(
        "stripe_payment_intent_id".to_string(),
        Value::String(intent.id.clone()),
    );
    patch.insert(
        "payment_status".to_string(),
        json!(BookingPaymentStatus::ProcessingStripe),
    );

    let persistence_error = |message: &str| {
        AppError::persistence(
            message,
            &[
                ("booking_id", Value::String(booking.id.clone())),
                ("stripe_payment_intent_id", Value::String(intent.id.clone())),
            ],
        )
    };

    let updated = match store.update_booking(&booking.id, &expected, &patch).await {
        Ok(Some(updated)) => updated,
        Ok(None) => {
            // A duplicate submission or the webhook may have recorded this
            // very intent already.
            match store.booking(&booking.id).await {
                Ok(Some(current))
                    if current.stripe_payment_intent_id.as_deref() == Some(intent.id.as_str()) =>
                {
                    current
                }
                _ => {
                    tracing::error!(booking_id = %booking.id, payment_intent_id = %intent.id, "Booking changed while the charge was created");
                    return Err(persistence_error(
                        "Payment was created but the booking changed concurrently. Reconcile manually.",
                    ));
                }
            }
        }
        Err(error) => {
            tracing::error!(booking_id = %booking.id, payment_intent_id = %intent.id, error = %error, "Could not store payment intent on booking");
            return Err(persistence_error(
                "Payment was created but the booking could not be updated. Reconcile manually.",
            ));
        }
    };

    audit_booking(store, actor_user_id, "charge_initiated", &booking, &updated).await;

    for row in &covered {
        if let Err(error) = attach_booking_intent(store, actor_user_id, row, &intent.id).await {
            tracing::error!(transaction_id = %row.id, payment_intent_id = %intent.id, error = %error, "Could not attach booking charge to transaction");
            return Err(persistence_error(
                "Payment was created but its transactions could not be updated. Reconcile manually.",
            ));
        }
    }

    Ok(json!({
        "success": true,
        "message": "SEPA charge initiated.",
        "booking_id": updated.id,
        "stripe_payment_intent_id": intent.id,
        "payment_status": BookingPaymentStatus::ProcessingStripe,
    }))
}

/// Charge (or retry) a single scheduled or failed transaction.
pub async fn charge_transaction(
    store: &dyn RentStore,
    gateway: &dyn PaymentGateway,
    actor_user_id: Option<&str>,
    transaction_id: &str,
) -> AppResult<Value> {
    let transaction = load_transaction(store, transaction_id).await?;
    let processing = next_state(transaction.status, LifecycleAction::StartCharge)
        .map_err(ChargeRejection::from)?;
    let amount = ensure_positive_amount(amount_in_minor_units(transaction.amount))?;

    let booking = store
        .booking(&transaction.booking_id)
        .await?
        .ok_or(ChargeRejection::NotFound("Booking"))?;
    if covered_by_booking_charge(booking.start_date, transaction.due_date) {
        return Err(ChargeRejection::CoveredByBookingCharge.into());
    }
    let customer_id = transaction
        .customer_id
        .as_deref()
        .unwrap_or(&booking.customer_id);
    let target = load_charge_target(store, customer_id).await?;

    let request = IntentRequest {
        amount,
        customer_id: target.stripe_customer_id,
        payment_method_id: target.stripe_payment_method_id,
        description: transaction
            .description
            .clone()
            .unwrap_or_else(|| format!("Booking {} {}", booking.id, transaction.kind.as_str())),
        metadata: vec![
            ("transaction_id", transaction.id.clone()),
            ("booking_id", booking.id.clone()),
        ],
        idempotency_key: charge_idempotency_key(
            "transaction",
            &transaction.id,
            transaction.version(),
        ),
    };
    let expected = status_guard(transaction.status);

    let intent = match gateway.create_off_session_intent(&request).await {
        Ok(intent) => intent,
        Err(error) => {
            tracing::warn!(transaction_id = %transaction.id, error = %error, "Transaction charge failed at the processor");
            // The attempt counts as started, so the row lands on failed.
            if let Ok(failed) = next_state(processing, LifecycleAction::Decline) {
                let mut patch = status_patch(failed);
                patch.insert("stripe_payment_intent_id".to_string(), Value::Null);
                match store
                    .update_transaction(&transaction.id, &expected, &patch)
                    .await
                {
                    Ok(Some(updated)) => {
                        audit_transaction(store, actor_user_id, "charge_failed", &transaction, &updated)
                            .await;
                    }
                    Ok(None) => {
                        tracing::warn!(transaction_id = %transaction.id, "Transaction changed before the failure could be recorded");
                    }
                    Err(write_error) => {
                        tracing::error!(transaction_id = %transaction.id, error = %write_error, "Could not record failed transaction charge");
                    }
                }
            }
            return Err(error.into());
        }
    };

    let mut patch = status_patch(processing);
    patch.insert(
        "stripe_payment_intent_id".to_string(),
        Value::String(intent.id.clone()),
    );

    let persistence_error = |message: &str| {
        AppError::persistence(
            message,
            &[
                ("transaction_id", Value::String(transaction.id.clone())),
                ("stripe_payment_intent_id", Value::String(intent.id.clone())),
            ],
        )
    };

    let updated = match store
        .update_transaction(&transaction.id, &expected, &patch)
        .await
    {
        Ok(Some(updated)) => updated,
        Ok(None) => match store.transaction(&transaction.id).await {
            Ok(Some(current))
                if current.stripe_payment_intent_id.as_deref() == Some(intent.id.as_str()) =>
            {
                current
            }
            _ => {
                tracing::error!(transaction_id = %transaction.id, payment_intent_id = %intent.id, "Transaction changed while the charge was created");
                return Err(persistence_error(
                    "Payment was created but the transaction changed concurrently. Reconcile manually.",
                ));
            }
        },
        Err(error) => {
            tracing::error!(transaction_id = %transaction.id, payment_intent_id = %intent.id, error = %error, "Could not store payment intent on transaction");
            return Err(persistence_error(
                "Payment was created but the transaction could not be updated. Reconcile manually.",
            ));
        }
    };

    tracing::info!(
        transaction_id = %transaction.id,
        payment_intent_id = %intent.id,
        intent_status = %intent.status,
        amount,
        "Created transaction payment intent"
    );
    log_transition(&transaction, updated.status);
    audit_transaction(store, actor_user_id, "charge_initiated", &transaction, &updated).await;

    Ok(json!({
        "success": true,
        "message": "SEPA charge initiated.",
        "transaction_id": updated.id,
        "booking_id": updated.booking_id,
        "stripe_payment_intent_id": intent.id,
        "status": updated.status,
    }))
}

pub async fn mark_transaction_paid_manually(
    store: &dyn RentStore,
    actor_user_id: Option<&str>,
    transaction_id: &str,
    note: Option<&str>,
) -> AppResult<Value> {
    let transaction = load_transaction(store, transaction_id).await?;
    let paid = next_state(transaction.status, LifecycleAction::MarkPaidManually)?;

    let mut patch = status_patch(paid);
    patch.insert(
        "paid_at".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );

    let updated = store
        .update_transaction(&transaction.id, &status_guard(transaction.status), &patch)
        .await?
        .ok_or_else(concurrent_change)?;

    log_transition(&transaction, updated.status);
    let mut after = serde_json::to_value(&updated).ok();
    if let (Some(Value::Object(map)), Some(note)) = (after.as_mut(), note) {
        map.insert("note".to_string(), Value::String(note.to_string()));
    }
    store
        .audit(AuditEntry {
            actor_user_id: actor_user_id.map(ToOwned::to_owned),
            action: "mark_paid_manually".to_string(),
            entity_name: "rent_transactions",
            entity_id: transaction.id.clone(),
            before: serde_json::to_value(&transaction).ok(),
            after,
        })
        .await;

    Ok(json!({
        "success": true,
        "message": "Transaction marked as paid manually.",
        "transaction": updated,
    }))
}

/// Disallowed switches are answered with `success: false` rather than an
/// error status.
pub async fn switch_transaction_to_manual(
    store: &dyn RentStore,
    actor_user_id: Option<&str>,
    transaction_id: &str,
) -> AppResult<Value> {
    let transaction = load_transaction(store, transaction_id).await?;

    match apply_manual_switch(store, actor_user_id, &transaction).await? {
        Ok(updated) => Ok(json!({
            "success": true,
            "message": "Transaction switched to manual collection.",
            "transaction": updated,
        })),
        Err(rejection) => Ok(json!({
            "success": false,
            "message": NOT_ALLOWED,
            "reason": rejection.to_string(),
            "transaction_id": transaction.id,
            "status": transaction.status,
        })),
    }
}

/// Move a whole booking to manual collection: the booking's method and
/// every transaction that is still collected automatically.
pub async fn switch_booking_to_manual(
    store: &dyn RentStore,
    actor_user_id: Option<&str>,
    booking_id: &str,
) -> AppResult<Value> {
    let booking = store
        .booking(booking_id)
        .await?
        .ok_or(ChargeRejection::NotFound("Booking"))?;

    if let Some(status) = booking.payment_status.filter(|status| status.is_settled()) {
        return Ok(json!({
            "success": false,
            "message": NOT_ALLOWED,
            "reason": format!("Booking payment is already {}.", status.as_str()),
            "booking_id": booking.id,
        }));
    }

    let mut patch = Map::new();
    patch.insert(
        "payment_collection_method".to_string(),
        json!(CollectionMethod::Manual),
    );
    if booking.payment_status.is_some() {
        patch.insert("payment_status".to_string(), Value::Null);
    }
    let mut expected = booking_guard(&booking);
    expected.insert(
        "payment_collection_method".to_string(),
        json!(booking.payment_collection_method),
    );
    let updated = store
        .update_booking(&booking.id, &expected, &patch)
        .await?
        .ok_or_else(concurrent_change)?;
    audit_booking(store, actor_user_id, "switch_to_manual", &booking, &updated).await;

    let mut switched = 0usize;
    let mut skipped = 0usize;
    for transaction in store.booking_transactions(&booking.id).await? {
        match apply_manual_switch(store, actor_user_id, &transaction).await {
            Ok(Ok(_)) => switched += 1,
            Ok(Err(_)) => skipped += 1,
            Err(error) => {
                tracing::warn!(transaction_id = %transaction.id, error = %error, "Could not switch transaction to manual");
                skipped += 1;
            }
        }
    }

    tracing::info!(booking_id = %booking.id, switched, skipped, "Switched booking to manual collection");

    Ok(json!({
        "success": true,
        "message": "Booking switched to manual collection.",
        "booking_id": booking.id,
        "switched": switched,
        "skipped": skipped,
    }))
}

/// Outer error: the store failed. Inner error: the transition is not allowed.
async fn apply_manual_switch(
    store: &dyn RentStore,
    actor_user_id: Option<&str>,
    transaction: &RentTransaction,
) -> AppResult<Result<RentTransaction, TransitionRejection>> {
    let pending = match next_state(transaction.status, LifecycleAction::SwitchToManual) {
        Ok(pending) => pending,
        Err(rejection) => return Ok(Err(rejection)),
    };

    if transaction.status == TransactionStatus::Processing {
        tracing::warn!(
            transaction_id = %transaction.id,
            payment_intent_id = transaction.stripe_payment_intent_id.as_deref().unwrap_or_default(),
            "Switching an in-flight charge to manual; the processor may still settle it"
        );
    }

    let updated = store
        .update_transaction(
            &transaction.id,
            &status_guard(transaction.status),
            &status_patch(pending),
        )
        .await?
        .ok_or_else(concurrent_change)?;

    log_transition(transaction, updated.status);
    audit_transaction(store, actor_user_id, "switch_to_manual", transaction, &updated).await;
    Ok(Ok(updated))
}

/// Rows collected by the booking-level charge rather than on their own.
pub(crate) async fn booking_charge_rows(
    store: &dyn RentStore,
    booking: &Booking,
) -> AppResult<Vec<RentTransaction>> {
    Ok(store
        .booking_transactions(&booking.id)
        .await?
        .into_iter()
        .filter(|row| covered_by_booking_charge(booking.start_date, row.due_date))
        .collect())
}

/// Start the charge on a covered row under the booking's payment-intent.
/// Manual rows are left to the operator.
async fn attach_booking_intent(
    store: &dyn RentStore,
    actor_user_id: Option<&str>,
    row: &RentTransaction,
    intent_id: &str,
) -> AppResult<()> {
    let processing = match next_state(row.status, LifecycleAction::StartCharge) {
        Ok(processing) => processing,
        Err(rejection) => {
            tracing::warn!(transaction_id = %row.id, reason = %rejection, "Booking charge covers a row that cannot start a charge");
            return Ok(());
        }
    };
    let mut patch = status_patch(processing);
    patch.insert(
        "stripe_payment_intent_id".to_string(),
        Value::String(intent_id.to_string()),
    );
    let updated = store
        .update_transaction(&row.id, &status_guard(row.status), &patch)
        .await?
        .ok_or_else(concurrent_change)?;
    log_transition(row, updated.status);
    audit_transaction(store, actor_user_id, "charge_initiated", row, &updated).await;
    Ok(())
}

pub(crate) async fn load_charge_target(
    store: &dyn RentStore,
    customer_id: &str,
) -> AppResult<ChargeTarget> {
    let customer = store
        .customer(customer_id)
        .await?
        .ok_or(ChargeRejection::NotFound("Customer"))?;
    Ok(ensure_customer_chargeable(
        &customer.mandate_status(),
        customer.stripe_customer_id.as_deref(),
        customer.stripe_payment_method_id.as_deref(),
    )?)
}

async fn load_transaction(store: &dyn RentStore, transaction_id: &str) -> AppResult<RentTransaction> {
    Ok(store
        .transaction(transaction_id)
        .await?
        .ok_or(ChargeRejection::NotFound("Transaction"))?)
}

fn booking_guard(booking: &Booking) -> Map<String, Value> {
    let mut expected = Map::new();
    expected.insert("payment_status".to_string(), json!(booking.payment_status));
    expected
}

pub(crate) fn status_guard(status: TransactionStatus) -> Map<String, Value> {
    let mut expected = Map::new();
    expected.insert("status".to_string(), json!(status));
    expected
}

pub(crate) fn status_patch(status: TransactionStatus) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert("status".to_string(), json!(status));
    patch
}

fn concurrent_change() -> AppError {
    AppError::Conflict("Record changed concurrently; reload and retry.".to_string())
}

pub(crate) fn log_transition(before: &RentTransaction, to: TransactionStatus) {
    tracing::info!(
        transaction_id = %before.id,
        booking_id = %before.booking_id,
        from = %before.status,
        to = %to,
        "Rent transaction transition"
    );
}

pub(crate) async fn audit_transaction(
    store: &dyn RentStore,
    actor_user_id: Option<&str>,
    action: &str,
    before: &RentTransaction,
    after: &RentTransaction,
) {
    store
        .audit(AuditEntry {
            actor_user_id: actor_user_id.map(ToOwned::to_owned),
            action: action.to_string(),
            entity_name: "rent_transactions",
            entity_id: before.id.clone(),
            before: serde_json::to_value(before).ok(),
            after: serde_json::to_value(after).ok(),
        })
        .await;
}

pub(crate) async fn audit_booking(
    store: &dyn RentStore,
    actor_user_id: Option<&str>,
    action: &str,
    before: &Booking,
    after: &Booking,
) {
    store
        .audit(AuditEntry {
            actor_user_id: actor_user_id.map(ToOwned::to_owned),
            action: action.to_string(),
            entity_name: "bookings",
            entity_id: before.id.clone(),
            before: serde_json::to_value(before).ok(),
            after: serde_json::to_value(after).ok(),
        })
        .await;
}
