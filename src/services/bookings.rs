use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    services::{
        charges::load_charge_target,
        payment_timeline::{compute_payment_timeline, end_date, FirstMonthCalculation, TimelineInput},
        rent_lifecycle::{
            amount_in_minor_units, charge_idempotency_key, initial_status, ChargeRejection,
            CollectionMethod, TransactionStatus,
        },
        rent_store::{AuditEntry, RentStore},
        stripe::{InvoiceRequest, PaymentGateway},
    },
};

#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub customer_id: String,
    pub room_id: Option<String>,
    pub start_date: NaiveDate,
    pub duration_months: u32,
    pub rent_price: f64,
    pub deposit_months: f64,
    pub first_month: FirstMonthCalculation,
    pub collection_method: CollectionMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    pub min_booking_months: u32,
    pub invoice_scheduling_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvoiceScheduleReport {
    pub scheduled: Vec<ScheduledTransaction>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTransaction {
    pub transaction_id: String,
    pub due_date: NaiveDate,
    pub stripe_invoice_id: String,
}

/// Insert a booking and its payment schedule. Invoice scheduling for
/// automatic collection is best-effort and surfaces as `warnings`.
pub async fn create_booking(
    store: &dyn RentStore,
    gateway: &dyn PaymentGateway,
    policy: BookingPolicy,
    actor_user_id: Option<&str>,
    input: NewBooking,
    today: NaiveDate,
) -> AppResult<Value> {
    if input.duration_months < policy.min_booking_months {
        return Err(AppError::BadRequest(format!(
            "Bookings must last at least {} months.",
            policy.min_booking_months
        )));
    }
    if !input.rent_price.is_finite() || input.rent_price <= 0.0 {
        return Err(AppError::BadRequest(
            "rent_price must be greater than zero.".to_string(),
        ));
    }
    if !input.deposit_months.is_finite() || input.deposit_months < 0.0 {
        return Err(AppError::BadRequest(
            "deposit_months cannot be negative.".to_string(),
        ));
    }
    let end = end_date(input.start_date, input.duration_months)
        .ok_or_else(|| AppError::BadRequest("Booking end date is out of range.".to_string()))?;

    store
        .customer(&input.customer_id)
        .await?
        .ok_or(ChargeRejection::NotFound("Customer"))?;

    let timeline = compute_payment_timeline(&TimelineInput {
        start_date: input.start_date,
        duration_months: input.duration_months,
        monthly_rent: input.rent_price,
        deposit_months: input.deposit_months,
        first_month: input.first_month,
    });
    let deposit_amount = (input.rent_price * input.deposit_months * 100.0).round() / 100.0;

    let mut record = Map::new();
    record.insert(
        "customer_id".to_string(),
        Value::String(input.customer_id.clone()),
    );
    if let Some(room_id) = &input.room_id {
        record.insert("room_id".to_string(), Value::String(room_id.clone()));
    }
    record.insert("start_date".to_string(), json!(input.start_date));
    record.insert("end_date".to_string(), json!(end));
    record.insert("rent_price".to_string(), json!(input.rent_price));
    record.insert("deposit_amount".to_string(), json!(deposit_amount));
    record.insert(
        "payment_collection_method".to_string(),
        json!(input.collection_method),
    );
    record.insert(
        "first_month_calculation".to_string(),
        json!(input.first_month),
    );
    record.insert("status".to_string(), Value::String("active".to_string()));

    let booking = store.insert_booking(&record).await?;
    tracing::info!(
        booking_id = %booking.id,
        entries = timeline.len(),
        collection_method = input.collection_method.as_str(),
        "Created booking"
    );

    store
        .audit(AuditEntry {
            actor_user_id: actor_user_id.map(ToOwned::to_owned),
            action: "create".to_string(),
            entity_name: "bookings",
            entity_id: booking.id.clone(),
            before: None,
            after: serde_json::to_value(&booking).ok(),
        })
        .await;

    let status = initial_status(input.collection_method);
    let rows: Vec<Map<String, Value>> = timeline
        .iter()
        .map(|entry| {
            let mut row = Map::new();
            row.insert("booking_id".to_string(), Value::String(booking.id.clone()));
            row.insert(
                "customer_id".to_string(),
                Value::String(input.customer_id.clone()),
            );
            if let Some(room_id) = &input.room_id {
                row.insert("room_id".to_string(), Value::String(room_id.clone()));
            }
            row.insert("due_date".to_string(), json!(entry.due_date));
            row.insert("amount".to_string(), json!(entry.amount));
            row.insert("type".to_string(), json!(entry.kind));
            row.insert("status".to_string(), json!(status));
            row.insert(
                "description".to_string(),
                Value::String(entry.description.clone()),
            );
            row
        })
        .collect();

    let transactions = match store.insert_transactions(&rows).await {
        Ok(transactions) => transactions,
        Err(error) => {
            // The booking row stays; the operator repairs the schedule by hand.
            tracing::error!(booking_id = %booking.id, error = %error, "Booking created without its payment schedule");
            return Err(AppError::persistence(
                "Booking was created but its payment schedule could not be stored.",
                &[("booking_id", Value::String(booking.id.clone()))],
            ));
        }
    };

    let mut warnings = Vec::new();
    if input.collection_method == CollectionMethod::Automatic {
        if policy.invoice_scheduling_enabled {
            match schedule_invoices(store, gateway, actor_user_id, &booking.id, today).await {
                Ok(report) => warnings.extend(report.warnings),
                Err(error) => {
                    tracing::warn!(booking_id = %booking.id, error = %error, "Invoice scheduling failed");
                    warnings.push(format!("Invoice scheduling failed: {error}"));
                }
            }
        } else {
            warnings.push("Invoice scheduling is disabled; schedule invoices manually.".to_string());
        }
    }

    Ok(json!({
        "success": true,
        "message": "Booking created.",
        "booking": booking,
        "transactions": transactions,
        "warnings": warnings,
    }))
}

/// Create one auto-charged processor invoice per future scheduled
/// transaction that has none yet. Per-transaction failures are warnings.
pub async fn schedule_invoices(
    store: &dyn RentStore,
    gateway: &dyn PaymentGateway,
    actor_user_id: Option<&str>,
    booking_id: &str,
    today: NaiveDate,
) -> AppResult<InvoiceScheduleReport> {
    let booking = store
        .booking(booking_id)
        .await?
        .ok_or(ChargeRejection::NotFound("Booking"))?;
    if booking.payment_collection_method == CollectionMethod::Manual {
        return Err(AppError::BadRequest(
            "Booking is collected manually; there is nothing to schedule.".to_string(),
        ));
    }
    let target = load_charge_target(store, &booking.customer_id).await?;

    let mut report = InvoiceScheduleReport::default();
    for transaction in store.booking_transactions(&booking.id).await? {
        // Deposit and first rent fall on the start date and are collected by
        // the booking-level charge.
        if transaction.status != TransactionStatus::Scheduled
            || transaction.due_date <= today.max(booking.start_date)
            || transaction.stripe_invoice_id.is_some()
        {
            continue;
        }

        let amount = amount_in_minor_units(transaction.amount);
        if amount <= 0 {
            report.warnings.push(format!(
                "Transaction {} has no amount to invoice.",
                transaction.id
            ));
            continue;
        }
        let Some(finalize_at) = transaction
            .due_date
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc().timestamp())
        else {
            continue;
        };

        let request = InvoiceRequest {
            amount,
            customer_id: target.stripe_customer_id.clone(),
            payment_method_id: target.stripe_payment_method_id.clone(),
            description: transaction
                .description
                .clone()
                .unwrap_or_else(|| format!("Rent due {}", transaction.due_date)),
            finalize_at,
            metadata: vec![
                ("transaction_id", transaction.id.clone()),
                ("booking_id", booking.id.clone()),
            ],
            idempotency_key: charge_idempotency_key(
                "invoice",
                &transaction.id,
                transaction.version(),
            ),
        };

        let invoice = match gateway.schedule_invoice(&request).await {
            Ok(invoice) => invoice,
            Err(error) => {
                tracing::warn!(transaction_id = %transaction.id, error = %error, "Could not schedule invoice");
                report.warnings.push(format!(
                    "Transaction {} ({}): {error}",
                    transaction.id, transaction.due_date
                ));
                continue;
            }
        };

        let mut expected = Map::new();
        expected.insert("status".to_string(), json!(TransactionStatus::Scheduled));
        expected.insert("stripe_invoice_id".to_string(), Value::Null);
        let mut patch = Map::new();
        patch.insert(
            "stripe_invoice_id".to_string(),
            Value::String(invoice.id.clone()),
        );

        match store
            .update_transaction(&transaction.id, &expected, &patch)
            .await
        {
            Ok(Some(_)) => report.scheduled.push(ScheduledTransaction {
                transaction_id: transaction.id.clone(),
                due_date: transaction.due_date,
                stripe_invoice_id: invoice.id,
            }),
            Ok(None) => report.warnings.push(format!(
                "Transaction {} changed while invoice {} was created.",
                transaction.id, invoice.id
            )),
            Err(error) => {
                tracing::error!(transaction_id = %transaction.id, stripe_invoice_id = %invoice.id, error = %error, "Could not store invoice id");
                report.warnings.push(format!(
                    "Invoice {} was created but transaction {} could not be updated.",
                    invoice.id, transaction.id
                ));
            }
        }
    }

    if !report.scheduled.is_empty() {
        store
            .audit(AuditEntry {
                actor_user_id: actor_user_id.map(ToOwned::to_owned),
                action: "schedule_invoices".to_string(),
                entity_name: "bookings",
                entity_id: booking.id.clone(),
                before: None,
                after: serde_json::to_value(&report).ok(),
            })
            .await;
    }
    tracing::info!(
        booking_id = %booking.id,
        scheduled = report.scheduled.len(),
        warnings = report.warnings.len(),
        "Scheduled booking invoices"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chrono::NaiveDate;
    use serde_json::{json, Value};

    use super::*;
    use crate::test_support::{InMemoryStore, RecordingGateway};

    const POLICY: BookingPolicy = BookingPolicy {
        min_booking_months: 3,
        invoice_scheduling_enabled: true,
    };

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    fn store_with_customer(mandate: &str) -> InMemoryStore {
        let store = InMemoryStore::new();
        store.seed_customer(json!({
            "id": "cust-1",
            "stripe_customer_id": "cus_1",
            "stripe_payment_method_id": "pm_1",
            "stripe_mandate_status": mandate,
        }));
        store
    }

    fn new_booking(method: CollectionMethod) -> NewBooking {
        NewBooking {
            customer_id: "cust-1".to_string(),
            room_id: Some("room-1".to_string()),
            start_date: date("2026-01-15"),
            duration_months: 3,
            rent_price: 930.0,
            deposit_months: 2.0,
            first_month: FirstMonthCalculation::Natural,
            collection_method: method,
        }
    }

    #[tokio::test]
    async fn manual_booking_creates_pending_schedule() {
        let store = store_with_customer("active");
        let gateway = RecordingGateway::new();

        let body = create_booking(
            &store,
            &gateway,
            POLICY,
            Some("op-1"),
            new_booking(CollectionMethod::Manual),
            date("2026-01-10"),
        )
        .await
        .expect("created");

        let transactions = body["transactions"].as_array().expect("array");
        assert_eq!(transactions.len(), 5);
        assert!(transactions
            .iter()
            .all(|row| row["status"] == json!("pending")));
        assert_eq!(transactions[0]["type"], json!("deposit"));
        assert_eq!(transactions[0]["amount"], json!(1860.0));
        assert_eq!(transactions[1]["amount"], json!(510.0));
        assert_eq!(body["booking"]["deposit_amount"], json!(1860.0));
        assert_eq!(body["booking"]["end_date"], json!("2026-04-15"));
        assert!(gateway.invoices().is_empty());
        assert_eq!(body["warnings"], json!([]));
    }

    #[tokio::test]
    async fn automatic_booking_schedules_future_invoices() {
        let store = store_with_customer("active");
        let gateway = RecordingGateway::new();

        let body = create_booking(
            &store,
            &gateway,
            POLICY,
            None,
            new_booking(CollectionMethod::Automatic),
            date("2026-01-10"),
        )
        .await
        .expect("created");

        // Deposit and first rent belong to the booking-level charge.
        let invoices = gateway.invoices();
        assert_eq!(invoices.len(), 3);
        assert_eq!(invoices[0].amount, 93_000);
        assert_eq!(
            invoices[0].finalize_at,
            date("2026-02-01")
                .and_hms_opt(0, 0, 0)
                .expect("midnight")
                .and_utc()
                .timestamp()
        );
        assert_eq!(body["warnings"], json!([]));
        let invoiced = store
            .transaction_rows()
            .iter()
            .filter(|row| row.get("stripe_invoice_id").is_some_and(Value::is_string))
            .count();
        assert_eq!(invoiced, 3);
    }

    #[tokio::test]
    async fn invoice_failures_do_not_block_creation() {
        let store = store_with_customer("active");
        let gateway = RecordingGateway::new();
        gateway.fail_invoices();

        let body = create_booking(
            &store,
            &gateway,
            POLICY,
            None,
            new_booking(CollectionMethod::Automatic),
            date("2026-01-10"),
        )
        .await
        .expect("created despite invoice failures");

        assert_eq!(body["success"], json!(true));
        assert_eq!(body["warnings"].as_array().map(Vec::len), Some(3));
        assert_eq!(store.transaction_rows().len(), 5);
    }

    #[tokio::test]
    async fn inactive_mandate_becomes_a_warning() {
        let store = store_with_customer("pending");
        let gateway = RecordingGateway::new();

        let body = create_booking(
            &store,
            &gateway,
            POLICY,
            None,
            new_booking(CollectionMethod::Automatic),
            date("2026-01-10"),
        )
        .await
        .expect("created");

        let warnings = body["warnings"].as_array().expect("warnings");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0]
            .as_str()
            .unwrap_or_default()
            .contains("mandate is not active"));
        assert!(store
            .transaction_rows()
            .iter()
            .all(|row| row["status"] == json!("scheduled")));
    }

    #[tokio::test]
    async fn schedule_failure_keeps_booking_and_reports_its_id() {
        let store = store_with_customer("active");
        store.fail_transaction_inserts();
        let gateway = RecordingGateway::new();

        let error = create_booking(
            &store,
            &gateway,
            POLICY,
            None,
            new_booking(CollectionMethod::Automatic),
            date("2026-01-10"),
        )
        .await
        .expect_err("insert failed");

        assert_eq!(store.booking_count(), 1);
        let AppError::Persistence { details, .. } = error else {
            panic!("expected persistence error");
        };
        assert_eq!(details["booking_id"], json!("booking-1"));
        assert!(gateway.invoices().is_empty());
    }

    #[tokio::test]
    async fn short_bookings_are_rejected() {
        let store = store_with_customer("active");
        let gateway = RecordingGateway::new();
        let mut input = new_booking(CollectionMethod::Manual);
        input.duration_months = 2;

        let error = create_booking(&store, &gateway, POLICY, None, input, date("2026-01-10"))
            .await
            .expect_err("too short");
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(store.booking_count(), 0);
    }

    #[tokio::test]
    async fn rescheduling_skips_invoiced_past_and_unscheduled_rows() {
        let store = store_with_customer("active");
        store.seed_booking(json!({
            "id": "book-1",
            "customer_id": "cust-1",
            "start_date": "2026-01-15",
            "rent_price": 930.0,
            "deposit_amount": 0.0,
            "payment_collection_method": "automatic",
        }));
        for (id, due, status, invoice) in [
            ("tx-1", "2026-01-15", "scheduled", Value::Null),
            ("tx-2", "2026-02-01", "scheduled", json!("in_existing")),
            ("tx-3", "2026-03-01", "failed", Value::Null),
            ("tx-4", "2026-04-01", "scheduled", Value::Null),
        ] {
            store.seed_transaction(json!({
                "id": id,
                "booking_id": "book-1",
                "due_date": due,
                "amount": 930.0,
                "type": "rent",
                "status": status,
                "stripe_invoice_id": invoice,
            }));
        }
        let gateway = RecordingGateway::new();

        let report = schedule_invoices(&store, &gateway, None, "book-1", date("2026-01-20"))
            .await
            .expect("scheduled");

        assert_eq!(report.scheduled.len(), 1);
        assert_eq!(report.scheduled[0].transaction_id, "tx-4");
        assert_eq!(
            store.transaction_row("tx-4")["stripe_invoice_id"],
            json!("in_test_1")
        );
    }

    #[tokio::test]
    async fn manual_bookings_have_nothing_to_schedule() {
        let store = store_with_customer("active");
        store.seed_booking(json!({
            "id": "book-1",
            "customer_id": "cust-1",
            "start_date": "2026-01-15",
            "payment_collection_method": "manual",
        }));
        let gateway = RecordingGateway::new();

        let error = schedule_invoices(&store, &gateway, None, "book-1", date("2026-01-10"))
            .await
            .expect_err("manual");
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }
}
