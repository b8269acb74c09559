use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::AppError;

/// Status of one scheduled rent or deposit obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Scheduled,
    Processing,
    Paid,
    PaidManually,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Paid => "paid",
            Self::PaidManually => "paid_manually",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::PaidManually)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Rent,
    Deposit,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rent => "rent",
            Self::Deposit => "deposit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMethod {
    Automatic,
    Manual,
}

impl CollectionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        }
    }
}

/// Booking-level processor status. A booking that was never charged stores
/// null, modelled as `Option<BookingPaymentStatus>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingPaymentStatus {
    ProcessingStripe,
    PaidStripe,
    PaidManual,
    FailedStripe,
}

impl BookingPaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessingStripe => "processing_stripe",
            Self::PaidStripe => "paid_stripe",
            Self::PaidManual => "paid_manual",
            Self::FailedStripe => "failed_stripe",
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(self, Self::PaidStripe | Self::PaidManual)
    }
}

/// Mandate states reported by the processor. Anything unknown is carried
/// verbatim and treated as not active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MandateStatus {
    #[default]
    None,
    Pending,
    Active,
    Inactive,
    #[serde(untagged)]
    Other(String),
}

impl MandateStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Self::None,
            "pending" => Self::Pending,
            "active" => Self::Active,
            "inactive" => Self::Inactive,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Other(value) => value.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    StartCharge,
    ConfirmPaid,
    Decline,
    SwitchToManual,
    MarkPaidManually,
}

impl LifecycleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartCharge => "start_charge",
            Self::ConfirmPaid => "confirm_paid",
            Self::Decline => "decline",
            Self::SwitchToManual => "switch_to_manual",
            Self::MarkPaidManually => "mark_paid_manually",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionRejection {
    #[error("Action Not Allowed: transaction is already {0}.")]
    AlreadySettled(TransactionStatus),
    #[error("Action Not Allowed: transaction is already collected manually.")]
    AlreadyManual,
    #[error("Cannot {} a transaction in status {from}.", .action.as_str())]
    InvalidTransition {
        from: TransactionStatus,
        action: LifecycleAction,
    },
}

/// The transition table for a single transaction.
pub fn next_state(
    current: TransactionStatus,
    action: LifecycleAction,
) -> Result<TransactionStatus, TransitionRejection> {
    use LifecycleAction as A;
    use TransactionStatus as S;

    if current.is_terminal() {
        return Err(TransitionRejection::AlreadySettled(current));
    }

    match (action, current) {
        (A::StartCharge, S::Scheduled | S::Failed) => Ok(S::Processing),
        // Processor outcomes only follow a started charge.
        (A::ConfirmPaid, S::Processing | S::Failed) => Ok(S::Paid),
        (A::Decline, S::Processing | S::Failed) => Ok(S::Failed),
        (A::SwitchToManual, S::Scheduled | S::Processing | S::Failed) => Ok(S::Pending),
        (A::SwitchToManual, S::Pending) => Err(TransitionRejection::AlreadyManual),
        (A::MarkPaidManually, _) => Ok(S::PaidManually),
        (action, from) => Err(TransitionRejection::InvalidTransition { from, action }),
    }
}

pub fn initial_status(method: CollectionMethod) -> TransactionStatus {
    match method {
        CollectionMethod::Automatic => TransactionStatus::Scheduled,
        CollectionMethod::Manual => TransactionStatus::Pending,
    }
}

/// Reasons a charge is refused before the processor is contacted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChargeRejection {
    #[error("{0} not found.")]
    NotFound(&'static str),
    #[error("Payment is already {0}; refusing to charge again.")]
    AlreadyInProgress(&'static str),
    #[error("First rent and deposit are collected by the booking charge; charge the booking instead.")]
    CoveredByBookingCharge,
    #[error("Transaction {0} of the booking charge is already settled; refusing to charge again.")]
    AlreadyCollected(String),
    #[error("Invalid amount to charge: {0} minor units.")]
    InvalidAmount(i64),
    #[error("Customer SEPA mandate is not active (status: {0}).")]
    MandateNotActive(String),
    #[error("Customer is missing Stripe payment configuration ({0}).")]
    PaymentConfigMissing(&'static str),
    #[error(transparent)]
    Transition(#[from] TransitionRejection),
}

impl From<ChargeRejection> for AppError {
    fn from(rejection: ChargeRejection) -> Self {
        let message = rejection.to_string();
        match rejection {
            ChargeRejection::NotFound(_) => AppError::NotFound(message),
            ChargeRejection::AlreadyInProgress(_)
            | ChargeRejection::CoveredByBookingCharge
            | ChargeRejection::AlreadyCollected(_)
            | ChargeRejection::Transition(_) => AppError::Conflict(message),
            ChargeRejection::InvalidAmount(_) | ChargeRejection::PaymentConfigMissing(_) => {
                AppError::BadRequest(message)
            }
            ChargeRejection::MandateNotActive(_) => AppError::Forbidden(message),
        }
    }
}

impl From<TransitionRejection> for AppError {
    fn from(rejection: TransitionRejection) -> Self {
        AppError::Conflict(rejection.to_string())
    }
}

pub fn ensure_booking_chargeable(
    status: Option<BookingPaymentStatus>,
) -> Result<(), ChargeRejection> {
    match status {
        Some(
            current @ (BookingPaymentStatus::ProcessingStripe
            | BookingPaymentStatus::PaidStripe
            | BookingPaymentStatus::PaidManual),
        ) => Err(ChargeRejection::AlreadyInProgress(current.as_str())),
        Some(BookingPaymentStatus::FailedStripe) | None => Ok(()),
    }
}

/// Processor fields of the paying customer, validated for an off-session
/// SEPA debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeTarget {
    pub stripe_customer_id: String,
    pub stripe_payment_method_id: String,
}

pub fn ensure_customer_chargeable(
    mandate_status: &MandateStatus,
    stripe_customer_id: Option<&str>,
    stripe_payment_method_id: Option<&str>,
) -> Result<ChargeTarget, ChargeRejection> {
    if *mandate_status != MandateStatus::Active {
        return Err(ChargeRejection::MandateNotActive(
            mandate_status.as_str().to_string(),
        ));
    }
    let customer = non_blank(stripe_customer_id)
        .ok_or(ChargeRejection::PaymentConfigMissing("stripe_customer_id"))?;
    let payment_method = non_blank(stripe_payment_method_id).ok_or(
        ChargeRejection::PaymentConfigMissing("stripe_payment_method_id"),
    )?;
    Ok(ChargeTarget {
        stripe_customer_id: customer,
        stripe_payment_method_id: payment_method,
    })
}

pub fn amount_in_minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// The booking-level charge collects every row due on or before the start
/// date: the deposit and the first rent.
pub fn covered_by_booking_charge(start_date: NaiveDate, due_date: NaiveDate) -> bool {
    due_date <= start_date
}

/// Total for the booking-level charge: rent plus deposit, in cents.
pub fn booking_charge_amount(rent_price: f64, deposit_amount: f64) -> Result<i64, ChargeRejection> {
    ensure_positive_amount(amount_in_minor_units(rent_price + deposit_amount))
}

pub fn ensure_positive_amount(minor_units: i64) -> Result<i64, ChargeRejection> {
    if minor_units <= 0 {
        return Err(ChargeRejection::InvalidAmount(minor_units));
    }
    Ok(minor_units)
}

/// Asynchronous outcome reported by the processor for a payment-intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorOutcome {
    Processing,
    Succeeded,
    Failed,
}

impl ProcessorOutcome {
    pub fn transaction_action(self) -> Option<LifecycleAction> {
        match self {
            Self::Processing => None,
            Self::Succeeded => Some(LifecycleAction::ConfirmPaid),
            Self::Failed => Some(LifecycleAction::Decline),
        }
    }
}

/// Booking status after a processor event. `None` leaves the row alone.
pub fn booking_status_after(
    current: Option<BookingPaymentStatus>,
    outcome: ProcessorOutcome,
) -> Option<BookingPaymentStatus> {
    use BookingPaymentStatus as B;

    let next = match (current, outcome) {
        (Some(B::PaidManual), _) | (Some(B::PaidStripe), _) => return None,
        (_, ProcessorOutcome::Processing) => B::ProcessingStripe,
        (_, ProcessorOutcome::Succeeded) => B::PaidStripe,
        (_, ProcessorOutcome::Failed) => B::FailedStripe,
    };
    (current != Some(next)).then_some(next)
}

/// Deterministic processor idempotency key. Two submissions of the same
/// attempt see the same `version` (the row's `updated_at`) and therefore
/// collapse onto one payment-intent; any status write bumps the version so
/// a later retry gets a fresh key.
pub fn charge_idempotency_key(scope: &str, id: &str, version: &str) -> String {
    let name = format!("{scope}:{id}:{version}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}
