use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::{
    error::AppError,
    services::{
        bookings::NewBooking, payment_timeline::FirstMonthCalculation,
        rent_lifecycle::CollectionMethod,
    },
};

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

fn non_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

fn default_deposit_months() -> f64 {
    2.0
}
fn default_collection_method() -> CollectionMethod {
    CollectionMethod::Manual
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateBookingInput {
    #[validate(length(min = 1, max = 64))]
    pub customer_id: String,
    #[validate(length(min = 1, max = 64))]
    pub room_id: Option<String>,
    pub start_date: NaiveDate,
    #[validate(range(min = 1, max = 120))]
    pub duration_months: u32,
    #[validate(range(exclusive_min = 0.0))]
    pub rent_price: f64,
    #[serde(default = "default_deposit_months")]
    #[validate(range(min = 0.0, max = 12.0))]
    pub deposit_months: f64,
    #[serde(default)]
    pub first_month_calculation: FirstMonthCalculation,
    #[serde(default = "default_collection_method")]
    pub payment_collection_method: CollectionMethod,
}

impl From<CreateBookingInput> for NewBooking {
    fn from(input: CreateBookingInput) -> Self {
        Self {
            customer_id: input.customer_id.trim().to_string(),
            room_id: input
                .room_id
                .map(|room| room.trim().to_string())
                .filter(|room| !room.is_empty()),
            start_date: input.start_date,
            duration_months: input.duration_months,
            rent_price: input.rent_price,
            deposit_months: input.deposit_months,
            first_month: input.first_month_calculation,
            collection_method: input.payment_collection_method,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct InitiateChargeInput {
    #[validate(length(min = 1, max = 64), custom(function = "non_blank"))]
    pub booking_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct MarkPaidManuallyInput {
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BookingPath {
    pub booking_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransactionPath {
    pub transaction_id: String,
}

/// Parse an optional JSON body; an empty body yields the default.
pub fn parse_optional_body<T>(bytes: &[u8]) -> Result<T, AppError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes)
        .map_err(|error| AppError::BadRequest(format!("Invalid JSON body: {error}")))
}

/// Parse a required JSON body. Malformed, incomplete or invalid input is a
/// bad request.
pub fn parse_required_body<T>(bytes: &[u8]) -> Result<T, AppError>
where
    T: Validate + DeserializeOwned,
{
    let input: T = serde_json::from_slice(bytes)
        .map_err(|error| AppError::BadRequest(format!("Invalid JSON body: {error}")))?;
    input
        .validate()
        .map_err(|errors| AppError::BadRequest(format!("Validation failed: {errors}")))?;
    Ok(input)
}
