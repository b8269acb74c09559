use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::services::rent_lifecycle::TransactionType;

/// How the rent of the entry month is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstMonthCalculation {
    /// Flat monthly amount regardless of the entry day.
    #[default]
    Full,
    /// Pro-rated by the calendar days left in the entry month, entry day included.
    Natural,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineInput {
    pub start_date: NaiveDate,
    pub duration_months: u32,
    pub monthly_rent: f64,
    pub deposit_months: f64,
    pub first_month: FirstMonthCalculation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub due_date: NaiveDate,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: f64,
    pub description: String,
}

/// Exclusive end of a tenancy. Day overflow clamps to the month end
/// (Jan 31 + 1 month = Feb 28/29).
pub fn end_date(start_date: NaiveDate, duration_months: u32) -> Option<NaiveDate> {
    start_date.checked_add_months(Months::new(duration_months))
}

pub fn days_in_month(date: NaiveDate) -> u32 {
    let first = first_of_month(date);
    first
        .checked_add_months(Months::new(1))
        .map(|next| (next - first).num_days() as u32)
        .unwrap_or(31)
}

/// Rent owed for the entry month under the given policy.
pub fn first_month_rent(
    start_date: NaiveDate,
    monthly_rent: f64,
    policy: FirstMonthCalculation,
) -> f64 {
    match policy {
        FirstMonthCalculation::Full => round2(monthly_rent),
        FirstMonthCalculation::Natural => {
            let total = days_in_month(start_date);
            let remaining = total - start_date.day() + 1;
            round2(monthly_rent * f64::from(remaining) / f64::from(total))
        }
    }
}

/// Ordered payment plan of a booking: the deposit and the first (possibly
/// pro-rated) rent on the start date, then a flat rent on the first of every
/// later month strictly before the end date.
pub fn compute_payment_timeline(input: &TimelineInput) -> Vec<TimelineEntry> {
    let Some(end) = end_date(input.start_date, input.duration_months) else {
        return Vec::new();
    };

    let mut entries = Vec::new();

    let deposit = round2(input.monthly_rent * input.deposit_months);
    if deposit > 0.0 {
        entries.push(TimelineEntry {
            due_date: input.start_date,
            kind: TransactionType::Deposit,
            amount: deposit,
            description: format!("Deposit ({} month(s))", trim_float(input.deposit_months)),
        });
    }

    let first_rent = first_month_rent(input.start_date, input.monthly_rent, input.first_month);
    let description = match input.first_month {
        FirstMonthCalculation::Natural if input.start_date.day() > 1 => {
            let total = days_in_month(input.start_date);
            format!(
                "Rent {} (pro-rated {}/{} days)",
                input.start_date.format("%B %Y"),
                total - input.start_date.day() + 1,
                total
            )
        }
        _ => format!("Rent {}", input.start_date.format("%B %Y")),
    };
    entries.push(TimelineEntry {
        due_date: input.start_date,
        kind: TransactionType::Rent,
        amount: first_rent,
        description,
    });

    let monthly = round2(input.monthly_rent);
    let mut cursor = first_of_month(input.start_date).checked_add_months(Months::new(1));
    while let Some(due_date) = cursor.filter(|date| *date < end) {
        entries.push(TimelineEntry {
            due_date,
            kind: TransactionType::Rent,
            amount: monthly,
            description: format!("Rent {}", due_date.format("%B %Y")),
        });
        cursor = due_date.checked_add_months(Months::new(1));
    }

    entries
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn trim_float(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}
