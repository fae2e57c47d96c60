//! Human-readable identifier allocation.
//!
//! Every allocation reads the highest issued value inside the caller's transaction, so two
//! concurrent issuers can never commit the same identifier. Each scope also keeps a persisted
//! high-water mark: values stay unique even after the retention sweep deletes the record that
//! carried the highest one.

use super::error::{AdmissionsError, AdmissionsResult};
use super::store::{StoreError, StoreTx};

/// Largest suffix that fits the four-digit identifier formats.
pub const MAX_SUFFIX: u32 = 9_999;

pub fn folio_prefix(year: i32) -> String {
    format!("FE-{year:04}-")
}

pub fn control_prefix(year: i32, month: u32) -> String {
    format!("{:02}{month:02}", year.rem_euclid(100))
}

/// Allocates the next `FE-YYYY-NNNN` folio for `year`.
pub fn next_folio(tx: &mut dyn StoreTx, year: i32) -> AdmissionsResult<String> {
    let prefix = folio_prefix(year);
    let issued = tx.max_folio(&prefix)?;
    let next = advance(tx, &format!("folio:{year:04}"), &prefix, issued)?;
    Ok(format!("{prefix}{next:04}"))
}

/// Allocates the next `YYMMNNNN` student control number for the given year and month.
pub fn next_control_number(tx: &mut dyn StoreTx, year: i32, month: u32) -> AdmissionsResult<String> {
    if !(1..=12).contains(&month) {
        return Err(AdmissionsError::validation(format!("month {month} is out of range")));
    }
    let prefix = control_prefix(year, month);
    let issued = tx.max_control_number(&prefix)?;
    let next = advance(tx, &format!("control:{prefix}"), &prefix, issued)?;
    Ok(format!("{prefix}{next:04}"))
}

/// Next waitlist position. Positions are global and never reused.
pub fn next_waitlist_position(tx: &mut dyn StoreTx) -> AdmissionsResult<u32> {
    const SCOPE: &str = "waitlist";
    let existing = tx.max_waitlist_position()?.unwrap_or(0);
    let high_water = tx.sequence_high_water(SCOPE)?.unwrap_or(0);
    let next = existing
        .max(high_water)
        .checked_add(1)
        .ok_or_else(|| AdmissionsError::SequenceExhausted {
            scope: SCOPE.to_string(),
        })?;
    tx.set_sequence_high_water(SCOPE, next)?;
    Ok(next)
}

fn advance(
    tx: &mut dyn StoreTx,
    scope: &str,
    prefix: &str,
    issued: Option<String>,
) -> AdmissionsResult<u32> {
    let existing = match issued {
        Some(value) => parse_suffix(prefix, &value)?,
        None => 0,
    };
    let high_water = tx.sequence_high_water(scope)?.unwrap_or(0);
    let next = existing.max(high_water) + 1;
    if next > MAX_SUFFIX {
        return Err(AdmissionsError::SequenceExhausted {
            scope: scope.to_string(),
        });
    }
    tx.set_sequence_high_water(scope, next)?;
    Ok(next)
}

fn parse_suffix(prefix: &str, value: &str) -> AdmissionsResult<u32> {
    value
        .strip_prefix(prefix)
        .and_then(|suffix| suffix.parse::<u32>().ok())
        .ok_or_else(|| {
            StoreError::Corrupt(format!("identifier '{value}' does not match '{prefix}NNNN'"))
                .into()
        })
}
