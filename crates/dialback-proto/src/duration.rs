//! Duration strings such as `500ms`, `2s` or `1m30s`
//!
//! Used for the `timeout` registration query parameter and for CLI flags.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("negative duration: {0}")]
    Negative(String),

    #[error("invalid duration: {0}")]
    Invalid(String),

    #[error("missing unit in duration: {0}")]
    MissingUnit(String),

    #[error("unknown unit {unit:?} in duration {input}")]
    UnknownUnit { unit: String, input: String },
}

fn unit_nanos(unit: &str) -> Option<u64> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60 * 1_000_000_000),
        "h" => Some(3_600 * 1_000_000_000),
        _ => None,
    }
}

/// Parse a sequence of decimal numbers, each with an optional fraction and a
/// unit suffix (`ns`, `us`, `ms`, `s`, `m`, `h`). A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }
    if s.starts_with('-') {
        return Err(DurationError::Negative(input.to_string()));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: u128 = 0;
    let mut rest = s;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        if number.is_empty() || number == "." || number.matches('.').count() > 1 {
            return Err(DurationError::Invalid(input.to_string()));
        }

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        if unit.is_empty() {
            return Err(DurationError::MissingUnit(input.to_string()));
        }
        let scale = unit_nanos(unit).ok_or_else(|| DurationError::UnknownUnit {
            unit: unit.to_string(),
            input: input.to_string(),
        })?;

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| DurationError::Invalid(input.to_string()))?
        };
        let overflow = || DurationError::Invalid(input.to_string());
        total_nanos = whole
            .checked_mul(scale as u128)
            .and_then(|nanos| total_nanos.checked_add(nanos))
            .ok_or_else(overflow)?;

        if !fraction.is_empty() {
            let fraction: f64 = format!("0.{}", fraction)
                .parse()
                .map_err(|_| DurationError::Invalid(input.to_string()))?;
            // fraction < 1, so this stays below one unit
            let nanos = (fraction * scale as f64).round() as u128;
            total_nanos = total_nanos.checked_add(nanos).ok_or_else(overflow)?;
        }

        rest = tail;
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000)
        .map_err(|_| DurationError::Invalid(input.to_string()))?;
    let nanos = (total_nanos % 1_000_000_000) as u32;
    Ok(Duration::new(secs, nanos))
}
