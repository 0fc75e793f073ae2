//! Duration-string parsing for configuration values.
//!
//! Accepts the compact forms operators write in the YAML file: `300ms`,
//! `1.5s`, `2m`, `1h30m`. A duration is one or more `<number><unit>`
//! segments; numbers may carry a fractional part; recognized units are
//! `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use torii_common::ToriiError;

/// Parse a duration string such as `"10s"` or `"1h30m"`.
pub fn parse_duration(input: &str) -> Result<Duration, ToriiError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid(input, "empty string"));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid(input, "expected a number"));
        }
        let (number, tail) = rest.split_at(digits);
        let value: f64 = number
            .parse()
            .map_err(|_| invalid(input, "bad numeric component"))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let nanos_per_unit: f64 = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60.0 * 1_000_000_000.0,
            "h" => 3_600.0 * 1_000_000_000.0,
            "" => return Err(invalid(input, "missing unit")),
            other => return Err(invalid(input, &format!("unknown unit {other:?}"))),
        };

        let nanos = value * nanos_per_unit;
        if !nanos.is_finite() || nanos < 0.0 {
            return Err(invalid(input, "value out of range"));
        }
        total += Duration::from_nanos(nanos as u64);
        rest = tail;
    }

    Ok(total)
}

fn invalid(input: &str, reason: &str) -> ToriiError {
    ToriiError::config(format!("invalid duration {input:?}: {reason}"))
}

/// Serde adapter so config fields can hold `Duration` directly.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}
