//! Duration strings in the `<number><unit>` form used throughout the
//! configuration surface: `300ms`, `10s`, `5m`, `2h`, and concatenations
//! such as `1m30s`.

use std::time::Duration;

use crate::ConfigError;

/// Parses a duration string. Supported units: `ns`, `us`, `ms`, `s`, `m`,
/// `h`. At least one `<number><unit>` segment is required.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ConfigError::InvalidDuration(input.to_string()));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ConfigError::InvalidDuration(input.to_string()))?;
        if digits_end == 0 {
            return Err(ConfigError::InvalidDuration(input.to_string()));
        }
        let (digits, tail) = rest.split_at(digits_end);
        let amount: u64 = digits
            .parse()
            .map_err(|_| ConfigError::InvalidDuration(input.to_string()))?;

        let (unit, tail) = match tail {
            t if t.starts_with("ns") => ("ns", &t[2..]),
            t if t.starts_with("us") => ("us", &t[2..]),
            t if t.starts_with("ms") => ("ms", &t[2..]),
            t if t.starts_with('s') => ("s", &t[1..]),
            t if t.starts_with('m') => ("m", &t[1..]),
            t if t.starts_with('h') => ("h", &t[1..]),
            _ => return Err(ConfigError::InvalidDuration(input.to_string())),
        };

        let segment = match unit {
            "ns" => Duration::from_nanos(amount),
            "us" => Duration::from_micros(amount),
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount * 60),
            "h" => Duration::from_secs(amount * 3600),
            _ => unreachable!(),
        };
        total += segment;
        rest = tail;
    }

    Ok(total)
}
