//! Parsing of duration strings such as `500ms`, `2s` or `1m30s`.

use std::time::Duration;

/// Parse a duration string made of `<number><unit>` groups.
///
/// Units are `ns`, `us`, `µs`, `ms`, `s`, `m` and `h`; numbers may carry a
/// fractional part. A bare `0` is accepted. Anything else yields `None`.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if input == "0" {
        return Some(Duration::ZERO);
    }

    let mut total_nanos = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total_nanos += value * nanos_per_unit;
    }

    Some(Duration::from_nanos(total_nanos.round() as u64))
}
