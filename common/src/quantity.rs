//! Resource-quantity parsing for scheduling decisions.
//!
//! CPU quantities are plain core counts with an optional `m` millicore
//! suffix (`"100m"` is 0.1 cores). Memory quantities are byte counts with
//! optional binary (`Ki`/`Mi`/`Gi`/`Ti`) or decimal (`k`/`M`/`G`/`T`)
//! suffixes. Malformed values are rejected, never treated as zero.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity {0:?}")]
    Invalid(String),
    #[error("negative quantity {0:?}")]
    Negative(String),
}

/// Parse a CPU quantity into cores.
pub fn parse_cpu(s: &str) -> Result<f64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    if let Some(millis) = s.strip_suffix('m') {
        return Ok(parse_number(millis, s)? / 1000.0);
    }

    parse_number(s, s)
}

/// Parse a memory quantity into bytes.
pub fn parse_memory(s: &str) -> Result<f64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    const UNITS: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    for (suffix, factor) in UNITS {
        if let Some(value) = s.strip_suffix(suffix) {
            return Ok(parse_number(value, s)? * factor);
        }
    }

    parse_number(s, s)
}

/// Memory in GiB, for score arithmetic.
pub fn parse_memory_gib(s: &str) -> Result<f64, QuantityError> {
    Ok(parse_memory(s)? / (1024.0 * 1024.0 * 1024.0))
}

fn parse_number(value: &str, original: &str) -> Result<f64, QuantityError> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| QuantityError::Invalid(original.to_string()))?;
    if !parsed.is_finite() {
        return Err(QuantityError::Invalid(original.to_string()));
    }
    if parsed < 0.0 {
        return Err(QuantityError::Negative(original.to_string()));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_cores_and_millicores() {
        assert_eq!(parse_cpu("2").unwrap(), 2.0);
        assert_eq!(parse_cpu("0.5").unwrap(), 0.5);
        assert_eq!(parse_cpu("100m").unwrap(), 0.1);
        assert_eq!(parse_cpu("1500m").unwrap(), 1.5);
    }

    #[test]
    fn memory_binary_suffixes() {
        assert_eq!(parse_memory("1Ki").unwrap(), 1024.0);
        assert_eq!(parse_memory("128Mi").unwrap(), 128.0 * 1024.0 * 1024.0);
        assert_eq!(parse_memory("4Gi").unwrap(), 4.0 * 1024.0 * 1024.0 * 1024.0);
        assert_eq!(parse_memory("1.5Gi").unwrap(), 1.5 * 1024.0 * 1024.0 * 1024.0);
    }

    #[test]
    fn memory_decimal_suffixes_and_plain_bytes() {
        assert_eq!(parse_memory("1k").unwrap(), 1000.0);
        assert_eq!(parse_memory("2M").unwrap(), 2e6);
        assert_eq!(parse_memory("3G").unwrap(), 3e9);
        assert_eq!(parse_memory("1048576").unwrap(), 1048576.0);
    }

    #[test]
    fn malformed_quantities_are_rejected() {
        assert_eq!(parse_cpu(""), Err(QuantityError::Empty));
        assert!(matches!(parse_cpu("abc"), Err(QuantityError::Invalid(_))));
        assert!(matches!(parse_cpu("-1"), Err(QuantityError::Negative(_))));
        assert!(matches!(
            parse_memory("12Qi"),
            Err(QuantityError::Invalid(_))
        ));
        assert!(matches!(
            parse_memory("Gi"),
            Err(QuantityError::Invalid(_))
        ));
    }

    #[test]
    fn gib_helper() {
        assert_eq!(parse_memory_gib("8Gi").unwrap(), 8.0);
        assert_eq!(parse_memory_gib("512Mi").unwrap(), 0.5);
    }
}
