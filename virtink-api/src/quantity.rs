//! Byte-quantity arithmetic for `resource.Quantity` strings.
//!
//! k8s-openapi carries quantities as opaque strings; admission defaulting
//! and the pre-runner need their byte values (memory overheads, hugepage
//! multiples, VMM memory size).

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("quantity {0:?} is empty")]
    Empty(String),
    #[error("quantity {0:?} has an invalid number")]
    InvalidNumber(String),
    #[error("quantity {0:?} has an unknown suffix {1:?}")]
    UnknownSuffix(String, String),
    #[error("quantity {0:?} overflows")]
    Overflow(String),
}

/// Parse a quantity into bytes. Supports plain integers, binary suffixes
/// (`Ki`..`Ei`) and decimal suffixes (`k`..`E`). Fractional and milli
/// quantities are rejected; byte counts are whole.
pub fn parse_quantity(q: &Quantity) -> Result<i64, ParseError> {
    parse_str(&q.0)
}

fn parse_str(s: &str) -> Result<i64, ParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ParseError::Empty(s.to_owned()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '-')
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let value: i64 = number
        .parse()
        .map_err(|_| ParseError::InvalidNumber(s.to_owned()))?;

    let multiplier: i64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        other => return Err(ParseError::UnknownSuffix(s.to_owned(), other.to_owned())),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| ParseError::Overflow(s.to_owned()))
}

/// Render a byte count as a quantity, using the largest exact binary suffix.
pub fn from_bytes(bytes: i64) -> Quantity {
    const SUFFIXES: [(i64, &str); 4] = [
        (1 << 40, "Ti"),
        (1 << 30, "Gi"),
        (1 << 20, "Mi"),
        (1 << 10, "Ki"),
    ];
    for (unit, suffix) in SUFFIXES {
        if bytes != 0 && bytes % unit == 0 {
            return Quantity(format!("{}{}", bytes / unit, suffix));
        }
    }
    Quantity(bytes.to_string())
}

/// Compare two quantities by byte value.
pub fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    matches!((parse_quantity(a), parse_quantity(b)), (Ok(x), Ok(y)) if x == y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_owned())
    }

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(parse_quantity(&q("1Gi")).unwrap(), 1 << 30);
        assert_eq!(parse_quantity(&q("2Mi")).unwrap(), 2 << 20);
        assert_eq!(parse_quantity(&q("512Ki")).unwrap(), 512 << 10);
    }

    #[test]
    fn parses_decimal_suffixes_and_plain() {
        assert_eq!(parse_quantity(&q("1000")).unwrap(), 1000);
        assert_eq!(parse_quantity(&q("1G")).unwrap(), 1_000_000_000);
        assert_eq!(parse_quantity(&q("3k")).unwrap(), 3_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_quantity(&q("")).is_err());
        assert!(parse_quantity(&q("1.5Gi")).is_err());
        assert!(parse_quantity(&q("100m")).is_err());
        assert!(parse_quantity(&q("Gi")).is_err());
    }

    #[test]
    fn formats_exact_binary() {
        assert_eq!(from_bytes(1 << 30).0, "1Gi");
        assert_eq!(from_bytes((1 << 30) + (256 << 20)).0, "1280Mi");
        assert_eq!(from_bytes(1000).0, "1000");
    }

    #[test]
    fn equality_is_by_value() {
        assert!(quantities_equal(&q("1Gi"), &q("1024Mi")));
        assert!(!quantities_equal(&q("1Gi"), &q("1G")));
    }
}
