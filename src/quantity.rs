//! Ordering for Kubernetes resource quantities.
//!
//! `k8s-openapi` models a quantity as an opaque string; deciding whether a
//! claim is smaller than its template needs the numeric value behind "2Gi",
//! "1500M" or "1e3". Values are parsed into exact nano-unit integers, so
//! sizes near 2^63 bytes compare correctly. The accepted grammar is the
//! apimachinery one: optional sign, decimal digits with an optional fraction,
//! followed by a binary suffix (Ki..Ei), a decimal suffix (n, u, m, k, M, G,
//! T, P, E) or a base-10 exponent.

use std::cmp::Ordering;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum QuantityError {
    #[error("quantity {0:?} malformed")]
    Malformed(String),
    #[error("quantity {0:?} out of range")]
    OutOfRange(String),
}

const NANO: i128 = 1_000_000_000;

/// Compares two quantities by numeric value.
pub fn cmp(a: &Quantity, b: &Quantity) -> Result<Ordering, QuantityError> {
    Ok(parse(&a.0)?.cmp(&parse(&b.0)?))
}

/// True iff `a` is strictly smaller than `b`.
pub fn lt(a: &Quantity, b: &Quantity) -> Result<bool, QuantityError> {
    Ok(cmp(a, b)? == Ordering::Less)
}

/// Parses a quantity string into nano-units (1 unit = 10^9 nano-units).
///
/// Sub-nano remainders truncate toward zero; they cannot occur for storage
/// sizes, which are whole bytes.
pub fn parse(s: &str) -> Result<i128, QuantityError> {
    let malformed = || QuantityError::Malformed(s.to_string());
    let out_of_range = || QuantityError::OutOfRange(s.to_string());

    let (sign, rest) = match s.as_bytes().first() {
        Some(b'-') => (-1, &s[1..]),
        Some(b'+') => (1, &s[1..]),
        Some(_) => (1, s),
        None => return Err(malformed()),
    };

    let int_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let int_digits = &rest[..int_end];
    let mut tail = &rest[int_end..];

    let mut frac_digits = "";
    if let Some(after_dot) = tail.strip_prefix('.') {
        let frac_end = after_dot
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after_dot.len());
        frac_digits = &after_dot[..frac_end];
        tail = &after_dot[frac_end..];
    }
    if int_digits.is_empty() && frac_digits.is_empty() {
        return Err(malformed());
    }

    // Numerator and denominator applied to the digit value. An "E" followed
    // by digits is an exponent, a bare "E" is the exa suffix.
    let (mult, div): (i128, i128) = match tail {
        "" => (1, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        "n" => (1, 1_000_000_000),
        "u" => (1, 1_000_000),
        "m" => (1, 1_000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        _ => {
            let exp = tail
                .strip_prefix(['e', 'E'])
                .and_then(|e| e.parse::<i32>().ok())
                .ok_or_else(malformed)?;
            if !(-18..=18).contains(&exp) {
                return Err(out_of_range());
            }
            if exp >= 0 {
                (10i128.pow(exp as u32), 1)
            } else {
                (1, 10i128.pow(-exp as u32))
            }
        }
    };

    let mut value: i128 = 0;
    for b in int_digits.bytes().chain(frac_digits.bytes()) {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i128))
            .ok_or_else(out_of_range)?;
    }
    if frac_digits.len() > 18 {
        return Err(out_of_range());
    }
    let frac_scale = 10i128.pow(frac_digits.len() as u32);

    value
        .checked_mul(mult)
        .and_then(|v| v.checked_mul(NANO))
        .map(|v| sign * (v / frac_scale / div))
        .ok_or_else(out_of_range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[rstest]
    #[case("1Gi", "2Gi", Ordering::Less)]
    #[case("2Gi", "1Gi", Ordering::Greater)]
    #[case("1Gi", "1024Mi", Ordering::Equal)]
    #[case("1G", "1000M", Ordering::Equal)]
    #[case("1G", "1Gi", Ordering::Less)]
    #[case("2Ki", "2000", Ordering::Greater)]
    #[case("1e3", "1k", Ordering::Equal)]
    #[case("1.5Gi", "1536Mi", Ordering::Equal)]
    #[case("500m", "1", Ordering::Less)]
    #[case("-1Gi", "0", Ordering::Less)]
    #[case("10Gi", "10Gi", Ordering::Equal)]
    fn ordering(#[case] a: &str, #[case] b: &str, #[case] want: Ordering) {
        assert_eq!(cmp(&q(a), &q(b)).unwrap(), want);
    }

    #[test]
    fn plain_bytes() {
        assert_eq!(parse("1").unwrap(), NANO);
        assert_eq!(parse("1073741824").unwrap(), 1_073_741_824 * NANO);
    }

    #[test]
    fn exa_suffix_vs_exponent() {
        assert_eq!(parse("1E").unwrap(), 1_000_000_000_000_000_000 * NANO);
        assert_eq!(parse("1E3").unwrap(), 1_000 * NANO);
        assert_eq!(parse("12e2").unwrap(), 1_200 * NANO);
    }

    #[test]
    fn sub_unit_suffixes() {
        assert_eq!(parse("1m").unwrap(), NANO / 1_000);
        assert_eq!(parse("1u").unwrap(), 1_000);
        assert_eq!(parse("1n").unwrap(), 1);
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("1X")]
    #[case("1GiB")]
    #[case("Gi")]
    #[case("1.2.3")]
    #[case("1e")]
    fn malformed(#[case] s: &str) {
        assert!(matches!(parse(s), Err(QuantityError::Malformed(_))), "{s:?}");
    }

    #[test]
    fn out_of_range() {
        assert!(matches!(
            parse("99999999999999999999999999999999999999999"),
            Err(QuantityError::OutOfRange(_))
        ));
        assert!(matches!(parse("1e19"), Err(QuantityError::OutOfRange(_))));
    }
}
