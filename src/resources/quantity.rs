//! Kubernetes resource quantity normalization
//!
//! The API server stores quantities in canonical form, so a CPU request of
//! `3.14` comes back as `3140m`. Generated jobs carry the canonical form
//! directly so that the submitted spec matches what the server would store.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

/// Errors produced while parsing a quantity string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantity is empty")]
    Empty,

    #[error("invalid number in quantity: {0}")]
    InvalidNumber(String),

    #[error("unknown quantity suffix: {0}")]
    UnknownSuffix(String),

    #[error("quantity out of range: {0}")]
    Overflow(String),
}

/// How the canonical form should be rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    DecimalSI,
    BinarySI,
    DecimalExponent,
}

/// Nano units per whole unit
const NANO: i128 = 1_000_000_000;

/// Largest decimal exponent with an SI suffix (E)
const MAX_DECIMAL_EXPONENT: i32 = 18;

/// Parse `value` and return its canonical Kubernetes form.
///
/// Values are held at nano precision; anything finer is rounded away from zero.
pub fn canonical_quantity(value: &str) -> Result<Quantity, QuantityError> {
    let (nanos, format) = parse(value)?;
    Ok(Quantity(render(nanos, format)))
}

fn parse(value: &str) -> Result<(i128, Format), QuantityError> {
    if value.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (negative, unsigned) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };

    let split = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(split);

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return Err(QuantityError::InvalidNumber(value.to_string()));
    }
    let fraction = fraction.trim_end_matches('0');

    let (decimal_exponent, binary_power, format) = parse_suffix(suffix)?;

    let overflow = || QuantityError::Overflow(value.to_string());

    let mut digits: i128 = 0;
    for c in whole.chars().chain(fraction.chars()) {
        let d = c
            .to_digit(10)
            .map(i128::from)
            .ok_or_else(|| QuantityError::InvalidNumber(value.to_string()))?;
        digits = digits
            .checked_mul(10)
            .and_then(|v| v.checked_add(d))
            .ok_or_else(overflow)?;
    }

    let fraction_len = i32::try_from(fraction.len()).map_err(|_| overflow())?;
    let mut scaled = digits
        .checked_mul(1024_i128.checked_pow(binary_power).ok_or_else(overflow)?)
        .ok_or_else(overflow)?;

    // value = digits * 1024^binary_power * 10^(decimal_exponent - fraction_len), in nanos
    let exponent = decimal_exponent
        .checked_sub(fraction_len)
        .and_then(|e| e.checked_add(9))
        .ok_or_else(overflow)?;
    if exponent >= 0 {
        let factor = 10_i128
            .checked_pow(exponent.unsigned_abs())
            .ok_or_else(overflow)?;
        scaled = scaled.checked_mul(factor).ok_or_else(overflow)?;
    } else {
        match 10_i128.checked_pow(exponent.unsigned_abs()) {
            Some(divisor) => {
                let rounded_up = scaled % divisor != 0;
                scaled = scaled / divisor + i128::from(rounded_up);
            }
            // Smaller than one nano unit
            None => scaled = i128::from(scaled != 0),
        }
    }

    Ok((if negative { -scaled } else { scaled }, format))
}

/// Decimal exponent, power of 1024 and output format for a suffix
type Suffix = (i32, u32, Format);

fn parse_suffix(suffix: &str) -> Result<Suffix, QuantityError> {
    let decimal = |exp: i32| -> Result<Suffix, QuantityError> { Ok((exp, 0, Format::DecimalSI)) };
    let binary = |pow: u32| -> Result<Suffix, QuantityError> { Ok((0, pow, Format::BinarySI)) };

    match suffix {
        "" => decimal(0),
        "n" => decimal(-9),
        "u" => decimal(-6),
        "m" => decimal(-3),
        "k" => decimal(3),
        "M" => decimal(6),
        "G" => decimal(9),
        "T" => decimal(12),
        "P" => decimal(15),
        "E" => decimal(18),
        "Ki" => binary(1),
        "Mi" => binary(2),
        "Gi" => binary(3),
        "Ti" => binary(4),
        "Pi" => binary(5),
        "Ei" => binary(6),
        s if s.len() > 1 && (s.starts_with('e') || s.starts_with('E')) => {
            let exp: i32 = s[1..]
                .parse()
                .map_err(|_| QuantityError::UnknownSuffix(s.to_string()))?;
            Ok((exp, 0, Format::DecimalExponent))
        }
        s => Err(QuantityError::UnknownSuffix(s.to_string())),
    }
}

fn render(nanos: i128, format: Format) -> String {
    if nanos == 0 {
        return "0".to_string();
    }

    if format == Format::BinarySI && nanos % NANO == 0 && nanos.abs() >= 1024 * NANO {
        let mut mantissa = nanos / NANO;
        let mut power = 0;
        while power < 6 && mantissa % 1024 == 0 {
            mantissa /= 1024;
            power += 1;
        }
        let suffix = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei"]
            .get(power)
            .copied()
            .unwrap_or_default();
        return format!("{mantissa}{suffix}");
    }

    let mut mantissa = nanos;
    let mut exponent = -9;
    while exponent < MAX_DECIMAL_EXPONENT && mantissa % 1000 == 0 {
        mantissa /= 1000;
        exponent += 3;
    }

    if format == Format::DecimalExponent {
        return if exponent == 0 {
            mantissa.to_string()
        } else {
            format!("{mantissa}e{exponent}")
        };
    }

    let suffix = match exponent {
        -9 => "n",
        -6 => "u",
        -3 => "m",
        3 => "k",
        6 => "M",
        9 => "G",
        12 => "T",
        15 => "P",
        18 => "E",
        _ => "",
    };
    format!("{mantissa}{suffix}")
}
