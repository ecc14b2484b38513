//! Kubernetes resource quantities (`600m`, `512M`, `1.5Gi`).

use std::fmt;
use std::str::FromStr;

const DEC_SUFFIXES: &[(&str, i32)] = &[
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("", 0),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

const BIN_SUFFIXES: &[(&str, u32)] = &[
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

/// Precision kept after the decimal point, in digits.
const SCALE_DIGITS: u32 = 9;
const SCALE: i128 = 10_i128.pow(SCALE_DIGITS);

/// A non-negative quantity, stored exactly in billionths of a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quantity(i128);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantityError(String);

impl fmt::Display for QuantityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for QuantityError {}

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub const fn from_millis(millis: i64) -> Self {
        Quantity(millis as i128 * (SCALE / 1000))
    }

    pub const fn from_units(units: i64) -> Self {
        Quantity(units as i128 * SCALE)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Parse, treating an empty string as zero.
    pub fn parse_or_zero(s: &str) -> Result<Self, QuantityError> {
        if s.trim().is_empty() {
            Ok(Self::ZERO)
        } else {
            s.parse()
        }
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim();
        let s = s.strip_prefix('+').unwrap_or(s);
        if s.starts_with('-') {
            return Err(QuantityError(format!("negative quantity '{raw}'")));
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        if number.is_empty() || number == "." {
            return Err(QuantityError(format!("missing number in '{raw}'")));
        }

        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if frac_part.contains('.') || frac_part.len() > SCALE_DIGITS as usize {
            return Err(QuantityError(format!("invalid number in '{raw}'")));
        }
        let int: i128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| QuantityError(format!("invalid number in '{raw}'")))?
        };
        let frac: i128 = if frac_part.is_empty() {
            0
        } else {
            let digits: i128 = frac_part
                .parse()
                .map_err(|_| QuantityError(format!("invalid number in '{raw}'")))?;
            digits * 10_i128.pow(SCALE_DIGITS - frac_part.len() as u32)
        };
        let base = int
            .checked_mul(SCALE)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(|| QuantityError(format!("quantity '{raw}' is too large")))?;

        let scaled = if let Some((_, exp)) = DEC_SUFFIXES.iter().find(|(t, _)| *t == suffix) {
            if *exp >= 0 {
                base.checked_mul(10_i128.pow(*exp as u32))
            } else {
                Some(base / 10_i128.pow(exp.unsigned_abs()))
            }
        } else if let Some((_, exp)) = BIN_SUFFIXES.iter().find(|(t, _)| *t == suffix) {
            base.checked_mul(1_i128 << exp)
        } else {
            return Err(QuantityError(format!("unrecognized suffix '{suffix}' in '{raw}'")));
        };

        scaled
            .map(Quantity)
            .ok_or_else(|| QuantityError(format!("quantity '{raw}' is too large")))
    }
}
