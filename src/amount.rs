use std::fmt;

use serde::{Deserialize, Serialize};

/// Monetary amount in minor currency units (two decimal places).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    const SCALE: i64 = 100;

    pub const ZERO: Amount = Amount(0);

    pub const fn from_minor(value: i64) -> Self {
        Amount(value)
    }

    /// Parse a major-unit float, rounding to the nearest minor unit.
    pub fn from_major(value: f64) -> Self {
        Amount((value * Self::SCALE as f64).round() as i64)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn abs(self) -> Self {
        Amount(self.0.saturating_abs())
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn checked_neg(self) -> Option<Self> {
        self.0.checked_neg().map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / Self::SCALE as u64;
        let frac = abs % Self::SCALE as u64;
        write!(f, "{sign}{whole}.{frac:02}")
    }
}

// Operators saturate; balance arithmetic on stored values uses the
// `checked_*` forms and reports overflow.
impl std::ops::Neg for Amount {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Amount(self.0.saturating_neg())
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_major_converts_correctly() {
        assert_eq!(Amount::from_major(21.0), Amount::from_minor(2100));
        assert_eq!(Amount::from_major(0.01), Amount::from_minor(1));
        assert_eq!(Amount::from_major(-5.5), Amount::from_minor(-550));
    }

    #[test]
    fn from_major_rounds_correctly() {
        assert_eq!(Amount::from_major(1.234), Amount::from_minor(123));
        assert_eq!(Amount::from_major(1.236), Amount::from_minor(124));
    }

    #[test]
    fn display_formats() {
        assert_eq!(Amount::from_minor(2100).to_string(), "21.00");
        assert_eq!(Amount::from_minor(5).to_string(), "0.05");
        assert_eq!(Amount::from_minor(0).to_string(), "0.00");
        assert_eq!(Amount::from_minor(-1050).to_string(), "-10.50");
    }

    #[test]
    fn checked_arithmetic_detects_overflow() {
        assert_eq!(
            Amount::from_minor(i64::MAX).checked_add(Amount::from_minor(1)),
            None
        );
        assert_eq!(
            Amount::from_minor(10).checked_sub(Amount::from_minor(30)),
            Some(Amount::from_minor(-20))
        );
    }

    #[test]
    fn neg_and_abs() {
        let charge = -Amount::from_minor(2100);
        assert_eq!(charge, Amount::from_minor(-2100));
        assert_eq!(charge.abs(), Amount::from_minor(2100));
        assert!(!charge.is_positive());
    }

    #[test]
    fn operators_saturate_at_the_bounds() {
        let max = Amount::from_minor(i64::MAX);
        let min = Amount::from_minor(i64::MIN);
        assert_eq!(max + Amount::from_minor(1), max);
        assert_eq!(min - Amount::from_minor(1), min);
        assert_eq!(-min, max);
        assert_eq!(min.checked_neg(), None);
    }

    #[test]
    fn ordering() {
        assert!(Amount::from_minor(-1) < Amount::ZERO);
        assert!(Amount::ZERO < Amount::from_minor(1));
    }
}
