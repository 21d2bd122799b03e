// Fixed-point decimal arithmetic with banker's rounding.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A fixed-point decimal: `unscaled * 10^-scale`. Arithmetic rescales to the
/// wider of the two operand scales; division and rescaling round half-to-even.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Decimal {
    pub unscaled: i128,
    pub scale: u32,
}

impl Decimal {
    pub fn new(unscaled: i128, scale: u32) -> Self {
        Self { unscaled, scale }
    }

    pub fn from_i64(v: i64) -> Self {
        Self::new(v as i128, 0)
    }

    pub fn to_f64(&self) -> f64 {
        self.unscaled as f64 / 10f64.powi(self.scale as i32)
    }

    fn pow10(exp: u32) -> i128 {
        10i128.pow(exp)
    }

    /// Rescale to `scale`, rounding half-to-even when digits are dropped.
    pub fn rescale(&self, scale: u32) -> Result<Decimal> {
        match scale.cmp(&self.scale) {
            Ordering::Equal => Ok(*self),
            Ordering::Greater => {
                let factor = Self::pow10(scale - self.scale);
                let unscaled = self
                    .unscaled
                    .checked_mul(factor)
                    .ok_or_else(|| EngineError::Arithmetic("decimal overflow".into()))?;
                Ok(Decimal::new(unscaled, scale))
            }
            Ordering::Less => {
                let factor = Self::pow10(self.scale - scale);
                Ok(Decimal::new(round_half_even(self.unscaled, factor), scale))
            }
        }
    }

    fn aligned(&self, other: &Decimal) -> Result<(i128, i128, u32)> {
        let scale = self.scale.max(other.scale);
        Ok((
            self.rescale(scale)?.unscaled,
            other.rescale(scale)?.unscaled,
            scale,
        ))
    }

    pub fn checked_add(&self, other: &Decimal) -> Result<Decimal> {
        let (a, b, scale) = self.aligned(other)?;
        a.checked_add(b)
            .map(|v| Decimal::new(v, scale))
            .ok_or_else(|| EngineError::Arithmetic("decimal overflow".into()))
    }

    pub fn checked_sub(&self, other: &Decimal) -> Result<Decimal> {
        let (a, b, scale) = self.aligned(other)?;
        a.checked_sub(b)
            .map(|v| Decimal::new(v, scale))
            .ok_or_else(|| EngineError::Arithmetic("decimal overflow".into()))
    }

    /// Multiply, then bring the result back to the wider operand scale.
    pub fn checked_mul(&self, other: &Decimal) -> Result<Decimal> {
        let product = self
            .unscaled
            .checked_mul(other.unscaled)
            .ok_or_else(|| EngineError::Arithmetic("decimal overflow".into()))?;
        Decimal::new(product, self.scale + other.scale).rescale(self.scale.max(other.scale))
    }

    /// Divide at the wider operand scale, rounding half-to-even.
    pub fn checked_div(&self, other: &Decimal) -> Result<Decimal> {
        if other.unscaled == 0 {
            return Err(EngineError::Arithmetic("division by zero".into()));
        }
        let scale = self.scale.max(other.scale);
        // Scale the dividend up so the quotient lands on `scale` digits.
        let numerator = self
            .rescale(scale)?
            .unscaled
            .checked_mul(Self::pow10(scale + other.scale.min(scale)))
            .ok_or_else(|| EngineError::Arithmetic("decimal overflow".into()))?;
        let denominator = other.rescale(scale)?.unscaled;
        let raw = Decimal::new(
            round_half_even(numerator, denominator),
            scale + scale.min(other.scale),
        );
        raw.rescale(scale)
    }
}

/// Divide `n` by `d`, rounding half-to-even (banker's rounding).
fn round_half_even(n: i128, d: i128) -> i128 {
    let quotient = n / d;
    let remainder = n % d;
    if remainder == 0 {
        return quotient;
    }
    let half = (remainder.abs() * 2).cmp(&d.abs());
    let round_away = match half {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => quotient % 2 != 0,
    };
    if round_away {
        if (n < 0) != (d < 0) {
            quotient - 1
        } else {
            quotient + 1
        }
    } else {
        quotient
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        let scale = self.scale.max(other.scale);
        match (self.rescale(scale), other.rescale(scale)) {
            (Ok(a), Ok(b)) => a.unscaled == b.unscaled,
            _ => false,
        }
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let scale = self.scale.max(other.scale);
        match (self.rescale(scale), other.rescale(scale)) {
            (Ok(a), Ok(b)) => a.unscaled.cmp(&b.unscaled),
            // Overflow during rescale: fall back to float comparison
            _ => self
                .to_f64()
                .partial_cmp(&other.to_f64())
                .unwrap_or(Ordering::Equal),
        }
    }
}

impl std::hash::Hash for Decimal {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Normalize by stripping trailing zeros so equal values hash equally
        let mut unscaled = self.unscaled;
        let mut scale = self.scale;
        while scale > 0 && unscaled % 10 == 0 {
            unscaled /= 10;
            scale -= 1;
        }
        unscaled.hash(state);
        scale.hash(state);
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.unscaled);
        }
        let factor = Decimal::pow10(self.scale);
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let abs = self.unscaled.abs();
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            abs / factor,
            abs % factor,
            width = self.scale as usize
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Decimal::new(12345, 2).to_string(), "123.45");
        assert_eq!(Decimal::new(-105, 1).to_string(), "-10.5");
        assert_eq!(Decimal::new(7, 0).to_string(), "7");
    }

    #[test]
    fn test_add_aligns_scales() {
        let a = Decimal::new(105, 1); // 10.5
        let b = Decimal::new(25, 2); // 0.25
        assert_eq!(a.checked_add(&b).unwrap(), Decimal::new(1075, 2));
    }

    #[test]
    fn test_bankers_rounding_ties_go_to_even() {
        // 0.25 -> scale 1 rounds to 0.2 (even), 0.35 -> 0.4 (even)
        assert_eq!(Decimal::new(25, 2).rescale(1).unwrap().unscaled, 2);
        assert_eq!(Decimal::new(35, 2).rescale(1).unwrap().unscaled, 4);
        assert_eq!(Decimal::new(-25, 2).rescale(1).unwrap().unscaled, -2);
    }

    #[test]
    fn test_div_by_zero() {
        let a = Decimal::new(1, 0);
        assert!(a.checked_div(&Decimal::new(0, 0)).is_err());
    }

    #[test]
    fn test_div() {
        let a = Decimal::new(100, 1); // 10.0
        let b = Decimal::new(40, 1); // 4.0
        assert_eq!(a.checked_div(&b).unwrap(), Decimal::new(25, 1));
    }

    #[test]
    fn test_eq_across_scales() {
        assert_eq!(Decimal::new(10, 1), Decimal::new(100, 2));
    }
}
