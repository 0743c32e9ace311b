//! Probability-like values that never underflow.
//!
//! The reconciliation CLVs multiply thousands of probabilities together; on
//! large trees a plain double reaches 0 long before the log-likelihood does.
//! Everything in the DP is therefore generic over [`ScaledReal`]: `f64` for
//! small trees, [`ScaledValue`] (mantissa in `[2^-31, 1)` plus an exponent
//! counted in 31-bit chunks) everywhere else.

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Mul, MulAssign};

pub trait ScaledReal:
    Copy
    + Debug
    + PartialOrd
    + Add<Output = Self>
    + AddAssign
    + Mul<Output = Self>
    + MulAssign
{
    fn zero() -> Self;
    fn one() -> Self;
    fn of(x: f64) -> Self;
    /// Renormalise after a chain of multiplications.
    fn scale(&mut self);
    fn is_zero(&self) -> bool;
    fn ln(&self) -> f64;
    fn mul_f64(self, x: f64) -> Self;
    fn div_usize(self, n: usize) -> Self;
    /// Difference of two probabilities, clamped at zero.
    fn minus(self, rhs: Self) -> Self;
    /// Lossy conversion used only for proportional sampling, where all the
    /// candidates share a comparable magnitude.
    fn ratio_to(&self, total: &Self) -> f64;
}

impl ScaledReal for f64 {
    fn zero() -> Self {
        0.0
    }
    fn one() -> Self {
        1.0
    }
    fn of(x: f64) -> Self {
        x
    }
    fn scale(&mut self) {}
    fn is_zero(&self) -> bool {
        *self == 0.0
    }
    fn ln(&self) -> f64 {
        if *self <= 0.0 {
            f64::NEG_INFINITY
        } else {
            f64::ln(*self)
        }
    }
    fn mul_f64(self, x: f64) -> Self {
        self * x
    }
    fn div_usize(self, n: usize) -> Self {
        self / n as f64
    }
    fn ratio_to(&self, total: &Self) -> f64 {
        if *total == 0.0 {
            0.0
        } else {
            self / total
        }
    }
    fn minus(self, rhs: Self) -> Self {
        (self - rhs).max(0.0)
    }
}

const SCALE_BITS: i32 = 31;
const SCALE_THRESHOLD: f64 = 4.656612873077393e-10; // 2^-31
const SCALE_FACTOR: f64 = 2147483648.0; // 2^31
const LN_SCALE: f64 = 21.487562597358306; // 31 * ln(2)

/// `mantissa * 2^(SCALE_BITS * exponent)`, with `exponent <= 0` in practice.
#[derive(Clone, Copy, Debug)]
pub struct ScaledValue {
    mantissa: f64,
    exponent: i32,
}

impl ScaledValue {
    fn normalized(mantissa: f64, exponent: i32) -> Self {
        let mut v = ScaledValue { mantissa, exponent };
        v.scale();
        v
    }
}

impl PartialEq for ScaledValue {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(std::cmp::Ordering::Equal)
    }
}

impl PartialOrd for ScaledValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.mantissa == 0.0 || other.mantissa == 0.0 {
            return self.mantissa.partial_cmp(&other.mantissa);
        }
        if self.exponent != other.exponent {
            return self.exponent.partial_cmp(&other.exponent);
        }
        self.mantissa.partial_cmp(&other.mantissa)
    }
}

impl Add for ScaledValue {
    type Output = ScaledValue;
    fn add(self, rhs: ScaledValue) -> ScaledValue {
        if self.mantissa == 0.0 {
            return rhs;
        }
        if rhs.mantissa == 0.0 {
            return self;
        }
        let (hi, lo) = if self.exponent >= rhs.exponent { (self, rhs) } else { (rhs, self) };
        let shift = hi.exponent - lo.exponent;
        // Past two chunks the small term is below 2^-62 of the big one.
        if shift > 2 {
            return hi;
        }
        let aligned = lo.mantissa * SCALE_THRESHOLD.powi(shift);
        ScaledValue::normalized(hi.mantissa + aligned, hi.exponent)
    }
}

impl AddAssign for ScaledValue {
    fn add_assign(&mut self, rhs: ScaledValue) {
        *self = *self + rhs;
    }
}

impl Mul for ScaledValue {
    type Output = ScaledValue;
    fn mul(self, rhs: ScaledValue) -> ScaledValue {
        ScaledValue::normalized(self.mantissa * rhs.mantissa, self.exponent + rhs.exponent)
    }
}

impl MulAssign for ScaledValue {
    fn mul_assign(&mut self, rhs: ScaledValue) {
        *self = *self * rhs;
    }
}

impl ScaledReal for ScaledValue {
    fn zero() -> Self {
        ScaledValue { mantissa: 0.0, exponent: 0 }
    }

    fn one() -> Self {
        ScaledValue { mantissa: 1.0, exponent: 0 }
    }

    fn of(x: f64) -> Self {
        ScaledValue::normalized(x, 0)
    }

    fn scale(&mut self) {
        if self.mantissa == 0.0 {
            self.exponent = 0;
            return;
        }
        while self.mantissa < SCALE_THRESHOLD {
            self.mantissa *= SCALE_FACTOR;
            self.exponent -= 1;
        }
        while self.mantissa > 1.0 {
            self.mantissa *= SCALE_THRESHOLD;
            self.exponent += 1;
        }
    }

    fn is_zero(&self) -> bool {
        self.mantissa == 0.0
    }

    fn ln(&self) -> f64 {
        if self.mantissa <= 0.0 {
            f64::NEG_INFINITY
        } else {
            self.mantissa.ln() + self.exponent as f64 * LN_SCALE
        }
    }

    fn mul_f64(self, x: f64) -> Self {
        ScaledValue::normalized(self.mantissa * x, self.exponent)
    }

    fn div_usize(self, n: usize) -> Self {
        ScaledValue::normalized(self.mantissa / n as f64, self.exponent)
    }

    fn ratio_to(&self, total: &Self) -> f64 {
        if total.mantissa == 0.0 {
            return 0.0;
        }
        let shift = self.exponent - total.exponent;
        if shift < -2 {
            return 0.0;
        }
        (self.mantissa / total.mantissa) * SCALE_THRESHOLD.powi(-shift)
    }

    fn minus(self, rhs: Self) -> Self {
        if rhs.mantissa == 0.0 {
            return self;
        }
        if self.mantissa == 0.0 || rhs >= self {
            return ScaledValue::zero();
        }
        let shift = self.exponent - rhs.exponent;
        if shift > 2 {
            return self;
        }
        let aligned = rhs.mantissa * SCALE_THRESHOLD.powi(shift);
        ScaledValue::normalized((self.mantissa - aligned).max(0.0), self.exponent)
    }
}
