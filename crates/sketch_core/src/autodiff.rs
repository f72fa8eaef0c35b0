use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Neg, Sub};
use thiserror::Error;

/// Added to a divisor that is exactly zero so the quotient stays finite-ish
/// instead of turning into NaN.
pub const DIVISION_NUDGE: f64 = 1e-16;

/// Dual number for forward mode AD over a fixed variable ordering.
/// val: real part
/// partials: one partial derivative per variable of the evaluation session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dual {
    pub val: f64,
    pub partials: Vec<f64>,
}

impl Dual {
    pub fn new(val: f64, partials: Vec<f64>) -> Self {
        Self { val, partials }
    }

    /// A value that does not depend on any of the `len` variables.
    pub fn constant(val: f64, len: usize) -> Self {
        Self::new(val, vec![0.0; len])
    }

    /// Seeds variable `index` out of `len`: one-hot partials.
    pub fn variable(val: f64, index: usize, len: usize) -> Self {
        let mut partials = vec![0.0; len];
        if let Some(slot) = partials.get_mut(index) {
            *slot = 1.0;
        }
        Self::new(val, partials)
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    fn map_partials(self, val: f64, scale: f64) -> Self {
        let partials = self.partials.into_iter().map(|d| d * scale).collect();
        Self::new(val, partials)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutodiffError {
    #[error("exponent {0} is not an integer; only integer powers of variables are supported")]
    UnsupportedExponent(f64),
    #[error("exponents that depend on a variable are not supported")]
    DualExponent,
}

/// Either a plain scalar or a dual number. Plain scalars are promoted to
/// duals with zero partials when combined with a dual.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Dual(Dual),
}

impl Value {
    /// The real part, whatever the variant.
    pub fn value(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Dual(d) => d.val,
        }
    }

    /// Converts into a dual carrying `len` partials. A dual keeps its own
    /// partials untouched.
    pub fn into_dual(self, len: usize) -> Dual {
        match self {
            Value::Number(n) => Dual::constant(n, len),
            Value::Dual(d) => d,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<Dual> for Value {
    fn from(value: Dual) -> Self {
        Value::Dual(value)
    }
}

/// Applies a binary rule. `partial(a, da, b, db)` gives the partial of the
/// result with respect to one variable.
fn binary(
    lhs: Value,
    rhs: Value,
    scalar: impl Fn(f64, f64) -> f64,
    partial: impl Fn(f64, f64, f64, f64) -> f64,
) -> Value {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => Value::Number(scalar(a, b)),
        (lhs, rhs) => {
            let len = match (&lhs, &rhs) {
                (Value::Dual(d), _) | (_, Value::Dual(d)) => d.len(),
                _ => 0,
            };
            let a = lhs.into_dual(len);
            let b = rhs.into_dual(len);
            let partials = a
                .partials
                .iter()
                .zip(b.partials.iter())
                .map(|(&da, &db)| partial(a.val, da, b.val, db))
                .collect();
            Value::Dual(Dual::new(scalar(a.val, b.val), partials))
        }
    }
}

/// Applies a unary rule: `f` for the value, `df` for the derivative at the value.
fn unary(x: Value, f: impl Fn(f64) -> f64, df: impl Fn(f64) -> f64) -> Value {
    match x {
        Value::Number(n) => Value::Number(f(n)),
        Value::Dual(d) => {
            let val = f(d.val);
            let scale = df(d.val);
            Value::Dual(d.map_partials(val, scale))
        }
    }
}

pub fn add(lhs: Value, rhs: Value) -> Value {
    binary(lhs, rhs, |a, b| a + b, |_, da, _, db| da + db)
}

pub fn sub(lhs: Value, rhs: Value) -> Value {
    binary(lhs, rhs, |a, b| a - b, |_, da, _, db| da - db)
}

pub fn mul(lhs: Value, rhs: Value) -> Value {
    binary(lhs, rhs, |a, b| a * b, |a, da, b, db| da * b + a * db)
}

/// `a / b` with a zero `b` replaced by `DIVISION_NUDGE`.
fn nudged_div(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        a / DIVISION_NUDGE
    } else {
        a / b
    }
}

pub fn div(lhs: Value, rhs: Value) -> Value {
    let rhs = match rhs {
        Value::Number(b) if b == 0.0 => Value::Number(DIVISION_NUDGE),
        Value::Dual(mut d) if d.val == 0.0 => {
            d.val = DIVISION_NUDGE;
            Value::Dual(d)
        }
        other => other,
    };
    binary(
        lhs,
        rhs,
        |a, b| a / b,
        |a, da, b, db| (b * da - a * db) / (b * b),
    )
}

pub fn neg(x: Value) -> Value {
    unary(x, |v| -v, |_| -1.0)
}

pub fn sin(x: Value) -> Value {
    unary(x, f64::sin, f64::cos)
}

pub fn cos(x: Value) -> Value {
    unary(x, f64::cos, |v| -v.sin())
}

pub fn tan(x: Value) -> Value {
    unary(x, f64::tan, |v| {
        let c = v.cos();
        nudged_div(1.0, c * c)
    })
}

pub fn asin(x: Value) -> Value {
    unary(x, f64::asin, |v| nudged_div(1.0, (1.0 - v * v).sqrt()))
}

pub fn acos(x: Value) -> Value {
    unary(x, f64::acos, |v| nudged_div(-1.0, (1.0 - v * v).sqrt()))
}

pub fn atan(x: Value) -> Value {
    unary(x, f64::atan, |v| 1.0 / (1.0 + v * v))
}

pub fn exp(x: Value) -> Value {
    unary(x, f64::exp, f64::exp)
}

pub fn sqrt(x: Value) -> Value {
    unary(x, f64::sqrt, |v| nudged_div(0.5, v.sqrt()))
}

pub fn log(x: Value) -> Value {
    unary(x, f64::ln, |v| nudged_div(1.0, v))
}

/// `base ^ exponent`.
///
/// Two plain numbers use `powf` directly. A dual base requires a constant
/// integer exponent, which is expanded into repeated multiplication (or
/// division for negative exponents); `x ^ 0` is the constant 1.
pub fn power(base: Value, exponent: Value) -> Result<Value, AutodiffError> {
    let exponent = match exponent {
        Value::Dual(_) => return Err(AutodiffError::DualExponent),
        Value::Number(e) => e,
    };

    let base = match base {
        Value::Number(b) => return Ok(Value::Number(b.powf(exponent))),
        Value::Dual(d) => d,
    };

    if !exponent.is_finite() || exponent.fract() != 0.0 {
        return Err(AutodiffError::UnsupportedExponent(exponent));
    }

    let len = base.len();
    if exponent == 0.0 {
        return Ok(Value::Dual(Dual::constant(1.0, len)));
    }

    let factor = if exponent < 0.0 {
        div(Value::Number(1.0), Value::Dual(base))
    } else {
        Value::Dual(base)
    };

    // Square-and-multiply keeps large exponents cheap.
    let mut remaining = exponent.abs() as u64;
    let mut square = factor;
    let mut result = Value::Dual(Dual::constant(1.0, len));
    while remaining > 0 {
        if remaining & 1 == 1 {
            result = mul(result, square.clone());
        }
        remaining >>= 1;
        if remaining > 0 {
            square = mul(square.clone(), square);
        }
    }
    Ok(result)
}

impl Add for Value {
    type Output = Value;
    fn add(self, rhs: Value) -> Value {
        add(self, rhs)
    }
}

impl Sub for Value {
    type Output = Value;
    fn sub(self, rhs: Value) -> Value {
        sub(self, rhs)
    }
}

impl Mul for Value {
    type Output = Value;
    fn mul(self, rhs: Value) -> Value {
        mul(self, rhs)
    }
}

impl Div for Value {
    type Output = Value;
    fn div(self, rhs: Value) -> Value {
        div(self, rhs)
    }
}

impl Neg for Value {
    type Output = Value;
    fn neg(self) -> Value {
        neg(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(val: f64, index: usize, len: usize) -> Value {
        Value::Dual(Dual::variable(val, index, len))
    }

    fn dual(value: Value) -> Dual {
        match value {
            Value::Dual(d) => d,
            Value::Number(n) => panic!("expected dual, got number {n}"),
        }
    }

    #[test]
    fn sin_derivative_at_zero_is_one() {
        let result = dual(sin(var(0.0, 0, 1)));
        assert!(result.val.abs() < 1e-15);
        assert!((result.partials[0] - 1.0).abs() < 1e-15);
    }

    #[test]
    fn scalars_are_promoted_to_matching_length() {
        let result = dual(add(Value::Number(2.0), var(3.0, 1, 3)));
        assert_eq!(result.val, 5.0);
        assert_eq!(result.partials, vec![0.0, 1.0, 0.0]);

        let result = dual(sub(var(3.0, 0, 2), Value::Number(1.0)));
        assert_eq!(result.val, 2.0);
        assert_eq!(result.partials, vec![1.0, 0.0]);
    }

    #[test]
    fn numbers_stay_numbers() {
        assert_eq!(mul(Value::Number(3.0), Value::Number(4.0)), Value::Number(12.0));
        assert_eq!(neg(Value::Number(2.0)), Value::Number(-2.0));
    }

    #[test]
    fn product_and_quotient_rules() {
        let x = var(3.0, 0, 2);
        let y = var(4.0, 1, 2);

        let product = dual(mul(x.clone(), y.clone()));
        assert_eq!(product.val, 12.0);
        assert_eq!(product.partials, vec![4.0, 3.0]);

        let quotient = dual(div(x, y));
        assert!((quotient.val - 0.75).abs() < 1e-15);
        assert!((quotient.partials[0] - 0.25).abs() < 1e-15);
        assert!((quotient.partials[1] + 3.0 / 16.0).abs() < 1e-15);
    }

    #[test]
    fn division_by_exact_zero_is_nudged() {
        let result = div(Value::Number(1.0), Value::Number(0.0));
        assert!(result.value().is_finite());
        assert!(result.value() > 0.0);

        let result = dual(div(var(1.0, 0, 1), Value::Number(0.0)));
        assert!(result.val.is_finite());
        assert!(!result.partials[0].is_nan());
    }

    #[test]
    fn distance_between_coincident_points_has_zero_partials() {
        let dx = sub(var(0.0, 2, 4), var(0.0, 0, 4));
        let dy = sub(var(0.0, 3, 4), var(0.0, 1, 4));
        let squared = add(mul(dx.clone(), dx), mul(dy.clone(), dy));
        let result = dual(sqrt(squared));
        assert_eq!(result.val, 0.0);
        assert_eq!(result.partials, vec![0.0; 4]);
    }

    #[test]
    fn singular_derivative_scales_stay_finite() {
        let root = dual(sqrt(var(0.0, 0, 1)));
        assert_eq!(root.partials[0], 0.5 / DIVISION_NUDGE);

        let ln = dual(log(var(0.0, 0, 1)));
        assert_eq!(ln.partials[0], 1.0 / DIVISION_NUDGE);

        for value in [asin(var(1.0, 0, 1)), acos(var(-1.0, 0, 1))] {
            let d = dual(value);
            assert!(d.partials[0].is_finite(), "{:?}", d.partials);
        }
    }

    #[test]
    fn elementary_function_derivatives() {
        let x: f64 = 0.3;
        let cases: Vec<(fn(Value) -> Value, f64)> = vec![
            (cos as fn(Value) -> Value, -x.sin()),
            (tan as fn(Value) -> Value, 1.0 / (x.cos() * x.cos())),
            (asin as fn(Value) -> Value, 1.0 / (1.0 - x * x).sqrt()),
            (acos as fn(Value) -> Value, -1.0 / (1.0 - x * x).sqrt()),
            (atan as fn(Value) -> Value, 1.0 / (1.0 + x * x)),
            (exp as fn(Value) -> Value, x.exp()),
            (sqrt as fn(Value) -> Value, 0.5 / x.sqrt()),
            (log as fn(Value) -> Value, 1.0 / x),
            (neg as fn(Value) -> Value, -1.0),
        ];
        for (f, expected) in cases {
            let result = dual(f(var(x, 0, 1)));
            assert!(
                (result.partials[0] - expected).abs() < 1e-12,
                "got {}, expected {}",
                result.partials[0],
                expected
            );
        }
    }

    #[test]
    fn integer_powers_of_duals() {
        let cube = dual(power(var(2.0, 0, 1), Value::Number(3.0)).expect("cube"));
        assert!((cube.val - 8.0).abs() < 1e-12);
        assert!((cube.partials[0] - 12.0).abs() < 1e-12);

        let inverse_square = dual(power(var(2.0, 0, 1), Value::Number(-2.0)).expect("x^-2"));
        assert!((inverse_square.val - 0.25).abs() < 1e-12);
        assert!((inverse_square.partials[0] + 0.25).abs() < 1e-12);

        let one = dual(power(var(5.0, 0, 2), Value::Number(0.0)).expect("x^0"));
        assert_eq!(one.val, 1.0);
        assert_eq!(one.partials, vec![0.0, 0.0]);
    }

    #[test]
    fn power_of_numbers_uses_real_exponent() {
        let result = power(Value::Number(4.0), Value::Number(0.5)).expect("sqrt via pow");
        assert_eq!(result, Value::Number(2.0));
    }

    #[test]
    fn power_rejects_unsupported_exponents() {
        let err = power(var(2.0, 0, 1), Value::Number(1.5)).expect_err("fractional exponent");
        assert_eq!(err, AutodiffError::UnsupportedExponent(1.5));

        let err = power(Value::Number(2.0), var(2.0, 0, 1)).expect_err("dual exponent");
        assert_eq!(err, AutodiffError::DualExponent);
    }

    #[test]
    fn operator_traits_delegate() {
        let x = var(2.0, 0, 1);
        let result = dual(-(x.clone() * x.clone() + Value::Number(1.0)) / x);
        assert!((result.val + 2.5).abs() < 1e-12);
        // d/dx -(x^2 + 1)/x = -(1 - 1/x^2)
        assert!((result.partials[0] + 0.75).abs() < 1e-12);
    }
}
