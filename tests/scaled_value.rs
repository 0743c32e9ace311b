use generax::maths::{ScaledReal, ScaledValue};

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

#[test]
fn long_products_do_not_underflow() {
    let mut plain = 1.0f64;
    let mut scaled = ScaledValue::one();
    let factor = ScaledValue::of(1e-5);
    for _ in 0..100 {
        plain *= 1e-5;
        scaled *= factor;
        scaled.scale();
    }
    // A plain double is flushed to zero long before 1e-500.
    assert_eq!(plain, 0.0);
    approx_eq(scaled.ln(), 100.0 * (1e-5f64).ln(), 1e-6);
}

#[test]
fn addition_aligns_magnitudes() {
    let big = ScaledValue::of(0.5);
    let mut tiny = ScaledValue::of(1e-3);
    for _ in 0..50 {
        tiny *= ScaledValue::of(1e-6);
    }
    let sum = big + tiny;
    approx_eq(sum.ln(), 0.5f64.ln(), 1e-12);
    let sum = tiny + big;
    approx_eq(sum.ln(), 0.5f64.ln(), 1e-12);

    let a = ScaledValue::of(0.25);
    let b = ScaledValue::of(0.5);
    approx_eq((a + b).ln(), 0.75f64.ln(), 1e-12);
}

#[test]
fn comparison_follows_magnitude() {
    let mut small = ScaledValue::of(0.9);
    for _ in 0..100 {
        small *= ScaledValue::of(0.01);
    }
    let large = ScaledValue::of(1e-8);
    assert!(small < large);
    assert!(large > small);
    assert!(ScaledValue::zero() < small);
    assert!(ScaledValue::zero().is_zero());
}

#[test]
fn subtraction_clamps_at_zero() {
    let a = ScaledValue::of(0.5);
    let b = ScaledValue::of(0.2);
    approx_eq(a.minus(b).ln(), 0.3f64.ln(), 1e-9);
    assert!(b.minus(a).is_zero());
}

#[test]
fn ratio_of_comparable_values() {
    let a = ScaledValue::of(0.2);
    let mut total = ScaledValue::of(0.2);
    total += ScaledValue::of(0.6);
    approx_eq(a.ratio_to(&total), 0.25, 1e-12);
    assert_eq!(ScaledValue::zero().ratio_to(&total), 0.0);
}
