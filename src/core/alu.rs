//! Checked 256-bit arithmetic shared by balance accounting and the `_u256` host function.
//!
//! Every operation either produces the exact result or a fault; nothing wraps or saturates.

use primitive_types::U256;
use num_traits::FromPrimitive;

use super::ExecError;

#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum U256Op {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
}

impl U256Op {
    pub fn from_code(code: u64) -> Option<Self> {
        Self::from_u64(code)
    }
}

#[inline(always)]
pub fn add(a: U256, b: U256) -> Result<U256, ExecError> {
    a.checked_add(b).ok_or(ExecError::Overflow)
}

#[inline(always)]
pub fn sub(a: U256, b: U256) -> Result<U256, ExecError> {
    a.checked_sub(b).ok_or(ExecError::Underflow)
}

#[inline(always)]
pub fn mul(a: U256, b: U256) -> Result<U256, ExecError> {
    a.checked_mul(b).ok_or(ExecError::Overflow)
}

#[inline(always)]
pub fn div(a: U256, b: U256) -> Result<U256, ExecError> {
    a.checked_div(b).ok_or(ExecError::DivisionByZero)
}

#[inline(always)]
pub fn rem(a: U256, b: U256) -> Result<U256, ExecError> {
    a.checked_rem(b).ok_or(ExecError::DivisionByZero)
}

pub fn apply(op: U256Op, a: U256, b: U256) -> Result<U256, ExecError> {
    match op {
        U256Op::Add => add(a, b),
        U256Op::Sub => sub(a, b),
        U256Op::Mul => mul(a, b),
        U256Op::Div => div(a, b),
        U256Op::Mod => rem(a, b),
    }
}

#[test]
fn test_faults() {
    assert_eq!(div(1.into(), U256::zero()), Err(ExecError::DivisionByZero));
    assert_eq!(rem(1.into(), U256::zero()), Err(ExecError::DivisionByZero));
    assert_eq!(div(U256::zero(), U256::zero()), Err(ExecError::DivisionByZero));
    assert_eq!(add(U256::MAX, 1.into()), Err(ExecError::Overflow));
    assert_eq!(mul(U256::MAX, 2.into()), Err(ExecError::Overflow));
    assert_eq!(sub(U256::zero(), 1.into()), Err(ExecError::Underflow));
    assert_eq!(add(U256::MAX - 1, 1.into()), Ok(U256::MAX));
    assert_eq!(mul(U256::MAX, U256::one()), Ok(U256::MAX));
}

#[test]
fn test_divisions() {
    let a = U256::from_dec_str(
        "115792089237316195423570985008687907853269984665640564039457584007913129639935",
    )
    .unwrap();
    let b = U256::from_dec_str("340282366920938463463374607431768211457")
        .unwrap();
    let q = div(a, b).unwrap();
    let r = rem(a, b).unwrap();
    assert_eq!(add(mul(q, b).unwrap(), r).unwrap(), a);
    assert!(r < b);
    assert_eq!(apply(U256Op::Div, 7.into(), 2.into()), Ok(3.into()));
    assert_eq!(apply(U256Op::Mod, 7.into(), 2.into()), Ok(1.into()));
}

#[test]
fn test_random_against_u128() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    for _ in 0..1000 {
        let x: u64 = rng.gen();
        let y: u64 = rng.gen_range(1..u64::MAX);
        let (a, b) = (U256::from(x), U256::from(y));
        assert_eq!(add(a, b).unwrap(), U256::from(x as u128 + y as u128));
        assert_eq!(mul(a, b).unwrap(), U256::from(x as u128 * y as u128));
        assert_eq!(div(a, b).unwrap(), U256::from(x / y));
        assert_eq!(rem(a, b).unwrap(), U256::from(x % y));
        if x >= y {
            assert_eq!(sub(a, b).unwrap(), U256::from(x - y));
        } else {
            assert_eq!(sub(a, b), Err(ExecError::Underflow));
        }
    }
}
