// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;

use anyhow::{bail, Result};
use ordered_float::OrderedFloat;
use serde::ser::Serializer;
use serde::Serialize;

/// Numeric scalar of the expression language.
///
/// Numbers are 64-bit floats that serialize without a fractional part when
/// they hold an integral value, so `1.0` and `1` are the same value with the
/// same canonical form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Number(OrderedFloat<f64>);

impl Number {
    pub fn as_f64(&self) -> f64 {
        self.0.into_inner()
    }

    pub fn is_integer(&self) -> bool {
        let v = self.as_f64();
        v.is_finite() && v.fract() == 0.0
    }

    pub fn as_i64(&self) -> Option<i64> {
        let v = self.as_f64();
        if self.is_integer() && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
            Some(v as i64)
        } else {
            None
        }
    }

    pub fn as_usize(&self) -> Result<usize> {
        match self.as_i64() {
            Some(n) if n >= 0 => Ok(n as usize),
            _ => bail!("expected a non-negative integer, got {self}"),
        }
    }

    pub fn from_json(n: &serde_json::Number) -> Option<Number> {
        let v = n.as_f64()?;
        v.is_finite().then(|| Number(OrderedFloat(v)))
    }
}

impl Serialize for Number {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.as_i64() {
            Some(n) => n.serialize(serializer),
            None => self.as_f64().serialize(serializer),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_i64() {
            Some(n) => write!(f, "{n}"),
            None => write!(f, "{}", self.as_f64()),
        }
    }
}

impl fmt::Debug for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<i64> for Number {
    fn from(n: i64) -> Self {
        Number(OrderedFloat(n as f64))
    }
}

impl From<usize> for Number {
    fn from(n: usize) -> Self {
        Number(OrderedFloat(n as f64))
    }
}

impl From<f64> for Number {
    fn from(n: f64) -> Self {
        Number(OrderedFloat(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_serialization_drops_fraction() {
        assert_eq!(serde_json::to_string(&Number::from(1.0)).unwrap(), "1");
        assert_eq!(serde_json::to_string(&Number::from(-1.0)).unwrap(), "-1");
        assert_eq!(serde_json::to_string(&Number::from(1.5)).unwrap(), "1.5");
    }

    #[test]
    fn usize_conversion_rejects_negatives() {
        assert!(Number::from(-1i64).as_usize().is_err());
        assert_eq!(Number::from(3usize).as_usize().unwrap(), 3);
    }
}
