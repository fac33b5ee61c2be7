//! Numeric parameterization of the engine.
//!
//! The forward pass, sampler and run state are generic over [`Scalar`], which
//! is implemented for `f32` and `f64`. Checkpoints are always stored as
//! little-endian `f32`; loading widens them to the session's scalar type.

use std::fmt::{Debug, Display};
use std::iter::Sum;
use std::ops::{AddAssign, DivAssign, MulAssign};

use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Floating point width a registry operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit float.
    Single,
    /// 64-bit float.
    Double,
}

impl Precision {
    /// Bytes per element.
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Single => 4,
            Self::Double => 8,
        }
    }

    /// Name of the precision.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Single => "f32",
            Self::Double => "f64",
        }
    }
}

impl Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Element type of weights and activations.
pub trait Scalar:
    Float + Default + Debug + Display + Sum + AddAssign + MulAssign + DivAssign + Send + Sync + 'static
{
    /// Precision tag for this type.
    const PRECISION: Precision;

    /// Convert from `f64`, rounding when narrowing.
    fn narrow(v: f64) -> Self;

    /// Convert to `f64`.
    fn widen(self) -> f64;

    /// Convert a stored checkpoint value.
    fn from_stored(v: f32) -> Self;
}

impl Scalar for f32 {
    const PRECISION: Precision = Precision::Single;

    #[inline]
    fn narrow(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn widen(self) -> f64 {
        f64::from(self)
    }

    #[inline]
    fn from_stored(v: f32) -> Self {
        v
    }
}

impl Scalar for f64 {
    const PRECISION: Precision = Precision::Double;

    #[inline]
    fn narrow(v: f64) -> Self {
        v
    }

    #[inline]
    fn widen(self) -> f64 {
        self
    }

    #[inline]
    fn from_stored(v: f32) -> Self {
        f64::from(v)
    }
}

/// Allocate a zero-filled buffer, reporting allocation failure instead of aborting.
///
/// # Examples
///
/// ```rust
/// use llama_engine::numeric::try_zeroed;
///
/// let buf: Vec<f64> = try_zeroed(4).unwrap();
/// assert_eq!(buf, vec![0.0; 4]);
/// assert!(try_zeroed::<f32>(usize::MAX).is_err());
/// ```
pub fn try_zeroed<T: Scalar>(len: usize) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, T::zero());
    Ok(buf)
}
