use std::fmt::{Debug, Display};
use std::ops::{AddAssign, SubAssign};

use num_traits::Float;
use serde::de::DeserializeOwned;
use serde::Serialize;

// Element - numeric storage type of every tensor
//
// The engine is written once against this trait and instantiated for f32 and
// f64. Reductions that drift over many timesteps (matmul, softmax) widen to
// f64 internally whatever the storage type is.

/// Trait implemented by the floating point types a [`crate::Tensor`] can hold.
pub trait Element:
    Float
    + AddAssign
    + SubAssign
    + Default
    + Debug
    + Display
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    /// Short name used in logs and checkpoint headers.
    const NAME: &'static str;

    /// Widen to f64 for accumulation.
    fn widen(self) -> f64;

    /// Narrow an f64 back into storage precision.
    fn narrow(v: f64) -> Self;
}

impl Element for f32 {
    const NAME: &'static str = "f32";

    #[inline]
    fn widen(self) -> f64 {
        self as f64
    }

    #[inline]
    fn narrow(v: f64) -> Self {
        v as f32
    }
}

impl Element for f64 {
    const NAME: &'static str = "f64";

    #[inline]
    fn widen(self) -> f64 {
        self
    }

    #[inline]
    fn narrow(v: f64) -> Self {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_widen_f32() {
        let x = <f32 as Element>::narrow(0.25);
        assert_eq!(x, 0.25f32);
        assert_eq!(x.widen(), 0.25f64);
        assert_eq!(<f32 as Element>::NAME, "f32");
    }

    #[test]
    fn f64_is_identity() {
        let v = 1.0f64 / 3.0;
        assert_eq!(<f64 as Element>::narrow(v), v);
        assert_eq!(v.widen(), v);
    }
}
