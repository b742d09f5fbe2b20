use std::f32::consts::FRAC_PI_4;

use crate::{Error, Result};

/// Stereo routing matrix
///
/// The left output receives `ll * left + lr * right` and the right output receives
/// `rl * left + rr * right`. Mono sounds feed the same input to both columns.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PanMatrix {
    /// Left input into left output
    pub ll: f32,
    /// Right input into left output
    pub lr: f32,
    /// Left input into right output
    pub rl: f32,
    /// Right input into right output
    pub rr: f32,
}

impl PanMatrix {
    /// Passes each input channel to its own output unchanged
    pub const IDENTITY: Self = Self {
        ll: 1.0,
        lr: 0.0,
        rl: 0.0,
        rr: 1.0,
    };

    /// Construct a matrix from its four coefficients
    pub const fn new(ll: f32, lr: f32, rl: f32, rr: f32) -> Self {
        Self { ll, lr, rl, rr }
    }

    fn validate(&self) -> Result<()> {
        for &x in &[self.ll, self.lr, self.rl, self.rr] {
            if !x.is_finite() {
                return Err(Error::invalid("pan matrix coefficient", x));
            }
        }
        Ok(())
    }
}

/// How a sound is distributed between the left and right outputs
///
/// The scalar and matrix forms describe the same routing state; whichever was set last is
/// authoritative and the other is derived from it.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Pan {
    /// -1 is fully left, 0 centered, 1 fully right
    Scalar(f32),
    /// Explicit stereo routing
    Matrix(PanMatrix),
}

impl Pan {
    pub(crate) fn scalar_checked(pan: f32) -> Result<Self> {
        // Also rejects NaN
        if !(-1.0..=1.0).contains(&pan) {
            return Err(Error::invalid("pan", pan));
        }
        Ok(Pan::Scalar(pan))
    }

    pub(crate) fn matrix_checked(matrix: PanMatrix) -> Result<Self> {
        matrix.validate()?;
        Ok(Pan::Matrix(matrix))
    }

    /// Scalar view of this pan
    ///
    /// For a matrix, this is a best-effort estimate from the balance of the left and right
    /// output totals, and matches the scalar exactly when the matrix was derived from one.
    pub fn scalar(&self) -> f32 {
        match *self {
            Pan::Scalar(x) => x,
            Pan::Matrix(m) => {
                let left = m.ll + m.lr;
                let right = m.rl + m.rr;
                if left == 0.0 && right == 0.0 {
                    return 0.0;
                }
                (right.atan2(left) / FRAC_PI_4 - 1.0).clamp(-1.0, 1.0)
            }
        }
    }

    /// Matrix view of this pan, using an equal-power law for scalars
    pub fn matrix(&self) -> PanMatrix {
        match *self {
            Pan::Scalar(x) => {
                let angle = (x + 1.0) * FRAC_PI_4;
                PanMatrix::new(angle.cos(), 0.0, 0.0, angle.sin())
            }
            Pan::Matrix(m) => m,
        }
    }
}

impl Default for Pan {
    fn default() -> Self {
        Pan::Scalar(0.0)
    }
}
