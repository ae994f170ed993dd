//! Gradient accumulation buffers.
//!
//! The compute core never applies updates itself; it deposits contributions
//! into an optimizer-owned buffer. [`GradientAccumulator::gradient_buffer`]
//! hands back the buffer together with the two scale factors the caller must
//! apply when combining old and new content:
//!
//! ```text
//! buffer = dst_scale * buffer + gradient_scale * contribution
//! ```
//!
//! The first request in a step overwrites (`dst_scale = 0`); later requests
//! with `accumulate` set add on top (`dst_scale = 1`). [`clear`] marks the
//! step boundary.
//!
//! [`clear`]: GradientAccumulator::clear

use grove_core::matrix::local_mat;
use grove_core::LocalMat;
use num_traits::Float;

pub struct GradientAccumulator<T> {
    gradient: LocalMat<T>,
    dirty: bool,
}

/// One accumulation grant: the destination buffer plus the scale factors to
/// combine it with the new contribution. Must not be retained across calls.
pub struct GradientBuffer<'a, T> {
    pub dst_scale: T,
    pub gradient_scale: T,
    pub gradient: &'a mut LocalMat<T>,
}

impl<T: Float> GradientAccumulator<T> {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            gradient: local_mat(height, width),
            dirty: false,
        }
    }

    /// Grants access to the gradient buffer for one accumulation call.
    ///
    /// With `accumulate` unset the grant always overwrites, discarding any
    /// contribution already deposited this step.
    pub fn gradient_buffer(&mut self, accumulate: bool) -> GradientBuffer<'_, T> {
        let dst_scale = if accumulate && self.dirty {
            T::one()
        } else {
            T::zero()
        };
        self.dirty = true;
        GradientBuffer {
            dst_scale,
            gradient_scale: T::one(),
            gradient: &mut self.gradient,
        }
    }

    /// Read access for the update step.
    pub fn gradient(&self) -> &LocalMat<T> {
        &self.gradient
    }

    /// Marks the step boundary; the next grant overwrites.
    pub fn clear(&mut self) {
        self.dirty = false;
    }
}
