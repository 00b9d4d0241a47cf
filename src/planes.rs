//! Contains the PlaneRegion struct, which describes the rectangle of
//! the complex plane that an image of a given size looks at.  The
//! region is described by its lower-left corner and its extent, which
//! is the form every kernel wants its arguments in: a pixel's sample
//! is `min + delta * fraction`.
use num::Complex;

use crate::error::{RenderError, Result};

/// The lower-left corner and the extent (max - min) of a region of the
/// complex plane, treating the real part as the x-component and the
/// imaginary part as the y-component.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PlaneRegion {
    /// The corner closest to negative infinity on both axes.
    pub min: Complex<f32>,
    /// The width (re) and height (im) of the region.
    pub delta: Complex<f32>,
}

impl PlaneRegion {
    /// Build a region from a horizontal range, choosing the vertical
    /// range so the region has the same aspect ratio as the image and
    /// is centered on the real axis.  A square image looking at a
    /// symmetric range of the real axis gets a square region.
    pub fn centered(width: u32, height: u32, real_min: f32, real_max: f32) -> Result<PlaneRegion> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidConfig(format!(
                "image dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }

        if !(real_min < real_max) {
            return Err(RenderError::InvalidConfig(format!(
                "the real range {},{} is empty or reversed",
                real_min, real_max
            )));
        }

        let imag_min = (real_max - real_min) * height as f32 / width as f32 / -2.0;
        let imag_max = -imag_min;

        Ok(PlaneRegion {
            min: Complex::new(real_min, imag_min),
            delta: Complex::new(real_max - real_min, imag_max - imag_min),
        })
    }

    /// The corner opposite `min`.
    pub fn max(&self) -> Complex<f32> {
        self.min + self.delta
    }

    /// Given the column and row of a pixel in an image of the given
    /// size, return the complex sample for that pixel.  The first and
    /// last pixels of each axis land exactly on the region's edges.  An
    /// axis only one pixel long has no extent to interpolate across, so
    /// it samples the `min` edge.
    #[inline]
    pub fn pixel_to_point(&self, x: u32, y: u32, width: u32, height: u32) -> Complex<f32> {
        let fx = fraction(x, width);
        let fy = fraction(y, height);
        Complex::new(
            self.min.re + self.delta.re * fx,
            self.min.im + self.delta.im * fy,
        )
    }
}

#[inline]
fn fraction(position: u32, extent: u32) -> f32 {
    if extent <= 1 {
        0.0
    } else {
        position as f32 / (extent - 1) as f32
    }
}
