// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The escape-time kernel.
//!
//! Every pixel is independent: map it to a point `c` on the complex
//! plane, iterate `z = z*z + c` starting from `z = c` until `|z|^2`
//! reaches 4 or the depth limit runs out, and turn the number of
//! iterations into a color.  Points that never escape are in the set
//! and are painted opaque black.  Points that escape pick a palette
//! entry along a logarithmic curve whose steepness is the scale force:
//! fast escapes land at the top of the palette, slow ones near the
//! bottom.
//!
//! Everything is done in single precision, the same arithmetic the
//! device kernels in `src/kernels/` use, and nothing is shared between
//! pixels.

use image::Rgba;
use num::Complex;

use crate::config::RenderParameters;
use crate::palette::Palette;
use crate::planes::PlaneRegion;

/// The color of points inside the set.
pub const INSIDE: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// The escape threshold on `|z|^2`.
pub const ESCAPE_RADIUS_SQR: f32 = 4.0;

/// OpenCL C source of the kernel.
pub const OPENCL_SOURCE: &str = include_str!("kernels/mandelbrot.cl");

/// CUDA C source of the kernel.
pub const CUDA_SOURCE: &str = include_str!("kernels/mandelbrot.cu");

/// WGSL source of the kernel.  The work-group edge is spliced in at
/// `{{WORKGROUP_SIZE}}` before compilation.
pub const WGSL_SOURCE: &str = include_str!("kernels/mandelbrot.wgsl");

/// Count the iterations before `c` escapes, up to `max_depth`.  A
/// result equal to `max_depth` means the point never escaped.
#[inline]
pub fn escape_depth(c: Complex<f32>, max_depth: u32) -> u32 {
    let mut depth = 0;
    let mut z = c;
    let mut z2 = Complex::new(z.re * z.re, z.im * z.im);
    while depth < max_depth && z2.re + z2.im < ESCAPE_RADIUS_SQR {
        z = Complex::new(z2.re - z2.im, 2.0 * z.re * z.im) + c;
        z2 = Complex::new(z.re * z.re, z.im * z.im);
        depth += 1;
    }
    depth
}

/// Map the depth of an escaped point to a palette index in `[0, len-1]`.
///
/// The depth is normalized against `max_depth - 1` and then bent by
/// `ln(i*S + 1) / ln(S)`.  With a depth limit of one there is nothing
/// to normalize against and the depth counts as zero; with `S == 1`
/// the curve is undefined and the normalized depth is used unbent.
#[inline]
pub fn palette_index(depth: u32, max_depth: u32, scale_force: f32, len: usize) -> usize {
    let i = if max_depth > 1 {
        depth as f32 / (max_depth - 1) as f32
    } else {
        0.0
    };

    let ln_scale = scale_force.ln();
    let ie = if ln_scale == 0.0 {
        i
    } else {
        ((i * scale_force + 1.0).ln() / ln_scale).min(1.0)
    };

    let top = (len - 1) as f32;
    let index = ((1.0 - ie) * top).floor();
    if index.is_nan() || index <= 0.0 {
        0
    } else if index >= top {
        len - 1
    } else {
        index as usize
    }
}

/// The color for a point that went `depth` iterations.
#[inline]
pub fn shade(depth: u32, max_depth: u32, scale_force: f32, palette: &Palette) -> Rgba<u8> {
    if depth >= max_depth {
        return INSIDE;
    }
    let index = palette_index(depth, max_depth, scale_force, palette.len());
    palette.colors()[index]
}

/// The whole kernel: the color of pixel `(x, y)`.
#[inline]
pub fn pixel(
    x: u32,
    y: u32,
    params: &RenderParameters,
    region: &PlaneRegion,
    palette: &Palette,
) -> Rgba<u8> {
    let c = region.pixel_to_point(x, y, params.width, params.height);
    let depth = escape_depth(c, params.max_depth);
    shade(depth, params.max_depth, params.scale_force, palette)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Palette {
        Palette::from_colors((0..n).map(|i| Rgba([i as u8, 0, 0, 255])).collect()).unwrap()
    }

    #[test]
    fn origin_never_escapes() {
        assert_eq!(escape_depth(Complex::new(0.0, 0.0), 1024), 1024);
        assert_eq!(escape_depth(Complex::new(-1.0, 0.0), 1024), 1024);
        assert_eq!(shade(1024, 1024, 20.0, &ramp(8)), INSIDE);
    }

    #[test]
    fn far_points_escape_immediately() {
        assert_eq!(escape_depth(Complex::new(2.5, 0.0), 1024), 0);
        assert_eq!(escape_depth(Complex::new(-1.5, -1.5), 1024), 0);
        assert_eq!(escape_depth(Complex::new(0.0, 2.0), 1024), 0);
    }

    #[test]
    fn immediate_escape_takes_the_last_color() {
        let palette = ramp(512);
        assert_eq!(palette_index(0, 1024, 20.0, 512), 511);
        assert_eq!(shade(0, 1024, 20.0, &palette), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn slowest_escape_takes_the_first_color() {
        assert_eq!(palette_index(1023, 1024, 20.0, 512), 0);
    }

    #[test]
    fn points_near_the_boundary_escape_late() {
        let inner = escape_depth(Complex::new(0.3, 0.0), 1024);
        let outer = escape_depth(Complex::new(0.5, 0.5), 1024);
        assert!(inner > outer, "{} <= {}", inner, outer);
        assert!(outer > 0);
    }

    #[test]
    fn index_stays_in_range_for_any_scale() {
        for &scale in &[0.01f32, 0.5, 1.0, 1.5, 20.0, 1.0e6] {
            for &len in &[2usize, 3, 256] {
                for depth in 0..64 {
                    let index = palette_index(depth, 64, scale, len);
                    assert!(index < len, "scale {} depth {} -> {}", scale, depth, index);
                }
            }
        }
    }

    #[test]
    fn unit_scale_is_linear() {
        assert_eq!(palette_index(0, 11, 1.0, 11), 10);
        assert_eq!(palette_index(5, 11, 1.0, 11), 5);
        assert_eq!(palette_index(10, 11, 1.0, 11), 0);
    }

    #[test]
    fn depth_limit_of_one_is_two_classes() {
        let palette = ramp(4);
        assert_eq!(shade(0, 1, 20.0, &palette), palette.colors()[3]);
        assert_eq!(shade(1, 1, 20.0, &palette), INSIDE);
    }

    #[test]
    fn pixel_combines_mapping_and_shading() {
        let params = RenderParameters::new(4, 4, 1, 20.0).unwrap();
        let region = PlaneRegion::centered(4, 4, -2.0, 1.0).unwrap();
        let palette = ramp(4);
        // (-2, -1.5) starts outside the radius; (0, -0.5) survives one step.
        assert_eq!(pixel(0, 0, &params, &region, &palette), palette.colors()[3]);
        assert_eq!(pixel(2, 1, &params, &region, &palette), INSIDE);
    }
}
