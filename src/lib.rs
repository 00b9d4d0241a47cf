#![deny(missing_docs)]
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mandelbrot renderer
//!
//! The Mandelbrot set is the set of points `c` on the complex plane for
//! which repeatedly squaring a number and adding `c` never runs off to
//! infinity.  To draw it, every pixel of an image is mapped to a point,
//! the point is iterated until it escapes or a depth limit runs out,
//! and the number of iterations it survived picks a color out of a
//! palette.  Points that never escape are the set itself, and are
//! black.
//!
//! Each pixel is independent of every other, which makes this the
//! textbook data-parallel job.  The same kernel is written here for
//! several compute APIs: plain CPU threads, WGSL compute shaders
//! through wgpu, OpenCL, and CUDA.  They all sit behind the
//! `DeviceOrchestrator` trait, and the render driver does not care
//! which one it is talking to.

pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod kernel;
pub mod palette;
pub mod planes;

pub use config::{Backend, DeviceOptions, RenderConfig, RenderJob, RenderParameters, WorkGrid};
pub use device::{DeviceInfo, DeviceOrchestrator, HostDevice};
pub use driver::{
    render_on, render_reporting, render_with, run, run_reporting, write_image, Rendered,
};
pub use error::{RenderError, Result};
pub use palette::Palette;
pub use planes::PlaneRegion;
