// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Render configuration.  Everything here is validated once, before a
//! device is touched, and never changes afterwards.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{RenderError, Result};
use crate::planes::PlaneRegion;

/// The per-render numbers every back end needs.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RenderParameters {
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// The escape-time iteration cap, D.
    pub max_depth: u32,
    /// The palette shaping factor, S.
    pub scale_force: f32,
}

impl RenderParameters {
    /// Check the ranges: non-empty image, D >= 1, S finite and > 0.
    pub fn new(width: u32, height: u32, max_depth: u32, scale_force: f32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidConfig(format!(
                "image dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }
        if max_depth < 1 {
            return Err(RenderError::InvalidConfig(
                "the maximum depth must be at least 1".to_string(),
            ));
        }
        if !(scale_force > 0.0) || !scale_force.is_finite() {
            return Err(RenderError::InvalidConfig(format!(
                "the scale force must be a positive number, got {}",
                scale_force
            )));
        }
        Ok(RenderParameters {
            width,
            height,
            max_depth,
            scale_force,
        })
    }

    /// Bytes in an RGBA8 image of this size.  An image too large to
    /// address cannot be allocated anywhere.
    pub fn image_bytes(&self) -> Result<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|pixels| pixels.checked_mul(4))
            .ok_or_else(|| {
                RenderError::transfer(
                    "image allocation",
                    "every device",
                    format!(
                        "a {}x{} image does not fit in memory",
                        self.width, self.height
                    ),
                )
            })
    }
}

/// A partition of the image into square work groups of `edge` pixels.
/// The partition is exact: every pixel belongs to exactly one work item
/// of exactly one group.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkGrid {
    /// Work-group edge length.
    pub edge: u32,
    /// Number of groups across.
    pub groups_x: u32,
    /// Number of groups down.
    pub groups_y: u32,
}

impl WorkGrid {
    /// Partition a `width` x `height` image.  Sizes that do not divide
    /// the image are refused rather than cropped or padded.
    pub fn new(width: u32, height: u32, edge: u32) -> Result<WorkGrid> {
        if edge == 0 {
            return Err(RenderError::dispatch(
                "every device",
                "the work-group size must be non-zero",
            ));
        }
        for (axis, extent) in &[("width", width), ("height", height)] {
            if extent % edge != 0 {
                return Err(RenderError::dispatch(
                    "every device",
                    format!(
                        "{} {} is not a multiple of the work-group size {}",
                        axis, extent, edge
                    ),
                ));
            }
        }
        Ok(WorkGrid {
            edge,
            groups_x: width / edge,
            groups_y: height / edge,
        })
    }

    /// Work items in one group.
    pub fn invocations(&self) -> u32 {
        self.edge * self.edge
    }
}

/// Everything a back end marshals into kernel arguments for one render.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RenderJob {
    /// Image size and kernel constants.
    pub params: RenderParameters,
    /// The part of the plane being looked at.
    pub region: PlaneRegion,
    /// How the image is cut into work groups.
    pub grid: WorkGrid,
}

impl RenderJob {
    /// Combine validated pieces.  The grid must partition the image the
    /// parameters describe.
    pub fn new(params: RenderParameters, region: PlaneRegion, work_group_size: u32) -> Result<Self> {
        let grid = WorkGrid::new(params.width, params.height, work_group_size)?;
        Ok(RenderJob {
            params,
            region,
            grid,
        })
    }
}

/// The compute back ends.  Only the host back end is always compiled;
/// the others are behind cargo features of the same name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    /// CPU threads running the Rust kernel.
    Host,
    /// A WGSL compute shader through wgpu.
    Shader,
    /// An OpenCL C kernel.
    OpenCl,
    /// A CUDA C kernel compiled by NVRTC.
    Cuda,
}

impl Backend {
    /// Every back end, compiled in or not.
    pub const ALL: [Backend; 4] = [Backend::Host, Backend::Shader, Backend::OpenCl, Backend::Cuda];

    /// The name used on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Backend::Host => "host",
            Backend::Shader => "shader",
            Backend::OpenCl => "opencl",
            Backend::Cuda => "cuda",
        }
    }

    /// Whether this build carries the back end.
    pub fn is_compiled(self) -> bool {
        match self {
            Backend::Host => true,
            Backend::Shader => cfg!(feature = "shader"),
            Backend::OpenCl => cfg!(feature = "opencl"),
            Backend::Cuda => cfg!(feature = "cuda"),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Backend::ALL
            .iter()
            .cloned()
            .find(|b| b.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let names: Vec<&str> = Backend::ALL.iter().map(|b| b.name()).collect();
                format!("unknown backend '{}', expected one of {}", s, names.join(", "))
            })
    }
}

/// Device selection knobs that are not part of the render itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Which device of the back end's list to use.
    pub device_index: usize,
    /// Worker threads, for the host back end.
    pub threads: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            device_index: 0,
            threads: num_cpus::get(),
        }
    }
}

/// The whole of a render's configuration, as it arrives from the
/// command line.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderConfig {
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Work-group edge length; must divide width and height.
    pub work_group_size: u32,
    /// Escape-time iteration cap.
    pub max_depth: u32,
    /// Palette curve steepness; must be > 0.
    pub scale_force: f32,
    /// Left edge of the plane.
    pub real_min: f32,
    /// Right edge of the plane.
    pub real_max: f32,
    /// Which back end renders.
    pub backend: Backend,
    /// Device index and host threads.
    pub device: DeviceOptions,
    /// The palette image.
    pub palette: PathBuf,
    /// Where the image goes.
    pub output: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            width: 1024,
            height: 1024,
            work_group_size: 32,
            max_depth: 1024,
            scale_force: 20.0,
            real_min: -2.0,
            real_max: 1.0,
            backend: Backend::Host,
            device: DeviceOptions::default(),
            palette: PathBuf::from("palette.png"),
            output: PathBuf::from("mandelbrot.png"),
        }
    }
}

impl RenderConfig {
    /// Validate the configuration and derive the render job from it.
    pub fn job(&self) -> Result<RenderJob> {
        let params =
            RenderParameters::new(self.width, self.height, self.max_depth, self.scale_force)?;
        let region = PlaneRegion::centered(self.width, self.height, self.real_min, self.real_max)?;
        RenderJob::new(params, region, self.work_group_size)
    }
}
