// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Device orchestration.
//!
//! Every back end runs the same lifecycle: find a device, copy the
//! palette to it, launch one work item per pixel in square work groups,
//! wait, copy the image back, and let go of everything it allocated.
//! The `DeviceOrchestrator` trait is that lifecycle; the modules below
//! are its implementations, one per compute API.
//!
//! Device resources are owned by the orchestrator (or, for the palette,
//! by the handle `upload` returns) and are freed when they are dropped,
//! so an early return or a panic releases them as surely as `release`
//! does.

use std::fmt;

use image::RgbaImage;

use crate::config::{Backend, DeviceOptions, RenderJob};
use crate::error::{RenderError, Result};
use crate::palette::Palette;

pub mod host;
pub use self::host::HostDevice;

#[cfg(feature = "shader")]
pub mod shader;
#[cfg(feature = "shader")]
pub use self::shader::ShaderDevice;

#[cfg(feature = "opencl")]
pub mod opencl;
#[cfg(feature = "opencl")]
pub use self::opencl::OpenClDevice;

#[cfg(feature = "cuda")]
pub mod cuda;
#[cfg(feature = "cuda")]
pub use self::cuda::CudaDevice;

/// What a device says about itself.  Informational only; nothing in the
/// render depends on it except the work-group limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The back end that found the device.
    pub backend: Backend,
    /// Who made it.
    pub vendor: String,
    /// What it is called.
    pub name: String,
    /// The API or driver version it reports.
    pub version: String,
    /// Parallel compute units, when the API says.
    pub compute_units: Option<u32>,
    /// The most work items one group may hold, when the API says.
    pub max_work_group_invocations: Option<u32>,
    /// The largest group along each axis, when the API says.
    pub max_work_group_size: Option<[u32; 3]>,
    /// The most groups one dispatch may launch along each axis, when the
    /// API says.
    pub max_work_group_count: Option<[u32; 3]>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}, {}, {}", self.vendor, self.name, self.version)?;
        if let Some(units) = self.compute_units {
            write!(f, "\nCompute units:        {}", units)?;
        }
        if let Some(items) = self.max_work_group_invocations {
            write!(f, "\nMax work-items:       {}", items)?;
        }
        if let Some([x, y, z]) = self.max_work_group_size {
            write!(f, "\nMax work-group size:  {} x {} x {}", x, y, z)?;
        }
        if let Some([x, y, z]) = self.max_work_group_count {
            write!(f, "\nMax work-group count: {} x {} x {}", x, y, z)?;
        }
        Ok(())
    }
}

/// The acquire/upload/render/release lifecycle of one compute device.
pub trait DeviceOrchestrator: Sized {
    /// The device-resident palette.  Dropping it frees the device memory.
    type PaletteHandle;

    /// The back end this orchestrator implements.
    const BACKEND: Backend;

    /// Select a device and prepare it.  Back ends that compile their
    /// kernel at runtime do so here, once, and keep the result.
    fn acquire(options: &DeviceOptions) -> Result<Self>;

    /// The acquired device's description.
    fn info(&self) -> &DeviceInfo;

    /// Copy the palette into device memory.
    fn upload(&mut self, palette: &Palette) -> Result<Self::PaletteHandle>;

    /// Run the kernel over every pixel of the job and read the image back.
    fn render(&mut self, job: &RenderJob, palette: &Self::PaletteHandle) -> Result<RgbaImage>;

    /// Free every device resource now rather than at the end of scope.
    fn release(self);
}

/// Refuse a grid whose groups are larger than the device allows.
pub(crate) fn check_group_limit(info: &DeviceInfo, job: &RenderJob) -> Result<()> {
    match info.max_work_group_invocations {
        Some(max) if job.grid.invocations() > max => Err(RenderError::dispatch(
            &info.name,
            format!(
                "work groups of {}x{} need {} work items, the device allows {}",
                job.grid.edge,
                job.grid.edge,
                job.grid.invocations(),
                max
            ),
        )),
        _ => Ok(()),
    }
}

/// Rebuild an image from packed device words.
pub(crate) fn image_from_words(job: &RenderJob, words: &[u32], device: &str) -> Result<RgbaImage> {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes().to_vec()).collect();
    let (width, height) = (job.params.width, job.params.height);
    RgbaImage::from_raw(width, height, bytes).ok_or_else(|| {
        RenderError::transfer(
            "image readback",
            device,
            format!(
                "read {} words back for a {}x{} image",
                words.len(),
                width,
                height
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RenderParameters, WorkGrid};
    use crate::planes::PlaneRegion;

    fn job(width: u32, height: u32, edge: u32) -> RenderJob {
        let params = RenderParameters::new(width, height, 16, 20.0).unwrap();
        let region = PlaneRegion::centered(width, height, -2.0, 1.0).unwrap();
        RenderJob::new(params, region, edge).unwrap()
    }

    fn info(limit: Option<u32>) -> DeviceInfo {
        DeviceInfo {
            backend: Backend::Host,
            vendor: "test".to_string(),
            name: "test-device".to_string(),
            version: "1.0".to_string(),
            compute_units: Some(4),
            max_work_group_invocations: limit,
            max_work_group_size: Some([1024, 1024, 64]),
            max_work_group_count: None,
        }
    }

    #[test]
    fn oversized_groups_are_refused() {
        let job = job(64, 64, 32);
        assert_eq!(job.grid, WorkGrid { edge: 32, groups_x: 2, groups_y: 2 });
        assert!(check_group_limit(&info(Some(256)), &job).is_err());
        assert!(check_group_limit(&info(Some(1024)), &job).is_ok());
        assert!(check_group_limit(&info(None), &job).is_ok());
    }

    #[test]
    fn words_unpack_to_rgba_rows() {
        let job = job(2, 1, 1);
        let image = image_from_words(&job, &[0xff00_0000, 0x0403_0201], "test").unwrap();
        assert_eq!(image.as_raw(), &vec![0, 0, 0, 255, 1, 2, 3, 4]);
    }

    #[test]
    fn short_readback_is_a_transfer_error() {
        let job = job(2, 2, 1);
        match image_from_words(&job, &[0; 3], "test") {
            Err(RenderError::Transfer { operation, .. }) => assert_eq!(operation, "image readback"),
            other => panic!("expected a transfer error, got {:?}", other),
        }
    }

    #[test]
    fn info_prints_like_a_device_listing() {
        let text = info(Some(1024)).to_string();
        assert!(text.starts_with("test, test-device, 1.0"));
        assert!(text.contains("Max work-items:       1024"));
        assert!(text.contains("Max work-group size:  1024 x 1024 x 64"));
        assert!(!text.contains("Max work-group count"));
    }
}
