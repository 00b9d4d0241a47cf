// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The CUDA back end.  The kernel is CUDA C compiled to PTX by NVRTC.
//! PTX does not depend on the device, so it is compiled once per process
//! and loaded into every device that is acquired.

use std::sync::{Arc, OnceLock};

use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::{CudaDevice as Driver, CudaSlice, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::{compile_ptx, Ptx};
use image::RgbaImage;
use tracing::{debug, info};

use crate::config::{Backend, DeviceOptions, RenderJob};
use crate::device::{check_group_limit, image_from_words, DeviceInfo, DeviceOrchestrator};
use crate::error::{RenderError, Result};
use crate::kernel::CUDA_SOURCE;
use crate::palette::Palette;

const MODULE_NAME: &str = "mandelbrot";
const KERNEL_NAME: &str = "mandelbrot";

static PTX: OnceLock<Ptx> = OnceLock::new();

/// A CUDA device with the kernel module loaded.
pub struct CudaDevice {
    info: DeviceInfo,
    device: Arc<Driver>,
}

/// The palette in device memory.
pub struct CudaPalette {
    buffer: CudaSlice<u32>,
    len: usize,
}

impl DeviceOrchestrator for CudaDevice {
    type PaletteHandle = CudaPalette;

    const BACKEND: Backend = Backend::Cuda;

    fn acquire(options: &DeviceOptions) -> Result<Self> {
        let device =
            Driver::new(options.device_index).map_err(|e| RenderError::unavailable("cuda", e))?;
        let info = describe(&device, options.device_index);

        let ptx = cached_ptx(&info.name)?;
        device
            .load_ptx(ptx, MODULE_NAME, &[KERNEL_NAME])
            .map_err(|e| RenderError::KernelBuild {
                device: info.name.clone(),
                log: e.to_string(),
            })?;

        info!(device = %info.name, "cuda device acquired");
        Ok(CudaDevice { info, device })
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn upload(&mut self, palette: &Palette) -> Result<CudaPalette> {
        let words = palette.to_words();
        let buffer = self
            .device
            .htod_sync_copy(&words)
            .map_err(|e| RenderError::transfer("palette upload", &self.info.name, e))?;
        debug!(colors = words.len(), "palette uploaded");
        Ok(CudaPalette {
            buffer,
            len: words.len(),
        })
    }

    fn render(&mut self, job: &RenderJob, palette: &CudaPalette) -> Result<RgbaImage> {
        check_group_limit(&self.info, job)?;
        let device = &self.info.name;
        let (width, height) = (job.params.width, job.params.height);

        let function = self
            .device
            .get_func(MODULE_NAME, KERNEL_NAME)
            .ok_or_else(|| RenderError::KernelBuild {
                device: device.clone(),
                log: format!("kernel {} is not loaded", KERNEL_NAME),
            })?;
        let mut image = self
            .device
            .alloc_zeros::<u32>(width as usize * height as usize)
            .map_err(|e| RenderError::transfer("image allocation", device, e))?;

        let config = LaunchConfig {
            grid_dim: (job.grid.groups_x, job.grid.groups_y, 1),
            block_dim: (job.grid.edge, job.grid.edge, 1),
            shared_mem_bytes: 0,
        };
        let args = (
            &mut image,
            &palette.buffer,
            palette.len as i32,
            job.region.min.re,
            job.region.min.im,
            job.region.delta.re,
            job.region.delta.im,
            job.params.max_depth,
            job.params.scale_force,
            width,
            height,
        );
        unsafe { function.launch(config, args) }
            .map_err(|e| RenderError::dispatch(device, e))?;
        debug!(
            groups_x = job.grid.groups_x,
            groups_y = job.grid.groups_y,
            "dispatched"
        );

        let words = self
            .device
            .dtoh_sync_copy(&image)
            .map_err(|e| RenderError::transfer("image readback", device, e))?;
        image_from_words(job, &words, device)
    }

    fn release(self) {
        if let Err(e) = self.device.synchronize() {
            tracing::warn!(device = %self.info.name, error = %e, "device did not drain on release");
        }
        debug!(device = %self.info.name, "released");
    }
}

fn cached_ptx(device: &str) -> Result<Ptx> {
    if let Some(ptx) = PTX.get() {
        return Ok(ptx.clone());
    }
    let ptx = compile_ptx(CUDA_SOURCE).map_err(|e| RenderError::KernelBuild {
        device: device.to_string(),
        log: e.to_string(),
    })?;
    debug!("compiled kernel to PTX");
    Ok(PTX.get_or_init(|| ptx).clone())
}

fn describe(device: &Driver, ordinal: usize) -> DeviceInfo {
    let attribute = |which| device.attribute(which).ok();
    let capability = match (
        attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR),
        attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR),
    ) {
        (Some(major), Some(minor)) => format!("compute {}.{}", major, minor),
        _ => String::new(),
    };
    let dims = |x, y, z| match (attribute(x), attribute(y), attribute(z)) {
        (Some(x), Some(y), Some(z)) => Some([x as u32, y as u32, z as u32]),
        _ => None,
    };
    DeviceInfo {
        backend: Backend::Cuda,
        vendor: "NVIDIA".to_string(),
        name: device
            .name()
            .unwrap_or_else(|_| format!("CUDA device {}", ordinal)),
        version: capability,
        compute_units: attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
            .map(|n| n as u32),
        max_work_group_invocations: attribute(
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
        )
        .map(|n| n as u32),
        max_work_group_size: dims(
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X,
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y,
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z,
        ),
        max_work_group_count: dims(
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X,
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y,
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Z,
        ),
    }
}
