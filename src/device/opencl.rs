// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The OpenCL back end.  The kernel is OpenCL C, built by the driver
//! for the chosen GPU when the device is acquired.

use image::RgbaImage;
use ocl::enums::{DeviceInfo as ClDeviceInfo, DeviceInfoResult};
use ocl::flags::{DeviceType, MemFlags};
use ocl::prm::Float2;
use ocl::{Buffer, Context, Device, Kernel, Platform, Program, Queue};
use tracing::{debug, info};

use crate::config::{Backend, DeviceOptions, RenderJob};
use crate::device::{check_group_limit, image_from_words, DeviceInfo, DeviceOrchestrator};
use crate::error::{RenderError, Result};
use crate::kernel::OPENCL_SOURCE;
use crate::palette::Palette;

const KERNEL_NAME: &str = "mandelbrot";

/// An OpenCL GPU with its context, queue, and built program.
pub struct OpenClDevice {
    info: DeviceInfo,
    queue: Queue,
    program: Program,
    // Held for the lifetime of the queue and program.
    _context: Context,
}

/// The palette as a read-only device buffer.
pub struct OpenClPalette {
    buffer: Buffer<u32>,
    len: usize,
}

impl DeviceOrchestrator for OpenClDevice {
    type PaletteHandle = OpenClPalette;

    const BACKEND: Backend = Backend::OpenCl;

    fn acquire(options: &DeviceOptions) -> Result<Self> {
        let (platform, device) = Platform::list()
            .into_iter()
            .flat_map(|platform| {
                Device::list(platform, Some(DeviceType::GPU))
                    .unwrap_or_default()
                    .into_iter()
                    .map(move |device| (platform, device))
            })
            .nth(options.device_index)
            .ok_or_else(|| {
                RenderError::unavailable(
                    "opencl",
                    format!("no GPU device at index {}", options.device_index),
                )
            })?;

        let info = describe(&device);
        let unavailable = |e: ocl::Error| RenderError::unavailable("opencl", e);
        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(unavailable)?;
        let queue = Queue::new(&context, device, None).map_err(unavailable)?;

        let program = Program::builder()
            .src(OPENCL_SOURCE)
            .devices(device)
            .build(&context)
            .map_err(|e| RenderError::KernelBuild {
                device: info.name.clone(),
                log: e.to_string(),
            })?;

        info!(device = %info.name, "opencl device acquired");
        Ok(OpenClDevice {
            info,
            queue,
            program,
            _context: context,
        })
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn upload(&mut self, palette: &Palette) -> Result<OpenClPalette> {
        let words = palette.to_words();
        let buffer = Buffer::<u32>::builder()
            .queue(self.queue.clone())
            .flags(MemFlags::new().read_only())
            .len(words.len())
            .copy_host_slice(&words)
            .build()
            .map_err(|e| RenderError::transfer("palette upload", &self.info.name, e))?;
        debug!(colors = words.len(), "palette uploaded");
        Ok(OpenClPalette {
            buffer,
            len: words.len(),
        })
    }

    fn render(&mut self, job: &RenderJob, palette: &OpenClPalette) -> Result<RgbaImage> {
        check_group_limit(&self.info, job)?;
        let (width, height) = (job.params.width as usize, job.params.height as usize);
        let edge = job.grid.edge as usize;
        let device = &self.info.name;

        let image = Buffer::<u32>::builder()
            .queue(self.queue.clone())
            .flags(MemFlags::new().write_only())
            .len(width * height)
            .build()
            .map_err(|e| RenderError::transfer("image allocation", device, e))?;

        let kernel = Kernel::builder()
            .program(&self.program)
            .name(KERNEL_NAME)
            .queue(self.queue.clone())
            .global_work_size([width, height])
            .local_work_size([edge, edge])
            .arg(&image)
            .arg(&palette.buffer)
            .arg(palette.len as i32)
            .arg(Float2::new(job.region.min.re, job.region.min.im))
            .arg(Float2::new(job.region.delta.re, job.region.delta.im))
            .arg(job.params.max_depth)
            .arg(job.params.scale_force)
            .build()
            .map_err(|e| RenderError::dispatch(device, e))?;

        unsafe {
            kernel
                .enq()
                .map_err(|e| RenderError::dispatch(device, e))?;
        }
        debug!(
            groups_x = job.grid.groups_x,
            groups_y = job.grid.groups_y,
            "dispatched"
        );

        let mut words = vec![0u32; width * height];
        image
            .read(&mut words)
            .enq()
            .map_err(|e| RenderError::transfer("image readback", device, e))?;
        self.queue
            .finish()
            .map_err(|e| RenderError::transfer("image readback", device, e))?;

        image_from_words(job, &words, device)
    }

    fn release(self) {
        if let Err(e) = self.queue.finish() {
            tracing::warn!(device = %self.info.name, error = %e, "queue did not drain on release");
        }
        debug!(device = %self.info.name, "released");
    }
}

fn describe(device: &Device) -> DeviceInfo {
    let compute_units = match device.info(ClDeviceInfo::MaxComputeUnits) {
        Ok(DeviceInfoResult::MaxComputeUnits(units)) => Some(units),
        _ => None,
    };
    let max_work_group_invocations = match device.info(ClDeviceInfo::MaxWorkGroupSize) {
        Ok(DeviceInfoResult::MaxWorkGroupSize(items)) => Some(items as u32),
        _ => None,
    };
    let max_work_group_size = match device.info(ClDeviceInfo::MaxWorkItemSizes) {
        Ok(DeviceInfoResult::MaxWorkItemSizes(sizes)) if sizes.len() >= 3 => {
            Some([sizes[0] as u32, sizes[1] as u32, sizes[2] as u32])
        }
        _ => None,
    };
    let version = device
        .info(ClDeviceInfo::OpenclCVersion)
        .map(|v| v.to_string())
        .unwrap_or_default();
    DeviceInfo {
        backend: Backend::OpenCl,
        vendor: device.vendor().unwrap_or_default(),
        name: device.name().unwrap_or_else(|_| "OpenCL device".to_string()),
        version,
        compute_units,
        max_work_group_invocations,
        max_work_group_size,
        max_work_group_count: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderParameters;
    use crate::kernel::INSIDE;
    use crate::planes::PlaneRegion;
    use image::Rgba;

    #[test]
    fn tiny_image_has_both_classes() {
        let mut device = match OpenClDevice::acquire(&DeviceOptions::default()) {
            Ok(device) => device,
            Err(e) => {
                eprintln!("skipping: {}", e);
                return;
            }
        };
        let palette =
            Palette::from_colors((0..8).map(|i| Rgba([i * 32, 0, 0, 255])).collect()).unwrap();
        let params = RenderParameters::new(4, 4, 1, 20.0).unwrap();
        let region = PlaneRegion::centered(4, 4, -2.0, 1.0).unwrap();
        let job = RenderJob::new(params, region, 2).unwrap();
        let handle = device.upload(&palette).unwrap();
        let image = device.render(&job, &handle).unwrap();
        assert_eq!(*image.get_pixel(0, 0), palette.colors()[7]);
        assert_eq!(*image.get_pixel(2, 1), INSIDE);
        device.release();
    }
}
