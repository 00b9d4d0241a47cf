// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The host back end: the Rust kernel on a pool of CPU threads.
//!
//! The image is cut into bands one work group tall.  A band is a
//! contiguous run of the output buffer, so each worker can be handed a
//! `&mut` slice of its own; workers pull bands off a shared queue until
//! it runs dry, and render each band one work group at a time.

use std::sync::Mutex;

use image::RgbaImage;
use itertools::iproduct;
use tracing::debug;

use crate::config::{Backend, DeviceOptions, RenderJob};
use crate::device::{DeviceInfo, DeviceOrchestrator};
use crate::error::{RenderError, Result};
use crate::kernel;
use crate::palette::Palette;

/// A CPU "device" of `threads` workers.
#[derive(Debug)]
pub struct HostDevice {
    info: DeviceInfo,
    threads: usize,
}

/// The host keeps its own copy of the palette, just as a device would.
#[derive(Debug)]
pub struct HostPalette(Palette);

impl DeviceOrchestrator for HostDevice {
    type PaletteHandle = HostPalette;

    const BACKEND: Backend = Backend::Host;

    fn acquire(options: &DeviceOptions) -> Result<Self> {
        if options.threads == 0 {
            return Err(RenderError::unavailable(
                "host",
                "no worker threads were requested",
            ));
        }
        let info = DeviceInfo {
            backend: Backend::Host,
            vendor: "host".to_string(),
            name: format!("{} worker threads", options.threads),
            version: env!("CARGO_PKG_VERSION").to_string(),
            compute_units: Some(num_cpus::get() as u32),
            max_work_group_invocations: None,
            max_work_group_size: None,
            max_work_group_count: None,
        };
        Ok(HostDevice {
            info,
            threads: options.threads,
        })
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn upload(&mut self, palette: &Palette) -> Result<HostPalette> {
        debug!(colors = palette.len(), "copying palette");
        Ok(HostPalette(palette.clone()))
    }

    fn render(&mut self, job: &RenderJob, palette: &HostPalette) -> Result<RgbaImage> {
        let (width, height) = (job.params.width, job.params.height);
        let mut pixels = allocate(job.params.image_bytes()?, &self.info.name)?;
        let band_bytes = pixels.len() / job.grid.groups_y as usize;

        debug!(
            bands = job.grid.groups_y,
            groups_per_band = job.grid.groups_x,
            threads = self.threads,
            "dispatching"
        );

        {
            let bands = Mutex::new(pixels.chunks_mut(band_bytes).enumerate());
            let bands = &bands;
            let palette = &palette.0;
            crossbeam::scope(|spawner| {
                for _ in 0..self.threads {
                    spawner.spawn(move |_| loop {
                        let band = bands.lock().ok().and_then(|mut queue| queue.next());
                        match band {
                            Some((row, band)) => render_band(job, palette, row as u32, band),
                            None => break,
                        }
                    });
                }
            })
            .map_err(|_| RenderError::dispatch(&self.info.name, "a worker thread panicked"))?;
        }

        RgbaImage::from_raw(width, height, pixels).ok_or_else(|| {
            RenderError::transfer("image readback", &self.info.name, "image buffer has the wrong size")
        })
    }

    fn release(self) {
        debug!(device = %self.info.name, "released");
    }
}

/// A zeroed image buffer, or a transfer error if the host cannot hold it.
fn allocate(bytes: usize, device: &str) -> Result<Vec<u8>> {
    let mut pixels = Vec::new();
    pixels
        .try_reserve_exact(bytes)
        .map_err(|e| RenderError::transfer("image allocation", device, e))?;
    pixels.resize(bytes, 0);
    Ok(pixels)
}

/// Render one band: the `row`th strip of work groups.  Pixel offsets
/// are relative to the start of the band.
fn render_band(job: &RenderJob, palette: &Palette, row: u32, band: &mut [u8]) {
    let edge = job.grid.edge;
    let width = job.params.width;
    let top = row * edge;
    for group in 0..job.grid.groups_x {
        for (local_y, local_x) in iproduct!(0..edge, 0..edge) {
            let x = group * edge + local_x;
            let color = kernel::pixel(x, top + local_y, &job.params, &job.region, palette);
            let offset = (local_y as usize * width as usize + x as usize) * 4;
            band[offset..offset + 4].copy_from_slice(&color.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RenderConfig, RenderParameters};
    use crate::planes::PlaneRegion;
    use image::Rgba;

    fn palette() -> Palette {
        Palette::from_colors((0..64).map(|i| Rgba([i * 4, 255 - i * 4, 0, 255])).collect())
            .unwrap()
    }

    fn job(width: u32, height: u32, edge: u32, depth: u32) -> RenderJob {
        let params = RenderParameters::new(width, height, depth, 20.0).unwrap();
        let region = PlaneRegion::centered(width, height, -2.0, 1.0).unwrap();
        RenderJob::new(params, region, edge).unwrap()
    }

    fn render(job: &RenderJob, threads: usize) -> RgbaImage {
        let options = DeviceOptions {
            device_index: 0,
            threads,
        };
        let palette = palette();
        let mut device = HostDevice::acquire(&options).unwrap();
        let handle = device.upload(&palette).unwrap();
        let image = device.render(job, &handle).unwrap();
        device.release();
        image
    }

    #[test]
    fn every_pixel_matches_the_kernel() {
        let job = job(32, 16, 8, 64);
        let palette = palette();
        let image = render(&job, 3);
        for (x, y, color) in image.enumerate_pixels() {
            assert_eq!(
                *color,
                kernel::pixel(x, y, &job.params, &job.region, &palette),
                "pixel {},{}",
                x,
                y
            );
        }
    }

    #[test]
    fn thread_count_does_not_change_the_image() {
        let job = job(64, 64, 16, 128);
        assert_eq!(render(&job, 1).as_raw(), render(&job, 8).as_raw());
    }

    #[test]
    fn rendering_is_repeatable() {
        let job = job(64, 32, 32, 256);
        assert_eq!(render(&job, 4).as_raw(), render(&job, 4).as_raw());
    }

    #[test]
    fn unaddressable_images_fail_to_allocate() {
        let config = RenderConfig {
            width: 4_294_967_264,
            height: 4_294_967_264,
            device: DeviceOptions {
                device_index: 0,
                threads: 2,
            },
            ..RenderConfig::default()
        };
        let job = config.job().unwrap();
        let palette = palette();
        let mut device = HostDevice::acquire(&config.device).unwrap();
        let handle = device.upload(&palette).unwrap();
        match device.render(&job, &handle) {
            Err(RenderError::Transfer { operation, .. }) => assert_eq!(operation, "image allocation"),
            other => panic!("expected a transfer error, got {:?}", other.map(|i| i.dimensions())),
        }
        device.release();
    }

    #[test]
    fn oversized_reservations_are_refused() {
        match allocate(usize::MAX, "host") {
            Err(RenderError::Transfer { device, .. }) => assert_eq!(device, "host"),
            other => panic!("expected a transfer error, got {:?}", other.map(|p| p.len())),
        }
    }

    #[test]
    fn zero_threads_is_no_device() {
        let options = DeviceOptions {
            device_index: 0,
            threads: 0,
        };
        match HostDevice::acquire(&options) {
            Err(RenderError::DeviceUnavailable { backend, .. }) => assert_eq!(backend, "host"),
            other => panic!("expected no device, got {:?}", other),
        }
    }
}
