// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The render driver: configuration in, image file out.
//!
//! The device is released whether or not the render succeeded, and the
//! output file is only written once a complete image is in hand.

use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, Instant};

use image::{ColorType, ImageFormat, RgbaImage};
use tracing::{info, info_span};

use crate::config::{Backend, DeviceOptions, RenderConfig, RenderJob};
use crate::device::{DeviceInfo, DeviceOrchestrator, HostDevice};
use crate::error::{RenderError, Result};
use crate::palette::Palette;

/// A finished render.
#[derive(Debug)]
pub struct Rendered {
    /// The image.
    pub image: RgbaImage,
    /// Wall-clock time from acquiring the device to having the image
    /// back on the host.  File I/O is not included.
    pub elapsed: Duration,
    /// The device that did the work.
    pub device: DeviceInfo,
}

/// Render one job on a device of type `O`.
pub fn render_with<O: DeviceOrchestrator>(
    options: &DeviceOptions,
    job: &RenderJob,
    palette: &Palette,
) -> Result<Rendered> {
    render_reporting::<O, _>(options, job, palette, |_| ())
}

/// Render one job on a device of type `O`, handing the device's
/// description to `report` as soon as it is acquired.  Time spent in
/// `report` is not counted in `Rendered::elapsed`.
pub fn render_reporting<O, F>(
    options: &DeviceOptions,
    job: &RenderJob,
    palette: &Palette,
    report: F,
) -> Result<Rendered>
where
    O: DeviceOrchestrator,
    F: FnOnce(&DeviceInfo),
{
    let span = info_span!(
        "render",
        backend = %O::BACKEND,
        width = job.params.width,
        height = job.params.height
    );
    let _entered = span.enter();

    let start = Instant::now();
    let mut device = O::acquire(options)?;
    let info = device.info().clone();
    info!(
        device = %info.name,
        vendor = %info.vendor,
        description = %info,
        "device acquired"
    );

    let reporting = Instant::now();
    report(&info);
    let reported = reporting.elapsed();

    let outcome = upload_and_render(&mut device, job, palette);
    let elapsed = start.elapsed().saturating_sub(reported);
    device.release();

    let image = outcome?;
    info!(elapsed_ms = elapsed.as_millis() as u64, "render complete");
    Ok(Rendered {
        image,
        elapsed,
        device: info,
    })
}

fn upload_and_render<O: DeviceOrchestrator>(
    device: &mut O,
    job: &RenderJob,
    palette: &Palette,
) -> Result<RgbaImage> {
    let handle = device.upload(palette)?;
    device.render(job, &handle)
}

/// Render one job on the named back end, reporting the device as
/// `render_reporting` does.
pub fn render_on<F: FnOnce(&DeviceInfo)>(
    backend: Backend,
    options: &DeviceOptions,
    job: &RenderJob,
    palette: &Palette,
    report: F,
) -> Result<Rendered> {
    match backend {
        Backend::Host => render_reporting::<HostDevice, _>(options, job, palette, report),
        #[cfg(feature = "shader")]
        Backend::Shader => {
            render_reporting::<crate::device::ShaderDevice, _>(options, job, palette, report)
        }
        #[cfg(feature = "opencl")]
        Backend::OpenCl => {
            render_reporting::<crate::device::OpenClDevice, _>(options, job, palette, report)
        }
        #[cfg(feature = "cuda")]
        Backend::Cuda => {
            render_reporting::<crate::device::CudaDevice, _>(options, job, palette, report)
        }
        #[allow(unreachable_patterns)]
        other => Err(RenderError::unavailable(
            other.name(),
            format!("this build does not include the `{}` feature", other.name()),
        )),
    }
}

/// Validate the configuration, load the palette, render, and write the
/// image.
pub fn run(config: &RenderConfig) -> Result<Rendered> {
    run_reporting(config, |_| ())
}

/// `run`, handing the device's description to `report` once the device
/// is acquired and before any work is sent to it.
pub fn run_reporting<F: FnOnce(&DeviceInfo)>(config: &RenderConfig, report: F) -> Result<Rendered> {
    let job = config.job()?;
    let palette = Palette::load(&config.palette)?;
    info!(
        palette = %config.palette.display(),
        colors = palette.len(),
        "palette loaded"
    );
    let rendered = render_on(config.backend, &config.device, &job, &palette, report)?;
    write_image(&config.output, &rendered.image)?;
    info!(output = %config.output.display(), "image written");
    Ok(rendered)
}

/// Encode the image in the format its extension names and write it.
/// Nothing is written unless encoding succeeded, and a write that fails
/// partway does not leave a truncated file behind.
pub fn write_image(path: &Path, image: &RgbaImage) -> Result<()> {
    let failed = |reason: String| RenderError::ImageWrite {
        path: path.display().to_string(),
        reason,
    };

    let format = ImageFormat::from_path(path).map_err(|e| failed(e.to_string()))?;
    let mut encoded = Cursor::new(Vec::new());
    image::write_buffer_with_format(
        &mut encoded,
        image.as_raw(),
        image.width(),
        image.height(),
        ColorType::Rgba8,
        format,
    )
    .map_err(|e| failed(e.to_string()))?;

    if let Err(e) = fs::write(path, encoded.get_ref()) {
        let _ = fs::remove_file(path);
        return Err(failed(e.to_string()));
    }
    Ok(())
}
