// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The shader back end: a WGSL compute shader through wgpu.
//!
//! The device and queue live on the orchestrator and go away with it;
//! there is no window and no global context.  WGSL fixes the work-group
//! size at compile time, so a pipeline is built the first time a given
//! edge length is asked for and kept for the life of the device.

use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use image::RgbaImage;
use pollster::block_on;
use tracing::{debug, info};
use wgpu::util::DeviceExt;

use crate::config::{Backend, DeviceOptions, RenderJob};
use crate::device::{check_group_limit, DeviceInfo, DeviceOrchestrator};
use crate::error::{RenderError, Result};
use crate::kernel::WGSL_SOURCE;
use crate::palette::Palette;

/// Kernel arguments, laid out as the shader's `Params` uniform.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
struct KernelParams {
    cmin: [f32; 2],
    cdelta: [f32; 2],
    size: [u32; 2],
    max_depth: u32,
    palette_len: u32,
    scale_force: f32,
    _pad: [u32; 3],
}

/// A wgpu adapter with compute support, and the pipelines built on it.
pub struct ShaderDevice {
    info: DeviceInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: wgpu::Limits,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: Vec<(u32, wgpu::ComputePipeline)>,
}

/// The palette as a read-only storage buffer.
pub struct ShaderPalette {
    buffer: wgpu::Buffer,
    len: u32,
}

impl DeviceOrchestrator for ShaderDevice {
    type PaletteHandle = ShaderPalette;

    const BACKEND: Backend = Backend::Shader;

    fn acquire(options: &DeviceOptions) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .filter(|adapter| {
                adapter
                    .get_downlevel_capabilities()
                    .flags
                    .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
            })
            .nth(options.device_index)
            .ok_or_else(|| {
                RenderError::unavailable(
                    "shader",
                    format!(
                        "no compute-capable adapter at index {}",
                        options.device_index
                    ),
                )
            })?;

        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("mandelbrot-device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
            },
            None,
        ))
        .map_err(|e| RenderError::unavailable("shader", e))?;

        let info = DeviceInfo {
            backend: Backend::Shader,
            vendor: format!("{:?} 0x{:04x}", adapter_info.backend, adapter_info.vendor),
            name: adapter_info.name.clone(),
            version: format!("{} {}", adapter_info.driver, adapter_info.driver_info)
                .trim()
                .to_string(),
            compute_units: None,
            max_work_group_invocations: Some(limits.max_compute_invocations_per_workgroup),
            max_work_group_size: Some([
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ]),
            max_work_group_count: Some([limits.max_compute_workgroups_per_dimension; 3]),
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("mandelbrot-bind-group-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<KernelParams>() as u64,
                        ),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("mandelbrot-pipeline-layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        info!(adapter = %info.name, backend = ?adapter_info.backend, "shader device acquired");
        Ok(ShaderDevice {
            info,
            device,
            queue,
            limits,
            bind_group_layout,
            pipeline_layout,
            pipelines: Vec::new(),
        })
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn upload(&mut self, palette: &Palette) -> Result<ShaderPalette> {
        let words = palette.to_words();
        check_storage_size(
            &self.limits,
            (words.len() * 4) as u64,
            "palette upload",
            &self.info.name,
        )?;
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mandelbrot-palette"),
            contents: bytemuck::cast_slice(&words),
            usage: wgpu::BufferUsages::STORAGE,
        });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(RenderError::transfer("palette upload", &self.info.name, err));
        }
        debug!(colors = words.len(), "palette uploaded");
        Ok(ShaderPalette {
            buffer,
            len: words.len() as u32,
        })
    }

    fn render(&mut self, job: &RenderJob, palette: &ShaderPalette) -> Result<RgbaImage> {
        check_group_limit(&self.info, job)?;
        self.check_limits(job)?;
        let pipeline = self.pipeline_for(job.grid.edge)?;

        let params = KernelParams {
            cmin: [job.region.min.re, job.region.min.im],
            cdelta: [job.region.delta.re, job.region.delta.im],
            size: [job.params.width, job.params.height],
            max_depth: job.params.max_depth,
            palette_len: palette.len,
            scale_force: job.params.scale_force,
            _pad: [0; 3],
        };
        let output_size = job.params.image_bytes()? as u64;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let params_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mandelbrot-params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mandelbrot-output"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mandelbrot-readback"),
            size: output_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(RenderError::transfer("image allocation", &self.info.name, err));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("mandelbrot-bind-group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: palette.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: output_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("mandelbrot-encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("mandelbrot-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipelines[pipeline].1);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(job.grid.groups_x, job.grid.groups_y, 1);
        }
        encoder.copy_buffer_to_buffer(&output_buffer, 0, &readback_buffer, 0, output_size);
        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(RenderError::dispatch(&self.info.name, err));
        }
        debug!(
            groups_x = job.grid.groups_x,
            groups_y = job.grid.groups_y,
            "dispatched"
        );

        let slice = readback_buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = sender.send(r);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        match receiver.recv() {
            Ok(Ok(())) => (),
            Ok(Err(e)) => return Err(RenderError::transfer("image readback", &self.info.name, e)),
            Err(e) => return Err(RenderError::transfer("image readback", &self.info.name, e)),
        }

        let bytes = slice.get_mapped_range().to_vec();
        readback_buffer.unmap();

        RgbaImage::from_raw(job.params.width, job.params.height, bytes).ok_or_else(|| {
            RenderError::transfer("image readback", &self.info.name, "short read")
        })
    }

    fn release(self) {
        let _ = self.device.poll(wgpu::Maintain::Wait);
        debug!(device = %self.info.name, pipelines = self.pipelines.len(), "released");
    }
}

impl ShaderDevice {
    /// The limits wgpu would otherwise turn into a validation panic.
    fn check_limits(&self, job: &RenderJob) -> Result<()> {
        let edge = job.grid.edge;
        if edge > self.limits.max_compute_workgroup_size_x
            || edge > self.limits.max_compute_workgroup_size_y
        {
            return Err(RenderError::dispatch(
                &self.info.name,
                format!("work-group edge {} exceeds the device limit", edge),
            ));
        }
        let most_groups = job.grid.groups_x.max(job.grid.groups_y);
        if most_groups > self.limits.max_compute_workgroups_per_dimension {
            return Err(RenderError::dispatch(
                &self.info.name,
                format!(
                    "{} work groups per dimension exceeds the device limit of {}",
                    most_groups, self.limits.max_compute_workgroups_per_dimension
                ),
            ));
        }
        let bytes = job.params.image_bytes()? as u64;
        check_storage_size(&self.limits, bytes, "image allocation", &self.info.name)
    }

    /// Index of the pipeline for work groups of `edge`, compiling it on
    /// first use.
    fn pipeline_for(&mut self, edge: u32) -> Result<usize> {
        if let Some(found) = self.pipelines.iter().position(|(e, _)| *e == edge) {
            return Ok(found);
        }
        let pipeline = self.compile(&WGSL_SOURCE.replace("{{WORKGROUP_SIZE}}", &edge.to_string()))?;
        debug!(edge, "compiled compute pipeline");
        self.pipelines.push((edge, pipeline));
        Ok(self.pipelines.len() - 1)
    }

    fn compile(&self, source: &str) -> Result<wgpu::ComputePipeline> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("mandelbrot-kernel"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("mandelbrot-pipeline"),
                layout: Some(&self.pipeline_layout),
                module: &module,
                entry_point: "main",
            });
        match block_on(self.device.pop_error_scope()) {
            Some(err) => Err(RenderError::KernelBuild {
                device: self.info.name.clone(),
                log: err.to_string(),
            }),
            None => Ok(pipeline),
        }
    }
}

/// Refuse a storage buffer the device could not create or bind.
fn check_storage_size(
    limits: &wgpu::Limits,
    bytes: u64,
    operation: &'static str,
    device: &str,
) -> Result<()> {
    let most = limits
        .max_buffer_size
        .min(u64::from(limits.max_storage_buffer_binding_size));
    if bytes > most {
        return Err(RenderError::transfer(
            operation,
            device,
            format!("{} bytes exceeds the device's buffer limit of {}", bytes, most),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderParameters;
    use crate::kernel::INSIDE;
    use crate::planes::PlaneRegion;
    use image::Rgba;

    /// A device if the machine has one; tests without one pass vacuously.
    fn device() -> Option<ShaderDevice> {
        match ShaderDevice::acquire(&DeviceOptions::default()) {
            Ok(device) => Some(device),
            Err(e) => {
                eprintln!("skipping: {}", e);
                None
            }
        }
    }

    fn palette() -> Palette {
        Palette::from_colors((0..16).map(|i| Rgba([i * 16, 0, 0, 255])).collect()).unwrap()
    }

    #[test]
    fn oversized_palettes_are_refused_before_upload() {
        let limits = wgpu::Limits::default();
        // An 8192x8193 palette image.
        let bytes = 8192 * 8193 * 4;
        match check_storage_size(&limits, bytes, "palette upload", "test-adapter") {
            Err(RenderError::Transfer { operation, device, .. }) => {
                assert_eq!(operation, "palette upload");
                assert_eq!(device, "test-adapter");
            }
            other => panic!("expected a transfer error, got {:?}", other),
        }
        assert!(check_storage_size(&limits, 256 * 4, "palette upload", "test-adapter").is_ok());
    }

    #[test]
    fn binding_limit_applies_as_well_as_buffer_limit() {
        let limits = wgpu::Limits::default();
        let over_binding = u64::from(limits.max_storage_buffer_binding_size) + 4;
        assert!(over_binding <= limits.max_buffer_size);
        assert!(check_storage_size(&limits, over_binding, "image allocation", "test").is_err());
    }

    #[test]
    fn tiny_image_has_both_classes() {
        let mut device = match device() {
            Some(device) => device,
            None => return,
        };
        let params = RenderParameters::new(4, 4, 1, 20.0).unwrap();
        let region = PlaneRegion::centered(4, 4, -2.0, 1.0).unwrap();
        let job = RenderJob::new(params, region, 2).unwrap();
        let palette = palette();
        let handle = device.upload(&palette).unwrap();
        let image = device.render(&job, &handle).unwrap();
        assert_eq!(*image.get_pixel(0, 0), palette.colors()[15]);
        assert_eq!(*image.get_pixel(2, 1), INSIDE);
        device.release();
    }

    #[test]
    fn repeated_renders_are_identical() {
        let mut device = match device() {
            Some(device) => device,
            None => return,
        };
        let params = RenderParameters::new(64, 64, 256, 20.0).unwrap();
        let region = PlaneRegion::centered(64, 64, -2.0, 1.0).unwrap();
        let job = RenderJob::new(params, region, 8).unwrap();
        let handle = device.upload(&palette()).unwrap();
        let first = device.render(&job, &handle).unwrap();
        let second = device.render(&job, &handle).unwrap();
        assert_eq!(first.as_raw(), second.as_raw());
        assert_eq!(device.pipelines.len(), 1);
    }

    #[test]
    fn broken_shader_is_a_build_error() {
        let device = match device() {
            Some(device) => device,
            None => return,
        };
        match device.compile("@compute @workgroup_size(1) fn main() { let x = ; }") {
            Err(RenderError::KernelBuild { log, .. }) => assert!(!log.is_empty()),
            Err(other) => panic!("expected a build error, got {:?}", other),
            Ok(_) => panic!("a broken shader compiled"),
        }
    }
}
