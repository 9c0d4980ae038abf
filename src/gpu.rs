//! Windowed GPU context: simulation and rendering on one device
//!
//! `GpuLifeRenderer` owns the surface, device and queue together with the
//! simulation resources and the render stage, and executes one
//! [`TickPlan`] per timer tick as a single command buffer.

use std::sync::Arc;

use wgpu::{
    CommandEncoderDescriptor, Device, Instance, Queue, Surface, SurfaceConfiguration,
    TextureUsages, TextureViewDescriptor,
};
use winit::window::Window;

use crate::{
    config::LifeConfig,
    error::LifeError,
    rendering::{RenderStage, VERTEX_COUNT},
    scheduler::{TickPlan, now_ms},
    sim::gpucompute::{Parity, SimulationResources, initial_grid, request_device},
};

/// How often the measured tick rate is logged
const TICK_LOG_INTERVAL_MS: f64 = 2000.0;

pub struct GpuLifeRenderer {
    #[allow(dead_code)]
    instance: Instance, // Keep instance alive for the lifetime of the renderer
    device: Device,
    queue: Queue,
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,
    resources: SimulationResources,
    render: RenderStage,
    window: Arc<Window>,
    /// For debug logging: time of last tick rate log
    last_tick_log_time: f64,
    /// For debug logging: ticks since last log
    ticks_since_last_log: u32,
}

impl GpuLifeRenderer {
    /// Acquire adapter and device for `window`, seed the grid and build both
    /// pipelines
    pub async fn new(window: Arc<Window>, config: &LifeConfig) -> Result<Self, anyhow::Error> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());

        // Create surface first to find compatible adapter
        let surface = instance
            .create_surface(window.clone())
            .map_err(LifeError::from)?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: Some(&surface),
            })
            .await
            .map_err(LifeError::from)?;

        log::info!("Using adapter: {:?}", adapter.get_info());

        let (device, queue) = request_device(&adapter).await?;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or(surface_caps.formats.first())
            .copied()
            .ok_or_else(|| LifeError::Capability("surface reports no texture formats".into()))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let initial = initial_grid(config);
        log::info!(
            "Seeded {}x{} grid with {} live cells",
            config.grid.width,
            config.grid.height,
            initial.population()
        );

        let resources = SimulationResources::create(&device, config.grid, &initial).await?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let render = RenderStage::new(
            &device,
            &resources.pipeline_layout,
            surface_format,
            config.geometry,
            config.clear_color,
        );
        if let Some(err) = device.pop_error_scope().await {
            return Err(LifeError::ResourceCreation {
                what: "render pipeline",
                message: err.to_string(),
            }
            .into());
        }

        Ok(Self {
            instance,
            device,
            queue,
            surface,
            surface_config,
            resources,
            render,
            window,
            last_tick_log_time: 0.0,
            ticks_since_last_log: 0,
        })
    }

    /// Request a redraw of the window
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    /// Encode the compute pass and the render pass of `plan` into one command
    /// buffer and submit it. Nothing is encoded if no surface image is
    /// available.
    pub fn execute(&mut self, plan: &TickPlan) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("tick encoder"),
            });

        let bind_groups = &self.resources.bind_groups;
        self.resources.simulation.encode(
            &mut encoder,
            bind_groups.get(plan.compute_bind_group),
            plan.workgroups,
        );
        self.render.encode(
            &mut encoder,
            &view,
            bind_groups.get(plan.render_bind_group),
            plan.vertex_count,
            plan.instance_count,
        );

        self.queue.submit(std::iter::once(encoder.finish()));
        self.window.pre_present_notify();
        output.present();

        log::trace!("submitted tick {}", plan.step);
        self.record_tick();
        Ok(())
    }

    /// Draw the slot `current` without advancing the simulation
    pub fn render_current(&self, current: Parity) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("render encoder"),
            });
        self.render.encode(
            &mut encoder,
            &view,
            self.resources.bind_groups.get(current),
            VERTEX_COUNT,
            self.resources.grid.cell_count(),
        );

        self.queue.submit(std::iter::once(encoder.finish()));
        self.window.pre_present_notify();
        output.present();
        Ok(())
    }

    /// Resize the render surface
    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.surface_config.width = width;
            self.surface_config.height = height;
            self.surface.configure(&self.device, &self.surface_config);
        }
    }

    /// Reconfigure the surface with its current size after it was lost
    pub fn reconfigure(&mut self) {
        log::info!(
            "Reconfiguring surface at {}x{}",
            self.surface_config.width,
            self.surface_config.height
        );
        self.surface.configure(&self.device, &self.surface_config);
    }

    fn record_tick(&mut self) {
        let now = now_ms();
        self.ticks_since_last_log += 1;
        if self.last_tick_log_time == 0.0 {
            self.last_tick_log_time = now;
        } else if now - self.last_tick_log_time >= TICK_LOG_INTERVAL_MS {
            let elapsed_sec = (now - self.last_tick_log_time) / 1000.0;
            log::debug!(
                "Actual tick rate: {:.1} ticks/sec, {} ticks in {:.1}s",
                self.ticks_since_last_log as f64 / elapsed_sec,
                self.ticks_since_last_log,
                elapsed_sec
            );
            self.last_tick_log_time = now;
            self.ticks_since_last_log = 0;
        }
    }
}
