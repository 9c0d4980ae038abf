use std::sync::Arc;

use crate::{
    config::LifeConfig,
    gpu::GpuLifeRenderer,
    scheduler::{StepScheduler, TickError},
};
use wasm_bindgen::prelude::*;
#[cfg(target_arch = "wasm32")]
use web_sys::HtmlCanvasElement;
use winit::{
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop, EventLoopProxy},
    window::WindowAttributes,
};

#[cfg(target_arch = "wasm32")]
use winit::platform::web::WindowAttributesExtWebSys;

pub mod config;
pub mod error;
pub mod gpu;
pub mod rendering;
pub mod scheduler;
pub mod sim;

/// Events posted to the event loop from outside the window
pub enum LifeEvent {
    Initialized(GpuLifeRenderer),
    Error(String),
    /// The web tick timer fired
    Tick,
}

struct Application {
    config: LifeConfig,
    proxy: EventLoopProxy<LifeEvent>,
    renderer: Option<GpuLifeRenderer>,
    scheduler: StepScheduler,
    requested_renderer: bool,
    /// Set when startup failed; the loop exits and the error is reported
    fatal: Option<String>,
    #[cfg(not(target_arch = "wasm32"))]
    clock: scheduler::TickClock,
    #[cfg(target_arch = "wasm32")]
    timer: Option<gloo_timers::callback::Interval>,
}

impl Application {
    fn new(event_loop: &EventLoop<LifeEvent>, config: LifeConfig) -> Self {
        Self {
            proxy: event_loop.create_proxy(),
            renderer: None,
            scheduler: StepScheduler::new(config.grid),
            requested_renderer: false,
            fatal: None,
            #[cfg(not(target_arch = "wasm32"))]
            clock: scheduler::TickClock::new(config.tick_interval),
            #[cfg(target_arch = "wasm32")]
            timer: None,
            config,
        }
    }

    /// A timer fire: queue a tick and ask for the frame that will run it
    fn on_timer(&mut self) {
        if let Some(ref renderer) = self.renderer
            && self.scheduler.request_tick()
        {
            renderer.request_redraw();
        }
    }

    #[cfg(target_arch = "wasm32")]
    fn start_timer(&mut self) {
        let proxy = self.proxy.clone();
        let millis = self.config.tick_interval.as_millis();
        let period_ms = millis.clamp(1, u32::MAX as u128) as u32;
        self.timer = Some(gloo_timers::callback::Interval::new(period_ms, move || {
            let _ = proxy.send_event(LifeEvent::Tick);
        }));
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(ref mut renderer) = self.renderer else {
            return;
        };

        let result = match self.scheduler.run_pending(|plan| renderer.execute(plan)) {
            Ok(Some(_)) => Ok(()),
            // Exposed or resized without a tick pending
            Ok(None) => renderer
                .render_current(self.scheduler.current_slot())
                .map_err(TickError::Execute),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {}
            Err(TickError::Execute(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated)) => {
                renderer.reconfigure();
            }
            Err(TickError::Execute(wgpu::SurfaceError::OutOfMemory)) => {
                log::error!("Out of memory!");
                event_loop.exit();
            }
            Err(e) => log::warn!("Skipped tick: {e}"),
        }
    }
}

impl winit::application::ApplicationHandler<LifeEvent> for Application {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.requested_renderer {
            return;
        }
        self.requested_renderer = true;

        #[cfg(target_arch = "wasm32")]
        let window_attrs = {
            let canvas: Option<HtmlCanvasElement> = web_sys::window()
                .and_then(|w| w.document())
                .and_then(|d| d.query_selector("canvas").ok().flatten())
                .and_then(|e| e.dyn_into().ok());
            if canvas.is_none() {
                log::warn!("no <canvas> element found, winit will create one");
            }
            WindowAttributes::default()
                .with_title("gpulife")
                .with_canvas(canvas)
        };
        #[cfg(not(target_arch = "wasm32"))]
        let window_attrs = WindowAttributes::default().with_title("gpulife");

        let window = match event_loop.create_window(window_attrs) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                log::error!("failed to create window: {e}");
                self.fatal = Some(e.to_string());
                event_loop.exit();
                return;
            }
        };

        let proxy = self.proxy.clone();
        let config = self.config.clone();

        #[cfg(target_arch = "wasm32")]
        wasm_bindgen_futures::spawn_local(async move {
            let event = match GpuLifeRenderer::new(window, &config).await {
                Ok(renderer) => LifeEvent::Initialized(renderer),
                Err(e) => LifeEvent::Error(format!("{e:#}")),
            };
            let _ = proxy.send_event(event);
        });

        #[cfg(not(target_arch = "wasm32"))]
        {
            // On native, use pollster to block on the future
            let event = match pollster::block_on(GpuLifeRenderer::new(window, &config)) {
                Ok(renderer) => LifeEvent::Initialized(renderer),
                Err(e) => LifeEvent::Error(format!("{e:#}")),
            };
            let _ = proxy.send_event(event);
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                log::info!("Stopping after {} ticks", self.scheduler.completed_steps());
                self.renderer = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(ref mut renderer) = self.renderer {
                    renderer.resize(size.width, size.height);
                    renderer.request_redraw();
                }
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => (),
        };
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: LifeEvent) {
        match event {
            LifeEvent::Initialized(renderer) => {
                log::info!(
                    "GPU renderer initialized, ticking every {}",
                    humantime::format_duration(self.config.tick_interval)
                );
                renderer.request_redraw();
                self.renderer = Some(renderer);
                #[cfg(target_arch = "wasm32")]
                self.start_timer();
            }
            LifeEvent::Error(e) => {
                log::error!("GPU initialization error: {e}");
                self.fatal = Some(e);
                event_loop.exit();
            }
            LifeEvent::Tick => self.on_timer(),
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        use winit::event_loop::ControlFlow;

        if self.renderer.is_none() {
            return;
        }
        let now = scheduler::now_ms();
        if self.clock.poll(now) {
            self.on_timer();
        }
        let wait = self.clock.time_until_due(scheduler::now_ms());
        event_loop.set_control_flow(ControlFlow::WaitUntil(std::time::Instant::now() + wait));
    }
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn initialize() {
    console_error_panic_hook::set_once();
    let _ = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Debug)
        .level_for("wgpu_core", log::LevelFilter::Warn)
        .level_for("wgpu_hal", log::LevelFilter::Warn)
        .chain(fern::Output::call(console_log::log))
        .apply();
}

/// Log to stderr with RFC 3339 timestamps
#[cfg(not(target_arch = "wasm32"))]
pub fn init_native_logging(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("wgpu_core", log::LevelFilter::Warn)
        .level_for("wgpu_hal", log::LevelFilter::Warn)
        .level_for("naga", log::LevelFilter::Warn)
        .chain(std::io::stderr())
        .apply()
}

/// Start the simulation with the default configuration
#[wasm_bindgen]
pub fn start() {
    if let Err(e) = start_with_config(LifeConfig::default()) {
        log::error!("{e:#}");
    }
}

/// Create the event loop and run the simulation until the window closes
///
/// On the web this returns as soon as the loop is spawned.
pub fn start_with_config(config: LifeConfig) -> Result<(), anyhow::Error> {
    config.validate()?;
    log::info!(
        "Starting {}x{} simulation, tile {}, interval {}",
        config.grid.width,
        config.grid.height,
        config.grid.tile_size,
        humantime::format_duration(config.tick_interval)
    );

    let event_loop = EventLoop::<LifeEvent>::with_user_event().build()?;

    #[allow(unused_mut)]
    let mut app = Application::new(&event_loop, config);

    // On web, we need to spawn the event loop
    #[cfg(target_arch = "wasm32")]
    {
        use winit::platform::web::EventLoopExtWebSys;
        event_loop.spawn_app(app);
        Ok(())
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        event_loop.run_app(&mut app)?;
        match app.fatal {
            Some(e) => Err(anyhow::anyhow!(e)),
            None => Ok(()),
        }
    }
}
