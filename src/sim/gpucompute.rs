//! GPU side of the simulation: the ping-pong state buffers, the bind groups
//! that alternate between them, and the compute pipeline applying the rule.
//!
//! [`SimulationResources`] is shared by the windowed renderer and the headless
//! [`ComputeContext`].

use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, Buffer, BufferDescriptor, BufferUsages, CommandEncoder,
    CommandEncoderDescriptor, ComputePassDescriptor, ComputePipeline, ComputePipelineDescriptor,
    Device, PipelineLayout, PipelineLayoutDescriptor, Queue, ShaderStages,
    util::{BufferInitDescriptor, DeviceExt},
};

use crate::{
    config::{GridDescriptor, LifeConfig},
    error::LifeError,
    sim::CellGrid,
};

/// Which of the two state slots is current
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Parity(u8);

impl Parity {
    pub const EVEN: Parity = Parity(0);
    pub const ODD: Parity = Parity(1);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn flipped(self) -> Parity {
        Parity(self.0 ^ 1)
    }

    pub fn flip(&mut self) {
        *self = self.flipped();
    }
}

/// The two equally sized cell state buffers
pub struct StateSlotPair {
    slots: [Buffer; 2],
}

impl StateSlotPair {
    /// Upload `initial` into slot 0; slot 1 stays zeroed until the first
    /// dispatch writes it
    pub fn new(device: &Device, initial: &CellGrid) -> StateSlotPair {
        let slot_a = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("cell state A"),
            contents: bytemuck::cast_slice(&initial.cells),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        });
        let slot_b = device.create_buffer(&BufferDescriptor {
            label: Some("cell state B"),
            size: slot_a.size(),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        StateSlotPair {
            slots: [slot_a, slot_b],
        }
    }

    pub fn slot(&self, parity: Parity) -> &Buffer {
        &self.slots[parity.index()]
    }

    /// Size of one slot in bytes
    pub fn size(&self) -> u64 {
        self.slots[0].size()
    }
}

/// Bind groups indexed by parity: entry `p` reads slot `p` and writes slot
/// `1 - p`
pub struct BindGroupPair {
    groups: [BindGroup; 2],
}

impl BindGroupPair {
    pub fn new(
        device: &Device,
        layout: &BindGroupLayout,
        uniform: &Buffer,
        slots: &StateSlotPair,
    ) -> BindGroupPair {
        let make = |read: Parity, label: &str| {
            device.create_bind_group(&BindGroupDescriptor {
                label: Some(label),
                layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: uniform.as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: slots.slot(read).as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 2,
                        resource: slots.slot(read.flipped()).as_entire_binding(),
                    },
                ],
            })
        };
        BindGroupPair {
            groups: [
                make(Parity::EVEN, "cells bind group (A -> B)"),
                make(Parity::ODD, "cells bind group (B -> A)"),
            ],
        }
    }

    pub fn get(&self, parity: Parity) -> &BindGroup {
        &self.groups[parity.index()]
    }
}

/// Layout shared by the compute and render pipelines
pub fn create_cells_bind_group_layout(device: &Device) -> BindGroupLayout {
    let storage = |read_only| wgpu::BindingType::Buffer {
        ty: wgpu::BufferBindingType::Storage { read_only },
        has_dynamic_offset: false,
        min_binding_size: None,
    };
    device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some("cells bind group layout"),
        entries: &[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::VERTEX | ShaderStages::FRAGMENT | ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStages::VERTEX | ShaderStages::COMPUTE,
                ty: storage(true),
                count: None,
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStages::COMPUTE,
                ty: storage(false),
                count: None,
            },
        ],
    })
}

/// WGSL for the compute pass with the workgroup size filled in
fn compute_shader_source(tile_size: u32) -> String {
    include_str!("./shader.wgsl").replace("TILE_SIZE", &tile_size.to_string())
}

/// Compute pipeline applying the transition rule
pub struct SimulationStage {
    pipeline: ComputePipeline,
}

impl SimulationStage {
    pub fn new(
        device: &Device,
        layout: &PipelineLayout,
        grid: &GridDescriptor,
    ) -> SimulationStage {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("simulation compute shader"),
            source: wgpu::ShaderSource::Wgsl(compute_shader_source(grid.tile_size).into()),
        });
        let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("simulation compute pipeline"),
            layout: Some(layout),
            module: &shader,
            entry_point: Some("cs_main"),
            compilation_options: Default::default(),
            cache: None,
        });
        SimulationStage { pipeline }
    }

    /// Record one generation reading the slot selected by `bind_group`
    pub fn encode(
        &self,
        encoder: &mut CommandEncoder,
        bind_group: &BindGroup,
        workgroups: [u32; 2],
    ) {
        let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some("simulation step compute pass"),
            ..Default::default()
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(workgroups[0], workgroups[1], 1);
    }
}

/// Everything created once at startup that the simulation needs on the GPU
pub struct SimulationResources {
    pub grid: GridDescriptor,
    pub slots: StateSlotPair,
    pub bind_groups: BindGroupPair,
    pub pipeline_layout: PipelineLayout,
    pub simulation: SimulationStage,
    _uniform: Buffer,
}

impl SimulationResources {
    /// Create buffers, bind groups and the compute pipeline. Validation errors
    /// are collected here so that a broken shader fails setup instead of the
    /// first tick.
    pub async fn create(
        device: &Device,
        grid: GridDescriptor,
        initial: &CellGrid,
    ) -> Result<SimulationResources, LifeError> {
        debug_assert_eq!((initial.width, initial.height), (grid.width, grid.height));
        grid.check_limits(&device.limits())?;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let uniform = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("grid uniform buffer"),
            contents: bytemuck::bytes_of(&grid.uniform()),
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        });
        let slots = StateSlotPair::new(device, initial);
        let layout = create_cells_bind_group_layout(device);
        let bind_groups = BindGroupPair::new(device, &layout, &uniform, &slots);
        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("cells pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let simulation = SimulationStage::new(device, &pipeline_layout, &grid);

        if let Some(err) = device.pop_error_scope().await {
            return Err(LifeError::ResourceCreation {
                what: "simulation resources",
                message: err.to_string(),
            });
        }

        Ok(SimulationResources {
            grid,
            slots,
            bind_groups,
            pipeline_layout,
            simulation,
            _uniform: uniform,
        })
    }

    /// Record a dispatch reading the slot named by `parity`
    pub fn encode_step(&self, encoder: &mut CommandEncoder, parity: Parity) {
        self.simulation.encode(
            encoder,
            self.bind_groups.get(parity),
            self.grid.workgroup_counts(),
        );
    }
}

/// Seed the initial state from the config
pub fn initial_grid(config: &LifeConfig) -> CellGrid {
    let mut rng = match config.seed {
        Some(seed) => fastrand::Rng::with_seed(seed),
        None => fastrand::Rng::new(),
    };
    CellGrid::random(
        config.grid.width,
        config.grid.height,
        config.alive_probability,
        &mut rng,
    )
}

/// Request a device able to run the simulation, failing with a capability
/// error when the adapter can't
pub async fn request_device(adapter: &wgpu::Adapter) -> Result<(Device, Queue), LifeError> {
    let downlevel_caps = adapter.get_downlevel_capabilities();
    if !downlevel_caps
        .flags
        .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
    {
        return Err(LifeError::Capability(
            "adapter does not support compute shaders".into(),
        ));
    }
    if !downlevel_caps
        .flags
        .contains(wgpu::DownlevelFlags::VERTEX_STORAGE)
    {
        return Err(LifeError::Capability(
            "adapter does not support storage buffers in vertex shaders".into(),
        ));
    }

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("gpulife device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::Off,
        })
        .await?;
    Ok((device, queue))
}

/// Headless simulation without a surface, for benchmarking and for checking
/// the shader against [`CellGrid::step`]
pub struct ComputeContext {
    resources: SimulationResources,
    parity: Parity,
    steps: u64,
    queue: Queue,
    device: Device,
}

impl ComputeContext {
    pub async fn create(config: &LifeConfig) -> Result<Self, LifeError> {
        Self::create_with_state(config.grid, &initial_grid(config)).await
    }

    pub async fn create_with_state(
        grid: GridDescriptor,
        initial: &CellGrid,
    ) -> Result<Self, LifeError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await?;
        log::info!("Using adapter: {:?}", adapter.get_info());
        let (device, queue) = request_device(&adapter).await?;
        let resources = SimulationResources::create(&device, grid, initial).await?;
        Ok(Self {
            resources,
            parity: Parity::EVEN,
            steps: 0,
            queue,
            device,
        })
    }

    /// Dispatch one generation and make its output current
    pub fn compute_step(&mut self) {
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("compute encoder"),
            });
        self.resources.encode_step(&mut encoder, self.parity);
        self.queue.submit(std::iter::once(encoder.finish()));
        self.parity.flip();
        self.steps += 1;
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Block until every submitted step has finished on the GPU
    pub fn wait_idle(&self) -> Result<(), LifeError> {
        self.device.poll(wgpu::PollType::wait_indefinitely())?;
        Ok(())
    }

    /// Copy the current slot back to the host
    pub async fn read_current(&self) -> Result<CellGrid, LifeError> {
        let size = self.resources.slots.size();
        let staging = self.device.create_buffer(&BufferDescriptor {
            label: Some("cell readback buffer"),
            size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_buffer_to_buffer(self.resources.slots.slot(self.parity), 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::PollType::wait_indefinitely())?;
        rx.receive()
            .await
            .ok_or_else(|| LifeError::Readback("map callback dropped".into()))?
            .map_err(|e| LifeError::Readback(e.to_string()))?;

        let cells = {
            let view = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, u32>(&view).to_vec()
        };
        staging.unmap();

        let grid = self.resources.grid;
        Ok(CellGrid {
            width: grid.width,
            height: grid.height,
            cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parity_flips() {
        let mut parity = Parity::default();
        assert_eq!(parity, Parity::EVEN);
        assert_eq!(parity.index(), 0);
        parity.flip();
        assert_eq!(parity, Parity::ODD);
        assert_eq!(parity.index(), 1);
        assert_eq!(parity.flipped(), Parity::EVEN);
    }

    #[test]
    fn test_compute_shader_validates() {
        use wgpu::naga::valid::{Capabilities, ValidationFlags, Validator};

        for tile_size in [1, 8, 16] {
            let source = compute_shader_source(tile_size);
            assert!(!source.contains("TILE_SIZE"));
            let module = wgpu::naga::front::wgsl::parse_str(&source)
                .unwrap_or_else(|e| panic!("{}", e.emit_to_string(&source)));
            Validator::new(ValidationFlags::all(), Capabilities::all())
                .validate(&module)
                .unwrap_or_else(|e| panic!("tile {tile_size}: {e:?}"));

            let entry = module
                .entry_points
                .iter()
                .find(|ep| ep.name == "cs_main")
                .expect("cs_main entry point");
            assert_eq!(entry.workgroup_size, [tile_size, tile_size, 1]);
        }
    }

    #[test]
    fn test_initial_grid_uses_seed() {
        let config = LifeConfig {
            grid: GridDescriptor::new(32, 24, 8).unwrap(),
            seed: Some(99),
            ..Default::default()
        };
        let a = initial_grid(&config);
        assert_eq!(a, initial_grid(&config));
        assert_eq!(a.cells.len(), 32 * 24);
    }

    fn gpu_context(grid: GridDescriptor, initial: &CellGrid) -> Option<ComputeContext> {
        match pollster::block_on(ComputeContext::create_with_state(grid, initial)) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                None
            }
        }
    }

    #[test]
    fn test_gpu_matches_cpu_reference() {
        // Not a multiple of the tile size, so partial tiles are exercised
        let grid = GridDescriptor::new(37, 29, 8).unwrap();
        let initial = CellGrid::random(37, 29, 0.4, &mut fastrand::Rng::with_seed(3));
        let Some(mut ctx) = gpu_context(grid, &initial) else {
            return;
        };

        assert_eq!(pollster::block_on(ctx.read_current()).unwrap(), initial);
        let mut expected = initial;
        for _ in 0..12 {
            ctx.compute_step();
            expected = expected.step();
            assert_eq!(pollster::block_on(ctx.read_current()).unwrap(), expected);
        }
        assert_eq!(ctx.steps(), 12);
    }

    #[test]
    fn test_gpu_isolated_cell_dies() {
        let grid = GridDescriptor::new(8, 8, 4).unwrap();
        let mut initial = CellGrid::new(8, 8);
        initial.set(0, 0, true);
        let Some(mut ctx) = gpu_context(grid, &initial) else {
            return;
        };
        ctx.compute_step();
        ctx.wait_idle().unwrap();
        assert_eq!(pollster::block_on(ctx.read_current()).unwrap().population(), 0);
    }
}
