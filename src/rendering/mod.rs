//! Instanced cell drawing
//!
//! Every cell is one instance of a small quad. The quad is placed by the
//! instance index and, with [`CellGeometry::StateScaled`], scaled by the cell
//! state so dead cells shrink to a point instead of being skipped.

use wgpu::{
    BindGroup, Buffer, BufferUsages, CommandEncoder, Device, FragmentState, LoadOp,
    MultisampleState, Operations, PipelineLayout, PrimitiveState, RenderPassColorAttachment,
    RenderPassDescriptor, RenderPipeline, RenderPipelineDescriptor, StoreOp, TextureFormat,
    TextureView, VertexState,
    util::{BufferInitDescriptor, DeviceExt},
};

use crate::config::{CellGeometry, GridDescriptor};

/// Two triangles covering a square with corners at ±0.8
pub const SQUARE_VERTICES: [[f32; 2]; 6] = [
    [-0.8, -0.8],
    [0.8, -0.8],
    [0.8, 0.8],
    [-0.8, -0.8],
    [0.8, 0.8],
    [-0.8, 0.8],
];

const RENDER_SHADER: &str = include_str!("./render.wgsl");

pub const VERTEX_COUNT: u32 = SQUARE_VERTICES.len() as u32;

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x2];

fn vertex_buffer_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &VERTEX_ATTRIBUTES,
    }
}

impl CellGeometry {
    fn vertex_entry_point(self) -> &'static str {
        match self {
            CellGeometry::StateScaled => "vs_state_scaled",
            CellGeometry::Static => "vs_static",
        }
    }
}

/// Render pipeline and the quad mesh it instances
pub struct RenderStage {
    pipeline: RenderPipeline,
    vertex_buffer: Buffer,
    clear_color: wgpu::Color,
}

impl RenderStage {
    pub fn new(
        device: &Device,
        layout: &PipelineLayout,
        format: TextureFormat,
        geometry: CellGeometry,
        clear_color: wgpu::Color,
    ) -> RenderStage {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("cell render shader"),
            source: wgpu::ShaderSource::Wgsl(RENDER_SHADER.into()),
        });

        let vertex_buffer = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("cell vertices"),
            contents: bytemuck::cast_slice(&SQUARE_VERTICES),
            usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
        });

        let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("cell render pipeline"),
            layout: Some(layout),
            vertex: VertexState {
                module: &shader,
                entry_point: Some(geometry.vertex_entry_point()),
                buffers: &[vertex_buffer_layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });

        RenderStage {
            pipeline,
            vertex_buffer,
            clear_color,
        }
    }

    /// Clear `view` and draw `instance_count` cells reading the state bound
    /// in `bind_group`
    pub fn encode(
        &self,
        encoder: &mut CommandEncoder,
        view: &TextureView,
        bind_group: &BindGroup,
        vertex_count: u32,
        instance_count: u32,
    ) {
        let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("cell render pass"),
            color_attachments: &[Some(RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: Operations {
                    load: LoadOp::Clear(self.clear_color),
                    store: StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        render_pass.set_pipeline(&self.pipeline);
        render_pass.set_bind_group(0, bind_group, &[]);
        render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
        render_pass.draw(0..vertex_count, 0..instance_count);
    }
}

/// Axis-aligned clip-space rectangle `(min, max)`
pub type ClipRect = ([f32; 2], [f32; 2]);

/// Where the vertex shader puts the quad of cell `instance`. Mirrors
/// `place_cell` in `render.wgsl`.
pub fn cell_clip_rect(
    grid: &GridDescriptor,
    instance: u32,
    alive: bool,
    geometry: CellGeometry,
) -> ClipRect {
    let scale = match geometry {
        CellGeometry::StateScaled => alive as u32 as f32,
        CellGeometry::Static => 1.0,
    };
    let dims = [grid.width as f32, grid.height as f32];
    let cell = [(instance % grid.width) as f32, (instance / grid.width) as f32];
    let place = |v: [f32; 2]| {
        [0usize, 1].map(|axis| {
            (v[axis] * scale + 1.0) / dims[axis] - 1.0 + cell[axis] / dims[axis] * 2.0
        })
    };
    (place(SQUARE_VERTICES[0]), place(SQUARE_VERTICES[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    fn approx(a: [f32; 2], b: [f32; 2]) -> bool {
        (a[0] - b[0]).abs() < EPS && (a[1] - b[1]).abs() < EPS
    }

    #[test]
    fn test_quad_mesh() {
        assert_eq!(VERTEX_COUNT, 6);
        assert_eq!(std::mem::size_of_val(&SQUARE_VERTICES), 48);
        assert_eq!(vertex_buffer_layout().array_stride, 8);
        for v in SQUARE_VERTICES {
            assert_eq!(v[0].abs(), 0.8);
            assert_eq!(v[1].abs(), 0.8);
        }
    }

    #[test]
    fn test_render_shader_validates() {
        use wgpu::naga::valid::{Capabilities, ValidationFlags, Validator};

        let module = wgpu::naga::front::wgsl::parse_str(RENDER_SHADER)
            .unwrap_or_else(|e| panic!("{}", e.emit_to_string(RENDER_SHADER)));
        Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .unwrap_or_else(|e| panic!("{e:?}"));

        let has_entry = |name: &str| module.entry_points.iter().any(|ep| ep.name == name);
        for geometry in [CellGeometry::StateScaled, CellGeometry::Static] {
            assert!(has_entry(geometry.vertex_entry_point()), "{geometry:?}");
        }
        assert!(has_entry("fs_main"));
    }

    #[test]
    fn test_live_cell_fills_its_slot() {
        let grid = GridDescriptor::new(4, 2, 8).unwrap();
        // Cell (0, 0) occupies x in [-1, -0.5], y in [-1, 0]; the quad covers
        // 80% of it around the centre
        let (min, max) = cell_clip_rect(&grid, 0, true, CellGeometry::StateScaled);
        assert!(approx(min, [-0.95, -0.9]), "{min:?}");
        assert!(approx(max, [-0.55, -0.1]), "{max:?}");

        // Instance 5 is (1, 1)
        let (min, max) = cell_clip_rect(&grid, 5, true, CellGeometry::StateScaled);
        assert!(approx(min, [-0.45, 0.1]), "{min:?}");
        assert!(approx(max, [-0.05, 0.9]), "{max:?}");
    }

    #[test]
    fn test_dead_cell_collapses_to_point() {
        let grid = GridDescriptor::new(4, 2, 8).unwrap();
        let (min, max) = cell_clip_rect(&grid, 5, false, CellGeometry::StateScaled);
        assert!(approx(min, max));
        // The point sits at the centre of the cell
        assert!(approx(min, [-0.25, 0.5]), "{min:?}");
    }

    #[test]
    fn test_static_geometry_ignores_state() {
        let grid = GridDescriptor::new(4, 2, 8).unwrap();
        let dead = cell_clip_rect(&grid, 5, false, CellGeometry::Static);
        let alive = cell_clip_rect(&grid, 5, true, CellGeometry::Static);
        assert_eq!(dead, alive);
        assert!(dead.0 != dead.1);
    }
}
