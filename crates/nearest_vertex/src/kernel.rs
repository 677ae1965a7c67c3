//! The nearest-vertex kernel: a fragment program drawn once over the whole
//! output grid. Every output texel scans the full reference grid for its query
//! texel; the hardware runs the texels in parallel.

use wgpu::util::DeviceExt;

use crate::config::Termination;
use crate::error::NnError;
use crate::grid::Grid;
use crate::surface::{ComputeSurface, GridTexture, RenderTarget, TargetStatus, GRID_FORMAT};

const SHADER_SRC: &str = include_str!("../shaders/nearest_vertex.wgsl");

/// Full-screen triangle vertices
const FS_TRI: [[f32; 2]; 3] = [[-1.0, -1.0], [3.0, -1.0], [-1.0, 3.0]];

/// Per-run uniform. Must match `ScanParams` in `nearest_vertex.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ScanParams {
    /// (cols, rows)
    pub query_dims: [u32; 2],
    /// (cols, rows)
    pub reference_dims: [u32; 2],
    pub query_len: u32,
    pub reference_len: u32,
    pub use_sentinel: u32,
    _pad: u32,
}

impl ScanParams {
    pub fn new(query: &Grid, reference: &Grid, termination: Termination) -> Self {
        let q = query.dims();
        let r = reference.dims();
        Self {
            query_dims: [q.cols(), q.rows()],
            reference_dims: [r.cols(), r.rows()],
            query_len: query.len() as u32,
            reference_len: reference.len() as u32,
            use_sentinel: (termination == Termination::Sentinel) as u32,
            _pad: 0,
        }
    }
}

/// Compiled once per engine; each [`NearestKernel::run`] allocates and drops
/// its own uniform buffer and bind group.
pub struct NearestKernel {
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    fs_vbo: wgpu::Buffer,
}

impl NearestKernel {
    pub fn new(surface: &ComputeSurface) -> Result<Self, NnError> {
        let device = &surface.device;
        surface
            .capture("building the nearest-vertex kernel", || {
                let grid_entry = |binding| wgpu::BindGroupLayoutEntry {
                    binding,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                };

                let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("NearestKernel Layout"),
                    entries: &[
                        grid_entry(0),
                        grid_entry(1),
                        wgpu::BindGroupLayoutEntry {
                            binding: 2,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: wgpu::BufferSize::new(
                                    std::mem::size_of::<ScanParams>() as u64,
                                ),
                            },
                            count: None,
                        },
                    ],
                });

                let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("nearest_vertex.wgsl"),
                    source: wgpu::ShaderSource::Wgsl(SHADER_SRC.into()),
                });

                let pipe_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("NearestKernel PipelineLayout"),
                    bind_group_layouts: &[&layout],
                    push_constant_ranges: &[],
                });

                let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("NearestKernel Pipeline"),
                    layout: Some(&pipe_layout),
                    vertex: wgpu::VertexState {
                        module: &shader,
                        entry_point: "vs_main",
                        buffers: &[wgpu::VertexBufferLayout {
                            array_stride: std::mem::size_of::<[f32; 2]>() as u64,
                            step_mode: wgpu::VertexStepMode::Vertex,
                            attributes: &[wgpu::VertexAttribute {
                                shader_location: 0,
                                offset: 0,
                                format: wgpu::VertexFormat::Float32x2,
                            }],
                        }],
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &shader,
                        entry_point: "fs_main",
                        targets: &[Some(wgpu::ColorTargetState {
                            format: GRID_FORMAT,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    }),
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                });

                let fs_vbo = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("NearestKernel FS VBO"),
                    contents: bytemuck::cast_slice(&FS_TRI),
                    usage: wgpu::BufferUsages::VERTEX,
                });

                Self {
                    pipeline,
                    layout,
                    fs_vbo,
                }
            })
            .map_err(|e| match e {
                NnError::Device { message, .. } => NnError::KernelCompile(message),
                other => other,
            })
    }

    /// Issue the single full-surface draw and submit it. Does not wait for completion.
    pub fn run(
        &self,
        surface: &ComputeSurface,
        query: &GridTexture,
        reference: &GridTexture,
        target: &RenderTarget<'_>,
        params: &ScanParams,
    ) -> Result<(), NnError> {
        let dst = target
            .color_view()
            .ok_or(NnError::TargetIncomplete(TargetStatus::MissingAttachment))?;
        let device = &surface.device;

        surface.capture("running the nearest-vertex kernel", || {
            let ubo = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("NearestKernel UBO"),
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("NearestKernel BindGroup"),
                layout: &self.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(query.view()),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(reference.view()),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: ubo.as_entire_binding(),
                    },
                ],
            });

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("NearestKernel Encoder"),
            });
            execute_pass(&self.pipeline, &mut encoder, &bind_group, &self.fs_vbo, dst);
            surface.queue.submit(std::iter::once(encoder.finish()));
        })
    }
}

fn execute_pass(
    pipeline: &wgpu::RenderPipeline,
    encoder: &mut wgpu::CommandEncoder,
    bind_group: &wgpu::BindGroup,
    fs_vbo: &wgpu::Buffer,
    dst: &wgpu::TextureView,
) {
    let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("Nearest Vertex Pass"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: dst,
            resolve_target: None,
            ops: wgpu::Operations {
                // 0.0 in channel 0 is the output's own end-of-data sentinel.
                load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
    });

    rpass.set_pipeline(pipeline);
    rpass.set_bind_group(0, bind_group, &[]);
    rpass.set_vertex_buffer(0, fs_vbo.slice(..));
    rpass.draw(0..3, 0..1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridDims;
    use crate::extract::compact;
    use crate::surface::GridRole;
    use glam::Vec3;

    #[test]
    fn scan_params_match_the_wgsl_layout() {
        assert_eq!(std::mem::size_of::<ScanParams>(), 32);
        assert_eq!(std::mem::size_of::<ScanParams>() % 16, 0);
    }

    #[test]
    fn scan_params_carry_lengths_and_mode() {
        let dims = GridDims::new(2, 8).unwrap();
        let q = Grid::encode(&[Vec3::ONE; 3], dims).unwrap();
        let r = Grid::encode(&[Vec3::ONE; 5], dims).unwrap();

        let p = ScanParams::new(&q, &r, Termination::Sentinel);
        assert_eq!(p.query_dims, [8, 2]);
        assert_eq!(p.reference_dims, [8, 2]);
        assert_eq!((p.query_len, p.reference_len), (3, 5));
        assert_eq!(p.use_sentinel, 1);

        assert_eq!(ScanParams::new(&q, &r, Termination::ExplicitLength).use_sentinel, 0);
    }

    fn parsed_shader() -> naga::Module {
        let module = naga::front::wgsl::parse_str(SHADER_SRC)
            .unwrap_or_else(|e| panic!("{}", e.emit_to_string(SHADER_SRC)));
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::empty(),
        )
        .validate(&module)
        .unwrap();
        module
    }

    #[test]
    fn shader_parses_and_validates() {
        let module = parsed_shader();
        let stages: Vec<_> = module
            .entry_points
            .iter()
            .map(|e| (e.name.as_str(), e.stage))
            .collect();
        assert!(stages.contains(&("vs_main", naga::ShaderStage::Vertex)));
        assert!(stages.contains(&("fs_main", naga::ShaderStage::Fragment)));
    }

    #[test]
    fn shader_uniform_layout_matches_scan_params() {
        let module = parsed_shader();
        let (members, span) = module
            .types
            .iter()
            .find_map(|(_, ty)| match &ty.inner {
                naga::TypeInner::Struct { members, span }
                    if ty.name.as_deref() == Some("ScanParams") =>
                {
                    Some((members.clone(), *span))
                }
                _ => None,
            })
            .expect("ScanParams struct in shader");

        assert_eq!(span as usize, std::mem::size_of::<ScanParams>());
        let layout: Vec<(Option<&str>, u32)> = members
            .iter()
            .map(|m| (m.name.as_deref(), m.offset))
            .collect();
        assert_eq!(
            layout,
            vec![
                (Some("query_dims"), std::mem::offset_of!(ScanParams, query_dims) as u32),
                (Some("reference_dims"), std::mem::offset_of!(ScanParams, reference_dims) as u32),
                (Some("query_len"), std::mem::offset_of!(ScanParams, query_len) as u32),
                (Some("reference_len"), std::mem::offset_of!(ScanParams, reference_len) as u32),
                (Some("use_sentinel"), std::mem::offset_of!(ScanParams, use_sentinel) as u32),
                (Some("_pad"), std::mem::offset_of!(ScanParams, _pad) as u32),
            ]
        );
    }

    #[test]
    #[ignore = "needs a GPU adapter with float render targets"]
    fn kernel_draw_fills_one_texel_per_query() {
        let surface = crate::test_surface();
        let kernel = NearestKernel::new(&surface).unwrap();
        let dims = GridDims::new(4, 4).unwrap();

        let query = Grid::encode(
            &[Vec3::new(1.0, 0.0, 0.0), Vec3::new(9.0, 9.0, 9.0)],
            dims,
        )
        .unwrap();
        let reference = Grid::encode(
            &[
                Vec3::new(5.0, 5.0, 5.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(10.0, 10.0, 10.0),
            ],
            dims,
        )
        .unwrap();

        let q = surface.create_grid(GridRole::Query, &query).unwrap();
        let r = surface.create_grid(GridRole::Reference, &reference).unwrap();
        let out = surface.create_grid(GridRole::Output, &Grid::zeroed(dims)).unwrap();
        let target = surface.attach_as_render_target(&out);
        assert!(surface.validate_target(&target, dims).is_complete());

        let params = ScanParams::new(&query, &reference, Termination::ExplicitLength);
        kernel.run(&surface, &q, &r, &target, &params).unwrap();

        let output = surface.read_grid(&out, None).unwrap();
        let indices = compact(&output, Termination::ExplicitLength, query.len());
        assert_eq!(indices.as_slice(), &[2, 3]);
        assert!(output.texels()[2..].iter().all(|t| t[0] == 0.0));
    }

    #[test]
    #[ignore = "needs a GPU adapter with float render targets"]
    fn running_without_an_attachment_fails_before_drawing() {
        let surface = crate::test_surface();
        let kernel = NearestKernel::new(&surface).unwrap();
        let dims = GridDims::new(2, 2).unwrap();
        let grid = Grid::zeroed(dims);
        let q = surface.create_grid(GridRole::Query, &grid).unwrap();
        let r = surface.create_grid(GridRole::Reference, &grid).unwrap();

        let err = kernel
            .run(
                &surface,
                &q,
                &r,
                &RenderTarget::empty(),
                &ScanParams::new(&grid, &grid, Termination::Sentinel),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            NnError::TargetIncomplete(TargetStatus::MissingAttachment)
        ));
    }
}
