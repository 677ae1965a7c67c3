//! Headless compute surface: device, grid textures, the render target the
//! kernel draws into, and the blocking readback path.

use std::fmt;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::config::GridDims;
use crate::error::NnError;
use crate::grid::Grid;

/// Device format of every grid. wgpu has no 3-channel float format; alpha stays 0.
pub const GRID_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

const TEXEL_BYTES: u32 = 16;

/// What the adapter must allow on `GRID_FORMAT` for the pipeline to run at all.
const FLOAT_GRID_USAGES: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
    .union(wgpu::TextureUsages::RENDER_ATTACHMENT)
    .union(wgpu::TextureUsages::COPY_SRC)
    .union(wgpu::TextureUsages::COPY_DST);

/// Which side of the search a grid texture holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridRole {
    Query,
    Reference,
    Output,
}

impl GridRole {
    fn label(self) -> &'static str {
        match self {
            GridRole::Query => "Query Grid",
            GridRole::Reference => "Reference Grid",
            GridRole::Output => "Output Grid",
        }
    }

    fn usage(self) -> wgpu::TextureUsages {
        match self {
            GridRole::Query | GridRole::Reference => {
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST
            }
            GridRole::Output => {
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST
            }
        }
    }
}

/// A grid uploaded to the device. Released when dropped.
pub struct GridTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    dims: GridDims,
}

impl GridTexture {
    #[inline]
    pub fn dims(&self) -> GridDims {
        self.dims
    }

    #[inline]
    pub(crate) fn view(&self) -> &wgpu::TextureView {
        &self.view
    }
}

/// The texture properties render-target validation looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
    pub mip_level_count: u32,
}

impl AttachmentInfo {
    fn of(texture: &wgpu::Texture) -> Self {
        Self {
            format: texture.format(),
            usage: texture.usage(),
            width: texture.width(),
            height: texture.height(),
            sample_count: texture.sample_count(),
            mip_level_count: texture.mip_level_count(),
        }
    }
}

struct Attachment<'a> {
    grid: &'a GridTexture,
    view: wgpu::TextureView,
    info: AttachmentInfo,
    /// Validation error raised while creating the attachment view.
    fault: Option<String>,
}

/// The output side of a kernel run: one color attachment backed by a grid texture.
pub struct RenderTarget<'a> {
    color: Option<Attachment<'a>>,
}

impl<'a> RenderTarget<'a> {
    /// A target with nothing attached yet; it validates as `MissingAttachment`.
    pub fn empty() -> Self {
        Self { color: None }
    }

    pub fn grid(&self) -> Option<&'a GridTexture> {
        self.color.as_ref().map(|a| a.grid)
    }

    pub(crate) fn color_view(&self) -> Option<&wgpu::TextureView> {
        self.color.as_ref().map(|a| &a.view)
    }
}

/// Result of render-target validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    Complete,
    /// The attachment format cannot be rendered to on this adapter.
    Unsupported,
    /// The attached texture lacks the usages or layout a color attachment needs.
    IncompleteAttachment,
    /// The attachment does not match the grid size the kernel covers.
    IncompleteDimensions {
        expected: GridDims,
        width: u32,
        height: u32,
    },
    MissingAttachment,
    Unexpected(String),
}

impl TargetStatus {
    #[inline]
    pub fn is_complete(&self) -> bool {
        matches!(self, TargetStatus::Complete)
    }

    /// Classify a target from its attachment alone; no device access needed.
    pub fn classify(
        attachment: Option<&AttachmentInfo>,
        expected: GridDims,
        format_renderable: bool,
        fault: Option<&str>,
    ) -> Self {
        let Some(info) = attachment else {
            return TargetStatus::MissingAttachment;
        };
        if let Some(message) = fault {
            return TargetStatus::Unexpected(message.to_owned());
        }
        if info.format != GRID_FORMAT || !format_renderable {
            return TargetStatus::Unsupported;
        }
        let required = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC;
        if !info.usage.contains(required) || info.sample_count != 1 || info.mip_level_count != 1
        {
            return TargetStatus::IncompleteAttachment;
        }
        if info.width != expected.cols() || info.height != expected.rows() {
            return TargetStatus::IncompleteDimensions {
                expected,
                width: info.width,
                height: info.height,
            };
        }
        TargetStatus::Complete
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetStatus::Complete => f.write_str("render target is complete"),
            TargetStatus::Unsupported => f.write_str("render target is unsupported"),
            TargetStatus::IncompleteAttachment => {
                f.write_str("render target incomplete attachment")
            }
            TargetStatus::IncompleteDimensions {
                expected,
                width,
                height,
            } => write!(
                f,
                "render target incomplete (mismatched) dimensions: {height}x{width}, expected {expected}"
            ),
            TargetStatus::MissingAttachment => f.write_str("render target missing attachment"),
            TargetStatus::Unexpected(message) => {
                write!(f, "unexpected render target status: {message}")
            }
        }
    }
}

/// Holds the device and queue every grid and kernel run is scoped to.
///
/// Acquire once per process and pass by reference. Fields drop top to bottom,
/// so the instance outlives the device.
pub struct ComputeSurface {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    float_grids: bool,
    _instance: wgpu::Instance,
}

impl ComputeSurface {
    /// Acquire an adapter and device, blocking the calling thread.
    pub fn new(power_preference: wgpu::PowerPreference) -> Result<Self, NnError> {
        pollster::block_on(Self::init_async(power_preference))
    }

    async fn init_async(power_preference: wgpu::PowerPreference) -> Result<Self, NnError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(NnError::NoAdapter)?;

        let adapter_info = adapter.get_info();
        let float_grids = adapter
            .get_texture_format_features(GRID_FORMAT)
            .allowed_usages
            .contains(FLOAT_GRID_USAGES);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("nearest_vertex"),
                    required_features: wgpu::Features::empty(),
                    // Downlevel defaults keep GL adapters usable; texture size follows the adapter.
                    required_limits: wgpu::Limits::downlevel_defaults()
                        .using_resolution(adapter.limits()),
                },
                None,
            )
            .await?;

        tracing::info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            device_type = ?adapter_info.device_type,
            float_grids,
            "Compute surface ready"
        );

        Ok(Self {
            device,
            queue,
            adapter_info,
            float_grids,
            _instance: instance,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Whether `Rgba32Float` can be sampled, rendered to and copied on this adapter.
    pub fn supports_floating_point_grids(&self) -> bool {
        self.float_grids
    }

    pub fn max_texture_dimension_2d(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    /// Upload `grid` into a fresh texture for `role`.
    pub fn create_grid(&self, role: GridRole, grid: &Grid) -> Result<GridTexture, NnError> {
        let dims = grid.dims();
        self.capture("creating grid texture", || {
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(role.label()),
                size: dims.extent(),
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: GRID_FORMAT,
                usage: role.usage(),
                view_formats: &[],
            });

            let rgba = grid.to_rgba();
            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                bytemuck::cast_slice(&rgba),
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(dims.cols() * TEXEL_BYTES),
                    rows_per_image: Some(dims.rows()),
                },
                dims.extent(),
            );

            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            GridTexture {
                texture,
                view,
                dims,
            }
        })
    }

    /// Attach `grid` as the single color attachment of a new render target.
    pub fn attach_as_render_target<'a>(&self, grid: &'a GridTexture) -> RenderTarget<'a> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let view = grid.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Nearest Vertex Target"),
            format: Some(GRID_FORMAT),
            dimension: Some(wgpu::TextureViewDimension::D2),
            mip_level_count: Some(1),
            array_layer_count: Some(1),
            ..Default::default()
        });
        let fault = pollster::block_on(self.device.pop_error_scope()).map(|e| e.to_string());

        RenderTarget {
            color: Some(Attachment {
                grid,
                view,
                info: AttachmentInfo::of(&grid.texture),
                fault,
            }),
        }
    }

    /// Check that `target` can receive a full-surface draw over `expected`.
    pub fn validate_target(&self, target: &RenderTarget<'_>, expected: GridDims) -> TargetStatus {
        let attachment = target.color.as_ref();
        TargetStatus::classify(
            attachment.map(|a| &a.info),
            expected,
            self.float_grids,
            attachment.and_then(|a| a.fault.as_deref()),
        )
    }

    /// Copy a grid texture back into host memory. Blocks until the copy lands
    /// or `timeout` expires.
    pub fn read_grid(&self, grid: &GridTexture, timeout: Option<Duration>) -> Result<Grid, NnError> {
        let dims = grid.dims;
        let unpadded_bytes_per_row = dims.cols() * TEXEL_BYTES;
        let padded_bytes_per_row =
            align_to(unpadded_bytes_per_row, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Grid Readback"),
            size: padded_bytes_per_row as u64 * dims.rows() as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Grid Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &grid.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(dims.rows()),
                },
            },
            dims.extent(),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait_for_map(&rx, timeout)?;

        let mut rgba: Vec<[f32; 4]> = Vec::with_capacity(dims.capacity());
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks_exact(padded_bytes_per_row as usize) {
                rgba.extend_from_slice(bytemuck::cast_slice(
                    &row[..unpadded_bytes_per_row as usize],
                ));
            }
        }
        staging.unmap();

        Grid::from_rgba(dims, &rgba)
    }

    fn wait_for_map(
        &self,
        rx: &mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>,
        timeout: Option<Duration>,
    ) -> Result<(), NnError> {
        await_mapping(rx, timeout, |maintain| {
            self.device.poll(maintain);
        })
    }

    /// Run `f` inside a validation error scope and surface any error it raised.
    pub(crate) fn capture<T>(&self, stage: &'static str, f: impl FnOnce() -> T) -> Result<T, NnError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            None => Ok(value),
            Some(err) => Err(NnError::Device {
                stage,
                message: err.to_string(),
            }),
        }
    }
}

/// Drive `poll` until the map callback reports on `rx`. With a timeout the
/// device is polled without blocking, once per millisecond.
fn await_mapping(
    rx: &mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>,
    timeout: Option<Duration>,
    mut poll: impl FnMut(wgpu::Maintain),
) -> Result<(), NnError> {
    let callback_lost = || NnError::Device {
        stage: "reading back a grid",
        message: "map callback was dropped".into(),
    };

    let Some(limit) = timeout else {
        poll(wgpu::Maintain::Wait);
        return rx.recv().map_err(|_| callback_lost())?.map_err(NnError::from);
    };

    let start = Instant::now();
    loop {
        poll(wgpu::Maintain::Poll);
        match rx.try_recv() {
            Ok(result) => return result.map_err(NnError::from),
            Err(mpsc::TryRecvError::Disconnected) => return Err(callback_lost()),
            Err(mpsc::TryRecvError::Empty) => {}
        }
        if start.elapsed() >= limit {
            return Err(NnError::ReadbackTimeout(limit));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Round `value` up to the next multiple of `alignment`.
#[inline]
fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_info(width: u32, height: u32) -> AttachmentInfo {
        AttachmentInfo {
            format: GRID_FORMAT,
            usage: GridRole::Output.usage(),
            width,
            height,
            sample_count: 1,
            mip_level_count: 1,
        }
    }

    #[test]
    fn well_formed_output_target_is_complete() {
        let dims = GridDims::new(8, 16).unwrap();
        let status = TargetStatus::classify(Some(&output_info(16, 8)), dims, true, None);
        assert!(status.is_complete());
    }

    #[test]
    fn missing_attachment_is_reported_first() {
        let dims = GridDims::new(8, 8).unwrap();
        assert_eq!(
            TargetStatus::classify(None, dims, false, Some("ignored")),
            TargetStatus::MissingAttachment
        );
    }

    #[test]
    fn non_renderable_float_format_is_unsupported() {
        let dims = GridDims::new(8, 8).unwrap();
        assert_eq!(
            TargetStatus::classify(Some(&output_info(8, 8)), dims, false, None),
            TargetStatus::Unsupported
        );

        let mut info = output_info(8, 8);
        info.format = wgpu::TextureFormat::Rgba8Unorm;
        assert_eq!(
            TargetStatus::classify(Some(&info), dims, true, None),
            TargetStatus::Unsupported
        );
    }

    #[test]
    fn sampled_only_grid_is_an_incomplete_attachment() {
        let dims = GridDims::new(8, 8).unwrap();
        let mut info = output_info(8, 8);
        info.usage = GridRole::Query.usage();
        assert_eq!(
            TargetStatus::classify(Some(&info), dims, true, None),
            TargetStatus::IncompleteAttachment
        );

        let mut info = output_info(8, 8);
        info.sample_count = 4;
        assert_eq!(
            TargetStatus::classify(Some(&info), dims, true, None),
            TargetStatus::IncompleteAttachment
        );
    }

    #[test]
    fn size_mismatch_reports_both_shapes() {
        let dims = GridDims::new(8, 8).unwrap();
        let status = TargetStatus::classify(Some(&output_info(8, 4)), dims, true, None);
        assert_eq!(
            status,
            TargetStatus::IncompleteDimensions {
                expected: dims,
                width: 8,
                height: 4
            }
        );
        assert!(status.to_string().contains("4x8"));
    }

    #[test]
    fn device_faults_surface_as_unexpected() {
        let dims = GridDims::new(8, 8).unwrap();
        let status =
            TargetStatus::classify(Some(&output_info(8, 8)), dims, true, Some("view mismatch"));
        assert_eq!(status, TargetStatus::Unexpected("view mismatch".into()));
        assert!(!status.is_complete());
    }

    #[test]
    fn empty_target_has_no_grid() {
        assert!(RenderTarget::empty().grid().is_none());
        assert!(RenderTarget::empty().color_view().is_none());
    }

    #[test]
    fn stalled_readback_times_out() {
        let (_tx, rx) = mpsc::channel();
        let mut polls = 0;
        let limit = Duration::from_millis(5);

        let err = await_mapping(&rx, Some(limit), |_| polls += 1).unwrap_err();
        assert!(matches!(err, NnError::ReadbackTimeout(d) if d == limit));
        assert!(polls >= 1);
    }

    #[test]
    fn finished_readback_returns_before_the_deadline() {
        let (tx, rx) = mpsc::channel();
        tx.send(Ok(())).unwrap();
        assert!(await_mapping(&rx, Some(Duration::from_secs(60)), |_| {}).is_ok());

        let (tx, rx) = mpsc::channel();
        tx.send(Ok(())).unwrap();
        assert!(await_mapping(&rx, None, |_| {}).is_ok());
    }

    #[test]
    fn dropped_map_callback_is_a_device_error() {
        let (tx, rx) = mpsc::channel::<Result<(), wgpu::BufferAsyncError>>();
        drop(tx);
        assert!(matches!(
            await_mapping(&rx, Some(Duration::from_millis(5)), |_| {}),
            Err(NnError::Device { .. })
        ));
        assert!(matches!(
            await_mapping(&rx, None, |_| {}),
            Err(NnError::Device { .. })
        ));
    }

    #[test]
    fn readback_rows_are_padded_to_copy_alignment() {
        assert_eq!(align_to(16 * 16, 256), 256);
        assert_eq!(align_to(3 * 16, 256), 256);
        assert_eq!(align_to(1024 * 16, 256), 16384);
    }
}
