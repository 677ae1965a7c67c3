//! End-to-end resolution: encode, upload, draw, read back.

use std::time::Instant;

use glam::Vec3;

use crate::config::{EngineConfig, Termination};
use crate::error::NnError;
use crate::extract::{extract, IndexArray};
use crate::grid::Grid;
use crate::kernel::{NearestKernel, ScanParams};
use crate::surface::{ComputeSurface, GridRole};

/// Maps every contact to the position of its nearest vertex.
///
/// The returned array is in contact order. Positions are 1-based into
/// `vertices`; 0 means no vertex was available.
pub trait Resolver {
    fn resolve(&self, contacts: &[Vec3], vertices: &[Vec3]) -> Result<IndexArray, NnError>;
}

impl<R: Resolver + ?Sized> Resolver for Box<R> {
    fn resolve(&self, contacts: &[Vec3], vertices: &[Vec3]) -> Result<IndexArray, NnError> {
        (**self).resolve(contacts, vertices)
    }
}

impl<R: Resolver + ?Sized> Resolver for &R {
    fn resolve(&self, contacts: &[Vec3], vertices: &[Vec3]) -> Result<IndexArray, NnError> {
        (**self).resolve(contacts, vertices)
    }
}

/// GPU resolver. Owns the device and the compiled kernel; each call to
/// [`Resolver::resolve`] allocates its own grids and drops them on return.
pub struct NearestVertexEngine {
    surface: ComputeSurface,
    kernel: NearestKernel,
    config: EngineConfig,
}

impl NearestVertexEngine {
    /// Acquire a device and build the kernel.
    pub fn new(config: EngineConfig) -> Result<Self, NnError> {
        let surface = ComputeSurface::new(config.power_preference)?;
        Self::with_surface(surface, config)
    }

    /// Build on an already-acquired device.
    pub fn with_surface(surface: ComputeSurface, config: EngineConfig) -> Result<Self, NnError> {
        if !surface.supports_floating_point_grids() {
            tracing::error!(
                adapter = %surface.adapter_info().name,
                "Floating point textures are not supported."
            );
            return Err(NnError::FloatGridsUnsupported);
        }
        config
            .dims
            .check_device_limit(surface.max_texture_dimension_2d())?;

        let kernel = NearestKernel::new(&surface)?;
        tracing::info!(
            dims = %config.dims,
            termination = %config.termination,
            "Nearest-vertex engine ready"
        );

        Ok(Self {
            surface,
            kernel,
            config,
        })
    }

    pub fn surface(&self) -> &ComputeSurface {
        &self.surface
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn warn_ambiguous_zero(set: &'static str, grid: &Grid) {
    if let Some(index) = grid.first_ambiguous_zero() {
        tracing::warn!(
            set,
            index,
            len = grid.len(),
            "point with x == 0.0 will be read as end of data"
        );
    }
}

impl Resolver for NearestVertexEngine {
    fn resolve(&self, contacts: &[Vec3], vertices: &[Vec3]) -> Result<IndexArray, NnError> {
        let span = tracing::debug_span!(
            "resolve",
            contacts = contacts.len(),
            vertices = vertices.len()
        );
        let _enter = span.enter();
        let started = Instant::now();

        let dims = self.config.dims;
        let termination = self.config.termination;
        let surface = &self.surface;

        let query = Grid::encode(contacts, dims)?;
        let reference = Grid::encode(vertices, dims)?;
        if termination == Termination::Sentinel {
            warn_ambiguous_zero("contacts", &query);
            warn_ambiguous_zero("vertices", &reference);
        }

        let query_tex = surface.create_grid(GridRole::Query, &query)?;
        let reference_tex = surface.create_grid(GridRole::Reference, &reference)?;
        let output_tex = surface.create_grid(GridRole::Output, &Grid::zeroed(dims))?;

        let target = surface.attach_as_render_target(&output_tex);
        let status = surface.validate_target(&target, dims);
        if !status.is_complete() {
            return Err(NnError::TargetIncomplete(status));
        }

        let params = ScanParams::new(&query, &reference, termination);
        self.kernel
            .run(surface, &query_tex, &reference_tex, &target, &params)?;

        let indices = extract(
            surface,
            &target,
            termination,
            query.len(),
            self.config.readback_timeout,
        )?;

        tracing::debug!(
            resolved = indices.len(),
            unmatched = indices.unmatched(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Resolved nearest vertices"
        );
        Ok(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridDims;
    use crate::cpu::CpuResolver;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn engine(termination: Termination) -> NearestVertexEngine {
        let config = EngineConfig {
            dims: GridDims::new(16, 16).unwrap(),
            termination,
            ..EngineConfig::default()
        };
        NearestVertexEngine::with_surface(crate::test_surface(), config).unwrap()
    }

    #[test]
    #[ignore = "needs a GPU adapter with float render targets"]
    fn resolves_the_closest_vertex() {
        let engine = engine(Termination::ExplicitLength);
        let q = [Vec3::new(1.0, 0.0, 0.0)];
        let v = [
            Vec3::new(5.0, 5.0, 5.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(10.0, 10.0, 10.0),
        ];
        assert_eq!(engine.resolve(&q, &v).unwrap().as_slice(), &[2]);
    }

    #[test]
    #[ignore = "needs a GPU adapter with float render targets"]
    fn ties_go_to_the_earlier_vertex() {
        let engine = engine(Termination::ExplicitLength);
        let q = [Vec3::new(2.0, 1.0, 0.0)];
        let v = [Vec3::new(3.0, 1.0, 0.0), Vec3::new(1.0, 1.0, 0.0)];
        assert_eq!(engine.resolve(&q, &v).unwrap().as_slice(), &[1]);
    }

    #[test]
    #[ignore = "needs a GPU adapter with float render targets"]
    fn empty_vertex_set_yields_no_neighbor() {
        let engine = engine(Termination::ExplicitLength);
        let q = [Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0)];
        let indices = engine.resolve(&q, &[]).unwrap();
        assert_eq!(indices.as_slice(), &[0, 0]);
        assert_eq!(indices.unmatched(), 2);
    }

    #[test]
    #[ignore = "needs a GPU adapter with float render targets"]
    fn sentinel_mode_stops_at_zero_x() {
        let engine = engine(Termination::Sentinel);
        let q = [Vec3::new(0.1, 0.0, 0.0)];
        let v = [Vec3::new(5.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 0.0)];
        assert_eq!(engine.resolve(&q, &v).unwrap().as_slice(), &[1]);
    }

    #[test]
    #[ignore = "needs a GPU adapter with float render targets"]
    fn oversized_sets_are_rejected_before_upload() {
        let engine = engine(Termination::ExplicitLength);
        let v = vec![Vec3::ONE; 257];
        let err = engine.resolve(&[Vec3::ONE], &v).unwrap_err();
        assert!(matches!(err, NnError::CapacityOverflow { len: 257, .. }));
    }

    #[test]
    #[ignore = "needs a GPU adapter with float render targets"]
    fn full_grids_match_the_cpu_reference() {
        for termination in [Termination::ExplicitLength, Termination::Sentinel] {
            let engine = engine(termination);
            let cpu = CpuResolver::new(engine.config().dims, termination);

            let mut rng = StdRng::seed_from_u64(42);
            // Integer coordinates keep every distance exact on both sides, ties included.
            let mut point = || {
                Vec3::new(
                    rng.gen_range(1..64) as f32,
                    rng.gen_range(-32..32) as f32,
                    rng.gen_range(-32..32) as f32,
                )
            };
            let contacts: Vec<Vec3> = (0..256).map(|_| point()).collect();
            let vertices: Vec<Vec3> = (0..256).map(|_| point()).collect();

            assert_eq!(
                engine.resolve(&contacts, &vertices).unwrap(),
                cpu.resolve(&contacts, &vertices).unwrap()
            );
        }
    }

    #[test]
    #[ignore = "needs a GPU adapter with float render targets"]
    fn grids_beyond_the_device_limit_are_rejected() {
        let surface = crate::test_surface();
        let too_wide = surface.max_texture_dimension_2d() + 1;
        let dims = GridDims::new(1, too_wide).unwrap();
        let config = EngineConfig {
            dims,
            ..EngineConfig::default()
        };
        assert!(matches!(
            NearestVertexEngine::with_surface(surface, config),
            Err(NnError::InvalidDims { .. })
        ));
    }
}
