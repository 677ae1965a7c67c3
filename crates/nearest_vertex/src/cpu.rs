//! CPU reference for the nearest-vertex kernel.
//!
//! Mirrors the fragment program step for step: same row-major scan, same
//! end-of-data rules, same 1-based positions, same strict `<` tie-break.
//! Query texels are spread over the rayon pool; each scan stays sequential.
//! The GPU kernel is validated against this module.

use glam::Vec3;
use rayon::prelude::*;

use crate::config::{GridDims, Termination};
use crate::engine::Resolver;
use crate::error::NnError;
use crate::extract::{compact, IndexArray};
use crate::grid::{Grid, Texel};

/// What one query texel's scan did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOutcome {
    /// 1-based position of the nearest reference texel, 0 if none.
    pub position: u32,
    /// Position increments, including the one that landed on the sentinel.
    pub attempts: u32,
    /// Distance evaluations.
    pub comparisons: u32,
}

#[inline]
fn squared_distance(c: Texel, v: Texel) -> f32 {
    (c[0] - v[0]) * (c[0] - v[0]) + (c[1] - v[1]) * (c[1] - v[1]) + (c[2] - v[2]) * (c[2] - v[2])
}

/// Scan `reference` for the texel nearest to `c`.
pub fn scan_reference(c: Texel, reference: &Grid, termination: Termination) -> ScanOutcome {
    let limit = match termination {
        Termination::Sentinel => reference.dims().capacity(),
        Termination::ExplicitLength => reference.len(),
    };

    let mut min_d2 = f32::MAX;
    let mut outcome = ScanOutcome::default();
    for &v in &reference.texels()[..limit] {
        outcome.attempts += 1;
        if termination == Termination::Sentinel && v[0] == 0.0 {
            break;
        }
        outcome.comparisons += 1;
        let d2 = squared_distance(c, v);
        if d2 < min_d2 {
            min_d2 = d2;
            outcome.position = outcome.attempts;
        }
    }
    outcome
}

/// The output grid the GPU kernel would produce for this pair of grids.
pub fn run_kernel(
    query: &Grid,
    reference: &Grid,
    termination: Termination,
) -> Result<Grid, NnError> {
    let texels: Vec<Texel> = query
        .texels()
        .par_iter()
        .enumerate()
        .map(|(slot, &c)| {
            let active = match termination {
                Termination::Sentinel => c[0] != 0.0,
                Termination::ExplicitLength => slot < query.len(),
            };
            if !active {
                return [0.0; 3];
            }
            [scan_reference(c, reference, termination).position as f32, 0.0, 0.0]
        })
        .collect();
    Grid::from_texels(query.dims(), texels)
}

/// Resolver that runs the reference scan on the CPU instead of the device.
#[derive(Debug, Clone, Copy)]
pub struct CpuResolver {
    dims: GridDims,
    termination: Termination,
}

impl CpuResolver {
    pub fn new(dims: GridDims, termination: Termination) -> Self {
        Self { dims, termination }
    }
}

impl Resolver for CpuResolver {
    fn resolve(&self, contacts: &[Vec3], vertices: &[Vec3]) -> Result<IndexArray, NnError> {
        let query = Grid::encode(contacts, self.dims)?;
        let reference = Grid::encode(vertices, self.dims)?;
        let output = run_kernel(&query, &reference, self.termination)?;
        Ok(compact(&output, self.termination, query.len()))
    }
}
