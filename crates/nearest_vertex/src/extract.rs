//! Result extraction: read the output grid back and compact channel 0 into
//! one index per query point.

use std::time::Duration;

use crate::config::Termination;
use crate::error::NnError;
use crate::grid::Grid;
use crate::surface::{ComputeSurface, RenderTarget, TargetStatus};

/// Nearest reference positions, one per query point in query order.
///
/// Positions are 1-based scan positions into the reference set; 0 means the
/// reference set held no data for that query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexArray(Vec<u32>);

impl IndexArray {
    #[inline]
    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u32> {
        self.0
    }

    /// Number of query points that found no neighbor.
    pub fn unmatched(&self) -> usize {
        self.0.iter().filter(|&&p| p == 0).count()
    }
}

impl From<Vec<u32>> for IndexArray {
    fn from(positions: Vec<u32>) -> Self {
        Self(positions)
    }
}

/// Compact an output grid already in host memory.
///
/// Under [`Termination::Sentinel`] the array stops at the first 0.0 (or at
/// `query_len`); under [`Termination::ExplicitLength`] it holds exactly
/// `query_len` entries, zeros included.
pub fn compact(output: &Grid, termination: Termination, query_len: usize) -> IndexArray {
    let values: Vec<f32> = match termination {
        Termination::Sentinel => output.decode(Some(query_len)),
        Termination::ExplicitLength => output
            .texels()
            .iter()
            .take(query_len)
            .map(|t| t[0])
            .collect(),
    };
    IndexArray(values.into_iter().map(|v| v as u32).collect())
}

/// Blocking readback of the target's grid followed by [`compact`].
pub fn extract(
    surface: &ComputeSurface,
    target: &RenderTarget<'_>,
    termination: Termination,
    query_len: usize,
    timeout: Option<Duration>,
) -> Result<IndexArray, NnError> {
    let grid = target
        .grid()
        .ok_or(NnError::TargetIncomplete(TargetStatus::MissingAttachment))?;
    let output = surface.read_grid(grid, timeout)?;
    Ok(compact(&output, termination, query_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridDims;

    fn output(values: &[f32]) -> Grid {
        let dims = GridDims::new(2, 4).unwrap();
        let mut texels = vec![[0.0; 3]; dims.capacity()];
        for (t, &v) in texels.iter_mut().zip(values) {
            t[0] = v;
        }
        Grid::from_texels(dims, texels).unwrap()
    }

    #[test]
    fn sentinel_compaction_stops_at_first_zero() {
        let grid = output(&[2.0, 7.0, 1.0]);
        assert_eq!(compact(&grid, Termination::Sentinel, 8).as_slice(), &[2, 7, 1]);
    }

    #[test]
    fn sentinel_compaction_respects_query_len() {
        let grid = output(&[2.0, 7.0, 1.0]);
        assert_eq!(compact(&grid, Termination::Sentinel, 2).as_slice(), &[2, 7]);
    }

    #[test]
    fn explicit_length_keeps_unmatched_entries() {
        let grid = output(&[0.0, 0.0, 0.0]);
        let indices = compact(&grid, Termination::ExplicitLength, 3);
        assert_eq!(indices.as_slice(), &[0, 0, 0]);
        assert_eq!(indices.unmatched(), 3);

        assert!(compact(&grid, Termination::Sentinel, 3).is_empty());
    }

    #[test]
    fn length_never_exceeds_query_count() {
        let grid = output(&[4.0, 4.0, 4.0, 4.0, 4.0]);
        assert_eq!(compact(&grid, Termination::ExplicitLength, 2).len(), 2);
    }
}
