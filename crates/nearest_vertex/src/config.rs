//! Engine configuration: grid sizing, end-of-data convention and readback policy.

use std::fmt;
use std::time::Duration;

use crate::error::NnError;

/// Largest capacity whose 1-based positions are all exactly representable in `f32`.
pub const MAX_EXACT_POSITION: usize = 1 << 24;

/// Fixed size of every grid in a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDims {
    rows: u32,
    cols: u32,
}

impl GridDims {
    /// 1024 × 1024 texels, 1,048,576 points per grid.
    pub const REFERENCE: GridDims = GridDims {
        rows: 1024,
        cols: 1024,
    };

    pub fn new(rows: u32, cols: u32) -> Result<Self, NnError> {
        if rows == 0 || cols == 0 {
            return Err(NnError::InvalidDims {
                rows,
                cols,
                reason: "rows and columns must be non-zero",
            });
        }
        if rows as usize * cols as usize > MAX_EXACT_POSITION {
            return Err(NnError::InvalidDims {
                rows,
                cols,
                reason: "capacity exceeds 2^24, positions would lose precision in f32",
            });
        }
        Ok(Self { rows, cols })
    }

    #[inline]
    pub fn rows(self) -> u32 {
        self.rows
    }

    #[inline]
    pub fn cols(self) -> u32 {
        self.cols
    }

    /// Number of texels (and therefore the maximum point count).
    #[inline]
    pub fn capacity(self) -> usize {
        self.rows as usize * self.cols as usize
    }

    pub fn extent(self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.cols,
            height: self.rows,
            depth_or_array_layers: 1,
        }
    }

    /// Reject sizes the device cannot allocate as a single 2D texture.
    pub fn check_device_limit(self, max_texture_dimension_2d: u32) -> Result<(), NnError> {
        if self.rows > max_texture_dimension_2d || self.cols > max_texture_dimension_2d {
            return Err(NnError::InvalidDims {
                rows: self.rows,
                cols: self.cols,
                reason: "exceeds the device's max_texture_dimension_2d",
            });
        }
        Ok(())
    }
}

impl Default for GridDims {
    fn default() -> Self {
        Self::REFERENCE
    }
}

impl fmt::Display for GridDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// How the end of valid data inside a grid is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Termination {
    /// The point count travels with the grid; zero coordinates are ordinary data.
    #[default]
    ExplicitLength,
    /// The first texel whose first channel is exactly 0.0 ends the data.
    /// Kept for zero-filled inputs produced by older tooling.
    Sentinel,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::ExplicitLength => f.write_str("explicit-length"),
            Termination::Sentinel => f.write_str("sentinel"),
        }
    }
}

/// Everything a [`crate::engine::NearestVertexEngine`] needs besides the device.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dims: GridDims,
    pub termination: Termination,
    /// `None` blocks until the device finishes, however long that takes.
    pub readback_timeout: Option<Duration>,
    pub power_preference: wgpu::PowerPreference,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dims: GridDims::REFERENCE,
            termination: Termination::default(),
            readback_timeout: None,
            power_preference: wgpu::PowerPreference::HighPerformance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_sizing_holds_a_million_points() {
        assert_eq!(GridDims::REFERENCE.capacity(), 1_048_576);
        assert_eq!(GridDims::default(), GridDims::REFERENCE);
    }

    #[test]
    fn zero_sized_grids_are_rejected() {
        assert!(matches!(
            GridDims::new(0, 16),
            Err(NnError::InvalidDims { rows: 0, cols: 16, .. })
        ));
        assert!(GridDims::new(16, 0).is_err());
    }

    #[test]
    fn capacity_is_capped_at_exact_f32_positions() {
        assert!(GridDims::new(4096, 4096).is_ok());
        assert!(GridDims::new(4096, 4097).is_err());
    }

    #[test]
    fn device_limit_applies_to_each_side() {
        let dims = GridDims::new(2, 9000).unwrap();
        assert!(dims.check_device_limit(8192).is_err());
        assert!(GridDims::REFERENCE.check_device_limit(8192).is_ok());
    }
}
