//! Dense grid codec.
//!
//! A point set travels to the device as a fixed `rows x cols` grid of RGB `f32`
//! texels, row-major, one point per texel. Texels past the last point are
//! zero-filled, so the texel right after the data carries (0, 0, 0) and acts as
//! the end-of-data sentinel.
//!
//! Device layout (`Rgba32Float`, 16 bytes per texel):
//!   [x, y, z, 0.0]   point texel
//!   [0, 0, 0, 0.0]   fill texel
//!
//! Output grids reuse the same layout with the nearest position in channel 0.

use glam::Vec3;

use crate::config::{GridDims, Termination};
use crate::error::NnError;

/// One grid cell: the three active channels.
pub type Texel = [f32; 3];

/// A fixed-capacity grid plus the number of points actually written into it.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    dims: GridDims,
    texels: Vec<Texel>,
    len: usize,
}

impl Grid {
    /// An all-zero grid, i.e. an empty point set.
    pub fn zeroed(dims: GridDims) -> Self {
        Self {
            dims,
            texels: vec![[0.0; 3]; dims.capacity()],
            len: 0,
        }
    }

    /// Pack `points` into successive texels of a zero-filled grid.
    pub fn encode(points: &[Vec3], dims: GridDims) -> Result<Self, NnError> {
        let capacity = dims.capacity();
        if points.len() > capacity {
            return Err(NnError::CapacityOverflow {
                len: points.len(),
                capacity,
            });
        }

        let mut grid = Self::zeroed(dims);
        for (texel, p) in grid.texels.iter_mut().zip(points) {
            *texel = p.to_array();
        }
        grid.len = points.len();
        Ok(grid)
    }

    /// Wrap texels that came back from the device. The length is taken from the sentinel.
    pub fn from_texels(dims: GridDims, texels: Vec<Texel>) -> Result<Self, NnError> {
        if texels.len() != dims.capacity() {
            return Err(NnError::InvalidDims {
                rows: dims.rows(),
                cols: dims.cols(),
                reason: "texel count does not match grid capacity",
            });
        }
        let mut grid = Self {
            dims,
            texels,
            len: 0,
        };
        grid.len = grid.sentinel_len();
        Ok(grid)
    }

    /// Drop the alpha channel of a device readback.
    pub fn from_rgba(dims: GridDims, rgba: &[[f32; 4]]) -> Result<Self, NnError> {
        let texels = rgba.iter().map(|t| [t[0], t[1], t[2]]).collect();
        Self::from_texels(dims, texels)
    }

    #[inline]
    pub fn dims(&self) -> GridDims {
        self.dims
    }

    /// Points written by [`Grid::encode`], or the sentinel length for readbacks.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn texels(&self) -> &[Texel] {
        &self.texels
    }

    /// Index of the first texel whose first channel is exactly 0.0, or the capacity.
    pub fn sentinel_len(&self) -> usize {
        self.texels
            .iter()
            .position(|t| t[0] == 0.0)
            .unwrap_or(self.texels.len())
    }

    /// Number of texels a consumer treats as data under `termination`.
    pub fn valid_len(&self, termination: Termination) -> usize {
        match termination {
            Termination::ExplicitLength => self.len,
            Termination::Sentinel => self.sentinel_len(),
        }
    }

    /// First real point whose x is 0.0; under [`Termination::Sentinel`] it would cut the set short.
    pub fn first_ambiguous_zero(&self) -> Option<usize> {
        self.texels[..self.len].iter().position(|t| t[0] == 0.0)
    }

    /// First-channel values up to the sentinel (exclusive) or `bound`, whichever is first.
    pub fn decode(&self, bound: Option<usize>) -> Vec<f32> {
        let bound = bound.unwrap_or(self.texels.len());
        self.texels
            .iter()
            .take(bound)
            .map(|t| t[0])
            .take_while(|&x| x != 0.0)
            .collect()
    }

    /// The points a consumer would see under `termination`.
    pub fn points(&self, termination: Termination) -> Vec<Vec3> {
        self.texels[..self.valid_len(termination)]
            .iter()
            .map(|&t| Vec3::from_array(t))
            .collect()
    }

    /// Texels in device layout, alpha fixed at 0.0.
    pub fn to_rgba(&self) -> Vec<[f32; 4]> {
        self.texels.iter().map(|t| [t[0], t[1], t[2], 0.0]).collect()
    }
}
