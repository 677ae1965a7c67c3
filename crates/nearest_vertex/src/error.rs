//! Error types for the engine and the cell sequencer.

use std::time::Duration;

use crate::surface::TargetStatus;

/// Boxed error returned by external collaborators (record loaders, persistence).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while setting up or running one nearest-vertex resolution.
#[derive(Debug, thiserror::Error)]
pub enum NnError {
    /// The adapter cannot sample, render to and copy `Rgba32Float` textures.
    #[error("Floating point textures are not supported.")]
    FloatGridsUnsupported,

    #[error("no suitable GPU adapter found")]
    NoAdapter,

    #[error("GPU device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("invalid grid dimensions {rows}x{cols}: {reason}")]
    InvalidDims {
        rows: u32,
        cols: u32,
        reason: &'static str,
    },

    /// Point sets are rejected whole; they are never truncated to fit.
    #[error("point set of {len} points exceeds grid capacity {capacity}")]
    CapacityOverflow { len: usize, capacity: usize },

    #[error("render target is not usable: {0}")]
    TargetIncomplete(TargetStatus),

    #[error("nearest-vertex kernel failed to build: {0}")]
    KernelCompile(String),

    #[error("GPU validation error while {stage}: {message}")]
    Device {
        stage: &'static str,
        message: String,
    },

    #[error("readback mapping failed: {0}")]
    Readback(#[from] wgpu::BufferAsyncError),

    #[error("readback did not complete within {0:?}")]
    ReadbackTimeout(Duration),
}

/// A failed cell, tagged with the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum CellError {
    #[error("cell {id}: failed to load inputs")]
    Load {
        id: String,
        #[source]
        source: BoxError,
    },

    #[error("cell {id}: nearest-vertex resolution failed")]
    Resolve {
        id: String,
        #[source]
        source: NnError,
    },

    #[error("cell {id}: failed to persist results")]
    Persist {
        id: String,
        #[source]
        source: BoxError,
    },
}

impl CellError {
    pub fn cell_id(&self) -> &str {
        match self {
            CellError::Load { id, .. }
            | CellError::Resolve { id, .. }
            | CellError::Persist { id, .. } => id,
        }
    }
}
