//! Brute-force nearest-vertex search on the GPU through float textures.
//!
//! Two point sets (contacts and mesh vertices) are packed into fixed-size
//! `Rgba32Float` grids. A single full-surface draw runs one fragment per
//! contact, and each fragment scans the whole vertex grid. The output grid
//! holds the 1-based position of the nearest vertex in channel 0.
//!
//! Pipeline:
//!   points --[grid]--> Grid --[surface]--> GridTexture x2 + RenderTarget
//!          --[kernel]--> output texture --[extract]--> IndexArray
//!
//! [`cpu`] carries the same scan on the host and is the reference the GPU
//! path is tested against. [`sequencer`] drives many cells through one
//! [`engine::Resolver`], one cell at a time.

pub mod config;
pub mod cpu;
pub mod engine;
pub mod error;
pub mod extract;
pub mod grid;
pub mod kernel;
pub mod sequencer;
pub mod surface;

pub use config::{EngineConfig, GridDims, Termination};
pub use cpu::CpuResolver;
pub use engine::{NearestVertexEngine, Resolver};
pub use error::{BoxError, CellError, NnError};
pub use extract::IndexArray;
pub use grid::Grid;
pub use sequencer::{Cell, CellSink, CellSource, FailurePolicy, SequenceReport, Sequencer};

/// A device for GPU tests. Panics when the machine has none, so an ignored
/// test run with `--ignored` never passes without touching the device.
#[cfg(test)]
pub(crate) fn test_surface() -> surface::ComputeSurface {
    let surface = surface::ComputeSurface::new(wgpu::PowerPreference::LowPower)
        .expect("GPU test needs an adapter");
    assert!(
        surface.supports_floating_point_grids(),
        "{} cannot render to float grids",
        surface.adapter_info().name
    );
    surface
}
