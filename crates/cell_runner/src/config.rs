use clap::{Parser, ValueEnum};
use nearest_vertex::{EngineConfig, FailurePolicy, GridDims, Termination};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::CELL_LIST_FILE;

/// `cell_runner` - batch nearest-vertex annotation of contact records.
///
/// Walks a list of cells. For each one it loads the contacts and the mesh
/// vertices, finds every contact's nearest vertex on the GPU and writes the
/// contacts back out with the result attached. Cells run strictly one after
/// another.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Directory holding `conns-<id>.json` files and the `meshes/` directory.
    #[arg(long, env = "CELL_DATA_DIR")]
    pub data_dir: PathBuf,

    /// JSON array of cell ids. Defaults to `conns-list.json` in the data directory.
    #[arg(long, env = "CELL_LIST")]
    pub cell_list: Option<PathBuf>,

    /// Where annotated `conns-<id>.json` files are written. Created if missing.
    #[arg(long, env = "CELL_OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// Grid rows. Rows x cols bounds the points per set.
    #[arg(long, env = "GRID_ROWS", default_value_t = 1024)]
    pub rows: u32,

    /// Grid columns.
    #[arg(long, env = "GRID_COLS", default_value_t = 1024)]
    pub cols: u32,

    /// How the end of each point set is found on the device.
    #[arg(long, env = "GRID_TERMINATION", value_enum, default_value_t = TerminationArg::ExplicitLength)]
    pub termination: TerminationArg,

    /// What to do when a cell fails to load, resolve or persist.
    #[arg(long, env = "ON_CELL_FAILURE", value_enum, default_value_t = PolicyArg::Halt)]
    pub on_failure: PolicyArg,

    /// Give up on a readback after this many milliseconds. 0 waits indefinitely.
    #[arg(long, env = "READBACK_TIMEOUT_MS", default_value_t = 0)]
    pub readback_timeout_ms: u64,

    /// Resolve on the CPU with the reference scan instead of the GPU.
    #[arg(long, env = "CPU_REFERENCE")]
    pub cpu_reference: bool,

    /// Prefer an integrated GPU over a discrete one.
    #[arg(long, env = "LOW_POWER_GPU")]
    pub low_power: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationArg {
    ExplicitLength,
    Sentinel,
}

impl From<TerminationArg> for Termination {
    fn from(arg: TerminationArg) -> Self {
        match arg {
            TerminationArg::ExplicitLength => Termination::ExplicitLength,
            TerminationArg::Sentinel => Termination::Sentinel,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyArg {
    Halt,
    Skip,
}

impl From<PolicyArg> for FailurePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Halt => FailurePolicy::Halt,
            PolicyArg::Skip => FailurePolicy::Skip,
        }
    }
}

impl Config {
    pub fn cell_list_path(&self) -> PathBuf {
        self.cell_list
            .clone()
            .unwrap_or_else(|| self.data_dir.join(CELL_LIST_FILE))
    }

    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        Ok(EngineConfig {
            dims: GridDims::new(self.rows, self.cols)?,
            termination: self.termination.into(),
            readback_timeout: (self.readback_timeout_ms > 0)
                .then(|| Duration::from_millis(self.readback_timeout_ms)),
            power_preference: if self.low_power {
                wgpu::PowerPreference::LowPower
            } else {
                wgpu::PowerPreference::HighPerformance
            },
        })
    }
}
