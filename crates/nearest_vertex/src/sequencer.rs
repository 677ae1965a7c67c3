//! Drives cells through load, resolve and persist, strictly one at a time.
//!
//! The next cell is not loaded until the previous one has been persisted, so
//! at most one cell's grids are alive on the device at any moment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;

use crate::engine::Resolver;
use crate::error::{BoxError, CellError};
use crate::extract::IndexArray;

/// One unit of work: a set of contacts and the mesh they attach to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cell {
    pub id: String,
    pub contacts: Vec<Vec3>,
    pub vertices: Vec<Vec3>,
}

/// Where cells come from.
pub trait CellSource {
    fn load(&mut self, id: &str) -> Result<Cell, BoxError>;
}

/// Where resolved cells go. `indices` is in `cell.contacts` order.
pub trait CellSink {
    fn persist(&mut self, cell: &Cell, indices: &IndexArray) -> Result<(), BoxError>;
}

/// What to do when a cell fails at any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop the run and return the error.
    #[default]
    Halt,
    /// Log, record the failure and move to the next cell.
    Skip,
}

#[derive(Debug, Default)]
pub struct SequenceReport {
    /// Persisted cells, in processing order.
    pub completed: Vec<String>,
    /// Cells skipped under [`FailurePolicy::Skip`].
    pub failed: Vec<CellError>,
    /// The run stopped early because cancellation was requested.
    pub cancelled: bool,
}

impl SequenceReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

pub struct Sequencer<R> {
    resolver: R,
    policy: FailurePolicy,
    cancel: Arc<AtomicBool>,
}

impl<R: Resolver> Sequencer<R> {
    pub fn new(resolver: R, policy: FailurePolicy) -> Self {
        Self {
            resolver,
            policy,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops the run before the next cell starts. The cell in
    /// flight always finishes.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Process `ids` in order.
    ///
    /// Under [`FailurePolicy::Halt`] the first failure is returned as `Err`;
    /// cells persisted before it stay persisted.
    pub fn run<I, S>(
        &mut self,
        ids: I,
        source: &mut dyn CellSource,
        sink: &mut dyn CellSink,
    ) -> Result<SequenceReport, CellError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = SequenceReport::default();

        for id in ids {
            let id = id.as_ref();
            if self.cancel.load(Ordering::Relaxed) {
                tracing::info!(next = id, "Cancellation requested, stopping");
                report.cancelled = true;
                break;
            }

            let span = tracing::info_span!("cell", id);
            let _enter = span.enter();

            match self.process(id, source, sink) {
                Ok(()) => report.completed.push(id.to_owned()),
                Err(e) => match self.policy {
                    FailurePolicy::Halt => {
                        tracing::error!(error = ?e, "Cell failed, halting");
                        return Err(e);
                    }
                    FailurePolicy::Skip => {
                        tracing::warn!(error = ?e, "Cell failed, skipping");
                        report.failed.push(e);
                    }
                },
            }
        }

        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled,
            "Sequence finished"
        );
        Ok(report)
    }

    fn process(
        &self,
        id: &str,
        source: &mut dyn CellSource,
        sink: &mut dyn CellSink,
    ) -> Result<(), CellError> {
        let started = Instant::now();

        let cell = source.load(id).map_err(|source| CellError::Load {
            id: id.to_owned(),
            source,
        })?;

        let indices = self
            .resolver
            .resolve(&cell.contacts, &cell.vertices)
            .map_err(|source| CellError::Resolve {
                id: id.to_owned(),
                source,
            })?;

        sink.persist(&cell, &indices)
            .map_err(|source| CellError::Persist {
                id: id.to_owned(),
                source,
            })?;

        tracing::info!(
            contacts = cell.contacts.len(),
            vertices = cell.vertices.len(),
            unmatched = indices.unmatched(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cell persisted"
        );
        Ok(())
    }
}
