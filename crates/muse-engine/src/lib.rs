//! Candidate image aggregation and tournament selection.
//!
//! Sources produce candidates, the aggregator pools them, and the selectors
//! narrow the pool by composing badge-numbered grids and asking a vision judge
//! which cells to keep. Every image touched gets a stable id from the
//! session's [`ImageRegistry`].

use muse_contracts::events::{EventWriter, SessionEvent};
use tracing::warn;

pub mod aggregate;
pub mod config;
pub mod download;
pub mod error;
pub mod grid;
pub mod oracle;
pub mod registry;
pub mod select;
pub mod session;
pub mod sources;

#[cfg(test)]
mod test_support;

pub use aggregate::{aggregate, dedup_by_key, AggregatedPool};
pub use config::{JudgeConfig, SelectorConfig};
pub use error::{DownloadError, GridError, JudgeError, LoadError, RegistryError};
pub use grid::{GridCellInput, GridCompositor, GridRender, GridRequest, RenderedCell};
pub use oracle::{DryrunJudge, OpenAiJudge, Pick, SelectionOracle, SelectionQuery, VisionJudge};
pub use registry::{IdValidation, ImageRegistry, LocalizeReport};
pub use select::Selector;
pub use session::{Session, SessionLayout};
pub use sources::{CandidateSource, FixtureSource, SourceQuery, SourceRegistry};

/// Appends a session event; a failed write is logged and otherwise ignored.
pub(crate) fn emit_event(events: Option<&EventWriter>, event: SessionEvent) {
    let Some(events) = events else {
        return;
    };
    if let Err(err) = events.emit(&event) {
        warn!(
            event = event.kind(),
            path = %events.path().display(),
            "failed to write event: {err:#}"
        );
    }
}
