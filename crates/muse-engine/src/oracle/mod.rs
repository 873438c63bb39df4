use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use muse_contracts::events::{EventWriter, SessionEvent};
use serde_json::json;
use tracing::{info, warn};

use crate::error::JudgeError;
use crate::emit_event;

pub mod openai;
pub mod parse;

pub use openai::OpenAiJudge;
pub use parse::{parse_selection, ParseStrategy, ParsedSelection, Pick};

/// Everything a judge needs to rank one grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeRequest {
    pub grid_path: PathBuf,
    pub instructions: String,
    /// Number of cells drawn in the grid.
    pub total: usize,
    /// How many positions the judge is asked for.
    pub limit: usize,
}

/// Transport to a vision model. Returns the raw reply text.
#[async_trait]
pub trait VisionJudge: Send + Sync {
    fn name(&self) -> &str;
    async fn judge(&self, request: &JudgeRequest) -> Result<String, JudgeError>;
}

/// Offline judge: always answers the first `limit` positions.
pub struct DryrunJudge;

#[async_trait]
impl VisionJudge for DryrunJudge {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn judge(&self, request: &JudgeRequest) -> Result<String, JudgeError> {
        let picks: Vec<_> = (1..=request.limit.min(request.total))
            .map(|number| json!({"number": number, "reason": "dryrun pick"}))
            .collect();
        Ok(json!({ "best_images": picks }).to_string())
    }
}

/// One ranking question about a rendered grid.
#[derive(Debug, Clone, Copy)]
pub struct SelectionQuery<'a> {
    pub grid_path: &'a Path,
    pub label: &'a str,
    pub context: &'a str,
    pub guide: Option<&'a str>,
    pub total: usize,
    pub limit: usize,
}

/// Wraps a judge with prompt construction, reply parsing and event logging.
#[derive(Clone)]
pub struct SelectionOracle {
    judge: Arc<dyn VisionJudge>,
    events: Option<EventWriter>,
}

impl SelectionOracle {
    pub fn new(judge: Arc<dyn VisionJudge>) -> Self {
        Self {
            judge,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn judge_name(&self) -> &str {
        self.judge.name()
    }

    /// Asks the judge for up to `limit` grid positions.
    ///
    /// An unusable reply is an empty selection, not an error; only transport
    /// failures come back as `Err`.
    pub async fn select(&self, query: SelectionQuery<'_>) -> Result<Vec<Pick>, JudgeError> {
        if query.total == 0 || query.limit == 0 {
            return Ok(Vec::new());
        }
        let request = JudgeRequest {
            grid_path: query.grid_path.to_path_buf(),
            instructions: build_instructions(query.context, query.guide, query.total, query.limit),
            total: query.total,
            limit: query.limit,
        };
        let reply = self.judge.judge(&request).await?;
        let parsed = parse_selection(&reply, query.total, query.limit);
        let positions: Vec<usize> = parsed.picks.iter().map(|pick| pick.position).collect();

        if parsed.picks.is_empty() {
            warn!(
                label = query.label,
                judge = self.judge.name(),
                "judge reply held no usable positions"
            );
        } else {
            info!(label = query.label, judge = self.judge.name(), ?positions, "judge selected");
        }

        emit_event(
            self.events.as_ref(),
            SessionEvent::OracleSelection {
                label: query.label.to_string(),
                judge: self.judge.name().to_string(),
                grid_path: query.grid_path.display().to_string(),
                total: query.total,
                limit: query.limit,
                positions,
                strategy: format!("{:?}", parsed.strategy).to_lowercase(),
            },
        );

        Ok(parsed.picks)
    }
}

/// Ranking prompt sent alongside every grid.
pub fn build_instructions(
    context: &str,
    guide: Option<&str>,
    total: usize,
    limit: usize,
) -> String {
    let mut prompt = format!(
        "We are searching the web for design inspiration. We have {total} images that we want to \
         rank. First keep only the images relevant to the brief, then rank those by how \
         aesthetically pleasing they are."
    );
    if !context.trim().is_empty() {
        prompt.push_str("\n\nBackground:\n");
        prompt.push_str(context.trim());
    }
    if let Some(guide) = guide.map(str::trim).filter(|guide| !guide.is_empty()) {
        prompt.push_str("\n\nJudging guide:\n");
        prompt.push_str(guide);
    }
    prompt.push_str(&format!(
        "\n\nSelect the best {limit} images from the grid. Refer to each image by its grid \
         position, 1 to {total}, counted left to right and top to bottom, not by the #id badge \
         drawn on it. Respond only with JSON of the form {{\"best_images\": [{{\"number\": \
         <position>, \"reason\": \"<short reason>\"}}]}}."
    ));
    prompt
}
