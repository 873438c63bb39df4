use serde::{Deserialize, Serialize};

/// One raw image reference produced by a source for a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CandidateImage {
    #[serde(alias = "pageUrl", alias = "url")]
    pub page_url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "thumbnailRef", alias = "thumbnailURL")]
    pub thumbnail_ref: Option<String>,
    #[serde(default, alias = "screenshotRef", alias = "screenshotURL")]
    pub screenshot_ref: Option<String>,
}

impl CandidateImage {
    pub fn new(page_url: impl Into<String>) -> Self {
        Self {
            page_url: page_url.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_thumbnail(mut self, thumbnail_ref: impl Into<String>) -> Self {
        self.thumbnail_ref = Some(thumbnail_ref.into());
        self
    }

    pub fn with_screenshot(mut self, screenshot_ref: impl Into<String>) -> Self {
        self.screenshot_ref = Some(screenshot_ref.into());
        self
    }

    /// The reference that gets registered and drawn: full resolution first.
    pub fn image_ref(&self) -> Option<&str> {
        non_blank(self.screenshot_ref.as_deref())
            .or_else(|| non_blank(self.thumbnail_ref.as_deref()))
    }

    /// A candidate without any image reference never enters a pool.
    pub fn is_valid(&self) -> bool {
        self.image_ref().is_some()
    }

    /// Two candidates with the same key are the same image.
    pub fn canonical_key(&self) -> &str {
        self.image_ref().unwrap_or(self.page_url.as_str())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

/// Everything one source returned for one query.
///
/// `error` is set when the source failed; a failed source never substitutes
/// invented entries, so `candidates` is then empty or holds only what was
/// really fetched before the failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceOutcome {
    pub source: String,
    pub query: String,
    #[serde(default)]
    pub candidates: Vec<CandidateImage>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SourceOutcome {
    pub fn ok(
        source: impl Into<String>,
        query: impl Into<String>,
        candidates: Vec<CandidateImage>,
    ) -> Self {
        Self {
            source: source.into(),
            query: query.into(),
            candidates,
            error: None,
        }
    }

    pub fn failed(
        source: impl Into<String>,
        query: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            query: query.into(),
            candidates: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}
