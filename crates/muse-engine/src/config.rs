use std::env;
use std::time::Duration;

use muse_contracts::images::GridAspect;

pub const DEFAULT_SELECTION_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_JUDGE_TIMEOUT_SECS: f64 = 60.0;
pub const DEFAULT_ROUND_CAP: usize = 3;
pub const DEFAULT_PER_SOURCE_LIMIT: usize = 9;
pub const DEFAULT_PER_SOURCE_PICKS: usize = 4;
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
pub const FETCH_USER_AGENT: &str = "Mozilla/5.0 (compatible; muse/0.1)";

pub const DEFAULT_JUDGE_GUIDE: &str = "Select designs with exceptional quality, clear visual \
    communication, and strong relevance to the design brief. Avoid low-quality, generic, or \
    poorly executed designs.";

/// Connection settings for the OpenAI-backed judge.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub timeout: Duration,
    pub max_dim: u32,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.openai.com/v1".to_string(),
            model: DEFAULT_SELECTION_MODEL.to_string(),
            timeout: Duration::from_secs_f64(DEFAULT_JUDGE_TIMEOUT_SECS),
            max_dim: 1536,
        }
    }
}

impl JudgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. Each setting takes the first
    /// of its keys holding a non-blank value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let setting = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(key))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };
        let defaults = Self::default();
        let timeout = setting(&["MUSE_JUDGE_TIMEOUT_SECS"])
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(defaults.timeout);
        Self {
            api_key: setting(&["OPENAI_API_KEY", "OPENAI_API_KEY_BACKUP"]),
            api_base: setting(&["OPENAI_API_BASE", "OPENAI_BASE_URL"])
                .map(|raw| versioned_base(&raw))
                .unwrap_or_else(|| defaults.api_base.clone()),
            model: setting(&["MUSE_SELECTION_MODEL", "OPENAI_VISION_MODEL"])
                .unwrap_or_else(|| defaults.model.clone()),
            timeout,
            ..defaults
        }
    }
}

/// Knobs shared by the tournament and per-source strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    pub round_cap: usize,
    pub aspect: GridAspect,
    pub label_prefix: String,
    /// Background brief handed to the judge with every grid.
    pub context: String,
    pub judge_guide: Option<String>,
    pub per_source_limit: usize,
    pub per_source_picks: usize,
    /// Bounds one whole round; individual judge calls are not cut short.
    pub round_timeout: Option<Duration>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            round_cap: DEFAULT_ROUND_CAP,
            aspect: GridAspect::Square,
            label_prefix: "smart".to_string(),
            context: String::new(),
            judge_guide: None,
            per_source_limit: DEFAULT_PER_SOURCE_LIMIT,
            per_source_picks: DEFAULT_PER_SOURCE_PICKS,
            round_timeout: None,
        }
    }
}

/// Appends `/v1` to a base URL with no path of its own.
fn versioned_base(raw: &str) -> String {
    let base = raw.trim_end_matches('/');
    match reqwest::Url::parse(base) {
        Ok(url) if matches!(url.path(), "" | "/") => format!("{base}/v1"),
        _ => base.to_string(),
    }
}
