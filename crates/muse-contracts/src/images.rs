use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type ImageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Reference,
    Generated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageCategory {
    Inspiration,
    Draft,
    Medium,
    Final,
}

impl ImageCategory {
    pub const ALL: [ImageCategory; 4] = [
        ImageCategory::Inspiration,
        ImageCategory::Draft,
        ImageCategory::Medium,
        ImageCategory::Final,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ImageCategory::Inspiration => "inspiration",
            ImageCategory::Draft => "draft",
            ImageCategory::Medium => "medium",
            ImageCategory::Final => "final",
        }
    }
}

impl fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageCategory {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "inspiration" => Ok(ImageCategory::Inspiration),
            "draft" => Ok(ImageCategory::Draft),
            "medium" => Ok(ImageCategory::Medium),
            "final" => Ok(ImageCategory::Final),
            other => anyhow::bail!("unknown image category: {other}"),
        }
    }
}

/// Shape of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridAspect {
    #[default]
    Square,
    Landscape,
    Portrait,
}

impl GridAspect {
    pub fn as_str(self) -> &'static str {
        match self {
            GridAspect::Square => "square",
            GridAspect::Landscape => "landscape",
            GridAspect::Portrait => "portrait",
        }
    }
}

impl fmt::Display for GridAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GridAspect {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "square" => Ok(GridAspect::Square),
            "landscape" => Ok(GridAspect::Landscape),
            "portrait" => Ok(GridAspect::Portrait),
            other => anyhow::bail!("unknown grid aspect: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredImage {
    pub id: ImageId,
    pub path: String,
    pub kind: ImageKind,
    pub category: ImageCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_ref: Option<String>,
    pub timestamp: String,
}

impl RegisteredImage {
    pub fn is_remote(&self) -> bool {
        is_remote_ref(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridCacheEntry {
    pub render_path: String,
    pub source_image_ids: Vec<ImageId>,
    pub grid_label: String,
    pub content_hash: String,
    pub timestamp: String,
    /// Row-major ids as drawn, so positions on a cached render map back to ids.
    #[serde(default)]
    pub cell_order: Vec<ImageId>,
}

pub fn is_remote_ref(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

pub fn sorted_id_set(ids: &[ImageId]) -> Vec<ImageId> {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

/// Cache key for a grid: the label plus the id set, independent of order.
pub fn grid_content_hash(grid_label: &str, ids: &[ImageId]) -> String {
    let joined = sorted_id_set(ids)
        .iter()
        .map(ImageId::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let mut hasher = Sha256::new();
    hasher.update(format!("{grid_label}-{joined}").as_bytes());
    hex::encode(hasher.finalize())
}
