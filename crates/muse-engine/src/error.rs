use muse_contracts::images::{ImageCategory, ImageId};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("image reference must not be empty")]
    EmptyReference,

    #[error(
        "invalid {expected} id #{id}{}; valid {expected} ids are [{}]",
        .actual.map(|category| format!(" (registered as {category})")).unwrap_or_default(),
        join_ids(.valid_ids)
    )]
    InvalidIdentity {
        id: ImageId,
        expected: ImageCategory,
        actual: Option<ImageCategory>,
        valid_ids: Vec<ImageId>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} returned an empty body")]
    EmptyBody { url: String },

    #[error("failed writing {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed copying into {path}: {source}")]
    Copy {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why one grid cell could not be loaded. The cell is dropped, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("empty payload from {0}")]
    EmptyPayload(String),

    #[error("failed reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("fetch of {0} failed: {1}")]
    Fetch(String, String),

    #[error("invalid data URL")]
    DataUrl,

    #[error("unsupported image reference {0}")]
    UnsupportedScheme(String),

    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("image has zero dimensions")]
    ZeroDimensions,
}

#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("grid request has no cells")]
    EmptyRequest,

    #[error("grid request has {0} cells, at most {max} fit", max = crate::grid::MAX_CELLS)]
    TooManyCells(usize),

    #[error("none of the {requested} images for grid {label} could be loaded")]
    NoRenderableImages { label: String, requested: usize },

    #[error("failed encoding grid {label}: {source}")]
    Encode {
        label: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed writing grid {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("no API key configured for judge {0}")]
    MissingApiKey(String),

    #[error("failed reading grid {path}: {source}")]
    ReadGrid {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("judge request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("judge answered HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("judge returned no text")]
    EmptyResponse,

    #[error("judge refused: {0}")]
    Refused(String),
}

pub(crate) fn join_ids(ids: &[ImageId]) -> String {
    ids.iter()
        .map(ImageId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
