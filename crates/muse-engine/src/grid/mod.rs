use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use muse_contracts::events::{EventWriter, SessionEvent};
use muse_contracts::images::{GridAspect, GridCacheEntry, ImageId};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::emit_event;
use crate::error::GridError;
use crate::registry::ImageRegistry;

mod glyphs;
mod load;

pub use glyphs::{badge_width, BADGE_HEIGHT};

pub const MAX_CELLS: usize = 9;
pub const COLUMNS: usize = 3;
pub const BASE_CELL: u32 = 256;

const CANVAS_FILL: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridCellInput {
    pub id: ImageId,
    pub reference: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridRequest {
    pub label: String,
    pub aspect: GridAspect,
    pub cells: Vec<GridCellInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedCell {
    /// 1-based, row-major.
    pub position: usize,
    pub id: ImageId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridRender {
    pub path: PathBuf,
    pub label: String,
    pub cells: Vec<RenderedCell>,
    pub cached: bool,
    pub requested: usize,
}

impl GridRender {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Registry id drawn at a 1-based grid position.
    pub fn id_at(&self, position: usize) -> Option<ImageId> {
        self.cells
            .iter()
            .find(|cell| cell.position == position)
            .map(|cell| cell.id)
    }

    fn from_cache(entry: GridCacheEntry, label: &str, requested: usize) -> Self {
        let order = if entry.cell_order.is_empty() {
            entry.source_image_ids
        } else {
            entry.cell_order
        };
        Self {
            path: PathBuf::from(entry.render_path),
            label: label.to_string(),
            cells: numbered(&order),
            cached: true,
            requested,
        }
    }
}

pub fn cell_size(aspect: GridAspect) -> (u32, u32) {
    let wide = BASE_CELL * 3 / 2;
    match aspect {
        GridAspect::Square => (BASE_CELL, BASE_CELL),
        GridAspect::Landscape => (wide, BASE_CELL),
        GridAspect::Portrait => (BASE_CELL, wide),
    }
}

/// Lays out up to nine registered images as one badge-numbered raster.
pub struct GridCompositor {
    registry: Arc<ImageRegistry>,
    grids_dir: PathBuf,
    http: reqwest::Client,
    events: Option<EventWriter>,
}

impl GridCompositor {
    pub fn new(registry: Arc<ImageRegistry>, grids_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            grids_dir: grids_dir.into(),
            http: reqwest::Client::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &Arc<ImageRegistry> {
        &self.registry
    }

    pub fn grids_dir(&self) -> &Path {
        &self.grids_dir
    }

    pub async fn compose(&self, request: &GridRequest) -> Result<GridRender, GridError> {
        if request.cells.is_empty() {
            return Err(GridError::EmptyRequest);
        }
        if request.cells.len() > MAX_CELLS {
            return Err(GridError::TooManyCells(request.cells.len()));
        }
        let requested = request.cells.len();
        let requested_ids: Vec<ImageId> = request.cells.iter().map(|cell| cell.id).collect();
        if let Some(entry) = self.registry.cached_grid(&requested_ids, &request.label) {
            debug!(label = %request.label, path = %entry.render_path, "reusing cached grid");
            return Ok(GridRender::from_cache(entry, &request.label, requested));
        }

        let loads = request.cells.iter().map(|cell| async move {
            let local = self
                .registry
                .image(cell.id)
                .filter(|image| !image.is_remote())
                .map(|image| image.path);
            let result = load::load_cell_image(&self.http, &cell.reference, local.as_deref()).await;
            (cell.id, result)
        });
        let mut loaded: Vec<(ImageId, DynamicImage)> = Vec::new();
        for (id, result) in join_all(loads).await {
            match result {
                Ok(image) => loaded.push((id, image)),
                Err(err) => warn!(label = %request.label, id, "dropping grid cell: {err}"),
            }
        }
        if loaded.is_empty() {
            return Err(GridError::NoRenderableImages {
                label: request.label.clone(),
                requested,
            });
        }

        let drawn_ids: Vec<ImageId> = loaded.iter().map(|(id, _)| *id).collect();
        if drawn_ids.len() < requested {
            if let Some(entry) = self.registry.cached_grid(&drawn_ids, &request.label) {
                debug!(
                    label = %request.label,
                    path = %entry.render_path,
                    "reusing cached grid for loaded subset"
                );
                return Ok(GridRender::from_cache(entry, &request.label, requested));
            }
        }

        let canvas = render(&loaded, request.aspect);
        let path = self.write_png(&canvas, &request.label).await?;
        self.registry.cache_grid(&path, &drawn_ids, &request.label);
        info!(
            label = %request.label,
            path = %path.display(),
            drawn = drawn_ids.len(),
            requested,
            "created grid"
        );

        emit_event(
            self.events.as_ref(),
            SessionEvent::GridCreated {
                label: request.label.clone(),
                path: path.display().to_string(),
                aspect: request.aspect,
                requested,
                image_ids: drawn_ids.clone(),
                width: canvas.width(),
                height: canvas.height(),
            },
        );

        Ok(GridRender {
            path,
            label: request.label.clone(),
            cells: numbered(&drawn_ids),
            cached: false,
            requested,
        })
    }

    async fn write_png(&self, canvas: &RgbImage, label: &str) -> Result<PathBuf, GridError> {
        let mut bytes = Vec::new();
        canvas
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|source| GridError::Encode {
                label: label.to_string(),
                source,
            })?;
        let path = self.grids_dir.join(grid_file_name(label));
        let write_err = |source| GridError::Write {
            path: path.display().to_string(),
            source,
        };
        tokio::fs::create_dir_all(&self.grids_dir)
            .await
            .map_err(write_err)?;
        tokio::fs::write(&path, bytes).await.map_err(write_err)?;
        Ok(path)
    }
}

fn numbered(ids: &[ImageId]) -> Vec<RenderedCell> {
    ids.iter()
        .enumerate()
        .map(|(idx, id)| RenderedCell {
            position: idx + 1,
            id: *id,
        })
        .collect()
}

fn grid_file_name(label: &str) -> String {
    let safe: String = label
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{safe}_{timestamp}_{}.png", &suffix[..8])
}

/// Three columns, rows as needed. Each image is scaled to the cell width,
/// cropped from the bottom when too tall or centered vertically when too
/// short, then stamped with its `#id` badge.
fn render(cells: &[(ImageId, DynamicImage)], aspect: GridAspect) -> RgbImage {
    let (cell_w, cell_h) = cell_size(aspect);
    let rows = cells.len().div_ceil(COLUMNS) as u32;
    let mut canvas = RgbImage::from_pixel(COLUMNS as u32 * cell_w, rows * cell_h, CANVAS_FILL);

    for (idx, (id, image)) in cells.iter().enumerate() {
        let x = (idx % COLUMNS) as u32 * cell_w;
        let y = (idx / COLUMNS) as u32 * cell_h;

        let cropped = visible_rows(image, cell_w, cell_h);
        let visible = flatten_on_white(cropped.as_ref().unwrap_or(image));
        let scaled_h = ((f64::from(cell_w) * f64::from(visible.height())
            / f64::from(visible.width()))
        .round() as u32)
            .max(1);
        let scaled = imageops::resize(&visible, cell_w, scaled_h, FilterType::Triangle);
        if scaled_h >= cell_h {
            let window = imageops::crop_imm(&scaled, 0, 0, cell_w, cell_h).to_image();
            imageops::overlay(&mut canvas, &window, i64::from(x), i64::from(y));
        } else {
            let offset = (cell_h - scaled_h) / 2;
            imageops::overlay(&mut canvas, &scaled, i64::from(x), i64::from(y + offset));
        }
        glyphs::draw_badge(&mut canvas, x, y, *id);
    }
    canvas
}

/// The top rows of `image` that remain once it is scaled to `cell_w` wide
/// and cropped to `cell_h`. `None` when every row remains.
fn visible_rows(image: &DynamicImage, cell_w: u32, cell_h: u32) -> Option<DynamicImage> {
    let (width, height) = (image.width(), image.height());
    let needed = (u64::from(cell_h) * u64::from(width)).div_ceil(u64::from(cell_w));
    let rows = u32::try_from(needed).unwrap_or(u32::MAX).clamp(1, height);
    (rows < height).then(|| image.crop_imm(0, 0, width, rows))
}

/// Composites any alpha onto a white background.
pub(crate) fn flatten_on_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flat = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flat.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flat
}
