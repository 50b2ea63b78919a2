use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identity of one loaded document. A fresh id is assigned on every load so
/// that page handles and cached geometry from a previous document can never
/// be confused with the current one.
pub type DocumentId = Uuid;

pub fn new_document_id() -> DocumentId {
    Uuid::new_v4()
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("page dimensions must be positive, got {width}x{height}")]
    InvalidPageDimensions { width: f64, height: f64 },
    #[error("selection geometry contains no usable rectangles")]
    DegenerateInput,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptionsError {
    #[error("scale must be positive and finite, got {0}")]
    InvalidScale(f64),
    #[error("border offset must be non-negative and finite, got {0}")]
    InvalidBorderOffset(f64),
}

/// Viewer configuration. Defaults render pages at 1.2x their intrinsic size
/// with an 11px inter-page border.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerOptions {
    /// Multiplier applied to intrinsic page sizes.
    pub scale: f64,
    /// Extra pages kept mounted beyond the visible range in each direction.
    pub overscan_count: usize,
    /// Vertical space reserved between consecutive pages.
    pub border_offset: f64,
    /// Cosmetic highlight color handed through to presentation components.
    pub text_selection_color: Option<String>,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            scale: 1.2,
            overscan_count: 1,
            border_offset: 11.0,
            text_selection_color: None,
        }
    }
}

impl ViewerOptions {
    pub fn validated(self) -> Result<Self, OptionsError> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(OptionsError::InvalidScale(self.scale));
        }
        if !self.border_offset.is_finite() || self.border_offset < 0.0 {
            return Err(OptionsError::InvalidBorderOffset(self.border_offset));
        }
        Ok(self)
    }
}

/// A rectangle in rendered-page pixel space. Gestures may be dragged in any
/// direction, so corners are not required to arrive in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl PixelRect {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Reorders the corners so that (x1, y1) is the top-left one.
    pub fn canonical(self) -> Self {
        Self {
            x1: self.x1.min(self.x2),
            y1: self.y1.min(self.y2),
            x2: self.x1.max(self.x2),
            y2: self.y1.max(self.y2),
        }
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// A collapsed DOM range or a zero-length drag produces a rectangle with
    /// no area. Such rectangles never become selections.
    pub fn is_degenerate(&self) -> bool {
        let canonical = self.canonical();
        canonical.width() <= 0.0 || canonical.height() <= 0.0
    }
}

/// A rectangle expressed as fractions of a page's rendered size, valid across
/// zoom levels and re-renders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl NormalizedRect {
    pub fn clamp(self) -> Self {
        Self {
            x1: self.x1.clamp(0.0, 1.0),
            y1: self.y1.clamp(0.0, 1.0),
            x2: self.x2.clamp(0.0, 1.0),
            y2: self.y2.clamp(0.0, 1.0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.x1 <= self.x2
            && self.y1 <= self.y2
            && self.x1 >= 0.0
            && self.y1 >= 0.0
            && self.x2 <= 1.0
            && self.y2 <= 1.0
    }
}

/// A normalized selection location: the page it belongs to, the rectangles a
/// text range decomposes into, and their union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPosition {
    /// 1-based page number, stable for the lifetime of the document.
    pub page_number: usize,
    pub bounding_rect: NormalizedRect,
    pub rects: Vec<NormalizedRect>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSelection {
    pub position: NormalizedPosition,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaSelection {
    pub position: NormalizedPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    Text(TextSelection),
    Area(AreaSelection),
}

impl Selection {
    pub fn position(&self) -> &NormalizedPosition {
        match self {
            Selection::Text(text) => &text.position,
            Selection::Area(area) => &area.position,
        }
    }

    pub fn page_number(&self) -> usize {
        self.position().page_number
    }
}

/// Converts raw pixel rectangles captured on a page into a normalized
/// position. Degenerate rectangles are dropped; if nothing usable remains the
/// gesture yields no selection at all rather than a zero-area one.
pub fn normalize_rects(
    page_number: usize,
    rects: &[PixelRect],
    page_width: f64,
    page_height: f64,
) -> Result<NormalizedPosition, GeometryError> {
    if !(page_width > 0.0) || !(page_height > 0.0) {
        return Err(GeometryError::InvalidPageDimensions {
            width: page_width,
            height: page_height,
        });
    }

    let normalized: Vec<NormalizedRect> = rects
        .iter()
        .filter(|rect| !rect.is_degenerate())
        .map(|rect| {
            let rect = rect.canonical();
            NormalizedRect {
                x1: rect.x1 / page_width,
                y1: rect.y1 / page_height,
                x2: rect.x2 / page_width,
                y2: rect.y2 / page_height,
            }
            .clamp()
        })
        .collect();

    if normalized.is_empty() {
        return Err(GeometryError::DegenerateInput);
    }

    let bounding_rect = bounding_rect_of(&normalized);
    Ok(NormalizedPosition {
        page_number,
        bounding_rect,
        rects: normalized,
    })
}

/// Exact inverse of normalization: `denormalize(normalize(r, d), d) ≈ r`.
pub fn denormalize(rect: NormalizedRect, page_width: f64, page_height: f64) -> PixelRect {
    PixelRect {
        x1: rect.x1 * page_width,
        y1: rect.y1 * page_height,
        x2: rect.x2 * page_width,
        y2: rect.y2 * page_height,
    }
}

fn bounding_rect_of(rects: &[NormalizedRect]) -> NormalizedRect {
    let mut iter = rects.iter();
    let first = *iter.next().expect("bounding_rect_of requires rects");
    iter.fold(first, |acc, rect| NormalizedRect {
        x1: acc.x1.min(rect.x1),
        y1: acc.y1.min(rect.y1),
        x2: acc.x2.max(rect.x2),
        y2: acc.y2.max(rect.y2),
    })
}

/// Intrinsic page size reported by the document renderer, before scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

/// Rendered size of one page at the current scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageGeometry {
    /// 1-based page number.
    pub page_number: usize,
    pub width: f64,
    pub height: f64,
}

/// Per-page geometry plus cumulative vertical offsets, computed once per
/// document load and replaced wholesale when the document or scale changes.
///
/// Offset entry `i` is the bottom edge of page `i + 1`: the sum of the scaled
/// heights and inter-page borders of pages `1..=i+1`. The sequence is strictly
/// increasing because page heights are validated to be positive.
#[derive(Debug, Clone, PartialEq)]
pub struct PageLayout {
    geometries: Vec<PageGeometry>,
    offsets: Vec<f64>,
}

impl PageLayout {
    pub fn from_page_sizes(
        sizes: &[PageSize],
        options: &ViewerOptions,
    ) -> Result<Self, GeometryError> {
        let mut geometries = Vec::with_capacity(sizes.len());
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut bottom = 0.0;

        for (index, size) in sizes.iter().enumerate() {
            if !(size.width > 0.0) || !(size.height > 0.0) {
                return Err(GeometryError::InvalidPageDimensions {
                    width: size.width,
                    height: size.height,
                });
            }
            let width = size.width * options.scale;
            let height = size.height * options.scale;
            geometries.push(PageGeometry {
                page_number: index + 1,
                width,
                height,
            });
            bottom += height + options.border_offset;
            offsets.push(bottom);
        }

        Ok(Self {
            geometries,
            offsets,
        })
    }

    pub fn empty() -> Self {
        Self {
            geometries: Vec::new(),
            offsets: Vec::new(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.geometries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }

    /// Geometry for a 1-based page number.
    pub fn geometry(&self, page_number: usize) -> Option<&PageGeometry> {
        page_number
            .checked_sub(1)
            .and_then(|index| self.geometries.get(index))
    }

    pub fn geometries(&self) -> &[PageGeometry] {
        &self.geometries
    }

    pub fn offsets(&self) -> &[f64] {
        &self.offsets
    }

    pub fn total_height(&self) -> f64 {
        self.offsets.last().copied().unwrap_or(0.0)
    }

    /// Computes the 0-based indices of pages that must be mounted for the
    /// given scroll position: the pages intersecting the viewport expanded by
    /// `overscan` pages on each side, clamped to the document.
    ///
    /// The first visible page is the one whose bottom edge lies strictly
    /// below the viewport top; the last is found the same way against the
    /// viewport bottom, falling back to the final page once the viewport
    /// extends past the end of the document. A viewport edge landing exactly
    /// on a page boundary resolves with the strictly-greater comparison, so
    /// the following page is still mounted.
    ///
    /// Runs in O(page count); it is recomputed on every scroll tick.
    pub fn visible_pages(
        &self,
        scroll_top: f64,
        viewport_height: f64,
        overscan: usize,
    ) -> Vec<usize> {
        let count = self.geometries.len();
        if count == 0 {
            return Vec::new();
        }
        let last_index = count - 1;

        let first = self
            .offsets
            .iter()
            .position(|&offset| offset > scroll_top)
            .unwrap_or(last_index);

        let viewport_bottom = scroll_top + viewport_height;
        let last = if viewport_bottom > self.offsets[last_index] {
            last_index
        } else {
            self.offsets
                .iter()
                .position(|&offset| offset > viewport_bottom)
                .unwrap_or(last_index)
        };

        let start = first.saturating_sub(overscan);
        let end = last.saturating_add(overscan).min(last_index);
        (start..=end).collect()
    }
}

/// Boundary with the external document renderer. The windowing core only ever
/// needs a page count and intrinsic per-page sizes; rasterization and text
/// extraction stay on the other side of this trait.
pub trait DocumentBackend: Send + Sync {
    fn page_count(&self) -> usize;

    /// Intrinsic size of a 1-based page number, in pre-scale units.
    fn page_size(&self, page_number: usize) -> Result<PageSize>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    /// Opens the document behind `source`. Failures are opaque to the viewer
    /// and propagate to the caller unchanged; there is no retry.
    async fn open(&self, source: &str) -> Result<Arc<dyn DocumentBackend>>;
}
