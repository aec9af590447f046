use crate::config::DisplayConfig;
use crate::prediction::PredictionRecord;
use opencv::{
    core::{Mat, MatTraitConst, Point, Rect, Scalar, Size, CV_8UC3},
    imgproc,
};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

const MIN_BOX_DIM: f64 = 4.0;
const LABEL_HEIGHT: i32 = 22;
const LABEL_HEIGHT_UNKNOWN: i32 = 16;
const LABEL_PAD: i32 = 8;
const FONT_SCALE: f64 = 0.5;
const FONT_THICKNESS: i32 = 1;
const UNKNOWN_NAME: &str = "Unknown";

/// How often geometry is recomputed even without an observed change.
/// Catches layout changes that raise no event.
const RESYNC_FALLBACK: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("Failed to build overlay canvas: {0}")]
    CanvasFailed(opencv::Error),
    #[error("OpenCV error: {0}")]
    OpenCvError(opencv::Error),
}

impl From<opencv::Error> for OverlayError {
    fn from(err: opencv::Error) -> Self {
        OverlayError::OpenCvError(err)
    }
}

/// The video's displayed rectangle relative to its container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Where predictions land on screen: surface size matches the displayed
/// rectangle exactly, scale factors map source-frame pixels onto it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayGeometry {
    pub surface_width: i32,
    pub surface_height: i32,
    pub offset_x: i32,
    pub offset_y: i32,
    pub scale_x: f64,
    pub scale_y: f64,
}

impl OverlayGeometry {
    /// Recomputes geometry from the video's intrinsic dimensions and its
    /// displayed rectangle. Returns None when the video is not ready
    /// (non-positive intrinsic dimensions), in which case the previous
    /// geometry should be kept.
    pub fn resync(intrinsic: (i32, i32), displayed: DisplayRect) -> Option<Self> {
        let (iw, ih) = intrinsic;
        if iw <= 0 || ih <= 0 {
            return None;
        }
        Some(Self {
            surface_width: displayed.width as i32,
            surface_height: displayed.height as i32,
            offset_x: displayed.x as i32,
            offset_y: displayed.y as i32,
            scale_x: displayed.width / iw as f64,
            scale_y: displayed.height / ih as f64,
        })
    }

    fn is_paintable(&self) -> bool {
        self.scale_x > 0.0
            && self.scale_y > 0.0
            && self.surface_width > 0
            && self.surface_height > 0
    }
}

/// Letterboxes the source aspect ratio into the configured display
/// rectangle, the way a browser fits a video element with object-fit.
pub fn letterbox_rect(intrinsic: (i32, i32), display: &DisplayConfig) -> DisplayRect {
    let (iw, ih) = (intrinsic.0 as f64, intrinsic.1 as f64);
    let (dw, dh) = (display.width as f64, display.height as f64);
    if iw <= 0.0 || ih <= 0.0 || dw <= 0.0 || dh <= 0.0 {
        return DisplayRect {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
        };
    }
    let scale = (dw / iw).min(dh / ih);
    let width = (iw * scale).floor();
    let height = (ih * scale).floor();
    DisplayRect {
        x: ((dw - width) / 2.0).floor(),
        y: ((dh - height) / 2.0).floor(),
        width,
        height,
    }
}

/// A prediction box projected into surface space: scaled, clamped and held
/// to a minimum visible size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectedBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

pub fn project_box(record: &PredictionRecord, geometry: &OverlayGeometry) -> ProjectedBox {
    let sw = geometry.surface_width as f64;
    let sh = geometry.surface_height as f64;
    let mut x1 = (record.x1 * geometry.scale_x).clamp(0.0, sw);
    let mut y1 = (record.y1 * geometry.scale_y).clamp(0.0, sh);
    let mut x2 = (record.x2 * geometry.scale_x).clamp(0.0, sw);
    let mut y2 = (record.y2 * geometry.scale_y).clamp(0.0, sh);
    // Degenerate boxes stay visible: extend to the minimum size, shifting
    // back inside the surface when clamping pinned them to an edge.
    if x2 - x1 < MIN_BOX_DIM {
        x2 = (x1 + MIN_BOX_DIM).min(sw);
        x1 = (x2 - MIN_BOX_DIM).max(0.0);
    }
    if y2 - y1 < MIN_BOX_DIM {
        y2 = (y1 + MIN_BOX_DIM).min(sh);
        y1 = (y2 - MIN_BOX_DIM).max(0.0);
    }
    ProjectedBox { x1, y1, x2, y2 }
}

/// Deterministic per-track color: the track identifier hashes to a hue.
/// "Unknown" always renders in the same neutral gray.
pub fn track_color(track_id: &str, name: &str) -> (f64, f64, f64) {
    if name == UNKNOWN_NAME {
        return (128.0, 128.0, 128.0);
    }
    let mut hash: u32 = 0;
    for byte in track_id.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u32);
    }
    hue_to_rgb((hash % 360) as f64)
}

/// Fixed saturation/value; only hue varies per track.
fn hue_to_rgb(hue: f64) -> (f64, f64, f64) {
    let s = 0.75;
    let v = 0.95;
    let c = v * s;
    let x = c * (1.0 - ((hue / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match hue as u32 {
        0..=59 => (c, x, 0.0),
        60..=119 => (x, c, 0.0),
        120..=179 => (0.0, c, x),
        180..=239 => (0.0, x, c),
        240..=299 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (((r + m) * 255.0), ((g + m) * 255.0), ((b + m) * 255.0))
}

pub fn label_text(name: &str, confidence: f64) -> String {
    format!("{} ({}%)", name, (confidence * 100.0).round() as i64)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelLayout {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Places the label background over the box: horizontally clamped so it
/// never overflows the right edge, vertically above the box top unless
/// that would run off the top of the surface.
pub fn layout_label(
    text_width: i32,
    boxed: &ProjectedBox,
    surface_width: i32,
    unknown: bool,
) -> LabelLayout {
    let width = text_width + LABEL_PAD;
    let height = if unknown {
        LABEL_HEIGHT_UNKNOWN
    } else {
        LABEL_HEIGHT
    };
    let x = (boxed.x1 as i32).min((surface_width - width).max(0));
    let above = boxed.y1 as i32 - height;
    let y = if above < 0 { boxed.y1 as i32 } else { above };
    LabelLayout {
        x,
        y,
        width,
        height,
    }
}

/// Paints predictions onto a transparent-equivalent overlay pass of the
/// displayed-size canvas. The canvas already contains the letterboxed
/// frame; boxes are drawn at the geometry offset.
pub fn paint_predictions(
    canvas: &mut Mat,
    geometry: &OverlayGeometry,
    records: &[PredictionRecord],
) -> Result<(), OverlayError> {
    if !geometry.is_paintable() {
        return Ok(());
    }

    for record in records {
        let boxed = project_box(record, geometry);
        let (r, g, b) = track_color(&record.track_id, &record.name);
        let color = Scalar::new(b, g, r, 0.0);

        let rect = Rect::new(
            geometry.offset_x + boxed.x1 as i32,
            geometry.offset_y + boxed.y1 as i32,
            (boxed.x2 - boxed.x1) as i32,
            (boxed.y2 - boxed.y1) as i32,
        );
        imgproc::rectangle(canvas, rect, color, 2, imgproc::LINE_8, 0)?;

        let label = label_text(&record.name, record.confidence);
        let mut baseline = 0;
        let text_size = imgproc::get_text_size(
            &label,
            imgproc::FONT_HERSHEY_SIMPLEX,
            FONT_SCALE,
            FONT_THICKNESS,
            &mut baseline,
        )?;
        let layout = layout_label(
            text_size.width,
            &boxed,
            geometry.surface_width,
            record.name == UNKNOWN_NAME,
        );

        let label_rect = Rect::new(
            geometry.offset_x + layout.x,
            geometry.offset_y + layout.y,
            layout.width,
            layout.height,
        );
        imgproc::rectangle(canvas, label_rect, color, imgproc::FILLED, imgproc::LINE_8, 0)?;
        imgproc::put_text(
            canvas,
            &label,
            Point::new(
                geometry.offset_x + layout.x + LABEL_PAD / 2,
                geometry.offset_y + layout.y + layout.height - 6,
            ),
            imgproc::FONT_HERSHEY_SIMPLEX,
            FONT_SCALE,
            Scalar::new(255.0, 255.0, 255.0, 0.0),
            FONT_THICKNESS,
            imgproc::LINE_AA,
            false,
        )?;
    }

    Ok(())
}

/// Keeps a displayed-size canvas in sync with the source video and paints
/// each response's predictions into it. Resyncs on display-size changes
/// and on a low-frequency periodic fallback.
pub struct OverlayRenderer {
    display_rx: watch::Receiver<DisplayConfig>,
    geometry: Option<OverlayGeometry>,
    intrinsic: (i32, i32),
    last_resync: Instant,
}

impl OverlayRenderer {
    pub fn new(display_rx: watch::Receiver<DisplayConfig>) -> Self {
        Self {
            display_rx,
            geometry: None,
            intrinsic: (0, 0),
            last_resync: Instant::now(),
        }
    }

    fn maybe_resync(&mut self, intrinsic: (i32, i32)) {
        let display_changed = self.display_rx.has_changed().unwrap_or(false);
        let stale = self.last_resync.elapsed() >= RESYNC_FALLBACK;
        if intrinsic == self.intrinsic && !display_changed && !stale {
            return;
        }
        let display = self.display_rx.borrow_and_update().clone();
        let displayed = letterbox_rect(intrinsic, &display);
        if let Some(geometry) = OverlayGeometry::resync(intrinsic, displayed) {
            self.geometry = Some(geometry);
            self.intrinsic = intrinsic;
        }
        self.last_resync = Instant::now();
    }

    /// Produces the annotated displayed-size canvas for one frame. A frame
    /// with no usable geometry comes back cleared (black letterbox bars,
    /// no annotations).
    pub fn render(
        &mut self,
        frame: &Mat,
        records: &[PredictionRecord],
    ) -> Result<Mat, OverlayError> {
        let intrinsic = (frame.cols(), frame.rows());
        self.maybe_resync(intrinsic);

        let display = self.display_rx.borrow().clone();
        let mut canvas = Mat::new_rows_cols_with_default(
            display.height.max(1),
            display.width.max(1),
            CV_8UC3,
            Scalar::all(0.0),
        )
        .map_err(OverlayError::CanvasFailed)?;

        let Some(geometry) = self.geometry else {
            return Ok(canvas);
        };
        if !geometry.is_paintable() {
            return Ok(canvas);
        }

        let mut scaled = Mat::default();
        imgproc::resize(
            frame,
            &mut scaled,
            Size::new(geometry.surface_width, geometry.surface_height),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;
        let roi = Rect::new(
            geometry.offset_x,
            geometry.offset_y,
            geometry.surface_width,
            geometry.surface_height,
        );
        let mut target = Mat::roi_mut(&mut canvas, roi)?;
        scaled.copy_to(&mut target)?;

        paint_predictions(&mut canvas, &geometry, records)?;
        Ok(canvas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(x1: f64, y1: f64, x2: f64, y2: f64) -> PredictionRecord {
        PredictionRecord {
            track_id: "7".into(),
            name: "Alice".into(),
            confidence: 0.92,
            x1,
            y1,
            x2,
            y2,
        }
    }

    fn geometry_720p_half() -> OverlayGeometry {
        OverlayGeometry::resync(
            (1280, 720),
            DisplayRect {
                x: 0.0,
                y: 0.0,
                width: 640.0,
                height: 360.0,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_resync_half_scale() {
        let geometry = geometry_720p_half();
        assert_eq!(geometry.scale_x, 0.5);
        assert_eq!(geometry.scale_y, 0.5);
        assert_eq!(geometry.surface_width, 640);
        assert_eq!(geometry.surface_height, 360);
    }

    #[test]
    fn test_resync_skips_unready_video() {
        let displayed = DisplayRect {
            x: 0.0,
            y: 0.0,
            width: 640.0,
            height: 360.0,
        };
        assert!(OverlayGeometry::resync((0, 720), displayed).is_none());
        assert!(OverlayGeometry::resync((1280, -1), displayed).is_none());
    }

    #[test]
    fn test_project_box_half_scale() {
        let geometry = geometry_720p_half();
        let boxed = project_box(&record(100.0, 100.0, 200.0, 200.0), &geometry);
        assert_eq!(boxed.x1, 50.0);
        assert_eq!(boxed.y1, 50.0);
        assert_eq!(boxed.x2, 100.0);
        assert_eq!(boxed.y2, 100.0);
    }

    #[test]
    fn test_project_box_clamps_to_surface() {
        let geometry = geometry_720p_half();
        let boxed = project_box(&record(-50.0, -50.0, 5000.0, 5000.0), &geometry);
        assert_eq!(boxed.x1, 0.0);
        assert_eq!(boxed.y1, 0.0);
        assert_eq!(boxed.x2, 640.0);
        assert_eq!(boxed.y2, 360.0);
    }

    #[test]
    fn test_degenerate_box_gets_minimum_size() {
        let geometry = geometry_720p_half();
        let boxed = project_box(&record(100.0, 100.0, 100.0, 100.0), &geometry);
        assert_eq!(boxed.x2 - boxed.x1, MIN_BOX_DIM);
        assert_eq!(boxed.y2 - boxed.y1, MIN_BOX_DIM);
    }

    #[test]
    fn test_box_past_far_edge_stays_visible() {
        let geometry = geometry_720p_half();
        // Entirely beyond the bottom-right corner of the surface after
        // scaling; both axes collapse onto the edge when clamped.
        let boxed = project_box(&record(1400.0, 800.0, 1500.0, 900.0), &geometry);
        assert_eq!(boxed.x2, 640.0);
        assert_eq!(boxed.x1, 640.0 - MIN_BOX_DIM);
        assert_eq!(boxed.y2, 360.0);
        assert_eq!(boxed.y1, 360.0 - MIN_BOX_DIM);
    }

    #[test]
    fn test_letterbox_wide_source_in_tall_display() {
        let display = DisplayConfig {
            width: 640,
            height: 640,
        };
        let rect = letterbox_rect((1280, 720), &display);
        assert_eq!(rect.width, 640.0);
        assert_eq!(rect.height, 360.0);
        assert_eq!(rect.x, 0.0);
        assert_eq!(rect.y, 140.0);
    }

    #[test]
    fn test_track_color_deterministic_and_unknown_gray() {
        assert_eq!(track_color("7", "Alice"), track_color("7", "Alice"));
        assert_eq!(track_color("7", "Unknown"), (128.0, 128.0, 128.0));
        assert_eq!(track_color("42", "Unknown"), (128.0, 128.0, 128.0));
    }

    #[test]
    fn test_label_text_rounds_percent() {
        assert_eq!(label_text("Alice", 0.927), "Alice (93%)");
        assert_eq!(label_text("Bob", 1.2), "Bob (120%)");
    }

    #[test]
    fn test_label_clamped_to_right_edge() {
        let boxed = ProjectedBox {
            x1: 600.0,
            y1: 100.0,
            x2: 640.0,
            y2: 200.0,
        };
        let layout = layout_label(80, &boxed, 640, false);
        assert_eq!(layout.x + layout.width, 640);
        assert_eq!(layout.height, LABEL_HEIGHT);
    }

    #[test]
    fn test_label_flips_below_top_edge() {
        let boxed = ProjectedBox {
            x1: 10.0,
            y1: 5.0,
            x2: 60.0,
            y2: 80.0,
        };
        let layout = layout_label(40, &boxed, 640, false);
        assert_eq!(layout.y, 5);

        let lower = ProjectedBox {
            x1: 10.0,
            y1: 100.0,
            x2: 60.0,
            y2: 180.0,
        };
        let layout = layout_label(40, &lower, 640, false);
        assert_eq!(layout.y, 100 - LABEL_HEIGHT);
    }

    #[test]
    fn test_unknown_label_is_shorter() {
        let boxed = ProjectedBox {
            x1: 10.0,
            y1: 100.0,
            x2: 60.0,
            y2: 180.0,
        };
        let layout = layout_label(40, &boxed, 640, true);
        assert_eq!(layout.height, LABEL_HEIGHT_UNKNOWN);
    }
}
