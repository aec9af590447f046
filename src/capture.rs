use crate::config::CaptureConfig;
use crate::frame_queue::{FrameQueue, QueuedFrame};
use crate::state::VideoState;
use crate::telemetry::Metrics;
use bytes::Bytes;
use opencv::{
    core::{Mat, MatTraitConst, Size, Vector},
    imgcodecs, imgproc,
    prelude::*,
    videoio,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time,
};

/// Tick cadence of the capture loop. Stands in for a display-refresh
/// callback; the pacer decides which ticks actually capture.
const TICK_INTERVAL: Duration = Duration::from_millis(4);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open capture source: {0}")]
    OpenSourceFailed(opencv::Error),
    #[error("Capture source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(opencv::Error),
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(opencv::Error),
    #[error("OpenCV error: {0}")]
    OpenCvError(opencv::Error),
}

impl From<opencv::Error> for CaptureError {
    fn from(err: opencv::Error) -> Self {
        CaptureError::OpenCvError(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    Device(i32),
    File(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
}

/// Drift-accumulating pacer: a tick is accepted when the configured
/// interval has elapsed since the last accepted tick, and the deadline
/// advances by whole intervals rather than resetting, so the achieved
/// rate converges on the target under jitter.
pub(crate) struct Pacer {
    interval: Duration,
    next_due: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }

    pub(crate) fn accept(&mut self, now: Instant) -> bool {
        match self.next_due {
            None => {
                self.next_due = Some(now + self.interval);
                true
            }
            Some(due) if now >= due => {
                let mut next = due + self.interval;
                // Cap the backlog at one interval so a long stall does not
                // trigger a burst of back-to-back accepts.
                if now > next + self.interval {
                    next = now + self.interval;
                }
                self.next_due = Some(next);
                true
            }
            Some(_) => false,
        }
    }
}

/// 1-in-N gate applied to accepted ticks. Skipped ticks still read a frame
/// so device buffers keep draining, but nothing is encoded for them.
pub(crate) fn should_encode(accepted_index: u64, frame_skip: u64) -> bool {
    accepted_index % frame_skip.max(1) == 0
}

struct Inner {
    state: CaptureState,
    source: CaptureSource,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// Paces capture from a camera device or a file-backed video, downsamples,
/// compresses to JPEG and pushes into the frame queue.
pub struct FrameSource {
    config: CaptureConfig,
    queue: Arc<FrameQueue>,
    video_state: Arc<VideoState>,
    metrics: Arc<Metrics>,
    inner: Mutex<Inner>,
}

impl FrameSource {
    pub fn new(
        config: CaptureConfig,
        queue: Arc<FrameQueue>,
        video_state: Arc<VideoState>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let source = match &config.video_file {
            Some(path) => CaptureSource::File(path.clone()),
            None => CaptureSource::Device(config.device_index),
        };
        Self {
            config,
            queue,
            video_state,
            metrics,
            inner: Mutex::new(Inner {
                state: CaptureState::Idle,
                source,
                stop_tx: None,
                task: None,
            }),
        }
    }

    pub async fn state(&self) -> CaptureState {
        self.inner.lock().await.state
    }

    pub async fn source(&self) -> CaptureSource {
        self.inner.lock().await.source.clone()
    }

    /// Acquires the source and starts the capture loop. A failure leaves
    /// the state in Idle with the error surfaced to the caller.
    pub async fn start(&self) -> Result<(), CaptureError> {
        let mut inner = self.inner.lock().await;
        if inner.state == CaptureState::Capturing {
            return Ok(());
        }

        let source = inner.source.clone();
        let config = self.config.clone();
        let capture = tokio::task::spawn_blocking(move || open_capture(&source, &config))
            .await
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))??;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_capture_loop(
            capture,
            self.config.clone(),
            self.queue.clone(),
            self.video_state.clone(),
            self.metrics.clone(),
            stop_rx,
        ));

        inner.state = CaptureState::Capturing;
        inner.stop_tx = Some(stop_tx);
        inner.task = Some(task);
        tracing::info!(source = ?inner.source, "capture started");
        Ok(())
    }

    /// Stops the loop, waits for it to release the underlying capture and
    /// clears the shared frame. A late-arriving encode result after this
    /// returns is discarded inside the loop.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(stop_tx) = inner.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(task) = inner.task.take() {
            let _ = task.await;
        }
        inner.state = CaptureState::Idle;
        self.video_state.clear_frame();
        tracing::info!("capture stopped");
    }

    /// Switching input forces a full stop and release before the new
    /// source is acquired, so two captures never own a device at once.
    pub async fn switch_source(&self, source: CaptureSource) -> Result<(), CaptureError> {
        let was_capturing = {
            let inner = self.inner.lock().await;
            inner.state == CaptureState::Capturing
        };
        self.stop().await;
        {
            let mut inner = self.inner.lock().await;
            inner.source = source;
        }
        if was_capturing {
            self.start().await?;
        }
        Ok(())
    }
}

/// Opens the source with the configured constraints; if the constrained
/// device opens but cannot produce a frame, retries once relaxed before
/// failing permanently.
fn open_capture(
    source: &CaptureSource,
    config: &CaptureConfig,
) -> Result<videoio::VideoCapture, CaptureError> {
    match source {
        CaptureSource::File(path) => {
            let capture = videoio::VideoCapture::from_file(path, videoio::CAP_ANY)
                .map_err(CaptureError::OpenSourceFailed)?;
            if !capture.is_opened()? {
                return Err(CaptureError::SourceUnavailable(format!(
                    "could not open video file {}",
                    path
                )));
            }
            Ok(capture)
        }
        CaptureSource::Device(index) => {
            let mut capture = videoio::VideoCapture::new(*index, videoio::CAP_ANY)
                .map_err(CaptureError::OpenSourceFailed)?;
            if let Some(width) = config.requested_width {
                capture.set(videoio::CAP_PROP_FRAME_WIDTH, width as f64)?;
            }
            if let Some(height) = config.requested_height {
                capture.set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64)?;
            }

            if capture.is_opened()? && grabs_frame(&mut capture) {
                return Ok(capture);
            }
            if config.requested_width.is_some() || config.requested_height.is_some() {
                tracing::warn!(
                    ?source,
                    "constrained open failed, retrying without constraints"
                );
                capture.release()?;
                let mut relaxed = videoio::VideoCapture::new(*index, videoio::CAP_ANY)
                    .map_err(CaptureError::OpenSourceFailed)?;
                if relaxed.is_opened()? && grabs_frame(&mut relaxed) {
                    return Ok(relaxed);
                }
            }
            Err(CaptureError::SourceUnavailable(format!(
                "device {} rejected or produced no frames",
                index
            )))
        }
    }
}

fn grabs_frame(capture: &mut videoio::VideoCapture) -> bool {
    let mut frame = Mat::default();
    matches!(capture.read(&mut frame), Ok(true)) && !frame.empty()
}

async fn run_capture_loop(
    mut capture: videoio::VideoCapture,
    config: CaptureConfig,
    queue: Arc<FrameQueue>,
    video_state: Arc<VideoState>,
    metrics: Arc<Metrics>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    let mut pacer = Pacer::new(Duration::from_millis(config.get_capture_interval_ms()));
    let mut accepted: u64 = 0;
    let mut fps_window_start = Instant::now();
    let mut fps_window_count: u64 = 0;
    let quality = config.get_jpeg_quality_percent();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        if !pacer.accept(Instant::now()) {
            continue;
        }

        let mut frame = Mat::default();
        match capture.read(&mut frame) {
            Ok(true) if !frame.empty() => {}
            Ok(_) => {
                tracing::debug!("capture produced no frame, skipping tick");
                continue;
            }
            Err(e) => {
                tracing::error!("frame read failed: {:?}", e);
                continue;
            }
        }

        let encode_this_tick = should_encode(accepted, config.frame_skip);
        accepted += 1;
        fps_window_count += 1;
        if fps_window_start.elapsed() >= Duration::from_secs(1) {
            let fps = fps_window_count as f64 / fps_window_start.elapsed().as_secs_f64();
            metrics.record_capture_fps(fps);
            fps_window_start = Instant::now();
            fps_window_count = 0;
        }

        if !encode_this_tick {
            continue;
        }

        let frame = match downscale(&frame, config.max_dimension) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("downscale failed: {:?}", e);
                continue;
            }
        };
        video_state.set_frame(frame.clone());

        // The single mandatory suspension point of the loop: compression
        // runs off the event loop and we resume on its completion.
        let encode_result = tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality)).await;

        // A stop issued while encoding makes the completion a no-op.
        if *stop_rx.borrow() {
            break;
        }

        match encode_result {
            Ok(Ok(payload)) => {
                let evicted = queue.push(QueuedFrame::new(Bytes::from(payload)));
                if evicted {
                    metrics.record_frame_dropped();
                }
                metrics.record_queue_depth(queue.len() as u64);
            }
            Ok(Err(e)) => {
                tracing::warn!("jpeg encode failed, skipping tick: {:?}", e);
            }
            Err(e) => {
                tracing::warn!("encode task failed, skipping tick: {:?}", e);
            }
        }
    }

    if let Err(e) = capture.release() {
        tracing::warn!("capture release failed: {:?}", e);
    }
}

/// Scales the frame down so the larger dimension equals the maximum,
/// preserving aspect ratio with floored integer dimensions.
fn downscale(frame: &Mat, max_dimension: i32) -> Result<Mat, CaptureError> {
    let (width, height) = (frame.cols(), frame.rows());
    if width <= max_dimension && height <= max_dimension {
        return Ok(frame.clone());
    }
    let scale = max_dimension as f64 / width.max(height) as f64;
    let new_width = (width as f64 * scale).floor() as i32;
    let new_height = (height as f64 * scale).floor() as i32;
    let mut scaled = Mat::default();
    imgproc::resize(
        frame,
        &mut scaled,
        Size::new(new_width, new_height),
        0.0,
        0.0,
        imgproc::INTER_AREA,
    )?;
    Ok(scaled)
}

/// Fixed-quality encode for the local annotated feed.
pub(crate) fn encode_preview_jpeg(frame: &Mat) -> Result<Vec<u8>, CaptureError> {
    encode_jpeg(frame, 80)
}

fn encode_jpeg(frame: &Mat, quality: i32) -> Result<Vec<u8>, CaptureError> {
    let mut buf = Vector::<u8>::new();
    let mut params = Vector::<i32>::new();
    params.push(imgcodecs::IMWRITE_JPEG_QUALITY);
    params.push(quality);
    imgcodecs::imencode(".jpg", frame, &mut buf, &params)
        .map_err(CaptureError::EncodeFrameFailed)?;
    Ok(buf.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_first_tick_accepted() {
        let mut pacer = Pacer::new(Duration::from_millis(100));
        assert!(pacer.accept(Instant::now()));
    }

    #[test]
    fn test_pacer_rejects_early_tick() {
        let start = Instant::now();
        let mut pacer = Pacer::new(Duration::from_millis(100));
        assert!(pacer.accept(start));
        assert!(!pacer.accept(start + Duration::from_millis(50)));
        assert!(pacer.accept(start + Duration::from_millis(100)));
    }

    #[test]
    fn test_pacer_accumulates_drift() {
        let start = Instant::now();
        let mut pacer = Pacer::new(Duration::from_millis(100));
        assert!(pacer.accept(start));
        // Arrives 30ms late; the next deadline stays on the original grid
        // so the following on-grid tick is still accepted.
        assert!(pacer.accept(start + Duration::from_millis(130)));
        assert!(pacer.accept(start + Duration::from_millis(200)));
    }

    #[test]
    fn test_pacer_caps_backlog_after_stall() {
        let start = Instant::now();
        let mut pacer = Pacer::new(Duration::from_millis(100));
        assert!(pacer.accept(start));
        assert!(pacer.accept(start + Duration::from_secs(5)));
        // No burst: the tick right after the stall is not accepted.
        assert!(!pacer.accept(start + Duration::from_secs(5) + Duration::from_millis(10)));
    }

    #[test]
    fn test_frame_skip_gate() {
        assert!(should_encode(0, 3));
        assert!(!should_encode(1, 3));
        assert!(!should_encode(2, 3));
        assert!(should_encode(3, 3));
    }

    #[test]
    fn test_frame_skip_zero_treated_as_every_frame() {
        assert!(should_encode(0, 0));
        assert!(should_encode(1, 0));
    }
}
