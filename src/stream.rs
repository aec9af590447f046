use crate::capture::CaptureError;
use crate::overlay::{OverlayError, OverlayRenderer};
use crate::state::VideoState;
use bytes::Bytes;
use futures::stream;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::instrument;

const FRAME_BOUNDARY: &str = "--frame";

#[derive(Error, Debug)]
pub enum VideoStreamError {
    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
    #[error("Encode error: {0}")]
    Encode(#[from] CaptureError),
    #[error("Http builder error: {0}")]
    HttpBuilderError(String),
}

/// Serves the annotated view: the latest captured frame letterboxed into
/// the displayed rectangle with the current predictions painted on top.
pub struct AnnotatedStream {
    video_state: Arc<VideoState>,
    renderer: OverlayRenderer,
    frame_delay: Duration,
}

impl AnnotatedStream {
    pub fn new(video_state: Arc<VideoState>, renderer: OverlayRenderer) -> Self {
        Self {
            video_state,
            renderer,
            frame_delay: Duration::from_millis(50),
        }
    }

    #[instrument(skip(self))]
    pub fn generate_stream(self) -> impl futures::Stream<Item = Result<Bytes, VideoStreamError>> {
        stream::unfold(self, move |mut this| async move {
            sleep(this.frame_delay).await;
            let Some(frame) = this.video_state.latest_frame() else {
                return None;
            };
            let records = this.video_state.predictions();

            let part = this
                .renderer
                .render(&frame, &records)
                .map_err(VideoStreamError::from)
                .and_then(|canvas| {
                    crate::capture::encode_preview_jpeg(&canvas).map_err(VideoStreamError::from)
                })
                .map(|jpeg| {
                    let part_header = format!(
                        "{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                        FRAME_BOUNDARY,
                        jpeg.len()
                    );
                    let mut body = part_header.into_bytes();
                    body.extend_from_slice(&jpeg);
                    body.extend_from_slice(b"\r\n");
                    Bytes::from(body)
                });

            match part {
                Ok(bytes) => Some((Ok(bytes), this)),
                Err(e) => {
                    tracing::error!("annotated frame failed: {:?}", e);
                    Some((Err(e), this))
                }
            }
        })
    }
}
