use crate::overlay::OverlayRenderer;
use crate::server::SharedState;
use crate::stream::{AnnotatedStream, VideoStreamError};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::instrument;

const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[instrument(skip(state))]
pub async fn video_feed(State(state): State<SharedState>) -> Result<Response, VideoStreamError> {
    let renderer = OverlayRenderer::new(state.display_rx.clone());
    let stream = AnnotatedStream::new(state.video_state.clone(), renderer).generate_stream();

    let body = Body::from_stream(stream);

    let response = Response::builder()
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .body(body)
        .map_err(|e| VideoStreamError::HttpBuilderError(e.to_string()))?;

    Ok(response)
}

impl IntoResponse for VideoStreamError {
    fn into_response(self) -> Response {
        let status = match self {
            VideoStreamError::Overlay(_) => StatusCode::INTERNAL_SERVER_ERROR,
            VideoStreamError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            VideoStreamError::HttpBuilderError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
