use crate::capture::FrameSource;
use crate::config::Config;
use crate::exits::{ExitEventAggregator, ExitPoller};
use crate::frame_queue::FrameQueue;
use crate::server::{HttpServer, SharedState};
use crate::state::VideoState;
use crate::streaming::StreamingChannel;
use crate::telemetry::Metrics;

use std::{error::Error, sync::Arc};
use tokio::{
    signal,
    sync::{broadcast, watch},
};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let metrics = Arc::new(Metrics::new());
    let queue = FrameQueue::new(config.queue.capacity);
    let video_state = Arc::new(VideoState::default());
    let exits = ExitEventAggregator::new(config.exits.clone());
    let (display_tx, display_rx) = watch::channel(config.display.clone());

    let frame_source = Arc::new(FrameSource::new(
        config.capture.clone(),
        queue.clone(),
        video_state.clone(),
        metrics.clone(),
    ));

    let (channel, channel_handle) = StreamingChannel::new(
        config.inference_service.get_ws_url(),
        config.reconnect.clone(),
        queue.clone(),
        video_state.clone(),
        exits.clone(),
        metrics.clone(),
    );

    let exit_poller = Arc::new(ExitPoller::new(
        config.inference_service.get_http_url(),
        config.exits.poll_interval_secs,
        exits.clone(),
    ));

    let app_state = SharedState {
        frame_source: frame_source.clone(),
        video_state,
        queue,
        exits,
        exit_poller: exit_poller.clone(),
        channel: channel_handle,
        metrics,
        display_tx: Arc::new(display_tx),
        display_rx,
    };

    let server = HttpServer::new(app_state, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let streaming_handle = tokio::spawn(channel.run(shutdown_tx.subscribe()));
    let poller_handle = tokio::spawn(exit_poller.run(shutdown_tx.subscribe()));

    // An acquisition failure here is surfaced but not fatal; capture stays
    // idle and can be retried through POST /capture/start.
    if let Err(e) = frame_source.start().await {
        tracing::error!("initial capture start failed: {}", e);
    }

    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    frame_source.stop().await;
    let _ = poller_handle.await;
    let _ = streaming_handle.await;
    let _ = server_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
