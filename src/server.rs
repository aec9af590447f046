use crate::{
    capture::FrameSource,
    config::{Config, DisplayConfig},
    exits::{ExitEventAggregator, ExitPoller},
    frame_queue::FrameQueue,
    routes::api_routes,
    state::VideoState,
    streaming::ChannelHandle,
    telemetry::Metrics,
};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    sync::{broadcast::Receiver, watch},
    task::JoinHandle,
};

#[derive(Clone)]
pub struct SharedState {
    pub frame_source: Arc<FrameSource>,
    pub video_state: Arc<VideoState>,
    pub queue: Arc<FrameQueue>,
    pub exits: Arc<ExitEventAggregator>,
    pub exit_poller: Arc<ExitPoller>,
    pub channel: ChannelHandle,
    pub metrics: Arc<Metrics>,
    pub display_tx: Arc<watch::Sender<DisplayConfig>>,
    pub display_rx: watch::Receiver<DisplayConfig>,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(app_state: SharedState, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let router = Router::new()
            .merge(api_routes())
            .with_state(app_state)
            .layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", &self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                let server = axum::serve(listener, router);
                server
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
