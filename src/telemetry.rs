use crate::streaming::ConnectionState;
use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    round_trip_latency: Histogram<u64>,
    queue_depth: Gauge<u64>,
    capture_fps: Gauge<f64>,
    frames_dropped: Counter<u64>,
    reconnects: Counter<u64>,
    connection_state: Gauge<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        // TODO: deprecated crate to be replaced with an OLTP exporter
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .unwrap();

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("exit_monitor");
        global::set_meter_provider(provider);

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));

        let round_trip_latency = meter
            .u64_histogram("round_trip_latency_ms")
            .with_boundaries(boundaries)
            .with_description("Send-to-response round trip over the inference channel")
            .build();

        let queue_depth = meter
            .u64_gauge("frame_queue_depth")
            .with_description("Frames currently buffered for transmission")
            .build();

        let capture_fps = meter
            .f64_gauge("capture_fps")
            .with_description("Achieved capture rate")
            .build();

        let frames_dropped = meter
            .u64_counter("frames_dropped_total")
            .with_description("Frames evicted from the queue under backpressure")
            .build();

        let reconnects = meter
            .u64_counter("reconnects_total")
            .with_description("Successful connections to the inference service")
            .build();

        let connection_state = meter
            .u64_gauge("connection_state")
            .with_description("0 disconnected, 1 connecting, 2 connected")
            .build();

        Metrics {
            round_trip_latency,
            queue_depth,
            capture_fps,
            frames_dropped,
            reconnects,
            connection_state,
            registry,
        }
    }

    pub fn record_round_trip(&self, latency_ms: u64) {
        self.round_trip_latency.record(latency_ms, &[]);
    }

    pub fn record_queue_depth(&self, depth: u64) {
        self.queue_depth.record(depth, &[]);
    }

    pub fn record_capture_fps(&self, fps: f64) {
        self.capture_fps.record(fps, &[]);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.add(1, &[]);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.add(1, &[]);
    }

    pub fn record_connection_state(&self, state: ConnectionState) {
        let value = match state {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        };
        let attributes = vec![KeyValue::new("state", state.as_str())];
        self.connection_state.record(value, &attributes);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (2, 22, 26, 46, 146);
        let get = generate_boundaries(parts);
        let expected = vec![2.0, 12.0, 22.0, 24.0, 26.0, 46.0, 146.0];

        assert_eq!(get, expected);
    }
}
