mod capture;
mod exits;
mod frame_queue;
mod overlay;
mod prediction;
mod routes;
mod server;
mod state;
mod stream;
mod streaming;
mod telemetry;

pub mod app;
pub mod config;

pub use app::start_app;
