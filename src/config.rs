use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub inference_service: InferenceServiceConfig,
    pub capture: CaptureConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub exits: ExitHistoryConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceServiceConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_ws_path() -> String {
    "/ws/frames".into()
}

impl InferenceServiceConfig {
    pub fn get_ws_url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.ws_path)
    }

    pub fn get_http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Immutable capture tuning. Read at construction of the frame source and
/// never mutated afterwards.
#[derive(Clone, Deserialize, Debug)]
pub struct CaptureConfig {
    #[serde(default = "default_target_fps")]
    pub target_fps: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: f64,
    #[serde(default = "default_max_dimension")]
    pub max_dimension: i32,
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u64,
    #[serde(default)]
    pub device_index: i32,
    /// File-backed input; takes precedence over the device when set.
    #[serde(default)]
    pub video_file: Option<String>,
    /// Requested device constraints. Relaxed once on a failed open.
    #[serde(default)]
    pub requested_width: Option<i32>,
    #[serde(default)]
    pub requested_height: Option<i32>,
}

fn default_target_fps() -> u64 {
    15
}

fn default_jpeg_quality() -> f64 {
    0.7
}

fn default_max_dimension() -> i32 {
    640
}

fn default_frame_skip() -> u64 {
    1
}

fn fps_to_interval_ms(fps: u64) -> u64 {
    (1000.0 / fps.max(1) as f64).round() as u64
}

impl CaptureConfig {
    pub fn get_capture_interval_ms(&self) -> u64 {
        fps_to_interval_ms(self.target_fps)
    }

    /// OpenCV quality scale is 0-100; the configured value is 0-1.
    pub fn get_jpeg_quality_percent(&self) -> i32 {
        (self.jpeg_quality.clamp(0.0, 1.0) * 100.0).round() as i32
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_attempt_cap")]
    pub attempt_cap: u32,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_growth_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_attempt_cap() -> u32 {
    6
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            growth_factor: default_growth_factor(),
            max_delay_ms: default_max_delay_ms(),
            attempt_cap: default_attempt_cap(),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct ExitHistoryConfig {
    #[serde(default = "default_push_cap")]
    pub push_cap: usize,
    #[serde(default = "default_pull_cap")]
    pub pull_cap: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_push_cap() -> usize {
    50
}

fn default_pull_cap() -> usize {
    500
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl Default for ExitHistoryConfig {
    fn default() -> Self {
        Self {
            push_cap: default_push_cap(),
            pull_cap: default_pull_cap(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Size of the rectangle the annotated feed is rendered into. The overlay
/// letterboxes the source aspect ratio into it.
#[derive(Clone, Deserialize, Debug)]
pub struct DisplayConfig {
    #[serde(default = "default_display_width")]
    pub width: i32,
    #[serde(default = "default_display_height")]
    pub height: i32,
}

fn default_display_width() -> i32 {
    960
}

fn default_display_height() -> i32 {
    540
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: default_display_width(),
            height: default_display_height(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().expect("Failed to determine the current directory");
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT");

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("EM")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    Ok(config)
}
