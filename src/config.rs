use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Address the publisher listens on.
    pub bind: String,
    /// Address subscribers dial.
    pub connect: String,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
}

fn default_queue_depth() -> usize {
    1024
}

fn default_reconnect_interval_ms() -> u64 {
    100
}

fn default_linger_ms() -> u64 {
    1000
}

impl ChannelConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// Pause between binding and the first emission.
    pub settle_ms: u64,
    /// Pause before a looping replay starts over.
    pub restart_delay_ms: u64,
}

impl ReplayConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_sensors")]
    pub sensors: u32,
}

fn default_sensors() -> u32 {
    4
}

/// Raw log column name for each canonical sample field.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMapping {
    pub sensor_id: String,
    pub time: String,
    pub x: String,
    pub y: String,
    pub z: String,
    pub qw: String,
    pub qx: String,
    pub qy: String,
    pub qz: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            sensor_id: "SEU".into(),
            time: "Frame".into(),
            x: "X1 (M)".into(),
            y: "Y1".into(),
            z: "Z1".into(),
            qw: "Qw1".into(),
            qx: "Qx1".into(),
            qy: "Qy1".into(),
            qz: "Qz1".into(),
        }
    }
}

impl ColumnMapping {
    /// Raw column names in canonical field order.
    pub fn raw_names(&self) -> [&str; 9] {
        [
            self.sensor_id.as_str(),
            self.time.as_str(),
            self.x.as_str(),
            self.y.as_str(),
            self.z.as_str(),
            self.qw.as_str(),
            self.qx.as_str(),
            self.qy.as_str(),
            self.qz.as_str(),
        ]
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub columns: ColumnMapping,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub channel: ChannelConfig,
    pub replay: ReplayConfig,
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

impl AppConfig {
    pub fn load_default() -> anyhow::Result<Self> {
        let default = include_str!("../config/default.toml");
        let cfg: AppConfig = toml::from_str(default)?;
        cfg.validate()
    }

    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let p = path.into();
        let s = fs::read_to_string(&p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        cfg.validate()
    }

    fn validate(self) -> anyhow::Result<Self> {
        anyhow::ensure!(
            self.consumer.sensors >= 1,
            "consumer.sensors must be at least 1"
        );
        Ok(self)
    }
}
