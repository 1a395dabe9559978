//! Topic-filtered consumer. Runs until the end-of-stream sentinel arrives or
//! it is cancelled.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::SubSocket;
use crate::config::AppConfig;
use crate::error::ReplayError;
use crate::frame;
use crate::sink::SampleSink;
use crate::topic::{consumer_topics, SENTINEL_TOPIC};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub received: u64,
    pub decode_errors: u64,
    /// Ended by cancellation rather than by the sentinel.
    pub interrupted: bool,
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub connect: String,
    pub reconnect_interval: Duration,
    /// Subscribes to sensors `1..=sensors`.
    pub sensors: u32,
}

impl Consumer {
    pub fn from_config(cfg: &AppConfig, sensors: u32) -> Self {
        Consumer {
            connect: cfg.channel.connect.clone(),
            reconnect_interval: cfg.channel.reconnect_interval(),
            sensors,
        }
    }

    pub async fn consume<K: SampleSink>(
        &self,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<ConsumeReport, ReplayError> {
        let mut report = ConsumeReport::default();

        let mut socket = tokio::select! {
            _ = cancel.cancelled() => {
                info!("consumer cancelled before connecting");
                report.interrupted = true;
                return Ok(report);
            }
            socket = SubSocket::connect(&self.connect, self.reconnect_interval) => socket?,
        };

        info!("subscribing to {} sensor topics", self.sensors);
        for topic in consumer_topics(self.sensors) {
            socket.subscribe(&topic).await?;
        }

        loop {
            let (topic, payload) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("consumer shutting down");
                    report.interrupted = true;
                    break;
                }
                msg = socket.recv() => msg?,
            };

            if topic == SENTINEL_TOPIC {
                info!("received done signal, shutting down");
                break;
            }

            match frame::decode(&payload) {
                Ok(sample) => {
                    report.received += 1;
                    sink.accept(&topic, &sample);
                }
                Err(e) => {
                    report.decode_errors += 1;
                    warn!("discarding message on '{}': {}", topic, e);
                }
            }
        }

        info!(
            "consumer stopped after {} samples ({} undecodable)",
            report.received, report.decode_errors
        );
        Ok(report)
    }
}
