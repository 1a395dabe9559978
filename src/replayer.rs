//! Time-accurate replay of a record source onto the channel.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::PubSocket;
use crate::config::AppConfig;
use crate::error::{ReplayError, TransportError};
use crate::frame;
use crate::source::RecordSource;
use crate::topic::{topic_for, SENTINEL_TOPIC};

/// Where the replayer emits `(topic, payload)` pairs. Publishing may wait
/// for room in the transport's queues.
pub trait Outbound {
    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl Outbound for PubSocket {
    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.send(topic, payload).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Passes started over the source.
    pub passes: u64,
    /// Sensor messages emitted, sentinel excluded.
    pub emitted: u64,
    pub interrupted: bool,
}

#[derive(Debug, Clone)]
pub struct Replayer {
    pub bind: String,
    pub queue_depth: usize,
    pub settle: Duration,
    pub restart_delay: Duration,
    pub linger: Duration,
    pub loop_data: bool,
}

/// Wait owed after emitting a sample stamped `current` when the one before
/// it was stamped `previous`. Timestamps are milliseconds; repeated or
/// decreasing stamps owe nothing.
pub fn delay_between(previous: Option<i64>, current: i64) -> Duration {
    match previous {
        Some(prev) if current > prev => Duration::from_millis(current.abs_diff(prev)),
        _ => Duration::ZERO,
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl Replayer {
    pub fn from_config(cfg: &AppConfig, loop_data: bool) -> Self {
        Replayer {
            bind: cfg.channel.bind.clone(),
            queue_depth: cfg.channel.queue_depth,
            settle: cfg.replay.settle(),
            restart_delay: cfg.replay.restart_delay(),
            linger: cfg.channel.linger(),
            loop_data,
        }
    }

    /// Bind the channel, replay `source` onto it, signal end of stream and
    /// release the channel. The channel is released on every exit path.
    pub async fn replay<S: RecordSource>(
        &self,
        source: &S,
        cancel: &CancellationToken,
    ) -> Result<ReplayReport, ReplayError> {
        let mut socket = PubSocket::bind(&self.bind, self.queue_depth).await?;
        info!(
            "replaying {} on {} (looping {})",
            source.describe(),
            socket.local_addr(),
            if self.loop_data { "enabled" } else { "disabled" }
        );

        let settled = pause(self.settle, cancel).await;
        debug!(
            "{} subscriptions registered after settle",
            socket.subscription_count()
        );

        let outcome = if settled {
            self.stream(&mut socket, source, cancel).await
        } else {
            self.signal_end(&mut socket).await;
            Ok(ReplayReport {
                interrupted: true,
                ..Default::default()
            })
        };

        socket.close(self.linger).await;
        match &outcome {
            Ok(report) if report.interrupted => info!("replay interrupted"),
            Ok(report) => info!(
                "replay finished: {} messages over {} pass(es)",
                report.emitted, report.passes
            ),
            Err(e) => warn!("replay aborted: {}", e),
        }
        outcome
    }

    /// Emit every pass of `source` followed by exactly one sentinel. The
    /// sentinel goes out even when the passes end in an error.
    pub async fn stream<O: Outbound, S: RecordSource>(
        &self,
        out: &mut O,
        source: &S,
        cancel: &CancellationToken,
    ) -> Result<ReplayReport, ReplayError> {
        let mut report = ReplayReport::default();
        let outcome = self.run_passes(out, source, cancel, &mut report).await;
        self.signal_end(out).await;
        outcome.map(|()| report)
    }

    /// Publish the sentinel, giving up after `linger` if the transport
    /// cannot take it.
    async fn signal_end<O: Outbound>(&self, out: &mut O) {
        let sent = out.publish(SENTINEL_TOPIC, Bytes::new());
        match tokio::time::timeout(self.linger, sent).await {
            Ok(Ok(())) => debug!("sent '{}'", SENTINEL_TOPIC),
            Ok(Err(e)) => warn!("failed to emit end-of-stream: {}", e),
            Err(_) => warn!("end-of-stream not accepted within {:?}", self.linger),
        }
    }

    async fn run_passes<O: Outbound, S: RecordSource>(
        &self,
        out: &mut O,
        source: &S,
        cancel: &CancellationToken,
        report: &mut ReplayReport,
    ) -> Result<(), ReplayError> {
        loop {
            report.passes += 1;
            let mut previous = None;

            for record in source.records()? {
                let sample = record?;
                let topic = topic_for(sample.sensor_id);
                let payload = frame::encode(&sample)?;
                let sent = tokio::select! {
                    biased;
                    sent = out.publish(&topic, payload) => sent,
                    _ = cancel.cancelled() => {
                        report.interrupted = true;
                        return Ok(());
                    }
                };
                sent?;
                report.emitted += 1;
                debug!("sent on topic '{}'", topic);

                let delay = delay_between(previous, sample.timestamp);
                previous = Some(sample.timestamp);
                if !pause(delay, cancel).await {
                    report.interrupted = true;
                    return Ok(());
                }
            }

            if !self.loop_data {
                return Ok(());
            }
            info!("replay loop restarting");
            if !pause(self.restart_delay, cancel).await {
                report.interrupted = true;
                return Ok(());
            }
        }
    }
}
