//! Runs a replayer and a consumer side by side in one process.

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::consumer::Consumer;
use crate::replayer::Replayer;
use crate::sink::SampleSink;
use crate::source::RecordSource;

/// Cancel `cancel` on Ctrl-C. The watcher ends on its own once the token is
/// cancelled by anyone else.
pub fn cancel_on_interrupt(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => {
                    info!("interrupt received, shutting down");
                    cancel.cancel();
                }
                Err(e) => error!("failed to listen for interrupt: {}", e),
            },
        }
    });
}

/// Start both sides concurrently and wait for both. A failed replayer
/// cancels the consumer, which would otherwise wait for a sentinel that
/// never comes, and a failed consumer cancels the replayer.
pub async fn run<S, K>(
    replayer: Replayer,
    source: S,
    consumer: Consumer,
    mut sink: K,
    cancel: CancellationToken,
) -> Result<()>
where
    S: RecordSource + Send + Sync + 'static,
    K: SampleSink + Send + 'static,
{
    let publisher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome = replayer.replay(&source, &cancel).await;
            if outcome.is_err() {
                cancel.cancel();
            }
            outcome
        })
    };
    let subscriber = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome = consumer.consume(&mut sink, &cancel).await;
            if outcome.is_err() {
                cancel.cancel();
            }
            outcome
        })
    };

    let (replayed, consumed) = tokio::join!(publisher, subscriber);

    let mut failed = false;
    match replayed? {
        Ok(report) => info!(
            "replayer: {} messages, {} pass(es){}",
            report.emitted,
            report.passes,
            if report.interrupted { ", interrupted" } else { "" }
        ),
        Err(e) => {
            error!("replayer failed: {}", e);
            failed = true;
        }
    }
    match consumed? {
        Ok(report) => info!(
            "consumer: {} samples, {} undecodable{}",
            report.received,
            report.decode_errors,
            if report.interrupted { ", interrupted" } else { "" }
        ),
        Err(e) => {
            error!("consumer failed: {}", e);
            failed = true;
        }
    }

    if failed {
        return Err(anyhow!("session ended with errors"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Sample;
    use std::time::Duration;

    fn sample(sensor_id: i64, timestamp: i64) -> Sample {
        Sample {
            sensor_id,
            timestamp,
            position: [0.0, 0.0, 0.0],
            orientation: [1.0, 0.0, 0.0, 0.0],
        }
    }

    fn free_addr() -> String {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_session_completes_on_sentinel() {
        let addr = free_addr();
        let replayer = Replayer {
            bind: addr.clone(),
            queue_depth: 64,
            settle: Duration::from_millis(300),
            restart_delay: Duration::from_secs(1),
            linger: Duration::from_secs(1),
            loop_data: false,
        };
        let consumer = Consumer {
            connect: addr,
            reconnect_interval: Duration::from_millis(10),
            sensors: 2,
        };
        let source = vec![sample(1, 0), sample(2, 10), sample(3, 20)];

        tokio::time::timeout(
            Duration::from_secs(10),
            run(replayer, source, consumer, Vec::new(), CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_replayer_failure_cancels_consumer() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let replayer = Replayer {
            bind: addr.clone(),
            queue_depth: 64,
            settle: Duration::ZERO,
            restart_delay: Duration::ZERO,
            linger: Duration::ZERO,
            loop_data: false,
        };
        let consumer = Consumer {
            connect: "127.0.0.1:1".into(),
            reconnect_interval: Duration::from_millis(10),
            sensors: 1,
        };

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run(replayer, vec![sample(1, 0)], consumer, Vec::new(), CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(result.is_err());
        drop(taken);
    }

    #[tokio::test]
    async fn test_consumer_failure_stops_looping_replayer() {
        let replayer = Replayer {
            bind: "127.0.0.1:0".into(),
            queue_depth: 64,
            settle: Duration::ZERO,
            restart_delay: Duration::from_millis(10),
            linger: Duration::from_millis(100),
            loop_data: true,
        };
        // not an address at all, so dialing fails outright
        let consumer = Consumer {
            connect: "no-port-here".into(),
            reconnect_interval: Duration::from_millis(10),
            sensors: 1,
        };
        let source = vec![sample(1, 0), sample(1, 10)];

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run(replayer, source, consumer, Vec::new(), CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(result.is_err());
    }
}
