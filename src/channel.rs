//! Topic-filtered publish/subscribe channel over TCP.
//!
//! ```text
//! publisher -> subscriber (one message)
//! ┌──────────┬────────────┬──────────┬──────────────┐
//! │ len u32  │ topic      │ len u32  │ payload      │
//! │ BE       │ UTF-8      │ BE       │ bytes        │
//! └──────────┴────────────┴──────────┴──────────────┘
//!
//! subscriber -> publisher (one subscription)
//! ┌──────────┬────────────┐
//! │ len u32  │ topic      │
//! └──────────┴────────────┘
//! ```
//!
//! Filtering happens on the publisher side: a subscriber only receives topics
//! it subscribed to, matched as exact strings. Messages published before a
//! subscription arrives are not delivered to that subscriber. Each subscriber
//! has its own queue of `queue_depth` messages; a full queue holds the
//! publisher back instead of dropping.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::TransportError;

const MAX_FRAME_LEN: usize = 64 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

#[derive(Debug, Clone)]
struct Message {
    topic: Arc<str>,
    payload: Bytes,
}

type Registry = Arc<Mutex<Vec<mpsc::Sender<Message>>>>;

/// Outbound side of the channel. Owned by the publisher.
pub struct PubSocket {
    local_addr: SocketAddr,
    /// Queue of every connected subscriber's writer task.
    registry: Registry,
    accept_task: Option<JoinHandle<()>>,
    peers: TaskTracker,
    subscriptions: watch::Receiver<usize>,
    stop_accepting: CancellationToken,
    stop_peers: CancellationToken,
}

impl PubSocket {
    pub async fn bind(addr: &str, queue_depth: usize) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let registry: Registry = Arc::new(Mutex::new(Vec::new()));
        let (sub_tx, subscriptions) = watch::channel(0usize);
        let sub_tx = Arc::new(sub_tx);
        let peers = TaskTracker::new();
        let stop_accepting = CancellationToken::new();
        let stop_peers = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            queue_depth.max(1),
            sub_tx,
            peers.clone(),
            stop_accepting.clone(),
            stop_peers.clone(),
        ));

        info!("channel bound on {}", local_addr);
        Ok(PubSocket {
            local_addr,
            registry,
            accept_task: Some(accept_task),
            peers,
            subscriptions,
            stop_accepting,
            stop_peers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live subscription entries across all connected subscribers.
    pub fn subscription_count(&self) -> usize {
        *self.subscriptions.borrow()
    }

    /// Queue a message for every connected subscriber, waiting while a
    /// subscriber's queue is full. With no subscribers the message is dropped.
    pub async fn send(&self, topic: &str, payload: Bytes) {
        let peers = self.registry.lock().await.clone();
        if peers.is_empty() {
            debug!("no subscribers connected, dropped message on '{}'", topic);
            return;
        }

        let msg = Message {
            topic: Arc::from(topic),
            payload,
        };
        for peer in peers {
            if peer.send(msg.clone()).await.is_err() {
                // writer task is gone
                self.registry
                    .lock()
                    .await
                    .retain(|p| !p.same_channel(&peer));
            }
        }
    }

    /// Stop accepting, let subscribers drain what is queued, and cut them off
    /// once `linger` has passed.
    pub async fn close(mut self, linger: Duration) {
        self.stop_accepting.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        // Dropping the queues' senders lets writers drain and then exit.
        self.registry.lock().await.clear();
        self.peers.close();
        if tokio::time::timeout(linger, self.peers.wait()).await.is_err() {
            warn!("subscribers still draining after {:?}, disconnecting", linger);
        }
        self.stop_peers.cancel();
        info!("channel on {} closed", self.local_addr);
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.stop_accepting.cancel();
        self.stop_peers.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Registry,
    queue_depth: usize,
    subscriptions: Arc<watch::Sender<usize>>,
    peers: TaskTracker,
    stop_accepting: CancellationToken,
    stop_peers: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop_accepting.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("subscriber connected: {}", peer);
                    let _ = stream.set_nodelay(true);
                    let (tx, rx) = mpsc::channel(queue_depth);
                    registry.lock().await.push(tx);
                    peers.spawn(serve_subscriber(
                        stream,
                        peer,
                        rx,
                        subscriptions.clone(),
                        stop_peers.clone(),
                    ));
                }
                Err(e) => warn!("accept failed: {}", e),
            }
        }
    }
}

async fn serve_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<Message>,
    subscriptions: Arc<watch::Sender<usize>>,
    stop: CancellationToken,
) {
    let (rd, wr) = stream.into_split();
    let mut requests = FramedRead::new(rd, codec());
    let mut out = FramedWrite::new(wr, codec());
    let mut topics: HashSet<String> = HashSet::new();

    loop {
        // Subscriptions already on the wire apply before queued messages.
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            request = requests.next() => match request {
                Some(Ok(frame)) => match String::from_utf8(frame.to_vec()) {
                    Ok(topic) => {
                        debug!("{} subscribed to '{}'", peer, topic);
                        if topics.insert(topic) {
                            subscriptions.send_modify(|n| *n += 1);
                        }
                    }
                    Err(_) => warn!("{} sent a non UTF-8 subscription, ignored", peer),
                },
                Some(Err(e)) => {
                    warn!("subscriber {} protocol error: {}", peer, e);
                    break;
                }
                None => {
                    info!("subscriber {} disconnected", peer);
                    break;
                }
            },
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if !topics.contains(&*msg.topic) {
                        continue;
                    }
                    if let Err(e) = write_message(&mut out, &msg).await {
                        warn!("dropping subscriber {}: {}", peer, e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    subscriptions.send_modify(|n| *n -= topics.len());
    let _ = out.get_mut().shutdown().await;
}

async fn write_message(
    out: &mut FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    msg: &Message,
) -> std::io::Result<()> {
    out.feed(Bytes::copy_from_slice(msg.topic.as_bytes())).await?;
    out.send(msg.payload.clone()).await
}

/// Inbound side of the channel. Owned by a subscriber.
pub struct SubSocket {
    addr: String,
    reconnect_interval: Duration,
    topics: Vec<String>,
    reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
}

impl SubSocket {
    /// Dial the publisher, waiting for it while it is not listening yet.
    pub async fn connect(addr: &str, reconnect_interval: Duration) -> Result<Self, TransportError> {
        let stream = dial(addr, reconnect_interval).await?;
        let (rd, wr) = stream.into_split();
        Ok(SubSocket {
            addr: addr.to_string(),
            reconnect_interval,
            topics: Vec::new(),
            reader: FramedRead::new(rd, codec()),
            writer: FramedWrite::new(wr, codec()),
        })
    }

    pub async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.writer
            .send(Bytes::copy_from_slice(topic.as_bytes()))
            .await?;
        self.topics.push(topic.to_string());
        Ok(())
    }

    /// Next `(topic, payload)` pair. If the publisher goes away the socket
    /// dials again and restores its subscriptions.
    pub async fn recv(&mut self) -> Result<(String, Bytes), TransportError> {
        loop {
            match self.read_message().await? {
                Some(msg) => return Ok(msg),
                None => {
                    warn!("publisher at {} went away, reconnecting", self.addr);
                    self.reconnect().await?;
                }
            }
        }
    }

    async fn read_message(&mut self) -> Result<Option<(String, Bytes)>, TransportError> {
        let Some(topic) = self.reader.next().await.transpose()? else {
            return Ok(None);
        };
        let Some(payload) = self.reader.next().await.transpose()? else {
            return Ok(None);
        };
        let topic = String::from_utf8(topic.to_vec())
            .map_err(|_| TransportError::Protocol("topic is not UTF-8".into()))?;
        Ok(Some((topic, payload.freeze())))
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        let stream = dial(&self.addr, self.reconnect_interval).await?;
        let (rd, wr) = stream.into_split();
        self.reader = FramedRead::new(rd, codec());
        self.writer = FramedWrite::new(wr, codec());
        for topic in &self.topics {
            self.writer
                .feed(Bytes::copy_from_slice(topic.as_bytes()))
                .await?;
        }
        SinkExt::<Bytes>::flush(&mut self.writer).await?;
        Ok(())
    }
}

async fn dial(addr: &str, interval: Duration) -> Result<TcpStream, TransportError> {
    use std::io::ErrorKind;

    let mut announced = false;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                info!("connected to publisher at {}", addr);
                return Ok(stream);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionRefused
                        | ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                ) =>
            {
                if !announced {
                    info!("publisher at {} not reachable yet ({}), waiting", addr, e);
                    announced = true;
                }
                tokio::time::sleep(interval).await;
            }
            Err(source) => {
                return Err(TransportError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Poll until the publisher has registered `n` subscription entries.
    pub(crate) async fn wait_for_subscriptions(socket: &PubSocket, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while socket.subscription_count() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriptions registered");
    }

    async fn pair(topics: &[&str]) -> (PubSocket, SubSocket) {
        let publisher = PubSocket::bind("127.0.0.1:0", 64).await.unwrap();
        let addr = publisher.local_addr().to_string();
        let mut subscriber = SubSocket::connect(&addr, Duration::from_millis(10))
            .await
            .unwrap();
        for t in topics {
            subscriber.subscribe(t).await.unwrap();
        }
        let distinct: HashSet<&&str> = topics.iter().collect();
        wait_for_subscriptions(&publisher, distinct.len()).await;
        (publisher, subscriber)
    }

    #[tokio::test]
    async fn test_delivers_only_subscribed_topics_in_order() {
        let (publisher, mut subscriber) = pair(&["sensor/em/1", "control/done"]).await;

        publisher.send("sensor/em/1", Bytes::from_static(b"a")).await;
        publisher.send("sensor/em/10", Bytes::from_static(b"x")).await;
        publisher.send("sensor/em/2", Bytes::from_static(b"y")).await;
        publisher.send("sensor/em/1", Bytes::from_static(b"b")).await;
        publisher.send("control/done", Bytes::new()).await;

        let got: Vec<(String, Bytes)> = vec![
            subscriber.recv().await.unwrap(),
            subscriber.recv().await.unwrap(),
            subscriber.recv().await.unwrap(),
        ];
        assert_eq!(got[0], ("sensor/em/1".to_string(), Bytes::from_static(b"a")));
        assert_eq!(got[1], ("sensor/em/1".to_string(), Bytes::from_static(b"b")));
        assert_eq!(got[2].0, "control/done");
        assert!(got[2].1.is_empty());
    }

    #[tokio::test]
    async fn test_close_drains_queued_messages() {
        let (publisher, mut subscriber) = pair(&["t"]).await;

        for i in 0..20u8 {
            publisher.send("t", Bytes::from(vec![i])).await;
        }
        publisher.close(Duration::from_secs(1)).await;

        for i in 0..20u8 {
            let (_, payload) = subscriber.recv().await.unwrap();
            assert_eq!(payload.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn test_burst_beyond_queue_depth_is_not_dropped() {
        let publisher = PubSocket::bind("127.0.0.1:0", 4).await.unwrap();
        let addr = publisher.local_addr().to_string();
        let mut subscriber = SubSocket::connect(&addr, Duration::from_millis(10))
            .await
            .unwrap();
        subscriber.subscribe("t").await.unwrap();
        wait_for_subscriptions(&publisher, 1).await;

        let sender = tokio::spawn(async move {
            for i in 0..2000u32 {
                publisher.send("t", Bytes::from(i.to_le_bytes().to_vec())).await;
            }
            publisher.close(Duration::from_secs(5)).await;
        });

        for i in 0..2000u32 {
            let (_, payload) = tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(payload.as_ref(), &i.to_le_bytes());
        }
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_subscription_applies_before_queued_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let (rd, wr) = client.into_split();
        let mut client_in = FramedRead::new(rd, codec());
        let mut client_out = FramedWrite::new(wr, codec());
        client_out.send(Bytes::from_static(b"t")).await.unwrap();
        // let the subscription reach the publisher's receive buffer
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(Message {
            topic: Arc::from("t"),
            payload: Bytes::from_static(b"first"),
        })
        .await
        .unwrap();
        let (subscriptions, _watch) = watch::channel(0usize);
        let stop = CancellationToken::new();
        tokio::spawn(serve_subscriber(
            server,
            peer,
            rx,
            Arc::new(subscriptions),
            stop.clone(),
        ));

        let topic = tokio::time::timeout(Duration::from_secs(5), client_in.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let payload = client_in.next().await.unwrap().unwrap();
        assert_eq!(topic.as_ref(), b"t");
        assert_eq!(payload.as_ref(), b"first");
        stop.cancel();
    }

    #[tokio::test]
    async fn test_subscription_count_tracks_disconnects() {
        let (publisher, subscriber) = pair(&["a", "b", "a"]).await;
        assert_eq!(publisher.subscription_count(), 2);

        drop(subscriber);
        tokio::time::timeout(Duration::from_secs(5), async {
            while publisher.subscription_count() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_waits_for_late_publisher() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap().to_string();
        drop(probe);

        let dialer = {
            let addr = addr.clone();
            tokio::spawn(async move { SubSocket::connect(&addr, Duration::from_millis(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let publisher = PubSocket::bind(&addr, 8).await.unwrap();

        let mut subscriber = dialer.await.unwrap().unwrap();
        subscriber.subscribe("t").await.unwrap();
        wait_for_subscriptions(&publisher, 1).await;
        publisher.send("t", Bytes::from_static(b"hi")).await;
        assert_eq!(subscriber.recv().await.unwrap().1.as_ref(), b"hi");
    }

    #[tokio::test]
    async fn test_subscriber_resubscribes_after_publisher_restart() {
        let (first, mut subscriber) = pair(&["t"]).await;
        let addr = first.local_addr().to_string();
        first.close(Duration::from_millis(100)).await;

        let receiver = tokio::spawn(async move { subscriber.recv().await });
        let second = PubSocket::bind(&addr, 8).await.unwrap();
        wait_for_subscriptions(&second, 1).await;
        second.send("t", Bytes::from_static(b"again")).await;

        let (topic, payload) = tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(topic, "t");
        assert_eq!(payload.as_ref(), b"again");
    }

    #[tokio::test]
    async fn test_bind_conflict_is_transport_error() {
        let first = PubSocket::bind("127.0.0.1:0", 8).await.unwrap();
        let addr = first.local_addr().to_string();
        let err = PubSocket::bind(&addr, 8).await.err().unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
    }
}
