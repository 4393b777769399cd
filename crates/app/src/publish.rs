//! Result publisher: JSON frame results fanned out to TCP subscribers.
//!
//! `publish` serialises and enqueues; a dedicated I/O thread writes
//! line-delimited JSON to every connected subscriber. The channel is bounded
//! and `try_send`-only, so a slow or absent consumer sheds messages instead
//! of stalling the inference workers. Dead subscribers are dropped on the
//! first failed write.

use std::{
    io::Write,
    net::{TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use infer_core::{FrameResult, ResultPublisher};
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct TcpFanoutPublisher {
    tx: Sender<String>,
    local_addr: std::net::SocketAddr,
    clients: Arc<Mutex<Vec<TcpStream>>>,
    stopping: Arc<AtomicBool>,
    published: AtomicU64,
    dropped: AtomicU64,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TcpFanoutPublisher {
    /// Bind the subscriber listener and start the accept and writer threads.
    pub fn bind(addr: &str) -> Result<Arc<Self>> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("binding publisher to {addr}"))?;
        listener
            .set_nonblocking(true)
            .context("configuring publisher listener")?;
        let local_addr = listener.local_addr()?;
        info!("result publisher listening on {local_addr}");

        let (tx, rx) = bounded::<String>(CHANNEL_CAPACITY);
        let publisher = Arc::new(Self {
            tx,
            local_addr,
            clients: Arc::new(Mutex::new(Vec::new())),
            stopping: Arc::new(AtomicBool::new(false)),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
        });

        let accept_handle = crate::telemetry::spawn_thread("publish-accept", {
            let clients = publisher.clients.clone();
            let stopping = publisher.stopping.clone();
            move || accept_loop(listener, clients, stopping)
        })
        .context("spawning publisher accept thread")?;

        let writer_handle = crate::telemetry::spawn_thread("publish-writer", {
            let clients = publisher.clients.clone();
            let stopping = publisher.stopping.clone();
            move || writer_loop(rx, clients, stopping)
        })
        .context("spawning publisher writer thread")?;

        publisher
            .threads
            .lock()
            .unwrap()
            .extend([accept_handle, writer_handle]);
        Ok(publisher)
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Messages shed because the outbound channel was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

impl ResultPublisher for TcpFanoutPublisher {
    fn publish(&self, result: &FrameResult) {
        let json = match serde_json::to_string(result) {
            Ok(json) => json,
            Err(err) => {
                warn!("failed to serialise frame result: {err}");
                return;
            }
        };
        match self.tx.try_send(json) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("infer_published_total").increment(1);
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("infer_publish_dropped_total").increment(1);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        self.clients.lock().unwrap().clear();
        debug!("result publisher stopped");
    }
}

fn accept_loop(
    listener: TcpListener,
    clients: Arc<Mutex<Vec<TcpStream>>>,
    stopping: Arc<AtomicBool>,
) {
    while !stopping.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("publisher subscriber connected: {peer}");
                let _ = stream.set_nodelay(true);
                clients.lock().unwrap().push(stream);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                warn!("publisher accept failed: {err}");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn writer_loop(
    rx: Receiver<String>,
    clients: Arc<Mutex<Vec<TcpStream>>>,
    stopping: Arc<AtomicBool>,
) {
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                let mut clients = clients.lock().unwrap();
                clients.retain_mut(|client| {
                    let ok = client
                        .write_all(line.as_bytes())
                        .and_then(|_| client.write_all(b"\n"))
                        .is_ok();
                    if !ok {
                        debug!("dropping dead publisher subscriber");
                    }
                    ok
                });
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if stopping.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};

    use super::*;

    fn result(frame_id: u64) -> FrameResult {
        FrameResult {
            cam_id: "cam-1".to_string(),
            frame_id,
            ..FrameResult::default()
        }
    }

    #[test]
    fn subscribers_receive_json_lines() {
        let publisher = TcpFanoutPublisher::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(publisher.local_addr()).unwrap();
        let mut reader = BufReader::new(stream);

        // Wait for the accept loop to register the subscriber.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while publisher.subscriber_count() == 0 {
            assert!(std::time::Instant::now() < deadline, "subscriber not seen");
            thread::sleep(Duration::from_millis(10));
        }

        publisher.publish(&result(7));
        assert_eq!(publisher.published_count(), 1);

        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let parsed: FrameResult = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed.cam_id, "cam-1");
        assert_eq!(parsed.frame_id, 7);

        publisher.shutdown();
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let publisher = TcpFanoutPublisher::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(publisher.local_addr()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while publisher.subscriber_count() == 0 {
            assert!(std::time::Instant::now() < deadline, "subscriber not seen");
            thread::sleep(Duration::from_millis(10));
        }
        drop(stream);

        // Writes to the closed socket fail and evict the client.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while publisher.subscriber_count() > 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "dead subscriber never pruned"
            );
            publisher.publish(&result(1));
            thread::sleep(Duration::from_millis(50));
        }

        publisher.shutdown();
    }

    #[test]
    fn publish_without_subscribers_is_lossy_not_blocking() {
        let publisher = TcpFanoutPublisher::bind("127.0.0.1:0").unwrap();
        let start = std::time::Instant::now();
        for i in 0..2_000 {
            publisher.publish(&result(i));
        }
        // Never blocks even with far more messages than channel capacity.
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(publisher.published_count() + publisher.dropped_count() == 2_000);
        publisher.shutdown();
    }
}
