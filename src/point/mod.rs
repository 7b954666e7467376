use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::promise::Promise;
use crate::sublog::SubLogger;
use crate::tunnel::client::{ClientOptions, TunnelClient};

pub mod device;
pub mod link;

pub use device::{BoxedTap, DeviceWorker};
pub use link::LinkWorker;

const QUEUE_DEPTH: usize = 256;
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PointOptions {
    pub device_name: String,
    pub server_addr: String,
    pub mtu: usize,
    pub dial_timeout: Duration,
    pub send_timeout: Duration,
    pub retry: Promise,
}

impl PointOptions {
    pub fn new(device_name: impl Into<String>, server_addr: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            server_addr: server_addr.into(),
            mtu: 1500,
            dial_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            retry: Promise::default(),
        }
    }
}

/// An edge endpoint: one TAP device coupled to one tunnel link.
///
/// The point owns both workers and the channels between them; neither
/// worker references the other directly. Any loop exiting (device EOF, link
/// termination) tears the whole point down, and the opposite loop exits on
/// the resulting EOF or `Closed`.
pub struct Point {
    opts: PointOptions,
    log: SubLogger,
    client: Arc<TunnelClient>,
}

impl Point {
    pub fn new(opts: PointOptions) -> Self {
        let client = TunnelClient::new(ClientOptions {
            server_addr: opts.server_addr.clone(),
            dial_timeout: opts.dial_timeout,
            send_timeout: opts.send_timeout,
            retry: opts.retry,
        });
        let log = SubLogger::new(format!("point/{}", opts.device_name));
        Self { opts, log, client }
    }

    pub fn client(&self) -> Arc<TunnelClient> {
        self.client.clone()
    }

    /// Runs the point until the device or the link goes away, or `shutdown`
    /// fires. Closes both endpoints on the way out.
    pub async fn run(self, tap: BoxedTap, mut shutdown: watch::Receiver<bool>) {
        self.log
            .info(format!("bridging {} to {}", self.opts.device_name, self.opts.server_addr));
        self.client.connect();

        let (tap_rd, tap_wr) = tokio::io::split(tap);
        let (to_link_tx, to_link_rx) = mpsc::channel(QUEUE_DEPTH);
        let (to_dev_tx, to_dev_rx) = mpsc::channel(QUEUE_DEPTH);
        let (halt_tx, halt_rx) = watch::channel(false);

        let dev = Arc::new(DeviceWorker::new(&self.opts.device_name, self.opts.mtu));
        let link = Arc::new(LinkWorker::new(self.client.clone()));

        let mut tasks = JoinSet::new();
        {
            let dev = dev.clone();
            let halt = halt_rx.clone();
            tasks.spawn(async move { dev.read_loop(tap_rd, to_link_tx, halt).await });
        }
        {
            let dev = dev.clone();
            let halt = halt_rx.clone();
            tasks.spawn(async move { dev.write_loop(tap_wr, to_dev_rx, halt).await });
        }
        {
            let link = link.clone();
            tasks.spawn(async move { link.read_loop(to_dev_tx).await });
        }
        {
            let link = link.clone();
            let halt = halt_rx.clone();
            tasks.spawn(async move { link.write_loop(to_link_rx, halt).await });
        }
        {
            let client = self.client.clone();
            let log = self.log.clone();
            let mut halt = halt_rx.clone();
            tasks.spawn(async move {
                let mut tick = tokio::time::interval(DROP_LOG_INTERVAL);
                tick.tick().await; // immediate first tick
                loop {
                    tokio::select! {
                        _ = halt.wait_for(|v| *v) => return,
                        _ = tick.tick() => {
                            let dropped = client.take_drops();
                            if dropped > 0 {
                                log.info(format!("{dropped} frames dropped while link was down"));
                            }
                        }
                    }
                }
            });
        }

        tokio::select! {
            _ = shutdown.wait_for(|v| *v) => {
                self.log.info("shutting down");
            }
            _ = tasks.join_next() => {
                self.log.info("worker exited; closing point");
            }
        }

        self.client.close();
        let _ = halt_tx.send(true);

        if tokio::time::timeout(Duration::from_secs(5), async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let dropped = self.client.take_drops();
        if dropped > 0 {
            self.log.info(format!("{dropped} frames dropped while link was down"));
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::frame::Frame;
    use crate::tunnel::codec;

    fn fast_opts(addr: &str) -> PointOptions {
        let mut opts = PointOptions::new("tap-test", addr);
        opts.retry = Promise {
            first: Duration::from_millis(10),
            min: Duration::from_millis(20),
            max: Duration::from_millis(100),
        };
        opts
    }

    fn tagged_frame(tag: u8, len: usize) -> Frame {
        let mut raw = vec![0u8; len];
        raw[5] = tag;
        raw[12] = 0x08;
        Frame::copy_from(&raw).unwrap()
    }

    #[tokio::test]
    async fn frames_cross_the_point_in_both_directions_in_order() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();

        let (tap, mut tap_side) = tokio::io::duplex(64 * 1024);
        let point = Point::new(fast_opts(&addr));
        let client = point.client();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(point.run(Box::new(tap), shutdown_rx));

        let (mut switch, _) = ln.accept().await.unwrap();
        let mut state = client.watch_state();
        state
            .wait_for(|s| *s == crate::tunnel::client::LinkState::Connected)
            .await
            .unwrap();

        // device -> link: one frame at a time, each must arrive unchanged.
        for tag in 1..=3u8 {
            let f = tagged_frame(tag, 60 + tag as usize);
            tap_side.write_all(f.as_bytes()).await.unwrap();
            let got = codec::read_frame(&mut switch).await.unwrap();
            assert_eq!(got, f, "frame {tag} corrupted in transit");
        }

        // link -> device: burst of frames, delivered back-to-back in order.
        let frames: Vec<Frame> = (10..13u8).map(|t| tagged_frame(t, 80)).collect();
        let mut expect = Vec::new();
        for f in &frames {
            codec::write_frame(&mut switch, f).await.unwrap();
            expect.extend_from_slice(f.as_bytes());
        }
        let mut got = vec![0u8; expect.len()];
        tap_side.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expect, "inbound frames reordered or corrupted");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("point must stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn device_eof_tears_the_point_down() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();

        let (tap, tap_side) = tokio::io::duplex(4096);
        let point = Point::new(fast_opts(&addr));
        let client = point.client();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(point.run(Box::new(tap), shutdown_rx));

        let (_switch, _) = ln.accept().await.unwrap();
        drop(tap_side); // kernel side of the TAP goes away

        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("point must stop when the device closes")
            .unwrap();
        assert_eq!(
            client.state(),
            crate::tunnel::client::LinkState::Terminated
        );
    }
}
