use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::promise::Promise;
use crate::session::{SessionRegistry, SharedSessions};
use crate::sublog::SubLogger;

pub mod http;
pub mod pipe;
pub mod socks;
pub mod tcp;

pub use http::HttpProxy;
pub use socks::Socks5Proxy;
pub use tcp::TcpProxy;

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub listen: String,
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct TcpForwardOptions {
    pub listen: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub http: Option<ListenerOptions>,
    pub socks: Option<ListenerOptions>,
    pub tcp: Vec<TcpForwardOptions>,
    pub dial_timeout: Duration,
    pub retry: Promise,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            http: None,
            socks: None,
            tcp: Vec::new(),
            dial_timeout: Duration::from_secs(10),
            retry: Promise::default(),
        }
    }
}

/// Lifecycle supervisor for the proxy fan-out: zero-or-one HTTP proxy,
/// zero-or-one SOCKS5 proxy, zero-or-more raw TCP forwarders.
///
/// Every listener runs under its own task with its own backoff, so one
/// failing component never takes the others down.
pub struct ProxyHost {
    log: SubLogger,
    sessions: SharedSessions,
    http: Option<Arc<HttpProxy>>,
    socks: Option<Arc<Socks5Proxy>>,
    tcp: Vec<Arc<TcpProxy>>,
}

impl ProxyHost {
    pub fn new(opts: ProxyOptions) -> Self {
        let sessions: SharedSessions = Arc::new(SessionRegistry::new());

        let http = opts.http.as_ref().map(|l| {
            Arc::new(
                HttpProxy::new(&l.listen, l.users.clone(), opts.dial_timeout, sessions.clone())
                    .with_retry(opts.retry),
            )
        });
        let socks = opts.socks.as_ref().map(|l| {
            Arc::new(
                Socks5Proxy::new(&l.listen, l.users.clone(), opts.dial_timeout, sessions.clone())
                    .with_retry(opts.retry),
            )
        });
        let tcp = opts
            .tcp
            .iter()
            .map(|t| {
                Arc::new(
                    TcpProxy::new(&t.listen, &t.target, opts.dial_timeout, sessions.clone())
                        .with_retry(opts.retry),
                )
            })
            .collect();

        Self {
            log: SubLogger::new("proxy"),
            sessions,
            http,
            socks,
            tcp,
        }
    }

    pub fn sessions(&self) -> SharedSessions {
        self.sessions.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.socks.is_none() && self.tcp.is_empty()
    }

    /// Serves every configured listener until `shutdown` fires, then drains.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();

        if let Some(http) = &self.http {
            let http = http.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { http.serve(shutdown).await });
        }
        if let Some(socks) = &self.socks {
            let socks = socks.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { socks.serve(shutdown).await });
        }
        for t in &self.tcp {
            let t = t.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { t.serve(shutdown).await });
        }

        if tasks.is_empty() {
            return;
        }
        self.log.info(format!(
            "started (http: {}, socks: {}, tcp forwards: {})",
            self.http.is_some(),
            self.socks.is_some(),
            self.tcp.len()
        ));

        while tasks.join_next().await.is_some() {}
        self.log.info("stopped");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    #[tokio::test]
    async fn host_runs_components_independently_and_stops_on_shutdown() {
        // Echo target for the tcp forwarder.
        let target_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target_ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = target_ln.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = s.read(&mut buf).await {
                        if n == 0 || s.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let probe1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_listen = probe1.local_addr().unwrap().to_string();
        let probe2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_listen = probe2.local_addr().unwrap().to_string();
        drop((probe1, probe2));

        let host = Arc::new(ProxyHost::new(ProxyOptions {
            http: Some(ListenerOptions {
                listen: http_listen.clone(),
                users: HashMap::new(),
            }),
            socks: None,
            tcp: vec![TcpForwardOptions {
                listen: tcp_listen.clone(),
                target,
            }],
            dial_timeout: Duration::from_secs(1),
            retry: Promise {
                first: Duration::from_millis(10),
                min: Duration::from_millis(20),
                max: Duration::from_millis(100),
            },
        }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn({
            let host = host.clone();
            async move { host.run(shutdown_rx).await }
        });

        // TCP forwarder answers.
        let mut c = None;
        for _ in 0..200 {
            if let Ok(s) = TcpStream::connect(&tcp_listen).await {
                c = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut c = c.expect("tcp forwarder never came up");
        c.write_all(b"ok").await.unwrap();
        let mut got = [0u8; 2];
        c.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ok");
        drop(c);

        // HTTP proxy answers on its own listener.
        let mut h = None;
        for _ in 0..200 {
            if let Ok(s) = TcpStream::connect(&http_listen).await {
                h = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut h = h.expect("http proxy never came up");
        h.write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\n\r\n").await.unwrap();
        let mut resp = Vec::new();
        h.read_to_end(&mut resp).await.unwrap();
        assert!(String::from_utf8_lossy(&resp).starts_with("HTTP/1.1 502 "));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("host must stop on shutdown")
            .unwrap();
    }
}
