use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::net;
use crate::promise::Promise;
use crate::proxy::pipe;
use crate::session::{self, SessionInfo, SharedSessions};
use crate::sublog::SubLogger;

/// Raw TCP forwarder: every accepted connection is spliced to one fixed
/// target address.
pub struct TcpProxy {
    listen: String,
    target: String,
    dial_timeout: Duration,
    retry: Promise,
    log: SubLogger,
    sessions: SharedSessions,
}

impl TcpProxy {
    pub fn new(
        listen: impl Into<String>,
        target: impl Into<String>,
        dial_timeout: Duration,
        sessions: SharedSessions,
    ) -> Self {
        let listen = listen.into();
        let log = SubLogger::new(format!("tcp/{listen}"));
        Self {
            listen,
            target: target.into(),
            dial_timeout,
            retry: Promise::default(),
            log,
            sessions,
        }
    }

    pub fn with_retry(mut self, retry: Promise) -> Self {
        self.retry = retry;
        self
    }

    /// Binds (with backoff on failure) and accepts until shutdown. Each
    /// accepted connection either gets paired with a target dial or is
    /// closed on the spot; in-flight pipes drain naturally after shutdown.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) {
        let bind_addr = net::normalize_bind_addr(&self.listen).into_owned();
        let Some(ln) = self
            .retry
            .run(&self.log, shutdown.clone(), || {
                let addr = bind_addr.clone();
                async move {
                    TcpListener::bind(&addr)
                        .await
                        .map_err(|e| anyhow::anyhow!("bind {addr}: {e}"))
                }
            })
            .await
        else {
            return;
        };

        self.log.info(format!("forwarding to {}", self.target));

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|v| *v) => return,
                res = ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            self.log.warn(format!("accept failed: {err}"));
                            continue;
                        }
                    };
                    self.log.debug(format!("accepted {peer}"));
                    self.spawn_pipe(conn, peer.to_string());
                }
            }
        }
    }

    fn spawn_pipe(&self, conn: TcpStream, peer: String) {
        let target = self.target.clone();
        let dial_timeout = self.dial_timeout;
        let log = self.log.clone();
        let sessions = self.sessions.clone();

        tokio::spawn(async move {
            let dial = tokio::time::timeout(dial_timeout, TcpStream::connect(&target)).await;
            let upstream = match dial {
                Ok(Ok(s)) => s,
                Ok(Err(err)) => {
                    log.warn(format!("dial {target} failed: {err}"));
                    return; // accepted conn dropped here
                }
                Err(_) => {
                    log.warn(format!("dial {target} timed out"));
                    return;
                }
            };

            let sid = session::new_session_id();
            sessions.add(SessionInfo {
                id: sid.clone(),
                client: peer.clone(),
                target: target.clone(),
                started_at_unix_ms: session::now_unix_ms(),
            });

            let (up, down) = pipe::splice(conn, upstream).await;
            sessions.remove(&sid);
            log.debug(format!("{peer} done ({up} up, {down} down)"));
        });
    }
}
