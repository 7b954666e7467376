use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::net;
use crate::promise::Promise;
use crate::proxy::pipe;
use crate::session::{self, SessionInfo, SharedSessions};
use crate::sublog::SubLogger;

const VER: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_OK: u8 = 0x00;
const REP_REFUSED: u8 = 0x05;
const REP_CMD_UNSUPPORTED: u8 = 0x07;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// RFC 1928 SOCKS5 server supporting CONNECT with optional RFC 1929
/// username/password authentication.
pub struct Socks5Proxy {
    listen: String,
    users: HashMap<String, String>,
    dial_timeout: Duration,
    retry: Promise,
    log: SubLogger,
    sessions: SharedSessions,
}

impl Socks5Proxy {
    pub fn new(
        listen: impl Into<String>,
        users: HashMap<String, String>,
        dial_timeout: Duration,
        sessions: SharedSessions,
    ) -> Self {
        let listen = listen.into();
        let log = SubLogger::new(format!("socks/{listen}"));
        Self {
            listen,
            users,
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

        self.log.info("proxy listening");

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
                    let users = self.users.clone();
                    let dial_timeout = self.dial_timeout;
                    let log = self.log.clone();
                    let sessions = self.sessions.clone();
                    tokio::spawn(async move {
                        let peer = peer.to_string();
                        let res = tokio::time::timeout(
                            HANDSHAKE_TIMEOUT,
                            handshake(conn, &users, dial_timeout),
                        )
                        .await;
                        let (conn, upstream, target) = match res {
                            Ok(Ok(Some(v))) => v,
                            Ok(Ok(None)) => return, // politely refused
                            Ok(Err(err)) => {
                                log.debug(format!("{peer}: handshake failed: {err:#}"));
                                return;
                            }
                            Err(_) => {
                                log.debug(format!("{peer}: handshake timed out"));
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
                        log.debug(format!("{peer} -> {target} established"));
                        let (up, down) = pipe::splice(conn, upstream).await;
                        sessions.remove(&sid);
                        log.debug(format!("{peer} -> {target} done ({up} up, {down} down)"));
                    });
                }
            }
        }
    }
}

/// Runs greeting, optional auth and the CONNECT request. `Ok(None)` means
/// the client was answered and turned away (bad method choice, bad
/// credentials, unsupported command, dial failure).
async fn handshake(
    mut conn: TcpStream,
    users: &HashMap<String, String>,
    dial_timeout: Duration,
) -> anyhow::Result<Option<(TcpStream, TcpStream, String)>> {
    // Greeting: VER NMETHODS METHODS...
    let mut hdr = [0u8; 2];
    conn.read_exact(&mut hdr).await?;
    if hdr[0] != VER {
        anyhow::bail!("unsupported version {:#x}", hdr[0]);
    }
    let mut methods = vec![0u8; hdr[1] as usize];
    conn.read_exact(&mut methods).await?;

    let want = if users.is_empty() {
        METHOD_NONE
    } else {
        METHOD_USERPASS
    };
    if !methods.contains(&want) {
        conn.write_all(&[VER, METHOD_UNACCEPTABLE]).await?;
        return Ok(None);
    }
    conn.write_all(&[VER, want]).await?;

    if want == METHOD_USERPASS && !check_userpass(&mut conn, users).await? {
        return Ok(None);
    }

    // Request: VER CMD RSV ATYP ADDR PORT
    let mut req = [0u8; 4];
    conn.read_exact(&mut req).await?;
    if req[0] != VER {
        anyhow::bail!("unsupported version {:#x}", req[0]);
    }
    if req[1] != CMD_CONNECT {
        reply(&mut conn, REP_CMD_UNSUPPORTED, None).await?;
        return Ok(None);
    }

    let host = match req[3] {
        ATYP_IPV4 => {
            let mut b = [0u8; 4];
            conn.read_exact(&mut b).await?;
            IpAddr::from(b).to_string()
        }
        ATYP_IPV6 => {
            let mut b = [0u8; 16];
            conn.read_exact(&mut b).await?;
            format!("[{}]", IpAddr::from(b))
        }
        ATYP_DOMAIN => {
            let len = conn.read_u8().await? as usize;
            let mut b = vec![0u8; len];
            conn.read_exact(&mut b).await?;
            String::from_utf8_lossy(&b).into_owned()
        }
        other => anyhow::bail!("unsupported address type {other:#x}"),
    };
    let port = conn.read_u16().await?;
    let target = format!("{host}:{port}");

    let dial = tokio::time::timeout(dial_timeout, TcpStream::connect(&target)).await;
    let upstream = match dial {
        Ok(Ok(s)) => s,
        _ => {
            reply(&mut conn, REP_REFUSED, None).await?;
            return Ok(None);
        }
    };

    reply(&mut conn, REP_OK, upstream.local_addr().ok()).await?;
    Ok(Some((conn, upstream, target)))
}

async fn check_userpass(
    conn: &mut TcpStream,
    users: &HashMap<String, String>,
) -> anyhow::Result<bool> {
    let ver = conn.read_u8().await?;
    if ver != 0x01 {
        anyhow::bail!("unsupported auth subnegotiation version {ver:#x}");
    }
    let ulen = conn.read_u8().await? as usize;
    let mut user = vec![0u8; ulen];
    conn.read_exact(&mut user).await?;
    let plen = conn.read_u8().await? as usize;
    let mut pass = vec![0u8; plen];
    conn.read_exact(&mut pass).await?;

    let user = String::from_utf8_lossy(&user);
    let pass = String::from_utf8_lossy(&pass);
    let ok = users.get(user.as_ref()).is_some_and(|p| *p == pass);

    conn.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
    if !ok {
        let _ = conn.shutdown().await;
    }
    Ok(ok)
}

async fn reply(conn: &mut TcpStream, rep: u8, bound: Option<SocketAddr>) -> anyhow::Result<()> {
    let mut out = vec![VER, rep, 0x00];
    match bound {
        Some(SocketAddr::V4(a)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&a.ip().octets());
            out.extend_from_slice(&a.port().to_be_bytes());
        }
        Some(SocketAddr::V6(a)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&a.ip().octets());
            out.extend_from_slice(&a.port().to_be_bytes());
        }
        None => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    conn.write_all(&out).await?;
    if rep != REP_OK {
        let _ = conn.shutdown().await;
    }
    Ok(())
}
