use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context as _;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::net;
use crate::promise::Promise;
use crate::proxy::pipe;
use crate::session::{self, SessionInfo, SharedSessions};
use crate::sublog::SubLogger;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_OKAY: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// HTTP/1.1 proxy: CONNECT tunneling plus plain forward proxying, with
/// optional Basic authentication.
pub struct HttpProxy {
    listen: String,
    users: HashMap<String, String>,
    dial_timeout: Duration,
    retry: Promise,
    log: SubLogger,
    sessions: SharedSessions,
}

impl HttpProxy {
    pub fn new(
        listen: impl Into<String>,
        users: HashMap<String, String>,
        dial_timeout: Duration,
        sessions: SharedSessions,
    ) -> Self {
        let listen = listen.into();
        let log = SubLogger::new(format!("http/{listen}"));
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
                    let h = Handler {
                        users: self.users.clone(),
                        dial_timeout: self.dial_timeout,
                        log: self.log.clone(),
                        sessions: self.sessions.clone(),
                    };
                    tokio::spawn(async move { h.handle(conn, peer.to_string()).await });
                }
            }
        }
    }
}

struct Handler {
    users: HashMap<String, String>,
    dial_timeout: Duration,
    log: SubLogger,
    sessions: SharedSessions,
}

impl Handler {
    async fn handle(&self, mut conn: TcpStream, peer: String) {
        let read = tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut conn, MAX_HEAD_BYTES)).await;
        let (head, leftover) = match read {
            Ok(Ok(v)) => v,
            Ok(Err(err)) => {
                self.log.debug(format!("{peer}: bad request head: {err:#}"));
                respond(&mut conn, 400, "Bad Request", &[]).await;
                return;
            }
            Err(_) => {
                self.log.debug(format!("{peer}: request head timed out"));
                let _ = conn.shutdown().await;
                return;
            }
        };

        let Some((method, target, version)) = head.request_line() else {
            respond(&mut conn, 400, "Bad Request", &[]).await;
            return;
        };

        if !self.authorized(&head) {
            self.log
                .info(format!("{peer}: authentication required for {target}"));
            respond(
                &mut conn,
                407,
                "Proxy Authentication Required",
                &[("Proxy-Authenticate", "Basic")],
            )
            .await;
            return;
        }

        if method.eq_ignore_ascii_case("CONNECT") {
            self.tunnel(conn, peer, target, leftover).await;
        } else {
            self.forward(conn, peer, head, method, target, version, leftover)
                .await;
        }
    }

    fn authorized(&self, head: &Head) -> bool {
        if self.users.is_empty() {
            return true;
        }
        let Some((user, pass)) = head.get("Proxy-Authorization").and_then(parse_basic_auth)
        else {
            return false;
        };
        self.users.get(&user).is_some_and(|p| *p == pass)
    }

    /// RFC 7231 CONNECT: splice the client socket to the dialed target.
    async fn tunnel(&self, mut conn: TcpStream, peer: String, target: String, leftover: Vec<u8>) {
        let dial = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&target)).await;
        let mut upstream = match dial {
            Ok(Ok(s)) => s,
            Ok(Err(err)) => {
                self.log.info(format!("{peer}: dial {target} failed: {err}"));
                respond(&mut conn, 502, "Bad Gateway", &[]).await;
                return;
            }
            Err(_) => {
                self.log.info(format!("{peer}: dial {target} timed out"));
                respond(&mut conn, 502, "Bad Gateway", &[]).await;
                return;
            }
        };

        if conn.write_all(CONNECT_OKAY).await.is_err() {
            return;
        }
        // Bytes the client sent past the head belong to the target.
        if !leftover.is_empty() && upstream.write_all(&leftover).await.is_err() {
            let _ = conn.shutdown().await;
            return;
        }

        let sid = session::new_session_id();
        self.sessions.add(SessionInfo {
            id: sid.clone(),
            client: peer.clone(),
            target: target.clone(),
            started_at_unix_ms: session::now_unix_ms(),
        });
        self.log.debug(format!("{peer} -> {target} established"));

        let (up, down) = pipe::splice(conn, upstream).await;
        self.sessions.remove(&sid);
        self.log.debug(format!("{peer} -> {target} done ({up} up, {down} down)"));
    }

    /// Plain forward proxying over a single-use origin connection.
    #[allow(clippy::too_many_arguments)]
    async fn forward(
        &self,
        mut conn: TcpStream,
        peer: String,
        head: Head,
        method: String,
        target: String,
        version: String,
        leftover: Vec<u8>,
    ) {
        let Some((authority, path)) = split_absolute_uri(&target) else {
            respond(&mut conn, 400, "Bad Request", &[]).await;
            return;
        };
        let origin = net::ensure_port(&authority, 80);

        let dial = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&origin)).await;
        let upstream = match dial {
            Ok(Ok(s)) => s,
            Ok(Err(err)) => {
                self.log.info(format!("{peer}: dial {origin} failed: {err}"));
                respond(&mut conn, 502, "Bad Gateway", &[]).await;
                return;
            }
            Err(_) => {
                self.log.info(format!("{peer}: dial {origin} timed out"));
                respond(&mut conn, 502, "Bad Gateway", &[]).await;
                return;
            }
        };

        // Origin-form request line; the transport is single-use, so make
        // the response EOF-delimited.
        let mut out = format!("{method} {path} {version}\r\n").into_bytes();
        for (name, value) in &head.headers {
            if name.eq_ignore_ascii_case("Connection")
                || name.eq_ignore_ascii_case("Proxy-Connection")
            {
                continue;
            }
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"Connection: close\r\n\r\n");

        let (mut crd, mut cwr) = conn.into_split();
        let (mut ord, mut owr) = upstream.into_split();

        if owr.write_all(&out).await.is_err() || owr.write_all(&leftover).await.is_err() {
            let _ = respond_split(&mut cwr, 502, "Bad Gateway").await;
            return;
        }

        // Stream any remaining request body while the response comes back.
        let body = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut crd, &mut owr).await;
        });

        let resp = read_head(&mut ord, MAX_HEAD_BYTES).await;
        let (resp_head, resp_leftover) = match resp {
            Ok(v) => v,
            Err(err) => {
                self.log.debug(format!("{peer}: origin response failed: {err:#}"));
                let _ = respond_split(&mut cwr, 502, "Bad Gateway").await;
                body.abort();
                return;
            }
        };

        // Pop one Proxy-Authorization value so a chained proxy sees its own
        // credentials at most once.
        let mut stripped = false;
        let mut out = format!("{}\r\n", resp_head.line1).into_bytes();
        for (name, value) in &resp_head.headers {
            if !stripped && name.eq_ignore_ascii_case("Proxy-Authorization") {
                stripped = true;
                continue;
            }
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");

        let ok = cwr.write_all(&out).await.is_ok()
            && cwr.write_all(&resp_leftover).await.is_ok()
            && tokio::io::copy(&mut ord, &mut cwr).await.is_ok();
        if !ok {
            self.log.debug(format!("{peer}: response relay interrupted"));
        }
        let _ = cwr.shutdown().await;
        body.abort();
    }
}

/// One parsed HTTP head: the first line plus headers in order.
#[derive(Debug, Clone)]
struct Head {
    line1: String,
    headers: Vec<(String, String)>,
}

impl Head {
    fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn request_line(&self) -> Option<(String, String, String)> {
        let mut it = self.line1.split_whitespace();
        let method = it.next()?.to_string();
        let target = it.next()?.to_string();
        let version = it.next()?.to_string();
        if it.next().is_some() || !version.starts_with("HTTP/") {
            return None;
        }
        Some((method, target, version))
    }
}

/// Reads up to the blank line; returns the parsed head and any bytes read
/// past it.
async fn read_head<R>(r: &mut R, max: usize) -> anyhow::Result<(Head, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut tmp = [0u8; 4096];
    let mut scan_from = 0usize;

    let end = loop {
        if let Some(pos) = find_head_end(&buf[scan_from..]) {
            break scan_from + pos;
        }
        scan_from = buf.len().saturating_sub(3);
        if buf.len() > max {
            anyhow::bail!("head exceeds {max} bytes");
        }
        let n = r.read(&mut tmp).await.context("read head")?;
        if n == 0 {
            anyhow::bail!("eof before end of head");
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let leftover = buf[end + 4..].to_vec();
    let head = parse_head(&buf[..end])?;
    Ok((head, leftover))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(raw: &[u8]) -> anyhow::Result<Head> {
    let text = std::str::from_utf8(raw).context("head is not valid utf-8")?;
    let mut lines = text.split("\r\n");
    let line1 = lines.next().unwrap_or_default().to_string();
    if line1.is_empty() {
        anyhow::bail!("empty start line");
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .with_context(|| format!("malformed header line {line:?}"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(Head { line1, headers })
}

fn parse_basic_auth(v: &str) -> Option<(String, String)> {
    let v = v.trim();
    if v.len() < 6 || !v[..6].eq_ignore_ascii_case("basic ") {
        return None;
    }
    let decoded = BASE64.decode(v[6..].trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Splits `http://host[:port]/path` into authority and origin-form path.
fn split_absolute_uri(target: &str) -> Option<(String, String)> {
    let rest = if target.len() >= 7 && target[..7].eq_ignore_ascii_case("http://") {
        &target[7..]
    } else {
        return None;
    };
    if rest.is_empty() {
        return None;
    }
    match rest.find('/') {
        Some(pos) => Some((rest[..pos].to_string(), rest[pos..].to_string())),
        None => Some((rest.to_string(), "/".to_string())),
    }
}

async fn respond(conn: &mut TcpStream, status: u16, reason: &str, extra: &[(&str, &str)]) {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
    for (k, v) in extra {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("Content-Length: 0\r\nConnection: close\r\n\r\n");
    let _ = conn.write_all(out.as_bytes()).await;
    let _ = conn.shutdown().await;
}

async fn respond_split<W>(w: &mut W, status: u16, reason: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let out =
        format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    w.write_all(out.as_bytes()).await?;
    w.shutdown().await
}
