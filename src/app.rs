use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config;
use crate::logging;
use crate::point::device::BoxedTap;
use crate::point::{Point, PointOptions};
use crate::proxy::{ListenerOptions, ProxyHost, ProxyOptions, TcpForwardOptions};
use crate::store::network::NetworkStore;

const NETWORK_STORE_CAP: usize = 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure surfaced to `main`, classified for the process exit code:
/// 1 for configuration problems, 2 for unrecoverable I/O.
#[derive(Debug)]
pub struct AppError {
    fatal: bool,
    source: anyhow::Error,
}

impl AppError {
    fn config(source: anyhow::Error) -> Self {
        Self {
            fatal: false,
            source,
        }
    }

    fn fatal(source: anyhow::Error) -> Self {
        Self {
            fatal: true,
            source,
        }
    }

    pub fn exit_code(&self) -> u8 {
        if self.fatal { 2 } else { 1 }
    }

    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.source)
    }
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), AppError> {
    let resolved = config::resolve_config_path(config_path).map_err(AppError::config)?;
    let cfg = config::load_config(&resolved.path).map_err(AppError::config)?;
    logging::init(&cfg.logging).map_err(AppError::config)?;

    let host = ProxyHost::new(ProxyOptions {
        http: cfg.proxy.http.as_ref().map(|l| ListenerOptions {
            listen: l.listen.clone(),
            users: l.users.clone(),
        }),
        socks: cfg.proxy.socks.as_ref().map(|l| ListenerOptions {
            listen: l.listen.clone(),
            users: l.users.clone(),
        }),
        tcp: cfg
            .proxy
            .tcp
            .iter()
            .map(|t| TcpForwardOptions {
                listen: t.listen.clone(),
                target: t.target.clone(),
            })
            .collect(),
        dial_timeout: cfg.dial_timeout,
        retry: cfg.retry,
    });

    let point_enabled = cfg.point.is_some();
    let proxy_enabled = !host.is_empty();
    if !point_enabled && !proxy_enabled {
        return Err(AppError::config(anyhow::anyhow!(
            "config: nothing to run (set a [point] section and/or [proxy] listeners)"
        )));
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        point_enabled,
        proxy_enabled,
        "overlan: starting"
    );

    // The network registry is process state shared with whatever bridges
    // frames switch-side; constructed here, never a global.
    let networks = Arc::new(NetworkStore::new(NETWORK_STORE_CAP));
    if let Some(path) = &cfg.networks_path {
        match networks.load(path).await {
            Ok(n) => tracing::info!(path = %path.display(), networks = n, "store: loaded"),
            Err(err) => tracing::warn!(path = %path.display(), err = %format!("{err:#}"), "store: load failed; starting empty"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<()> = JoinSet::new();

    if proxy_enabled {
        let host = Arc::new(host);
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { host.run(shutdown).await });
    }

    if let Some(pc) = &cfg.point {
        let (tap, device_name) = open_device(&pc.device)?;
        let point = Point::new(PointOptions {
            device_name,
            server_addr: pc.connect.clone(),
            mtu: pc.mtu,
            dial_timeout: cfg.dial_timeout,
            send_timeout: cfg.send_timeout,
            retry: cfg.retry,
        });
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { point.run(tap, shutdown).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        _ = tasks.join_next() => {
            tracing::warn!("shutdown: component exited");
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("overlan: stopped");
    Ok(())
}

fn open_device(name: &str) -> Result<(BoxedTap, String), AppError> {
    #[cfg(target_os = "linux")]
    {
        crate::point::device::open_tap(name)
            .map_err(|e| AppError::fatal(anyhow::anyhow!("create tap {name}: {e}")))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(AppError::config(anyhow::anyhow!(
            "the point role needs a linux TAP device (requested {name:?})"
        )))
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
