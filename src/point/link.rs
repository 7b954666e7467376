use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::frame::Frame;
use crate::sublog::SubLogger;
use crate::tunnel::client::{SendError, TunnelClient};

/// Read/write loops over the tunnel link, symmetric to `DeviceWorker`.
pub struct LinkWorker {
    log: SubLogger,
    client: Arc<TunnelClient>,
}

impl LinkWorker {
    pub fn new(client: Arc<TunnelClient>) -> Self {
        Self {
            log: SubLogger::new("link"),
            client,
        }
    }

    /// Consumes inbound frames from the tunnel and hands them to `egress`
    /// in arrival order. Exits when the link terminates.
    pub async fn read_loop(&self, egress: mpsc::Sender<Frame>) {
        loop {
            match self.client.recv().await {
                Some(frame) => {
                    if egress.send(frame).await.is_err() {
                        return;
                    }
                }
                None => {
                    self.log.debug("link terminated");
                    return;
                }
            }
        }
    }

    /// Forwards outbound frames into the tunnel. Frames refused while the
    /// link is down are counted by the client and reported by the point's
    /// stats loop; a terminated link ends the loop.
    pub async fn write_loop(
        &self,
        mut ingress: mpsc::Receiver<Frame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                next = ingress.recv() => match next {
                    Some(frame) => match self.client.send(&frame).await {
                        Ok(()) => {}
                        Err(SendError::Closed) => return,
                        Err(SendError::NotConnected) => {}
                        Err(SendError::Transport(err)) => {
                            self.log.debug(format!("frame lost to transport error: {err}"));
                        }
                    },
                    None => return,
                },
            }
        }
    }
}
