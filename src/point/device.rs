use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::frame::{ETH_HDR_LEN, Frame};
use crate::sublog::SubLogger;

/// The abstract TAP device: a byte stream of whole Ethernet frames.
///
/// Interface configuration (`ip link set up`, addressing) happens out of
/// band; the dataplane only reads and writes frames.
pub trait TapIo: AsyncRead + AsyncWrite {}
impl<T> TapIo for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedTap = Box<dyn TapIo + Unpin + Send>;

/// Read/write loops over the local TAP device.
///
/// The device is held exclusively by one worker pair for its lifetime;
/// closing it unblocks the in-flight read with EOF and the worker exits,
/// signaling the owning point to tear down.
pub struct DeviceWorker {
    log: SubLogger,
    mtu: usize,
}

impl DeviceWorker {
    pub fn new(device_name: &str, mtu: usize) -> Self {
        Self {
            log: SubLogger::new(format!("device/{device_name}")),
            mtu,
        }
    }

    /// Reads MTU-sized buffers from the TAP and hands each as a copied
    /// frame to `egress`, in read order.
    pub async fn read_loop<R>(
        &self,
        mut rd: R,
        egress: mpsc::Sender<Frame>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        R: AsyncRead + Unpin,
    {
        // Header plus MTU payload, with headroom for an 802.1Q tag.
        let mut buf = vec![0u8; ETH_HDR_LEN + self.mtu + 4];
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                res = rd.read(&mut buf) => match res {
                    Ok(0) => {
                        self.log.info("device closed");
                        return;
                    }
                    Ok(n) => match Frame::copy_from(&buf[..n]) {
                        Ok(frame) => {
                            if egress.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => self.log.debug(format!("discarding device read: {err}")),
                    },
                    Err(err) => {
                        self.log.warn(format!("device read failed: {err}"));
                        return;
                    }
                },
            }
        }
    }

    /// Writes frames to the TAP in arrival order; partial writes are
    /// completed before the next frame.
    pub async fn write_loop<W>(
        &self,
        mut wr: W,
        mut ingress: mpsc::Receiver<Frame>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                next = ingress.recv() => match next {
                    Some(frame) => {
                        if let Err(err) = wr.write_all(frame.as_bytes()).await {
                            self.log.warn(format!("device write failed: {err}"));
                            return;
                        }
                    }
                    None => return,
                },
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::open_tap;

/// Linux TAP creation via the `/dev/net/tun` clone device.
#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::os::fd::{AsRawFd, RawFd};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::unix::AsyncFd;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    use super::BoxedTap;

    const TUN_CLONE: &[u8] = b"/dev/net/tun\0";
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

    #[repr(C)]
    struct IfReq {
        name: [u8; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    struct TapFd(RawFd);

    impl AsRawFd for TapFd {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    impl Drop for TapFd {
        fn drop(&mut self) {
            unsafe { libc::close(self.0) };
        }
    }

    impl TapFd {
        fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            match unsafe { libc::read(self.0, buf.as_mut_ptr() as _, buf.len()) } {
                -1 => Err(io::Error::last_os_error()),
                n => Ok(n as usize),
            }
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            match unsafe { libc::write(self.0, buf.as_ptr() as _, buf.len()) } {
                -1 => Err(io::Error::last_os_error()),
                n => Ok(n as usize),
            }
        }
    }

    struct Tap {
        fd: AsyncFd<TapFd>,
    }

    impl AsyncRead for Tap {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            loop {
                let mut guard = std::task::ready!(self.fd.poll_read_ready(cx))?;
                match guard.try_io(|inner| inner.get_ref().read(buf.initialize_unfilled())) {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(err)) => return Poll::Ready(Err(err)),
                    Err(_would_block) => continue,
                }
            }
        }
    }

    impl AsyncWrite for Tap {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            loop {
                let mut guard = std::task::ready!(self.fd.poll_write_ready(cx))?;
                match guard.try_io(|inner| inner.get_ref().write(buf)) {
                    Ok(res) => return Poll::Ready(res),
                    Err(_would_block) => continue,
                }
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Creates a TAP interface (no packet-info header) and returns the
    /// device plus the name the kernel settled on (`name` may be a pattern
    /// such as `tap%d`).
    pub fn open_tap(name: &str) -> io::Result<(BoxedTap, String)> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }

        let fd = match unsafe {
            libc::open(
                TUN_CLONE.as_ptr() as _,
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        } {
            -1 => return Err(io::Error::last_os_error()),
            fd => TapFd(fd),
        };

        let mut ifr = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0; 22],
        };
        ifr.name[..name.len()].copy_from_slice(name.as_bytes());

        if unsafe { libc::ioctl(fd.0, TUNSETIFF as _, &ifr) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let end = ifr.name.iter().position(|b| *b == 0).unwrap_or(0);
        let actual = String::from_utf8_lossy(&ifr.name[..end]).into_owned();

        let tap = Tap {
            fd: AsyncFd::new(fd)?,
        };
        Ok((Box::new(tap), actual))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn read_loop_frames_device_bytes_and_skips_runts() {
        let (tap, mut side) = tokio::io::duplex(4096);
        let (rd, _wr) = tokio::io::split(tap);
        let worker = DeviceWorker::new("tap-test", 1500);
        let (tx, mut rx) = mpsc::channel(8);
        let (_halt_tx, halt_rx) = watch::channel(false);

        let task = tokio::spawn(async move { worker.read_loop(rd, tx, halt_rx).await });

        side.write_all(&[0u8; 5]).await.unwrap(); // runt, skipped
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut raw = vec![0u8; 42];
        raw[12] = 0x08;
        side.write_all(&raw).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.as_bytes(), &raw[..]);
        assert_eq!(frame.ethertype(), 0x0800);

        // EOF from the device ends the loop.
        drop(side);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("read loop must exit on EOF")
            .unwrap();
    }

    #[tokio::test]
    async fn write_loop_preserves_order_and_bytes() {
        let (tap, mut side) = tokio::io::duplex(4096);
        let (_rd, wr) = tokio::io::split(tap);
        let worker = DeviceWorker::new("tap-test", 1500);
        let (tx, rx) = mpsc::channel(8);
        let (_halt_tx, halt_rx) = watch::channel(false);

        tokio::spawn(async move { worker.write_loop(wr, rx, halt_rx).await });

        let mut expect = Vec::new();
        for tag in 1..=3u8 {
            let mut raw = vec![0u8; 20];
            raw[15] = tag;
            expect.extend_from_slice(&raw);
            tx.send(Frame::copy_from(&raw).unwrap()).await.unwrap();
        }

        let mut got = vec![0u8; expect.len()];
        side.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expect);
    }
}
