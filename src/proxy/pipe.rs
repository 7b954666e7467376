use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::barrier::Barrier;

/// Splices two streams together until both directions are done.
///
/// Each direction runs as its own copy task; on EOF (or error) it
/// half-closes its destination so the opposite copy sees EOF too, then
/// signals the barrier. Returns `(a_to_b, b_to_a)` byte counts once the
/// barrier releases; both streams are dropped, so no socket outlives the
/// pipe.
pub async fn splice<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let barrier = Arc::new(Barrier::new(2));
    let up = Arc::new(AtomicU64::new(0));
    let down = Arc::new(AtomicU64::new(0));

    {
        let barrier = barrier.clone();
        let up = up.clone();
        tokio::spawn(async move {
            if let Ok(n) = tokio::io::copy(&mut ar, &mut bw).await {
                up.store(n, Ordering::Relaxed);
            }
            let _ = bw.shutdown().await;
            barrier.done();
        });
    }
    {
        let barrier = barrier.clone();
        let down = down.clone();
        tokio::spawn(async move {
            if let Ok(n) = tokio::io::copy(&mut br, &mut aw).await {
                down.store(n, Ordering::Relaxed);
            }
            let _ = aw.shutdown().await;
            barrier.done();
        });
    }

    barrier.wait().await;
    (up.load(Ordering::Relaxed), down.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    #[tokio::test]
    async fn bytes_cross_both_ways_and_eof_propagates() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        // Echo peer on the b side.
        let echo = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = s.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                s.write_all(&buf[..n]).await.unwrap();
            }
        });

        let (client_a, pipe_a) = tokio::io::duplex(1024);
        let pipe_b = TcpStream::connect(addr).await.unwrap();
        let pipe = tokio::spawn(splice(pipe_a, pipe_b));

        let (mut crd, mut cwr) = tokio::io::split(client_a);
        cwr.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        crd.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        // Closing the client side unwinds the whole pipe.
        cwr.shutdown().await.unwrap();
        drop(cwr);
        drop(crd);

        let (up, down) = tokio::time::timeout(std::time::Duration::from_secs(1), pipe)
            .await
            .expect("pipe must finish after close")
            .unwrap();
        assert_eq!(up, 5);
        assert_eq!(down, 5);
        echo.await.unwrap();
    }
}
