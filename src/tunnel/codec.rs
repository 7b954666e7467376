use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{ETH_HDR_LEN, Frame, FrameError};

/// Header prefixed to every frame on the switch link: two magic bytes and a
/// big-endian payload length.
pub const FRAME_MAGIC: [u8; 2] = [0xff, 0xff];
pub const HDR_LEN: usize = 4;

/// A full Ethernet frame plus headroom for tunnel encapsulation overhead.
pub const MAX_FRAME_BYTES: usize = 1514 + 64;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("frame length {0} exceeds {MAX_FRAME_BYTES}")]
    Oversize(u16),
    #[error("frame length {0} below the ethernet header size")]
    Runt(u16),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for CodecError {
    fn from(err: FrameError) -> Self {
        let FrameError::Malformed(len) = err;
        CodecError::Runt(len as u16)
    }
}

/// Writes one frame: header, then payload.
pub async fn write_frame<W>(w: &mut W, frame: &Frame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let len = frame.len();
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::Oversize(len.min(u16::MAX as usize) as u16));
    }
    let len = len as u16;
    let hdr = [FRAME_MAGIC[0], FRAME_MAGIC[1], (len >> 8) as u8, len as u8];
    w.write_all(&hdr).await?;
    w.write_all(frame.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one frame. The header is validated before any payload byte is
/// consumed; a bad header means the peer is broken and the link should be
/// recycled.
pub async fn read_frame<R>(r: &mut R) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HDR_LEN];
    r.read_exact(&mut hdr).await?;

    if hdr[0..2] != FRAME_MAGIC {
        return Err(CodecError::BadMagic([hdr[0], hdr[1]]));
    }
    let len = u16::from_be_bytes([hdr[2], hdr[3]]);
    if len as usize > MAX_FRAME_BYTES {
        return Err(CodecError::Oversize(len));
    }
    if (len as usize) < ETH_HDR_LEN {
        return Err(CodecError::Runt(len));
    }

    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(Frame::try_from(buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let mut raw = vec![0u8; 60];
        raw[0..6].copy_from_slice(&[0xff; 6]);
        raw[6..12].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        raw[12] = 0x08;
        raw[13] = 0x06;
        Frame::copy_from(&raw).unwrap()
    }

    #[tokio::test]
    async fn frame_round_trips_bit_for_bit() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = sample_frame();

        let sent = frame.clone();
        let w = tokio::spawn(async move { write_frame(&mut a, &sent).await });
        let got = read_frame(&mut b).await.unwrap();
        w.await.unwrap().unwrap();

        assert_eq!(got, frame);
        assert_eq!(got.ethertype(), 0x0806);
    }

    #[tokio::test]
    async fn back_to_back_frames_stay_delimited() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        let f1 = sample_frame();
        let mut raw2 = sample_frame().as_bytes().to_vec();
        raw2.extend_from_slice(&[0xab; 100]);
        let f2 = Frame::copy_from(&raw2).unwrap();

        let (s1, s2) = (f1.clone(), f2.clone());
        tokio::spawn(async move {
            write_frame(&mut a, &s1).await.unwrap();
            write_frame(&mut a, &s2).await.unwrap();
        });

        assert_eq!(read_frame(&mut b).await.unwrap(), f1);
        assert_eq!(read_frame(&mut b).await.unwrap(), f2);
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(128);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            a.write_all(&[0xde, 0xad, 0x00, 0x20]).await.unwrap();
        });

        match read_frame(&mut b).await {
            Err(CodecError::BadMagic(m)) => assert_eq!(m, [0xde, 0xad]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_length_is_rejected_before_reading_the_payload() {
        let (mut a, mut b) = tokio::io::duplex(128);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let len = (MAX_FRAME_BYTES + 1) as u16;
            let hdr = [FRAME_MAGIC[0], FRAME_MAGIC[1], (len >> 8) as u8, len as u8];
            a.write_all(&hdr).await.unwrap();
            // no payload follows
        });

        match read_frame(&mut b).await {
            Err(CodecError::Oversize(n)) => assert!(n as usize > MAX_FRAME_BYTES),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn runt_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(128);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            a.write_all(&[FRAME_MAGIC[0], FRAME_MAGIC[1], 0x00, 0x05])
                .await
                .unwrap();
        });

        match read_frame(&mut b).await {
            Err(CodecError::Runt(5)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
