//! Framed wire connection

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{MsgHeader, RawOp, HEADER_LEN};
use crate::Result;

/// Initial read buffer size
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// One live connection speaking whole wire frames.
///
/// `recv` is cancel-safe: bytes read before a timeout or cancellation stay
/// buffered and the next call resumes the same frame.
pub struct WireConnection<S> {
    stream: S,
    read_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WireConnection<S> {
    /// Wrap a byte stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Write one frame and flush it
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub async fn send(&mut self, op: &RawOp) -> io::Result<()> {
        self.stream.write_all(op.as_bytes()).await?;
        self.stream.flush().await
    }

    /// Read the next complete frame
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the peer closes the connection, or an invalid
    /// frame error if the peer sends garbage
    pub async fn recv(&mut self) -> Result<RawOp> {
        loop {
            if let Some(op) = self.parse_frame()? {
                return Ok(op);
            }

            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )
                .into());
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<RawOp>> {
        if self.read_buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = MsgHeader::parse(&self.read_buf[..HEADER_LEN])?.frame_len()?;
        if self.read_buf.len() < len {
            self.read_buf.reserve(len - self.read_buf.len());
            return Ok(None);
        }

        let frame = self.read_buf.split_to(len).freeze();
        RawOp::from_bytes(frame).map(Some)
    }

    /// Close the write half
    ///
    /// # Errors
    ///
    /// Returns error if shutdown fails
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::build;
    use crate::ReplayError;

    #[tokio::test]
    async fn test_frames_cross_a_pipe() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = WireConnection::new(a);
        let mut right = WireConnection::new(b);

        let first = build::get_more(1, "mongotape.test", 5, 42).unwrap();
        let second = build::kill_cursors(2, &[42]).unwrap();

        let writer = tokio::spawn(async move {
            left.send(&first).await.unwrap();
            left.send(&second).await.unwrap();
            left
        });

        assert_eq!(right.recv().await.unwrap().header().request_id, 1);
        assert_eq!(right.recv().await.unwrap().cursor_ids().unwrap(), vec![42]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_resumes_after_timeout() {
        let (a, b) = tokio::io::duplex(1024);
        let mut raw = a;
        let mut conn = WireConnection::new(b);

        let op = build::get_more(7, "mongotape.test", 5, 42).unwrap();
        let bytes = op.as_bytes().clone();
        raw.write_all(&bytes[..10]).await.unwrap();

        let early = tokio::time::timeout(std::time::Duration::from_millis(20), conn.recv()).await;
        assert!(early.is_err());

        raw.write_all(&bytes[10..]).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), op);
    }

    #[tokio::test]
    async fn test_eof_is_io_error() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut conn = WireConnection::new(b);
        assert!(matches!(conn.recv().await, Err(ReplayError::Io(_))));
    }
}
