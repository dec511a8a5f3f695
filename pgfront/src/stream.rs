//! Buffered transport of typed protocol fields.
//!
//! Messages of the older protocol generations are not length prefixed, a message is
//! only known to be complete after each of its fields is read. Thus, instead of
//! decoding whole frames, [`PgStream`] hands out individual fields.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    common::verbose,
    ext::BufMutExt,
    postgres::version::ByteOrder,
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Buffered connection to postgres.
///
/// Once any read or write fails, the error is latched and every later call fails
/// with the same [`io::ErrorKind`] without touching the socket.
pub struct PgStream<S> {
    socket: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    order: ByteOrder,
    broken: Option<io::ErrorKind>,
}

impl<S> PgStream<S> {
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            order: ByteOrder::Network,
            broken: None,
        }
    }

    /// Byte order used by integer fields.
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    pub fn set_byte_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    /// Buffer a single byte.
    pub fn put_u8(&mut self, value: u8) {
        self.write_buf.put_u8(value);
    }

    /// Buffer an integer in the stream byte order.
    pub fn put_i32(&mut self, value: i32) {
        match self.order {
            ByteOrder::Network => self.write_buf.put_i32(value),
            ByteOrder::Reversed => self.write_buf.put_i32_le(value),
        }
    }

    /// Buffer a string followed by nul.
    pub fn put_nul_string(&mut self, value: &str) {
        self.write_buf.put_nul_string(value);
    }

    /// Buffer raw bytes.
    pub fn put_slice(&mut self, value: &[u8]) {
        self.write_buf.put_slice(value);
    }

    fn check(&self) -> io::Result<()> {
        match self.broken {
            Some(kind) => Err(io::Error::new(kind, "connection is already broken")),
            None => Ok(()),
        }
    }

    fn latch(&mut self, err: io::Error) -> io::Error {
        verbose!("transport broken: {err}");
        self.broken = Some(err.kind());
        err
    }
}

impl<S> PgStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Write all buffered fields to the socket.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        if let Err(err) = self.socket.write_all_buf(&mut self.write_buf).await {
            return Err(self.latch(err));
        }
        if let Err(err) = self.socket.flush().await {
            return Err(self.latch(err));
        }
        Ok(())
    }

    /// Shutdown the write half, any buffered fields are flushed first.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.socket.shutdown().await
    }

    /// Read from socket until at least `len` bytes are buffered.
    async fn fill(&mut self, len: usize) -> io::Result<()> {
        self.check()?;
        while self.read_buf.len() < len {
            self.read_buf.reserve(len.max(DEFAULT_BUF_CAPACITY));
            match self.socket.read_buf(&mut self.read_buf).await {
                Ok(0) => return Err(self.latch(io::ErrorKind::UnexpectedEof.into())),
                Ok(_) => {}
                Err(err) => return Err(self.latch(err)),
            }
        }
        Ok(())
    }

    pub async fn get_u8(&mut self) -> io::Result<u8> {
        self.fill(1).await?;
        Ok(self.read_buf.get_u8())
    }

    /// Read an integer in the stream byte order.
    pub async fn get_i16(&mut self) -> io::Result<i16> {
        self.fill(2).await?;
        Ok(match self.order {
            ByteOrder::Network => self.read_buf.get_i16(),
            ByteOrder::Reversed => self.read_buf.get_i16_le(),
        })
    }

    /// Read an integer in the stream byte order.
    pub async fn get_i32(&mut self) -> io::Result<i32> {
        self.fill(4).await?;
        Ok(match self.order {
            ByteOrder::Network => self.read_buf.get_i32(),
            ByteOrder::Reversed => self.read_buf.get_i32_le(),
        })
    }

    /// Read exactly `len` raw bytes.
    pub async fn get_bytes(&mut self, len: usize) -> io::Result<Bytes> {
        self.fill(len).await?;
        Ok(self.read_buf.split_to(len).freeze())
    }

    /// Read a nul terminated string, the nul is consumed but not returned.
    ///
    /// Server messages are not guaranteed to be utf8, invalid sequences are replaced.
    pub async fn get_string(&mut self) -> io::Result<String> {
        self.get_until(b'\0').await
    }

    /// Read a line of copy data, the newline is consumed but not returned.
    pub async fn get_line(&mut self) -> io::Result<String> {
        self.get_until(b'\n').await
    }

    async fn get_until(&mut self, delim: u8) -> io::Result<String> {
        let mut scanned = 0;
        loop {
            if let Some(end) = self.read_buf[scanned..].iter().position(|&b| b == delim) {
                let string = self.read_buf.split_to(scanned + end);
                self.read_buf.advance(1);
                return Ok(String::from_utf8_lossy(&string).into_owned());
            }
            scanned = self.read_buf.len();
            self.fill(scanned + 1).await?;
        }
    }
}

impl<S> std::fmt::Debug for PgStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStream")
            .field("order", &self.order)
            .field("buffered", &self.read_buf.len())
            .field("pending", &self.write_buf.len())
            .field("broken", &self.broken)
            .finish()
    }
}
