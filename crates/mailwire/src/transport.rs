use crate::error::TransportError;
use crate::stuffing::remove_dot_stuffing;
use crate::traits::BoxedAsyncReadAndWrite;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);
pub const CRLF: &[u8] = b"\r\n";
pub const DATA_TERMINATOR: &[u8] = b"\r\n.\r\n";

const READ_CHUNK: usize = 4096;

/// A connected, line oriented byte stream.
///
/// Every individual read and write is bounded by `io_timeout`; the
/// deadline is re-armed for each underlying socket operation so that a
/// slow but steadily progressing peer is not cut off.
#[derive(Debug)]
pub struct Transport {
    stream: Option<BoxedAsyncReadAndWrite>,
    peer_address: SocketAddr,
    encrypted: bool,
    read_buffer: Vec<u8>,
    io_timeout: Duration,
}

impl Transport {
    pub fn new(stream: BoxedAsyncReadAndWrite, peer_address: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer_address,
            encrypted: false,
            read_buffer: Vec::with_capacity(READ_CHUNK),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Reads a single CRLF terminated line and returns it with
    /// surrounding whitespace removed.
    /// `max_len` counts the terminator; 0 means unbounded.
    pub async fn read_line(&mut self, max_len: usize) -> Result<String, TransportError> {
        let line = self.read_until(CRLF, max_len, false).await?;
        let line = String::from_utf8(line)?;
        let trimmed = line.trim();
        tracing::debug!("C: {trimmed}");
        Ok(trimmed.to_string())
    }

    /// Reads a dot terminated block following a DATA/RETR style
    /// exchange. The returned bytes have the terminating `.` line removed
    /// (the CRLF ending the final content line is kept) and are
    /// dot-unstuffed. A block consisting of only the terminating `.` line
    /// yields an empty payload.
    /// `max_len` counts every byte through the terminator; 0 means unbounded.
    pub async fn read_data(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let block = self.read_until(DATA_TERMINATOR, max_len, true).await?;
        tracing::debug!("C: <{} bytes of data>", block.len());
        Ok(remove_dot_stuffing(&block))
    }

    /// Locates `terminator` in the read buffer, searching from `scan_from`.
    /// Returns the payload length and the number of bytes making up the
    /// complete frame.
    fn locate(
        &self,
        terminator: &[u8],
        scan_from: usize,
        at_start: bool,
        allow_empty_block: bool,
    ) -> Option<(usize, usize)> {
        // The block may be empty, in which case the CRLF that leads the
        // terminator was consumed as part of the preceding command line
        if allow_empty_block && at_start && self.read_buffer.starts_with(&terminator[2..]) {
            return Some((0, terminator.len() - 2));
        }
        let start = scan_from.saturating_sub(terminator.len() - 1);
        memchr::memmem::find(&self.read_buffer[start..], terminator).map(|idx| {
            let end = start + idx;
            // The CRLF ending the last line is part of the payload of
            // a block, but not of a command line
            let payload_len = if allow_empty_block { end + 2 } else { end };
            (payload_len, end + terminator.len())
        })
    }

    async fn read_until(
        &mut self,
        terminator: &[u8],
        max_len: usize,
        allow_empty_block: bool,
    ) -> Result<Vec<u8>, TransportError> {
        let mut discarded = 0;
        let mut scan_from = 0;
        loop {
            if let Some((payload_len, frame_len)) = self.locate(
                terminator,
                scan_from,
                discarded == 0,
                allow_empty_block,
            ) {
                let mut frame: Vec<u8> = self.read_buffer.drain(0..frame_len).collect();
                if max_len > 0 && discarded + frame_len > max_len {
                    return Err(TransportError::SizeExceeded { limit: max_len });
                }
                frame.truncate(payload_len);
                return Ok(frame);
            }

            scan_from = self.read_buffer.len();
            if max_len > 0 && discarded + self.read_buffer.len() > max_len {
                // Too big already: throw away what we have, keeping enough
                // of the tail to recognize a terminator that straddles reads
                let keep = (terminator.len() - 1).min(self.read_buffer.len());
                let drop = self.read_buffer.len() - keep;
                self.read_buffer.drain(0..drop);
                discarded += drop;
                scan_from = self.read_buffer.len();
            }

            let mut data = [0u8; READ_CHUNK];
            let size = match self.stream.as_mut() {
                Some(s) => match timeout(self.io_timeout, s.read(&mut data)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(TransportError::Timeout {
                            duration: self.io_timeout,
                        })
                    }
                },
                None => return Err(TransportError::NotConnected),
            };
            if size == 0 {
                self.stream.take();
                return Err(TransportError::Disconnected);
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    /// Sends `line` followed by CRLF.
    pub async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        tracing::debug!("S: {line}");
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(CRLF);
        self.write_all(&data).await
    }

    /// Sends raw bytes with no framing applied.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let io_timeout = self.io_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        match timeout(io_timeout, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout {
                duration: io_timeout,
            }),
        }
    }

    /// Performs the server side of a TLS handshake over this transport
    /// and returns the encrypted replacement. Any bytes the peer sent
    /// ahead of the handshake are discarded.
    pub async fn upgrade(mut self, acceptor: &TlsAcceptor) -> Result<Transport, TransportError> {
        let stream = self.stream.take().ok_or(TransportError::NotConnected)?;
        if !self.read_buffer.is_empty() {
            tracing::debug!(
                "discarding {} bytes of plaintext pipelined ahead of TLS",
                self.read_buffer.len()
            );
        }
        let stream = match timeout(self.io_timeout, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(TransportError::Handshake(format!("{err:#}"))),
            Err(_) => {
                return Err(TransportError::Timeout {
                    duration: self.io_timeout,
                })
            }
        };

        let stream: BoxedAsyncReadAndWrite = Box::new(stream);
        Ok(Transport {
            stream: Some(stream),
            peer_address: self.peer_address,
            encrypted: true,
            read_buffer: Vec::with_capacity(READ_CHUNK),
            io_timeout: self.io_timeout,
        })
    }

    /// Flushes and closes the write side of the stream.
    pub async fn shutdown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = timeout(self.io_timeout, stream.shutdown()).await;
        }
    }
}
