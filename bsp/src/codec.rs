//! JSON-RPC framing codec for build-server connections.
//!
//! Messages travel as `Content-Length: N\r\n\r\n{json}` over the client
//! transport. [`FrameReader`] yields decoded [`Frame`]s; [`FrameWriter`]
//! frames outgoing JSON values.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::frame::Frame;

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Longest header line accepted, terminator included.
pub const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

/// Parse one header line. Returns the length for a `Content-Length` header,
/// `None` for any other header.
fn parse_header_line(line: &str) -> Result<Option<usize>> {
    let Some((key, value)) = line.split_once(':') else {
        bail!("malformed header line: {line:?}");
    };
    if !key.trim().eq_ignore_ascii_case("Content-Length") {
        return Ok(None);
    }
    let len = value
        .trim()
        .parse()
        .with_context(|| format!("invalid Content-Length value {:?}", value.trim()))?;
    Ok(Some(len))
}

/// Reads framed messages from the read half of a client transport.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read and classify the next frame.
    ///
    /// `Ok(None)` means the client closed the stream between frames.
    /// Truncated headers or bodies, oversized frames, and bodies that are not
    /// JSON-RPC messages are errors.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some(value) = self.read_value().await? else {
            return Ok(None);
        };
        let frame = Frame::from_value(value).context("classifying frame")?;
        Ok(Some(frame))
    }

    /// Read the next raw JSON body without classifying it.
    pub async fn read_value(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            bail!("Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;

        let value = serde_json::from_slice(&body).context("parsing frame body")?;
        Ok(Some(value))
    }

    async fn read_headers(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut first_line = true;

        loop {
            self.line.clear();
            let bytes_read = (&mut self.reader)
                .take(MAX_HEADER_LINE_BYTES as u64)
                .read_line(&mut self.line)
                .await
                .context("reading header line")?;
            if bytes_read == MAX_HEADER_LINE_BYTES && !self.line.ends_with('\n') {
                bail!("header line exceeds {MAX_HEADER_LINE_BYTES} bytes");
            }

            if bytes_read == 0 {
                // Clean EOF only counts before the first header byte.
                if first_line {
                    return Ok(None);
                }
                bail!("unexpected EOF while reading headers");
            }
            first_line = false;

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                break;
            }
            if let Some(len) = parse_header_line(trimmed)? {
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .context("missing Content-Length header")
    }
}

/// Writes framed JSON values to the write half of a client transport.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one message with its `Content-Length` header and flush.
    pub async fn write_value(&mut self, msg: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(msg).context("serializing frame")?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .context("writing frame header")?;
        self.writer
            .write_all(&body)
            .await
            .context("writing frame body")?;
        self.writer.flush().await.context("flushing frame")?;

        Ok(())
    }

    /// Shut down the underlying stream. Errors are reported, not retried.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer
            .shutdown()
            .await
            .context("shutting down transport")
    }
}
