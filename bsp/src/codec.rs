//! `Content-Length` framing for BSP messages.
//!
//! BSP reuses the LSP base protocol: every JSON body is preceded by a
//! header block terminated by an empty line,
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"result":{"displayName":"x"}}
//! ```

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single body; larger frames are rejected before allocation.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// Pull the body length out of one header line, if it is `Content-Length`.
fn content_length_of(line: &str) -> Result<Option<usize>> {
    let Some((name, value)) = line.split_once(':') else {
        return Ok(None);
    };
    if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }
    let len = value
        .trim()
        .parse::<usize>()
        .with_context(|| format!("invalid Content-Length value {:?}", value.trim()))?;
    Ok(Some(len))
}

/// Decodes framed JSON bodies from a build server's stdout.
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

    /// Next decoded body, or `Ok(None)` on EOF at a frame boundary.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(len) = self.read_header_block().await? else {
            return Ok(None);
        };
        if len > MAX_FRAME_BYTES {
            bail!("frame of {len} bytes exceeds limit of {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .await
            .with_context(|| format!("reading {len}-byte frame body"))?;
        let value = serde_json::from_slice(&body).context("decoding frame body as JSON")?;
        Ok(Some(value))
    }

    async fn read_header_block(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut header_lines = 0usize;

        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .await
                .context("reading frame header")?;
            if n == 0 {
                if header_lines == 0 {
                    return Ok(None);
                }
                bail!("stream ended inside a header block");
            }
            header_lines += 1;

            let line = self.line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(len) = content_length_of(line)? {
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .context("header block has no Content-Length")
    }
}

/// Encodes JSON bodies onto a build server's stdin.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, body: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(body).context("encoding frame body")?;
        let mut frame = format!("{CONTENT_LENGTH}: {}\r\n\r\n", bytes.len()).into_bytes();
        frame.extend_from_slice(&bytes);

        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }
}
