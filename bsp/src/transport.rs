//! Stdio transport — owns the build-server subprocess and its pipes.
//!
//! Three tasks per connection: a writer draining the engine's outbound
//! queue onto stdin, a listener decoding stdout into the engine via an
//! [`InboundSink`], and a stderr forwarder feeding `tracing`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::discovery::ConnectionDescriptor;
use crate::engine::InboundSink;

const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

pub(crate) struct StdioTransport {
    server: String,
    child: Child,
    writer_handle: JoinHandle<()>,
    listener_handle: JoinHandle<()>,
    stderr_handle: Option<JoinHandle<()>>,
}

impl StdioTransport {
    pub fn spawn(
        descriptor: &ConnectionDescriptor,
        project_root: &Path,
        outbound: mpsc::UnboundedReceiver<serde_json::Value>,
        sink: InboundSink,
    ) -> Result<Self> {
        let (program, args) = descriptor
            .command()
            .with_context(|| format!("connection file for '{}' has an empty argv", descriptor.name))?;
        // Relative programs resolve against the project root, like the
        // server's own working directory.
        let resolved = which::which_in(program, std::env::var_os("PATH"), project_root)
            .with_context(|| format!("{program} not found in PATH"))?;

        let mut cmd = Command::new(&resolved);
        cmd.args(args)
            .current_dir(project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", resolved.display()))?;

        let stdin = child.stdin.take().context("no stdin from build server")?;
        let stdout = child.stdout.take().context("no stdout from build server")?;
        let server = descriptor.name.clone();

        let writer_handle = tokio::spawn(write_frames(stdin, outbound, sink.clone(), server.clone()));
        let listener_handle = tokio::spawn(listen(stdout, sink, server.clone()));
        let stderr_handle = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_stderr(stderr, server.clone())));

        Ok(Self {
            server,
            child,
            writer_handle,
            listener_handle,
            stderr_handle,
        })
    }

    /// Wait briefly for the server to exit on its own, then kill it.
    ///
    /// The engine drops its outbound sender first, so the writer closes
    /// stdin and a well-behaved server sees EOF.
    pub async fn shutdown(mut self) {
        let grace = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        let _ = tokio::time::timeout(grace, &mut self.writer_handle).await;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server, %status, "BSP server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.server, "Waiting for BSP server failed: {e}");
            }
            Err(_) => {
                tracing::debug!("BSP server '{}' didn't exit in time, killing", self.server);
                let _ = self.child.kill().await;
            }
        }

        self.writer_handle.abort();
        self.listener_handle.abort();
        if let Some(handle) = self.stderr_handle.take() {
            handle.abort();
        }
    }
}

async fn write_frames<W>(
    stdin: W,
    mut outbound: mpsc::UnboundedReceiver<serde_json::Value>,
    sink: InboundSink,
    server: String,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(stdin);
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_frame(&frame).await {
            tracing::warn!("BSP write error for '{server}': {e:#}");
            sink.close(format!("write to build server failed: {e:#}"))
                .await;
            return;
        }
    }
    tracing::trace!("BSP writer for '{server}' finished");
}

/// Decode frames until EOF or error and hand them to the engine.
///
/// A body that fails to decode ends the stream: framing can no longer be
/// trusted past it.
async fn listen<R>(stdout: R, sink: InboundSink, server: String)
where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(stdout);
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                if !sink.deliver_inbound(vec![frame]).await {
                    tracing::trace!("BSP engine for '{server}' gone; listener exiting");
                    return;
                }
            }
            Ok(None) => {
                tracing::info!("BSP server '{server}' closed stdout");
                sink.close("build server closed its output").await;
                return;
            }
            Err(e) => {
                tracing::warn!("BSP reader error for '{server}': {e:#}");
                sink.close(format!("read from build server failed: {e:#}"))
                    .await;
                return;
            }
        }
    }
}

async fn forward_stderr<R>(stderr: R, server: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(server = %server, "{line}"),
            Ok(None) => return,
            Err(e) => {
                tracing::trace!("BSP stderr for '{server}' unreadable: {e}");
                return;
            }
        }
    }
}
