//! Peer-side connection that survives server restarts.
//!
//! The client holds at most one connection. A failed attempt waits a fixed
//! interval and tries again without limit; a connection that drops sends the
//! client back to connecting with the same target address.

use std::{future::Future, pin::Pin, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
    sync::mpsc,
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::protocol::{encode_lines, read_line};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

enum ServerPush {
    Line(String),
    Lost,
}

enum LinkEnd {
    Lost,
    Left,
    InputClosed,
    Shutdown,
}

pub struct Reconnector {
    target: String,
    retry_interval: Duration,
    state: LinkState,
}

impl Reconnector {
    pub fn new(target: impl Into<String>, retry_interval: Duration) -> Self {
        Self {
            target: target.into(),
            retry_interval,
            state: LinkState::Disconnected,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Forwards `input` lines to the server and prints server lines to
    /// `output` as `> line`, reconnecting whenever the link drops.
    ///
    /// Returns when `input` ends, when the server closes the connection after
    /// the user sent `/leave`, or when `shutdown` resolves.
    pub async fn run<I, O, F>(&mut self, input: I, mut output: O, shutdown: F) -> Result<()>
    where
        I: AsyncBufRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let (mut lines, input_task) = spawn_input_pump(input);
        let mut pending: Option<String> = None;

        let result = loop {
            let stream = match self.connect(&mut output, &mut shutdown).await? {
                Some(stream) => stream,
                None => break Ok(()),
            };
            let (reader, mut writer) = stream.into_split();
            let (mut pushes, reader_task) = spawn_read_loop(reader);

            let end = self
                .forward(
                    &mut lines,
                    &mut pushes,
                    &mut writer,
                    &mut output,
                    &mut pending,
                    &mut shutdown,
                )
                .await;
            reader_task.abort();
            self.state = LinkState::Disconnected;

            match end? {
                LinkEnd::Lost => {
                    warn!(server = %self.target, "connection to server lost");
                    print_status(&mut output, "Connection to server lost.").await?;
                }
                LinkEnd::Left => {
                    print_status(&mut output, "Disconnected from the server.").await?;
                    break Ok(());
                }
                LinkEnd::InputClosed | LinkEnd::Shutdown => {
                    if let Err(err) = writer.shutdown().await {
                        debug!(error = ?err, "failed to shutdown client writer cleanly");
                    }
                    print_status(&mut output, "Disconnected from the server.").await?;
                    break Ok(());
                }
            }
        };

        input_task.abort();
        result
    }

    /// Connects to the target, sleeping `retry_interval` between failures.
    /// Returns `None` if `shutdown` resolves first.
    async fn connect<O, F>(
        &mut self,
        output: &mut O,
        shutdown: &mut Pin<&mut F>,
    ) -> Result<Option<TcpStream>>
    where
        O: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        loop {
            self.state = LinkState::Connecting;
            let attempt = select! {
                _ = shutdown.as_mut() => return Ok(None),
                attempt = TcpStream::connect(self.target.as_str()) => attempt,
            };

            match attempt {
                Ok(stream) => {
                    self.state = LinkState::Connected;
                    info!(server = %self.target, "connected");
                    print_status(
                        output,
                        &format!("Connected to the server at {}", self.target),
                    )
                    .await?;
                    return Ok(Some(stream));
                }
                Err(err) => {
                    self.state = LinkState::Disconnected;
                    warn!(server = %self.target, error = ?err, "connection attempt failed");
                    print_status(
                        output,
                        &format!(
                            "Failed to connect to server, retrying in {} seconds...",
                            self.retry_interval.as_secs()
                        ),
                    )
                    .await?;
                    select! {
                        _ = shutdown.as_mut() => return Ok(None),
                        _ = sleep(self.retry_interval) => {}
                    }
                }
            }
        }
    }

    async fn forward<O, F>(
        &self,
        lines: &mut mpsc::Receiver<String>,
        pushes: &mut mpsc::Receiver<ServerPush>,
        writer: &mut OwnedWriteHalf,
        output: &mut O,
        pending: &mut Option<String>,
        shutdown: &mut Pin<&mut F>,
    ) -> Result<LinkEnd>
    where
        O: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let mut left = false;

        if let Some(line) = pending.take() {
            if let Err(err) = send_line(writer, &line).await {
                debug!(error = ?err, "resend after reconnect failed");
                *pending = Some(line);
                return Ok(LinkEnd::Lost);
            }
            left = is_leave(&line);
        }

        loop {
            select! {
                _ = shutdown.as_mut() => return Ok(LinkEnd::Shutdown),
                push = pushes.recv() => match push {
                    Some(ServerPush::Line(line)) => {
                        print_status(output, &format!("> {line}")).await?;
                    }
                    Some(ServerPush::Lost) | None => {
                        return Ok(if left { LinkEnd::Left } else { LinkEnd::Lost });
                    }
                },
                line = lines.recv() => match line {
                    Some(line) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Err(err) = send_line(writer, &line).await {
                            debug!(error = ?err, "send failed, keeping line for reconnect");
                            *pending = Some(line);
                            return Ok(LinkEnd::Lost);
                        }
                        left = left || is_leave(&line);
                    }
                    None => return Ok(LinkEnd::InputClosed),
                },
            }
        }
    }
}

fn is_leave(line: &str) -> bool {
    line.split_whitespace().next() == Some("/leave")
}

fn spawn_input_pump<I>(mut input: I) -> (mpsc::Receiver<String>, JoinHandle<()>)
where
    I: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(async move {
        loop {
            match read_line(&mut input).await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = ?err, "failed to read input");
                    break;
                }
            }
        }
    });
    (rx, task)
}

/// Reads server lines until end of stream or an error, then reports `Lost`.
fn spawn_read_loop(reader: OwnedReadHalf) -> (mpsc::Receiver<ServerPush>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(reader);
        loop {
            match read_line(&mut reader).await {
                Ok(Some(line)) => {
                    if tx.send(ServerPush::Line(line)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(error = ?err, "server read failed");
                    break;
                }
            }
        }
        let _ = tx.send(ServerPush::Lost).await;
    });
    (rx, task)
}

async fn send_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(&encode_lines([line])).await?;
    writer.flush().await
}

async fn print_status<O>(output: &mut O, line: &str) -> std::io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    output.write_all(&encode_lines([line])).await?;
    output.flush().await
}
