//! Server-side state and I/O for one accepted connection.

use std::{io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::{Dispatcher, Flow},
    protocol::{encode_lines, read_line},
    registry::SessionId,
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Serialized write side of a session.
///
/// Cloned into the registry so other sessions can push lines to this peer.
/// Every write takes the same lock, so a push and the session's own reply
/// never interleave within a line or a multi-line response.
#[derive(Clone)]
pub struct Outbox {
    writer: Arc<Mutex<BoxedWriter>>,
}

impl Outbox {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub async fn send_line(&self, line: &str) -> io::Result<()> {
        self.send_lines([line]).await
    }

    /// Writes all `lines` as one unit and flushes.
    pub async fn send_lines<I, S>(&self, lines: I) -> io::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let encoded = encode_lines(lines);
        if encoded.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    pub async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Running,
    Closed,
}

pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    handle: Option<String>,
    outbox: Outbox,
    phase: Phase,
}

impl Session {
    pub fn new(id: SessionId, peer: Option<SocketAddr>, outbox: Outbox) -> Self {
        Self {
            id,
            peer,
            handle: None,
            outbox,
            phase: Phase::Open,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Registered handle, `None` until `/register` succeeds.
    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    pub(crate) fn set_handle(&mut self, handle: String) {
        self.handle = Some(handle);
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Runs the read loop until end of stream, an I/O error, or `/leave`,
    /// then releases the handle and closes the connection.
    pub async fn run<R>(mut self, mut reader: R, dispatcher: &Dispatcher) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.phase = Phase::Running;
        let result = self.read_loop(&mut reader, dispatcher).await;
        self.close(dispatcher).await;
        result
    }

    async fn read_loop<R>(&mut self, reader: &mut R, dispatcher: &Dispatcher) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        while let Some(line) = read_line(reader).await? {
            debug!(session = self.id, %line, "command received");
            let reply = dispatcher.dispatch(self, &line).await;
            self.outbox.send_lines(&reply.lines).await?;
            if reply.flow == Flow::Close {
                break;
            }
        }
        Ok(())
    }

    async fn close(&mut self, dispatcher: &Dispatcher) {
        match self.handle.take() {
            Some(handle) => {
                dispatcher.registry().deregister(&handle, self.id).await;
                info!(peer = ?self.peer, %handle, "client disconnected");
            }
            None => info!(peer = ?self.peer, "unregistered client disconnected"),
        }

        if let Err(err) = self.outbox.close().await {
            warn!(peer = ?self.peer, error = ?err, "failed to close client connection cleanly");
        }
        self.phase = Phase::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn outbox_writes_lines_as_one_unit() {
        let (writer, reader) = tokio::io::duplex(256);
        let outbox = Outbox::new(writer);
        let mut reader = BufReader::new(reader);

        outbox
            .send_lines(["Server Directory", "a.txt", "b.txt"])
            .await
            .expect("send lines");
        outbox.close().await.expect("close");

        let mut lines = Vec::new();
        while let Some(line) = read_line(&mut reader).await.expect("read") {
            lines.push(line);
        }
        assert_eq!(lines, vec!["Server Directory", "a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn concurrent_pushes_do_not_interleave() {
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let outbox = Outbox::new(writer);

        let mut tasks = Vec::new();
        for sender in 0..8 {
            let outbox = outbox.clone();
            tasks.push(tokio::spawn(async move {
                for n in 0..25 {
                    let body = format!("{sender}-{n}-").repeat(20);
                    outbox.send_line(&body).await.expect("push");
                }
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }
        outbox.close().await.expect("close");

        let mut reader = BufReader::new(reader);
        let mut count = 0;
        while let Some(line) = read_line(&mut reader).await.expect("read") {
            let prefix = line.split('-').take(2).collect::<Vec<_>>().join("-");
            assert_eq!(line, format!("{prefix}-").repeat(20));
            count += 1;
        }
        assert_eq!(count, 200);
    }

    #[test]
    fn new_session_is_open_and_unregistered() {
        let (writer, _reader) = tokio::io::duplex(16);
        let session = Session::new(7, None, Outbox::new(writer));
        assert_eq!(session.phase(), Phase::Open);
        assert_eq!(session.handle(), None);
        assert_eq!(session.id(), 7);
    }
}
