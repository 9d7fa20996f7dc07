use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    dispatcher::Dispatcher,
    registry::Registry,
    session::{Outbox, Session},
    store::FileStore,
};

pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    pub fn new(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            listener,
            dispatcher,
        }
    }

    /// Binds `addr` and wires a fresh registry to `store`.
    pub async fn bind<A>(addr: A, store: FileStore) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind listening socket")?;
        let dispatcher = Dispatcher::new(Arc::new(Registry::new()), Arc::new(store));
        Ok(Self::new(listener, Arc::new(dispatcher)))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Accepts connections until `shutdown` resolves, then drops the
    /// listening socket. Sessions already running are left to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            dispatcher,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server stopped");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &dispatcher);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// Runs the accept loop in the background.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let dispatcher = Arc::clone(&self.dispatcher);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async move {
            let _ = stop_rx.await;
        }));
        Ok(ServerHandle {
            addr,
            dispatcher,
            stop_tx,
            task,
        })
    }
}

/// Background server started with [`Server::spawn`].
pub struct ServerHandle {
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Closes the listening socket and waits for the accept loop to exit.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(());
        self.task.await.context("accept loop panicked")?
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    dispatcher: &Arc<Dispatcher>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, dispatcher),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, dispatcher: &Arc<Dispatcher>) {
    let dispatcher = Arc::clone(dispatcher);
    tokio::spawn(async move {
        info!(%peer, "client connected");
        let (reader, writer) = stream.into_split();
        let session = Session::new(
            dispatcher.registry().next_id(),
            Some(peer),
            Outbox::new(writer),
        );
        if let Err(err) = session.run(BufReader::new(reader), &dispatcher).await {
            warn!(%peer, error = ?err, "client connection closed with error");
        }
    });
}
