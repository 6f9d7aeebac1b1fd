//! TCP server for BERT-RPC connections.
//!
//! Accepts connections and runs one independent `Connection` task per
//! socket. Every task shares the same read-only dispatch table and nothing
//! else.

use crate::config::Config;
use crate::connection::Connection;
use crate::dispatch::DispatchTable;
use crate::frame::FrameError;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Server instance
pub struct Server {
    config: Config,
    table: Arc<DispatchTable>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance.
    ///
    /// Takes ownership of the dispatch table; from here on it is only
    /// ever lent out read-only.
    pub fn new(config: Config, table: DispatchTable) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            table: Arc::new(table),
            connection_limit,
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let addr = resolve(&self.config.host, self.config.port)?;
        let listener = create_listener(addr, self.config.backlog)?;
        TcpListener::from_std(listener)
    }

    /// Bind and serve until a fatal accept-loop error.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(address = %listener.local_addr()?, "Server listening");

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let table = Arc::clone(&self.table);
                    let max_frame_size = self.config.max_frame_size;
                    let span = info_span!("connection", peer = %addr);

                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_connection(stream, table, max_frame_size).await {
                                warn!(error = %e, "Connection terminated");
                            }
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// The shared dispatch table
    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    table: Arc<DispatchTable>,
    max_frame_size: usize,
) -> Result<(), FrameError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    Connection::new(reader, writer, table, max_frame_size)
        .run()
        .await
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for {host}:{port}"),
        )
    })
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
