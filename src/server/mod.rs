//! Connection manager for client sockets
//!
//! Multiplexes the listening socket and every client connection on one mio
//! `Poll`. All work happens on the caller's thread; each call to
//! [`Server::service`] touches every ready connection at most once.

pub mod connection;

use anyhow::{Context, Result};
use connection::Connection;
use jw_ipc::Response;
use mio::net::UnixListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER: Token = Token(0);

pub struct Server {
    poll: Poll,
    events: Events,
    listener: UnixListener,
    socket_path: PathBuf,
    connections: BTreeMap<Token, Connection>,
    next_token: usize,
    max_clients: usize,
    max_frame: usize,
    /// Connections may be waiting in the listen backlog
    accept_pending: bool,
}

impl Server {
    /// Bind the listening socket, replacing a stale socket file if present
    pub fn bind(socket_path: &Path, max_clients: usize, max_frame: usize) -> Result<Self> {
        // Remove existing socket if present
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
        }

        // Create parent directory if needed
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
        }

        let mut listener = UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind {:?}", socket_path))?;
        let poll = Poll::new().context("Failed to create mio Poll")?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("Failed to register listening socket")?;

        info!("IPC server listening on {:?}", socket_path);

        Ok(Self {
            poll,
            events: Events::with_capacity(64),
            listener,
            socket_path: socket_path.to_path_buf(),
            connections: BTreeMap::new(),
            next_token: 1,
            max_clients,
            max_frame,
            accept_pending: false,
        })
    }

    #[cfg(test)]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn can_accept(&self) -> bool {
        self.accept_pending && self.connections.len() < self.max_clients
    }

    /// Wait for readiness for at most `timeout`.
    ///
    /// Returns immediately when work is already buffered, so a connection
    /// holding several queued requests is not delayed by the timeout.
    pub fn poll(&mut self, timeout: Duration) -> std::io::Result<()> {
        let busy = self.can_accept() || self.connections.values().any(Connection::has_work);
        let timeout = if busy { Duration::ZERO } else { timeout };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            if event.token() == LISTENER {
                self.accept_pending = true;
                continue;
            }
            if let Some(conn) = self.connections.get_mut(&event.token()) {
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    conn.mark_readable();
                }
                if event.is_writable() {
                    conn.mark_writable();
                }
            }
        }
        Ok(())
    }

    /// Accept pending connections while below the client cap.
    ///
    /// At the cap, connections stay queued in the listen backlog and are
    /// picked up once a slot frees.
    pub fn accept(&mut self) {
        while self.can_accept() {
            match self.listener.accept() {
                Ok((mut stream, _)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!("Failed to register connection: {}", e);
                        continue;
                    }
                    let mut conn = Connection::new(token.0, stream, self.max_frame);
                    // Data may have arrived before registration
                    conn.mark_readable();
                    self.connections.insert(token, conn);
                    info!(
                        "Client {} connected ({}/{})",
                        token.0,
                        self.connections.len(),
                        self.max_clients
                    );
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.accept_pending = false;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Accept error: {}", e);
                    self.accept_pending = false;
                }
            }
        }
        if self.accept_pending && self.connections.len() >= self.max_clients {
            debug!("Client limit {} reached, deferring accept", self.max_clients);
        }
    }

    /// Give every connection with pending work one service step
    pub fn service<F>(&mut self, mut handler: F)
    where
        F: FnMut(&[u8]) -> Response,
    {
        let ready: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.has_work())
            .map(|(token, _)| *token)
            .collect();

        for token in ready {
            let Some(conn) = self.connections.get_mut(&token) else {
                continue;
            };
            if let Err(reason) = conn.service(&mut handler) {
                self.close(token, &reason);
            }
        }
    }

    fn close(&mut self, token: Token, reason: &connection::CloseReason) {
        if let Some(mut conn) = self.connections.remove(&token) {
            if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
                debug!("Failed to deregister client {}: {}", conn.id, e);
            }
            info!("Client {} disconnected: {}", conn.id, reason);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove socket {:?}: {}", self.socket_path, e);
            }
        }
    }
}
