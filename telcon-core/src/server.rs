//! Single-connection acceptor.
//!
//! An [`Acceptor`] binds one listening socket with a backlog of 1, accepts
//! exactly one peer, runs a [`Console`] session on it and then closes both
//! the connection and the listener. Serving another client means building
//! another acceptor.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::TelconError;
use crate::session::{Console, SessionReport};

/// Pending connections queued by the kernel; one session at a time.
pub const LISTEN_BACKLOG: i32 = 1;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 3333;

pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Create, bind and listen. `SO_REUSEADDR` is set so a restarted server
    /// can rebind while the previous connection sits in `TIME_WAIT`. IPv6
    /// sockets are IPv6-only, leaving the IPv4 side of the port to an
    /// `0.0.0.0` acceptor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<Self, TelconError> {
        let bind_err = |source| TelconError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true).map_err(bind_err)?;
        }
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        info!("socket created");

        socket.bind(&addr.into()).map_err(bind_err)?;
        info!("socket bound, port {}", addr.port());

        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|source| TelconError::Listen { addr, source })?;
        let listener = TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;
        info!("socket listening on {local_addr}");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for one peer, serve it, then close everything.
    pub async fn serve_one(self, console: &Console) -> Result<SessionReport, TelconError> {
        let (stream, peer) = self.listener.accept().await.map_err(|e| {
            error!("unable to accept connection: {e}");
            TelconError::Accept(e)
        })?;
        info!("socket accepted ip address: {}", peer.ip());

        // The listener is closed for the duration of the session.
        drop(self.listener);

        if let Err(e) = stream.set_nodelay(true) {
            error!("unable to set TCP_NODELAY: {e}");
        }

        console.serve(stream).await
    }
}

/// Bind `addr` and serve a single session on it. Setup failures are logged
/// and returned; the caller decides whether to try again.
pub async fn serve_once(addr: SocketAddr, console: &Console) -> Result<SessionReport, TelconError> {
    let acceptor = Acceptor::bind(addr).inspect_err(|e| error!("{e}"))?;
    acceptor.serve_one(console).await
}

// ── Tests ────────────────────────────────────────────────────────
