//! Ephemeral port reservation for the agent's listener.
//!
//! The port is discovered by binding to port 0 and reading back what the OS
//! assigned. The probe socket is closed before the number is handed out, so
//! another process can still grab the port before the agent binds it. When that
//! happens the transport reports [`TransportError::AgentUnreachable`] on connect.
//!
//! [`TransportError::AgentUnreachable`]: crate::error::TransportError::AgentUnreachable

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use tracing::debug;

/// Reserve an unused loopback TCP port.
pub fn allocate() -> io::Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
    let port = listener.local_addr()?.port();
    drop(listener);

    debug!(port, "Reserved ephemeral port for agent");
    Ok(port)
}
