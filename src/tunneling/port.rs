use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

use crate::config::PortRange;

use super::tunnel::TunnelError;

/// Returns the lowest port of `range` (inclusive) that can currently be bound.
///
/// The listener is dropped right away, so the port is only a hint: anything else may
/// grab it before the forwarding session binds it.
pub fn find_available_port(range: &PortRange) -> Result<u16, TunnelError> {
    if range.start > range.end {
        return Err(TunnelError::InvalidPortRange(*range));
    }
    (range.start..=range.end)
        .find(|port| is_port_available(*port))
        .ok_or(TunnelError::NoPortAvailable(*range))
}

fn is_port_available(port: u16) -> bool {
    match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
        Ok(_listener) => true,
        Err(e) => {
            debug!("port {port} is not available: {e}");
            false
        }
    }
}
