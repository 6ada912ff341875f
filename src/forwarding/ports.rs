//! Ephemeral local port allocation

use std::net::{IpAddr, TcpListener};

use crate::error::PortalError;

/// Ask the OS for a free TCP port on `bind_address`
///
/// The probe socket is closed before returning, so the caller must bind the
/// port promptly; a concurrent binder can still win the race.
pub fn allocate_ephemeral_port(bind_address: IpAddr) -> Result<u16, PortalError> {
    let listener = TcpListener::bind((bind_address, 0)).map_err(|e| {
        PortalError::PortAllocationFailure(format!(
            "could not bind an ephemeral port on {}: {}",
            bind_address, e
        ))
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| {
            PortalError::PortAllocationFailure(format!(
                "could not read the ephemeral port bound on {}: {}",
                bind_address, e
            ))
        })?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_allocated_port_is_bindable() {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let port = allocate_ephemeral_port(loopback).unwrap();
        assert_ne!(port, 0);
        TcpListener::bind((loopback, port)).unwrap();
    }

    #[test]
    fn test_unusable_address_fails() {
        // TEST-NET-1 is never assigned to a local interface
        let err = allocate_ephemeral_port("192.0.2.1".parse().unwrap()).unwrap_err();
        assert!(matches!(err, PortalError::PortAllocationFailure(_)));
    }
}
