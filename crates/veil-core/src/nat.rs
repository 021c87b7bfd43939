//! Best-effort NAT traversal via UPnP port mapping.
//!
//! The listener asks the local gateway to forward its chat port so peers
//! outside the network can reach it. Every step can fail independently (no
//! gateway, no UPnP support, mapping refused) and none of those failures may
//! abort the listening flow: the fallback is always "forward the port
//! manually". Each failure mode is a typed [`NatError`], not a swallowed
//! exception.
//!
//! The IGD client is a blocking HTTP/SSDP implementation, so every call runs
//! under [`tokio::task::spawn_blocking`].

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use igd::{Gateway, PortMappingProtocol, SearchOptions};
use thiserror::Error;
use tokio::task;
use tracing::{debug, info, warn};

/// How long the SSDP gateway search may block at listen time.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Shorter search used when unmapping at teardown without a kept gateway.
const TEARDOWN_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Description string attached to mappings on the gateway.
const MAPPING_DESCRIPTION: &str = "veil p2p chat";

/// NAT traversal errors. All of them are non-fatal to the session.
#[derive(Debug, Error)]
pub enum NatError {
    #[error("no UPnP gateway found: {0}")]
    Discovery(String),

    #[error("failed to read external IP from gateway: {0}")]
    ExternalIp(String),

    #[error("failed to determine LAN address: {0}")]
    LanAddress(String),

    #[error("failed to add port mapping: {0}")]
    Mapping(String),

    #[error("failed to remove port mapping: {0}")]
    Unmapping(String),

    #[error("gateway task failed: {0}")]
    Task(String),
}

/// A port mapping held on the gateway.
///
/// External port always equals the internal port, and the protocol is fixed
/// to TCP; the chat never remaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInfo {
    pub external_port: u16,
    pub internal_addr: SocketAddrV4,
    pub protocol: &'static str,
}

/// Handle to a discovered UPnP gateway.
pub struct PortMapper {
    gateway: Gateway,
    lan_addr: Ipv4Addr,
}

impl PortMapper {
    /// Search the local network for an IGD-capable gateway.
    ///
    /// Also probes which local interface routes toward the gateway; that
    /// address becomes the internal side of any mapping.
    pub async fn discover(timeout: Duration) -> Result<Self, NatError> {
        let gateway = task::spawn_blocking(move || {
            igd::search_gateway(SearchOptions {
                timeout: Some(timeout),
                ..Default::default()
            })
        })
        .await
        .map_err(|e| NatError::Task(e.to_string()))?
        .map_err(|e| NatError::Discovery(e.to_string()))?;

        let lan_addr = probe_lan_addr(gateway.addr)?;
        debug!("gateway {} selected, LAN address {}", gateway.addr, lan_addr);

        Ok(Self { gateway, lan_addr })
    }

    /// Local address on the interface facing the gateway.
    pub fn lan_address(&self) -> Ipv4Addr {
        self.lan_addr
    }

    /// Public IP as reported by the gateway.
    pub async fn external_ip(&self) -> Result<Ipv4Addr, NatError> {
        let gateway = self.gateway.clone();
        task::spawn_blocking(move || gateway.get_external_ip())
            .await
            .map_err(|e| NatError::Task(e.to_string()))?
            .map_err(|e| NatError::ExternalIp(e.to_string()))
    }

    /// Ask the gateway to forward `port` to this host, TCP, same port on
    /// both sides, unlimited lease.
    pub async fn map_port(&self, port: u16) -> Result<MappingInfo, NatError> {
        let gateway = self.gateway.clone();
        let internal_addr = SocketAddrV4::new(self.lan_addr, port);

        task::spawn_blocking(move || {
            gateway.add_port(
                PortMappingProtocol::TCP,
                port,
                internal_addr,
                0,
                MAPPING_DESCRIPTION,
            )
        })
        .await
        .map_err(|e| NatError::Task(e.to_string()))?
        .map_err(|e| NatError::Mapping(e.to_string()))?;

        Ok(MappingInfo {
            external_port: port,
            internal_addr,
            protocol: "TCP",
        })
    }

    /// Remove the mapping for `port`, whether or not this process added it.
    pub async fn unmap_port(&self, port: u16) -> Result<(), NatError> {
        let gateway = self.gateway.clone();
        task::spawn_blocking(move || gateway.remove_port(PortMappingProtocol::TCP, port))
            .await
            .map_err(|e| NatError::Task(e.to_string()))?
            .map_err(|e| NatError::Unmapping(e.to_string()))
    }
}

/// Find the local IPv4 address that routes toward the gateway.
///
/// Connecting a UDP socket sends no packets; it only asks the kernel which
/// interface it would use.
fn probe_lan_addr(gateway_addr: SocketAddrV4) -> Result<Ipv4Addr, NatError> {
    let socket =
        std::net::UdpSocket::bind("0.0.0.0:0").map_err(|e| NatError::LanAddress(e.to_string()))?;
    socket
        .connect(gateway_addr)
        .map_err(|e| NatError::LanAddress(e.to_string()))?;

    match socket
        .local_addr()
        .map_err(|e| NatError::LanAddress(e.to_string()))?
        .ip()
    {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(NatError::LanAddress("got an IPv6 local address".into())),
    }
}

/// Best-effort port forwarding for the listener role.
///
/// Reports whatever it could obtain (public IP, mapping) and logs a manual
/// forwarding hint on any failure. Never aborts the listen flow.
pub async fn setup_port_forwarding(port: u16) -> Option<PortMapper> {
    let mapper = match PortMapper::discover(DISCOVERY_TIMEOUT).await {
        Ok(mapper) => mapper,
        Err(e) => {
            warn!("{e}; forward TCP port {port} manually if your peer is outside your network");
            return None;
        }
    };

    match mapper.external_ip().await {
        Ok(ip) => info!("reachable from outside at {ip}:{port}"),
        Err(e) => warn!("{e}"),
    }

    match mapper.map_port(port).await {
        Ok(mapping) => info!(
            "gateway forwards external port {} to {}",
            mapping.external_port, mapping.internal_addr
        ),
        Err(e) => {
            warn!("{e}; forward TCP port {port} manually if your peer is outside your network");
        }
    }

    Some(mapper)
}

/// Remove the port mapping at session end.
///
/// Attempted even when the mapping step failed or was skipped; the gateway
/// may still hold a stale entry from an earlier run. Failures here are
/// absorbed, the session outcome is already decided.
pub async fn teardown_port_forwarding(mapper: Option<PortMapper>, port: u16) {
    let mapper = match mapper {
        Some(mapper) => mapper,
        None => match PortMapper::discover(TEARDOWN_DISCOVERY_TIMEOUT).await {
            Ok(mapper) => mapper,
            Err(e) => {
                debug!("skipping port unmapping: {e}");
                return;
            }
        },
    };

    match mapper.unmap_port(port).await {
        Ok(()) => info!("removed gateway mapping for port {port}"),
        Err(e) => debug!("{e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_uses_same_port_on_both_sides() {
        let info = MappingInfo {
            external_port: 9000,
            internal_addr: SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 9000),
            protocol: "TCP",
        };
        assert_eq!(info.external_port, info.internal_addr.port());
    }

    #[tokio::test]
    async fn test_teardown_without_mapper_is_absorbed() {
        // No gateway in the test environment: discovery fails (or an
        // unexpected gateway refuses the unmapping) and both outcomes must
        // be swallowed without a panic or an error return.
        teardown_port_forwarding(None, 9000).await;
    }
}
