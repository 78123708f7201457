//! UDP ingress: one listener task per configured address, one task per
//! accepted datagram.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::context::{self, Services};
use crate::error::{Error, Result};
use crate::packet::{DhcpPacket, HLEN_ETHERNET, MIN_PACKET_SIZE};
use crate::stats::Counter;

const DHCP_SERVER_PORT: u16 = 67;

/// DHCP datagrams cannot be larger than this.
const RECV_BUFFER_SIZE: usize = 576;

pub struct Server {
    services: Arc<Services>,
}

impl Server {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Runs one listener per configured address until the first one fails.
    pub async fn run(&self) -> Result<()> {
        if self.services.config.dhcp.listen.is_empty() {
            return Err(Error::InvalidConfig(
                "no DHCP listen address defined".to_string(),
            ));
        }

        let mut listeners = JoinSet::new();
        for address in &self.services.config.dhcp.listen {
            let services = Arc::clone(&self.services);
            let address = *address;
            listeners.spawn(async move { listen(services, address).await });
        }

        while let Some(result) = listeners.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(Error::Socket(format!("listener task failed: {}", err))),
            }
        }
        Ok(())
    }
}

fn create_socket(address: Ipv4Addr, buffer_size: usize) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    // Large kernel buffers absorb request storms.
    socket
        .set_recv_buffer_size(buffer_size)
        .map_err(|error| Error::Socket(format!("Failed to set receive buffer: {}", error)))?;
    socket
        .set_send_buffer_size(buffer_size)
        .map_err(|error| Error::Socket(format!("Failed to set send buffer: {}", error)))?;

    let bind_addr = SocketAddrV4::new(address, DHCP_SERVER_PORT);
    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    let tokio_socket = UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))?;

    Ok(tokio_socket)
}

async fn listen(services: Arc<Services>, address: Ipv4Addr) -> Result<()> {
    let socket = Arc::new(create_socket(address, services.config.dhcp.buffer_size)?);
    warn!("listening on {}:{}", address, DHCP_SERVER_PORT);

    let mut buffer = [0u8; RECV_BUFFER_SIZE];
    loop {
        let (size, peer) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(error) if is_transient(&error) => {
                warn!(%error, "temporary receive error");
                services.stats.inc(Counter::ErrorsOther);
                continue;
            }
            Err(error) => {
                error!(%error, "fatal receive error, stopping listener");
                return Err(error.into());
            }
        };

        services.stats.inc(Counter::RequestsTotal);
        services.stats.inc(Counter::PacketsIn);
        services.stats.add(Counter::BytesIn, size as u64);

        if size < MIN_PACKET_SIZE {
            services.stats.inc(Counter::ErrorsMalformedPacket);
            warn!(%peer, size, "packet too small to be DHCP, dropping");
            continue;
        }

        let datagram = buffer[..size].to_vec();
        let services = Arc::clone(&services);
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            handle_datagram(services, socket, datagram, peer, address).await;
        });
    }
}

fn is_transient(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::ConnectionReset
    )
}

/// Validates one datagram and runs it through the pipeline, sending any
/// reply back to the originating peer.
async fn handle_datagram(
    services: Arc<Services>,
    socket: Arc<UdpSocket>,
    datagram: Vec<u8>,
    peer: SocketAddr,
    local_ip: Ipv4Addr,
) {
    let packet = match DhcpPacket::parse(&datagram) {
        Ok(packet) => packet,
        Err(error) => {
            services.stats.inc(Counter::ErrorsMalformedPacket);
            debug!(%peer, %error, "malformed packet");
            return;
        }
    };

    if packet.hlen != HLEN_ETHERNET {
        services.stats.inc(Counter::ErrorsMalformedPacket);
        warn!(%peer, hlen = packet.hlen, "malformed packet (HLEN != 6)");
        return;
    }

    // Usually BOOTP requests from misconfigured devices.
    let Some(request_type) = packet.message_type() else {
        services.stats.inc(Counter::ErrorsMalformedPacket);
        debug!(%peer, mac = %packet.mac(), "packet without DHCP message type");
        return;
    };

    let remote_ip = match peer {
        SocketAddr::V4(addr) => *addr.ip(),
        SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };

    let reply = context::handle_request(
        &services,
        packet,
        request_type,
        local_ip,
        remote_ip,
        datagram.len(),
    )
    .await;

    if let Some(bytes) = reply {
        match socket.send_to(&bytes, peer).await {
            Ok(sent) => {
                services.stats.inc(Counter::PacketsOut);
                services.stats.add(Counter::BytesOut, sent as u64);
            }
            Err(error) => {
                services.stats.inc(Counter::ErrorsOther);
                error!(%peer, %error, "unable to send reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants() {
        assert_eq!(DHCP_SERVER_PORT, 67);
        assert_eq!(RECV_BUFFER_SIZE, 576);
        assert_eq!(MIN_PACKET_SIZE, 240);
    }

    #[test]
    fn transient_errors_are_classified() {
        assert!(is_transient(&std::io::Error::from(ErrorKind::WouldBlock)));
        assert!(is_transient(&std::io::Error::from(ErrorKind::Interrupted)));
        assert!(!is_transient(&std::io::Error::from(
            ErrorKind::PermissionDenied
        )));
    }
}
