//! Locates the controller on the LAN by asking for its `.local`
//! hostname over multicast DNS.
//!
//! The [`DiscoveryService`] joins the mDNS group on the best interface
//! it can find (see [`select_interface`]), sends an A query for the
//! configured hostname every `retry_interval`, and in between reads
//! whatever arrives on the socket with a short per-read deadline. The
//! first A record answering for the hostname wins; everything else
//! (other hosts, our own looped back queries, malformed packets) is
//! logged and skipped until the overall `timeout` runs out.
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

mod dns;
mod iface;

pub use dns::{build_query, parse_response, DnsError};
pub use iface::{list_interfaces, select_interface, InterfaceInfo, MulticastInterface};

pub const MDNS_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("No mDNS answer for {hostname} within {timeout:?}")]
    Timeout { hostname: String, timeout: Duration },
    #[error("Discovery cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    pub hostname: String,
    /// Hard ceiling on one discovery run
    pub timeout: Duration,
    /// Time between two queries
    pub retry_interval: Duration,
    /// Deadline for a single socket read
    pub read_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            hostname: "pentair.local".to_string(),
            timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(2),
            read_timeout: Duration::from_millis(250),
        }
    }
}

/// Anything able to resolve the controller address; lets
/// re-discovery be driven without a network
#[async_trait::async_trait]
pub trait Discover: Send + Sync {
    async fn discover(&self, cancel: &CancellationToken) -> Result<Ipv4Addr, DiscoveryError>;
}

pub struct DiscoveryService {
    config: DiscoveryConfig,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn open_socket(iface: &MulticastInterface) -> Result<UdpSocket, DiscoveryError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        let mdns = SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT));
        if let Err(e) = socket.bind(&mdns.into()) {
            // another responder owns 5353 without SO_REUSEADDR; answers
            // to our queries still reach an ephemeral port
            log::warn!("Unable to bind {mdns}, using an ephemeral port: {e:}");
            socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
        }

        let joined = match iface {
            MulticastInterface::Addr { addr, .. } => socket
                .join_multicast_v4(&MDNS_ADDR, addr)
                .and_then(|_| socket.set_multicast_if_v4(addr)),
            MulticastInterface::Index { index, .. } => {
                socket.join_multicast_v4_n(&MDNS_ADDR, &InterfaceIndexOrAddress::Index(*index))
            }
            MulticastInterface::Default => {
                socket.join_multicast_v4(&MDNS_ADDR, &Ipv4Addr::UNSPECIFIED)
            }
        };
        match joined {
            Ok(()) => log::debug!("Joined {MDNS_ADDR} on {iface:?}"),
            Err(e) => log::warn!("Unable to join {MDNS_ADDR} on {iface:?} (continuing): {e:}"),
        }

        socket.set_multicast_ttl_v4(255)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }
}

#[async_trait::async_trait]
impl Discover for DiscoveryService {
    async fn discover(&self, cancel: &CancellationToken) -> Result<Ipv4Addr, DiscoveryError> {
        let interfaces = list_interfaces().unwrap_or_else(|e| {
            log::warn!("Unable to list interfaces: {e:}");
            Vec::new()
        });
        let iface = select_interface(&interfaces);
        log::info!(
            "Discovering {} via mDNS on {:?}",
            self.config.hostname,
            iface
        );

        let socket = Self::open_socket(&iface)?;
        query_loop(
            &socket,
            SocketAddr::from((MDNS_ADDR, MDNS_PORT)),
            &self.config,
            cancel,
        )
        .await
    }
}

async fn query_loop(
    socket: &UdpSocket,
    target: SocketAddr,
    config: &DiscoveryConfig,
    cancel: &CancellationToken,
) -> Result<Ipv4Addr, DiscoveryError> {
    // multicast queries carry id 0
    let query = build_query(0, &config.hostname);
    let deadline = Instant::now() + config.timeout;
    let mut next_query = Instant::now();
    let mut buf = vec![0u8; 9000];
    let mut sent = 0;

    loop {
        let now = Instant::now();
        if now >= deadline {
            log::warn!(
                "No answer for {} after {sent} queries",
                config.hostname
            );
            return Err(DiscoveryError::Timeout {
                hostname: config.hostname.clone(),
                timeout: config.timeout,
            });
        }

        if now >= next_query {
            match socket.send_to(&query, target).await {
                Ok(_) => {
                    sent += 1;
                    log::trace!("Sent mDNS query #{sent} for {}", config.hostname);
                }
                Err(e) => log::warn!("Unable to send mDNS query to {target}: {e:}"),
            }
            next_query = now + config.retry_interval;
        }

        let wait = config.read_timeout.min(deadline - now);
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(DiscoveryError::Cancelled),
            res = tokio::time::timeout(wait, socket.recv_from(&mut buf)) => res,
        };

        let (len, from) = match res {
            Err(_) => continue,
            Ok(Err(e)) => {
                log::debug!("mDNS read error: {e:}");
                continue;
            }
            Ok(Ok(received)) => received,
        };

        match parse_response(&buf[..len], &config.hostname) {
            Ok(Some(addr)) => {
                log::info!("Discovered {} at {addr} (answer from {from})", config.hostname);
                return Ok(addr);
            }
            Ok(None) => log::trace!("Ignoring mDNS packet from {from}"),
            Err(e) => log::debug!(
                "Malformed mDNS packet from {from} ({e:}): {}",
                hex::encode(&buf[..len])
            ),
        }
    }
}
