//! The `poolmind-broker` crate defines the network layer for the
//! pool-minder agent: everything needed to find the pool controller and
//! keep talking to it reliably. It is composed of:
//! 1. [`TransportConnection`], owning one session (WebSocket or raw TCP,
//!    see [`Transport`]) with connect retries on an exponential backoff
//!    ([`backoff_delay`]), throttled health check pings and a deadline
//!    on every read.
//! 2. [`RequestCorrelator`], pairing each request with its response by
//!    `messageID` on a connection that also carries unsolicited push
//!    notifications. Pushes seen while waiting are handed to a push
//!    handler, and a response for some other request is treated as the
//!    connection having fallen out of step.
//! 3. [`DiscoveryService`], resolving the controller's `.local`
//!    hostname over multicast DNS when no address is configured.
//! 4. [`RediscoveryController`], deciding when repeated failures should
//!    trigger a new lookup and whether the controller has actually
//!    moved.
//!
//! Nothing in this crate owns a task: callers own connections and drive
//! them from their own loops, see the `poolmindd` crate.
//!
//! # Examples
//! ```rust,no_run
//! use poolmind_broker::{
//!     CorrelatorConfig, Endpoint, NetConnector, RequestCorrelator, RetryConfig,
//!     TransportConnection, TransportKind,
//! };
//! use poolmindp_wire::{command, key, objtyp, ObjectQuery, ALL_OBJECTS};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cancel = tokio_util::sync::CancellationToken::new();
//!     let mut conn = TransportConnection::new(
//!         Endpoint::new("192.168.50.118", 6680, TransportKind::WebSocket),
//!         RetryConfig::default(),
//!         std::sync::Arc::new(NetConnector),
//!     );
//!     conn.connect(&cancel).await?;
//!
//!     let mut correlator = RequestCorrelator::new(CorrelatorConfig::default());
//!     let resp = correlator
//!         .request(
//!             &mut conn,
//!             command::GET_PARAM_LIST,
//!             &format!("OBJTYP={}", objtyp::PUMP),
//!             vec![ObjectQuery::new(ALL_OBJECTS, &[key::SNAME, key::RPM])],
//!         )
//!         .await?;
//!     for pump in resp.object_list {
//!         println!("{} {:?}", pump.name(), pump.get(key::RPM));
//!     }
//!     Ok(())
//! }
//! ```

mod backoff;
mod connection;
mod correlator;
mod discovery;
mod rediscovery;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{backoff_delay, RetryConfig};
pub use connection::{ConnectionError, TransportConnection};
pub use correlator::{
    next_message_id, CorrelationError, CorrelatorConfig, PushHandler, RequestCorrelator,
    RequestError,
};
pub use discovery::{
    build_query, list_interfaces, parse_response, select_interface, Discover, DiscoveryConfig,
    DiscoveryError, DiscoveryService, DnsError, InterfaceInfo, MulticastInterface, MDNS_ADDR,
    MDNS_PORT,
};
pub use rediscovery::{Outcome, RediscoveryController};
pub use transport::{
    Connector, Endpoint, NetConnector, TcpTransport, Transport, TransportError, TransportKind,
    WsTransport,
};

/// Default controller port for the WebSocket protocol
pub const DEFAULT_WS_PORT: u16 = 6680;

/// Default controller port for the raw TCP protocol
pub const DEFAULT_TCP_PORT: u16 = 6681;
