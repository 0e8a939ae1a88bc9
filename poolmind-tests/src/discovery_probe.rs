use poolmind_broker::{list_interfaces, select_interface, Discover, DiscoveryService};
use poolmindd::Config;
use tokio_util::sync::CancellationToken;

/// Looks for the controller over mDNS once and prints what was found.
/// The hostname comes from the usual config layers, or the first arg.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = Config::load()?;
    if let Some(hostname) = std::env::args().nth(1) {
        config.discovery.hostname = hostname;
    }

    let interfaces = list_interfaces()?;
    for iface in interfaces.iter() {
        log::info!("{iface:?}");
    }
    log::info!("Selected {:?}", select_interface(&interfaces));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let service = DiscoveryService::new(config.discovery_config());
    let addr = service.discover(&cancel).await.map_err(|e| {
        log::error!("Discovery of {} failed {e:}", config.discovery.hostname);
        e
    })?;

    println!("{} -> {addr}", config.discovery.hostname);
    Ok(())
}
