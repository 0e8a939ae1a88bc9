use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use poolmind_broker::{DiscoveryService, NetConnector};
use poolmindd::{
    sink::{LogEventLog, LogMetricsSink},
    Config, HybridPoller, PoolMinderResult,
};
use tracing_appender::rolling;
use tracing_subscriber::FmtSubscriber;

use tracing_log::LogTracer;

#[tokio::main]
async fn main() -> PoolMinderResult<()> {
    let config = Config::load()?;

    LogTracer::init().expect("Unable to set up log tracer");

    let log = rolling::daily(&config.logging.dir, &config.logging.prefix);
    let (nb, _guard) = tracing_appender::non_blocking(log);

    let level = config
        .logging
        .level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    let sub = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(nb)
        .finish();

    tracing::subscriber::set_global_default(sub).expect("Unable to set up tracing subscriber");

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Unable to listen for ctrl-c {e:}");
            return;
        }
        log::info!("Shutting down");
        ctrl_c.cancel();
    });

    let discovery = Arc::new(DiscoveryService::new(config.discovery_config()));
    let poller = HybridPoller::new(config, Arc::new(NetConnector), discovery);

    poller
        .run(Box::new(LogMetricsSink), Box::new(LogEventLog), cancel)
        .await
        .map_err(|e| {
            log::error!("Pool minder exited with error {e:}");
            e
        })
}
