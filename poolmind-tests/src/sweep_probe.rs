use std::sync::Arc;

use poolmind_broker::{NetConnector, RequestCorrelator, TransportConnection};
use poolmindd::{
    event::Source,
    sink::{EventLog, LogEventLog, LogMetricsSink, MetricsSink},
    state::EquipmentState,
    sweep, Config,
};
use tokio_util::sync::CancellationToken;

/// Runs a single full sweep against a controller and logs every
/// derived reading. Usage: `sweep-probe <host>`
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::load()?;
    let host = std::env::args()
        .nth(1)
        .or_else(|| config.controller.host.clone())
        .ok_or("no controller host given")?;

    let cancel = CancellationToken::new();
    let mut conn = TransportConnection::new(
        config.endpoint(&host),
        config.retry_config(),
        Arc::new(NetConnector),
    );
    conn.connect(&cancel).await?;

    let mut correlator = RequestCorrelator::new(config.correlator_config());
    let mut state = EquipmentState::new();
    match sweep::load_feature_flags(&mut correlator, &mut conn).await {
        Ok(flags) => state.set_feature_flags(flags),
        Err(e) => log::warn!("No feature flags {e:}"),
    }

    let result = sweep::sweep(&mut correlator, &mut conn).await;
    if let Some((query, e)) = result.error.as_ref() {
        log::error!("Sweep stopped at {query} {e:}");
    }

    let applied = state.apply(&result.objects, Source::Poll);
    let (mut metrics, mut events) = (LogMetricsSink, LogEventLog);
    for reading in applied.readings.iter() {
        metrics.observe(reading);
    }
    for event in applied.events.iter() {
        events.record(event);
    }

    println!(
        "{} objects, {} readings, {} pending requests",
        result.objects.len(),
        applied.readings.len(),
        correlator.pending_count()
    );
    conn.close().await;
    Ok(())
}
