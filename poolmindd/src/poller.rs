//! [`HybridPoller`] drives the whole agent: it finds the controller,
//! opens two connections to it, and splits the work as follows:
//! 1. The push side ([`PushListener`]) subscribes to change
//!    notifications and listens, checking health when the connection
//!    goes quiet. When a read fails it reconnects (forever, pausing
//!    `reconnect_delay` between rounds), asks the state task to reset,
//!    and re-observes everything before subscribing again.
//! 2. The poll side runs a full sweep every `poll_interval` as a
//!    safety net for missed notifications. Repeated failures there hand
//!    over to the [`RediscoveryController`]: sweeps stop and each tick
//!    looks for the controller instead, until it is reconnected at a new
//!    address. That address is shared with the push side through a
//!    `watch` channel.
//! 3. Both sides publish [`Update`]s to a single [`PoolMinder`] task
//!    owning the equipment state.
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedSender},
    watch,
};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use poolmind_broker::{
    ConnectionError, Connector, Discover, DiscoveryError, Endpoint, Outcome,
    RediscoveryController, RequestCorrelator, RequestError, TransportConnection, TransportError,
};
use poolmindp_wire::{command, ObjectQuery, Response};

use crate::config::Config;
use crate::event::{Source, Update};
use crate::minder::PoolMinder;
use crate::sink::{EventLog, MetricsSink};
use crate::sweep;
use crate::PoolMinderResult;

pub struct HybridPoller {
    config: Config,
    connector: Arc<dyn Connector>,
    discover: Arc<dyn Discover>,
}

impl HybridPoller {
    pub fn new(config: Config, connector: Arc<dyn Connector>, discover: Arc<dyn Discover>) -> Self {
        Self {
            config,
            connector,
            discover,
        }
    }

    fn connection(&self, endpoint: Endpoint) -> TransportConnection {
        TransportConnection::new(endpoint, self.config.retry_config(), self.connector.clone())
    }

    /// Runs until `cancel` fires
    pub async fn run(
        self,
        metrics: Box<dyn MetricsSink>,
        events: Box<dyn EventLog>,
        cancel: CancellationToken,
    ) -> PoolMinderResult<()> {
        let Some(endpoint) = self.resolve_endpoint(&cancel).await else {
            return Ok(());
        };
        log::info!("Using controller at {endpoint}");

        let (endpoint_tx, endpoint_rx) = watch::channel(endpoint.clone());
        let (update_tx, update_rx) = unbounded_channel();
        let state_task = tokio::spawn(PoolMinder::new(metrics, events).run(update_rx, cancel.clone()));

        let mut poll_conn = self.connection(endpoint.clone());
        let mut push_conn = self.connection(endpoint);
        let reconnect_delay = self.config.reconnect_delay();
        if !connect_until(&mut poll_conn, reconnect_delay, &cancel).await
            || !connect_until(&mut push_conn, reconnect_delay, &cancel).await
        {
            state_task.await?;
            return Ok(());
        }

        let mut poll_correlator = RequestCorrelator::new(self.config.correlator_config());
        match sweep::load_feature_flags(&mut poll_correlator, &mut poll_conn).await {
            Ok(flags) => publish(&update_tx, Update::FeatureFlags(flags)),
            Err(e) => log::warn!("Unable to load feature menu flags, features stay hidden: {e:}"),
        }

        let Some(initial) = initial_sweep(
            &mut poll_correlator,
            &mut poll_conn,
            reconnect_delay,
            &cancel,
        )
        .await
        else {
            poll_conn.close().await;
            push_conn.close().await;
            state_task.await?;
            return Ok(());
        };
        let subscription = sweep::subscription(&initial.objects);
        publish(
            &update_tx,
            Update::Initial {
                source: Source::Poll,
                objects: initial.objects,
            },
        );

        let listener = PushListener::new(
            push_conn,
            &self.config,
            subscription,
            endpoint_rx,
            update_tx.clone(),
        );
        let push_task = tokio::spawn(listener.run(cancel.clone()));

        self.poll_loop(poll_conn, poll_correlator, endpoint_tx, update_tx, &cancel)
            .await;

        push_task.await?;
        state_task.await?;
        log::info!("Hybrid poller stopped");
        Ok(())
    }

    async fn resolve_endpoint(&self, cancel: &CancellationToken) -> Option<Endpoint> {
        if let Some(host) = self.config.controller.host.as_deref() {
            return Some(self.config.endpoint(host));
        }

        loop {
            match self.discover.discover(cancel).await {
                Ok(addr) => return Some(self.config.endpoint(&addr.to_string())),
                Err(DiscoveryError::Cancelled) => return None,
                Err(e) => {
                    let delay = self.config.reconnect_delay();
                    log::warn!("Controller discovery failed, retrying in {delay:?}: {e:}");
                    if !pause(delay, cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn poll_loop(
        &self,
        mut conn: TransportConnection,
        mut correlator: RequestCorrelator,
        endpoint_tx: watch::Sender<Endpoint>,
        updates: UnboundedSender<Update>,
        cancel: &CancellationToken,
    ) {
        let mut rediscovery = RediscoveryController::new(
            self.config.discovery.failure_threshold,
            self.config.discovery.auto_rediscovery,
        );
        let period = self.config.poll_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let stale = correlator.sweep_stale(self.config.stale_request_age());
            if stale > 0 {
                log::debug!("Dropped {stale} unanswered poll requests");
            }

            // Polling is suspended while re-discovering; a cycle only
            // sweeps again once a new address has been reconnected
            if rediscovery.is_active() {
                self.rediscover(&mut rediscovery, &mut conn, &endpoint_tx, cancel)
                    .await;
                if rediscovery.is_active() {
                    continue;
                }
            }

            match conn.ensure_connected(cancel).await {
                Ok(()) => {}
                Err(ConnectionError::Cancelled) => break,
                Err(e) => {
                    log::warn!("Poll connection unavailable: {e:}");
                    rediscovery.record_failure();
                    continue;
                }
            }

            let result = sweep::sweep(&mut correlator, &mut conn).await;
            let failed = result.failed();
            publish(
                &updates,
                Update::PollCycle {
                    objects: result.objects,
                    failed,
                },
            );
            if failed {
                rediscovery.record_failure();
            } else {
                rediscovery.record_success();
            }
        }

        conn.close().await;
    }

    async fn rediscover(
        &self,
        rediscovery: &mut RediscoveryController,
        conn: &mut TransportConnection,
        endpoint_tx: &watch::Sender<Endpoint>,
        cancel: &CancellationToken,
    ) {
        let current = conn.endpoint().host.clone();
        if let Outcome::AddressChanged(addr) =
            rediscovery.attempt(self.discover.as_ref(), &current, cancel).await
        {
            let endpoint = conn.endpoint().with_host(&addr.to_string());
            conn.close().await;
            conn.set_endpoint(endpoint.clone());
            endpoint_tx.send_replace(endpoint);
            let res = conn.connect(cancel).await;
            if let Err(e) = res.as_ref() {
                log::warn!("Unable to connect to re-discovered {addr}: {e:}");
            }
            rediscovery.reconnected(res.is_ok());
        }
    }
}

/// Owns the push connection; see the module docs
pub struct PushListener {
    conn: TransportConnection,
    correlator: RequestCorrelator,
    subscription: Vec<ObjectQuery>,
    endpoint_rx: watch::Receiver<Endpoint>,
    updates: UnboundedSender<Update>,
    listen_timeout: Duration,
    reconnect_delay: Duration,
}

impl PushListener {
    pub fn new(
        conn: TransportConnection,
        config: &Config,
        subscription: Vec<ObjectQuery>,
        endpoint_rx: watch::Receiver<Endpoint>,
        updates: UnboundedSender<Update>,
    ) -> Self {
        let mut correlator = RequestCorrelator::new(config.correlator_config());
        let tx = updates.clone();
        correlator.set_push_handler(Box::new(move |resp: Response| {
            publish(&tx, Update::Push(resp.object_list));
        }));

        Self {
            conn,
            correlator,
            subscription,
            endpoint_rx,
            updates,
            listen_timeout: config.listen_timeout(),
            reconnect_delay: config.reconnect_delay(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        if let Err(e) = self.subscribe().await {
            log::warn!("Push subscription failed: {e:}");
            if !self.reconnect(&cancel).await {
                self.conn.close().await;
                return;
            }
        }

        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.conn.recv_text(self.listen_timeout) => res,
            };

            match res {
                Ok(text) => self.frame(&text),
                Err(TransportError::Timeout(_)) => {
                    log::debug!("No push for {:?}, checking connection", self.listen_timeout);
                    if self.conn.is_healthy().await {
                        continue;
                    }
                    log::warn!("Push connection unhealthy after idle period");
                    if !self.reconnect(&cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Push connection read failed: {e:}");
                    if !self.reconnect(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.conn.close().await;
        log::info!("Push listener stopped");
    }

    fn frame(&self, text: &str) {
        match Response::from_json(text) {
            Ok(resp) if resp.is_push() => publish(&self.updates, Update::Push(resp.object_list)),
            Ok(resp) => log::trace!("Ignoring {} frame {}", resp.command, resp.message_id),
            Err(e) => log::warn!("Undecodable push frame: {e:}"),
        }
    }

    async fn subscribe(&mut self) -> Result<(), RequestError> {
        if self.subscription.is_empty() {
            log::warn!("Nothing to subscribe to, relying on polling");
            return Ok(());
        }
        self.correlator
            .request(
                &mut self.conn,
                command::REQUEST_PARAM_LIST,
                "",
                self.subscription.clone(),
            )
            .await?;
        log::info!("Subscribed to {} objects", self.subscription.len());
        Ok(())
    }

    /// Re-observe everything on the fresh connection, then subscribe
    async fn resynchronize(&mut self) -> Result<(), RequestError> {
        publish(&self.updates, Update::Reset);
        let result = sweep::sweep(&mut self.correlator, &mut self.conn).await;
        if let Some((_, e)) = result.error {
            return Err(e);
        }
        self.subscription = sweep::subscription(&result.objects);
        publish(
            &self.updates,
            Update::Initial {
                source: Source::Push,
                objects: result.objects,
            },
        );
        self.subscribe().await
    }

    /// false when cancelled
    async fn reconnect(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if self.endpoint_rx.has_changed().unwrap_or(false) {
                let endpoint = self.endpoint_rx.borrow_and_update().clone();
                self.conn.set_endpoint(endpoint);
            }

            self.conn.close().await;
            match self.conn.connect(cancel).await {
                Ok(()) => match self.resynchronize().await {
                    Ok(()) => {
                        log::info!("Push connection restored to {}", self.conn.endpoint());
                        return true;
                    }
                    Err(e) => log::warn!("Resynchronizing after reconnect failed: {e:}"),
                },
                Err(ConnectionError::Cancelled) => return false,
                Err(e) => log::warn!("Push reconnect failed: {e:}"),
            }

            log::info!("Retrying push connection in {:?}", self.reconnect_delay);
            if !pause(self.reconnect_delay, cancel).await {
                return false;
            }
        }
    }
}

fn publish(updates: &UnboundedSender<Update>, update: Update) {
    if let Err(e) = updates.send(update) {
        log::error!("State task gone, dropping update {e:}");
    }
}

/// Sleep unless cancelled first; false when cancelled
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Repeats the full sweep until one completes: every category has to be
/// seen before the initial snapshot counts as done. None when cancelled
async fn initial_sweep(
    correlator: &mut RequestCorrelator,
    conn: &mut TransportConnection,
    delay: Duration,
    cancel: &CancellationToken,
) -> Option<sweep::Sweep> {
    loop {
        let result = sweep::sweep(correlator, conn).await;
        let Some((query, e)) = result.error.as_ref() else {
            return Some(result);
        };
        log::warn!("Initial sweep incomplete ({query} failed), retrying in {delay:?}: {e:}");
        if !pause(delay, cancel).await {
            return None;
        }
        match conn.ensure_connected(cancel).await {
            Ok(()) => {}
            Err(ConnectionError::Cancelled) => return None,
            Err(e) => log::warn!("Poll connection unavailable: {e:}"),
        }
    }
}

async fn connect_until(
    conn: &mut TransportConnection,
    delay: Duration,
    cancel: &CancellationToken,
) -> bool {
    loop {
        match conn.connect(cancel).await {
            Ok(()) => return true,
            Err(ConnectionError::Cancelled) => return false,
            Err(e) => {
                log::warn!("{e:}, retrying in {delay:?}");
                if !pause(delay, cancel).await {
                    return false;
                }
            }
        }
    }
}
