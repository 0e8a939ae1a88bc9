/// Re-discovery as driven by the hybrid poller, against an in-memory
/// controller and a scripted mDNS lookup, under paused time.
use poolmind_broker::{Connector, Discover, DiscoveryError, Endpoint, Transport, TransportError};
use poolmindd::event::{EquipmentEvent, EventKind, Source};
use poolmindd::sink::{ChannelEventLog, LogMetricsSink};
use poolmindd::{Config, HybridPoller};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// What every connection shares: which host has stopped answering,
/// and a record of what was asked of whom
#[derive(Default)]
struct Controller {
    broken_host: Mutex<Option<String>>,
    sent: Mutex<Vec<(String, String)>>,
    connects: Mutex<Vec<String>>,
    discover_calls: AtomicUsize,
    polled_while_rediscovering: AtomicUsize,
    /// Drops subscribed connections to the broken host
    drop_push: CancellationToken,
}

impl Controller {
    fn is_broken(&self, host: &str) -> bool {
        self.broken_host.lock().expect("lock").as_deref() == Some(host)
    }

    fn break_host(&self, host: &str) {
        *self.broken_host.lock().expect("lock") = Some(host.to_string());
    }

    fn sent_to(&self, host: &str, command: &str) -> usize {
        self.sent
            .lock()
            .expect("lock")
            .iter()
            .filter(|(h, c)| h == host && c == command)
            .count()
    }

    fn connects_to(&self, host: &str) -> usize {
        self.connects
            .lock()
            .expect("lock")
            .iter()
            .filter(|h| h.as_str() == host)
            .count()
    }
}

struct FakeTransport {
    host: String,
    controller: Arc<Controller>,
    replies: VecDeque<String>,
    subscribed: bool,
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        let req: Value = serde_json::from_str(text).expect("request json");
        let id = req["messageID"].as_str().unwrap_or_default().to_string();
        let command = req["command"].as_str().unwrap_or_default().to_string();
        self.controller
            .sent
            .lock()
            .expect("lock")
            .push((self.host.clone(), command.clone()));

        let reply = match command.as_str() {
            "GetParamList" => {
                if self.controller.discover_calls.load(Ordering::SeqCst) > 0 {
                    self.controller
                        .polled_while_rediscovering
                        .fetch_add(1, Ordering::SeqCst);
                }
                if self.controller.is_broken(&self.host) {
                    json!({"command": "SendParamList", "messageID": id,
                        "response": "500", "description": "unavailable"})
                } else {
                    json!({"command": "SendParamList", "messageID": id, "response": "200",
                        "objectList": [{"objnam": "PMP01",
                            "params": {"OBJTYP": "PUMP", "SNAME": "Filter", "RPM": "1800"}}]})
                }
            }
            _ => {
                self.subscribed = true;
                json!({"command": "SendParamList", "messageID": id, "response": "200",
                    "objectList": []})
            }
        };
        self.replies.push_back(reply.to_string());
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<String, TransportError> {
        if let Some(reply) = self.replies.pop_front() {
            return Ok(reply);
        }
        if self.subscribed {
            self.controller.drop_push.cancelled().await;
            if self.controller.is_broken(&self.host) {
                return Err(TransportError::Closed);
            }
        }
        std::future::pending().await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct FakeConnector(Arc<Controller>);

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, TransportError> {
        self.0
            .connects
            .lock()
            .expect("lock")
            .push(endpoint.host.clone());
        Ok(Box::new(FakeTransport {
            host: endpoint.host.clone(),
            controller: self.0.clone(),
            replies: VecDeque::new(),
            subscribed: false,
        }))
    }
}

/// Always finds the controller at the same address
struct FakeDiscover {
    controller: Arc<Controller>,
    addr: Ipv4Addr,
}

#[async_trait::async_trait]
impl Discover for FakeDiscover {
    async fn discover(&self, _cancel: &CancellationToken) -> Result<Ipv4Addr, DiscoveryError> {
        self.controller.discover_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.addr)
    }
}

fn start(
    host: &str,
    found_at: Ipv4Addr,
) -> (
    Arc<Controller>,
    CancellationToken,
    UnboundedReceiver<EquipmentEvent>,
    tokio::task::JoinHandle<()>,
) {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = Config::default();
    config.controller.host = Some(host.to_string());
    config.monitor.poll_interval_secs = 10;
    config.monitor.reconnect_delay_secs = 1;
    config.discovery.failure_threshold = 3;

    let controller = Arc::new(Controller::default());
    let poller = HybridPoller::new(
        config,
        Arc::new(FakeConnector(controller.clone())),
        Arc::new(FakeDiscover {
            controller: controller.clone(),
            addr: found_at,
        }),
    );

    let (tx, rx) = unbounded_channel();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        poller
            .run(
                Box::new(LogMetricsSink),
                Box::new(ChannelEventLog::new(tx)),
                token,
            )
            .await
            .expect("poller");
    });
    (controller, cancel, rx, handle)
}

async fn stop(cancel: CancellationToken, handle: tokio::task::JoinHandle<()>) {
    cancel.cancel();
    timeout(Duration::from_secs(30), handle)
        .await
        .expect("shutdown")
        .expect("join");
}

#[tokio::test(start_paused = true)]
async fn same_address_suspends_polling() {
    let (controller, cancel, mut rx, handle) = start("127.0.0.1", Ipv4Addr::LOCALHOST);

    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("initial snapshot")
        .expect("event");
    controller.break_host("127.0.0.1");

    // failures at 10s, 20s, 30s; discovery every tick from 40s on
    tokio::time::sleep(Duration::from_secs(105)).await;

    assert!(controller.discover_calls.load(Ordering::SeqCst) >= 6);
    assert_eq!(
        controller.polled_while_rediscovering.load(Ordering::SeqCst),
        0
    );
    assert_eq!(controller.connects_to("127.0.0.1"), 2);

    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn changed_address_is_followed_by_both_connections() {
    let moved = Ipv4Addr::new(10, 0, 0, 2);
    let (controller, cancel, mut rx, handle) = start("10.0.0.1", moved);

    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("initial snapshot")
        .expect("event");
    controller.break_host("10.0.0.1");

    // three failures, the move is found at 40s, then polling resumes
    tokio::time::sleep(Duration::from_secs(75)).await;

    assert_eq!(controller.discover_calls.load(Ordering::SeqCst), 1);
    assert_eq!(controller.connects_to("10.0.0.2"), 1);
    assert!(controller.sent_to("10.0.0.2", "GetParamList") > 0);
    assert_eq!(controller.sent_to("10.0.0.2", "RequestParamList"), 0);

    // the push side only learns the new address once its own read fails
    controller.drop_push.cancel();
    timeout(Duration::from_secs(30), async {
        while let Some(event) = rx.recv().await {
            if event.kind == EventKind::Resynchronized {
                assert_eq!(event.source, Source::Push);
                break;
            }
        }
    })
    .await
    .expect("resynchronized");
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(controller.connects_to("10.0.0.2"), 2);
    assert_eq!(controller.sent_to("10.0.0.2", "RequestParamList"), 1);

    stop(cancel, handle).await;
}
