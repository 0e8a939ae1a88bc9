//! In-memory [`Connector`] / [`Transport`] fakes for unit tests
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use crate::{Connector, Endpoint, Transport, TransportError};

#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Answer the last sent request, echoing its messageID
    Reply { code: &'static str },
    /// NotifyList frame for a pump speed change
    Push { rpm: &'static str },
    /// Successful response carrying someone else's messageID
    Other { id: &'static str },
    Raw(&'static str),
    Fail,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    pub script: Arc<Mutex<VecDeque<Script>>>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub pings: Arc<AtomicUsize>,
    pub fail_ping: bool,
}

impl ScriptedTransport {
    pub fn with_script(items: Vec<Script>) -> Self {
        Self {
            script: Arc::new(Mutex::new(items.into())),
            ..Default::default()
        }
    }

    fn last_sent_id(&self) -> String {
        let sent = self.sent.lock().expect("lock");
        sent.last()
            .and_then(|text| serde_json::from_str::<serde_json::Value>(text).ok())
            .and_then(|v| v["messageID"].as_str().map(|s| s.to_string()))
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.sent.lock().expect("lock").push(text.to_string());
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<String, TransportError> {
        let next = self.script.lock().expect("lock").pop_front();
        match next {
            Some(Script::Reply { code }) => Ok(serde_json::json!({
                "command": "SendParamList",
                "messageID": self.last_sent_id(),
                "response": code,
                "objectList": [
                    {"objnam": "PMP01", "params": {"SNAME": "Filter", "RPM": "1800"}}
                ]
            })
            .to_string()),
            Some(Script::Push { rpm }) => Ok(serde_json::json!({
                "command": "NotifyList",
                "messageID": "push",
                "objectList": [{"objnam": "PMP01", "params": {"RPM": rpm}}]
            })
            .to_string()),
            Some(Script::Other { id }) => Ok(serde_json::json!({
                "command": "SendParamList",
                "messageID": id,
                "response": "200",
                "objectList": []
            })
            .to_string()),
            Some(Script::Raw(text)) => Ok(text.to_string()),
            Some(Script::Fail) => Err(TransportError::Closed),
            None => std::future::pending().await,
        }
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.fail_ping {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Refuses the first `failures` connects, then hands out clones of
/// `transport` (sharing its script)
pub(crate) struct FakeConnector {
    pub attempts: AtomicUsize,
    failures: usize,
    transport: ScriptedTransport,
}

impl FakeConnector {
    pub fn failing_then(failures: usize, transport: ScriptedTransport) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            failures,
            transport,
        }
    }
}

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<Box<dyn Transport>, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )));
        }
        Ok(Box::new(self.transport.clone()))
    }
}
