use chrono::Utc;
use poolmindp_wire::{ObjectQuery, Request, Response, WireError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::time::{Duration, Instant};

use crate::{TransportConnection, TransportError};

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum CorrelationError {
    #[error("Response for {received} while waiting on {expected}")]
    Mismatch { expected: String, received: String },
    #[error("No response for {expected} ({skipped} frames skipped)")]
    Timeout { expected: String, skipped: usize },
    #[error("Controller returned {code}: {description:?}")]
    Protocol {
        code: String,
        description: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Transport Error")]
    Transport(#[from] TransportError),
    #[error("Wire Error")]
    Wire(#[from] WireError),
    #[error("Correlation Error")]
    Correlation(#[from] CorrelationError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatorConfig {
    /// Non-matching frames tolerated while waiting for one response
    pub max_skips: usize,
    /// Overall deadline for one response
    pub read_deadline: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            max_skips: 10,
            read_deadline: Duration::from_secs(10),
        }
    }
}

pub type PushHandler = Box<dyn Fn(Response) + Send + Sync>;

/// Pairs requests with their responses on a connection that also
/// carries unsolicited `NotifyList` frames. One correlator is used per
/// connection, by the single task owning that connection.
pub struct RequestCorrelator {
    config: CorrelatorConfig,
    pending: HashMap<String, Instant>,
    push_handler: Option<PushHandler>,
}

/// `<unix-nanos>-<counter>`, unique within the process even when two
/// ids are generated within the same clock tick
pub fn next_message_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let count = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{nanos}-{count}")
}

impl RequestCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            push_handler: None,
        }
    }

    /// Push frames seen while waiting on a response are handed to
    /// `handler` instead of being dropped
    pub fn set_push_handler(&mut self, handler: PushHandler) {
        self.push_handler = Some(handler);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub async fn send_request(
        &mut self,
        conn: &mut TransportConnection,
        command: &str,
        condition: &str,
        objects: Vec<ObjectQuery>,
    ) -> Result<String, RequestError> {
        let message_id = next_message_id();
        let text = Request {
            message_id: message_id.clone(),
            command: command.to_string(),
            condition: condition.to_string(),
            object_list: objects,
        }
        .to_json()?;

        self.pending.insert(message_id.clone(), Instant::now());
        if let Err(e) = conn.send_text(&text).await {
            log::error!("Failed to send {command} ({message_id}): {e:}");
            self.pending.remove(&message_id);
            return Err(e.into());
        }
        log::trace!("Sent {command} ({message_id})");
        Ok(message_id)
    }

    pub async fn read_matching_response(
        &mut self,
        conn: &mut TransportConnection,
        expected_id: &str,
    ) -> Result<Response, RequestError> {
        let deadline = Instant::now() + self.config.read_deadline;
        let mut skipped = 0;

        loop {
            if skipped > self.config.max_skips {
                return Err(self.timed_out(conn, expected_id, skipped));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(conn, expected_id, skipped));
            }

            let text = match conn.recv_text(deadline - now).await {
                Ok(text) => text,
                Err(TransportError::Timeout(_)) => {
                    return Err(self.timed_out(conn, expected_id, skipped));
                }
                Err(e) => {
                    log::error!("Read failed waiting on {expected_id}: {e:}");
                    self.pending.remove(expected_id);
                    return Err(e.into());
                }
            };

            let resp = match Response::from_json(&text) {
                Ok(resp) => resp,
                Err(e) => {
                    log::warn!("Skipping undecodable frame while waiting on {expected_id}: {e:}");
                    log::debug!("Undecodable frame: {text}");
                    skipped += 1;
                    continue;
                }
            };

            if resp.message_id == expected_id {
                self.pending.remove(expected_id);
                return Ok(resp);
            }

            if resp.is_push() {
                skipped += 1;
                log::trace!("Push frame while waiting on {expected_id} ({skipped} skipped)");
                if let Some(handler) = self.push_handler.as_ref() {
                    handler(resp);
                }
                continue;
            }

            // The controller answered some other request on this
            // connection: everything after this point is out of step
            log::error!(
                "Message id mismatch: expected {expected_id}, received {}",
                resp.message_id
            );
            self.pending.remove(expected_id);
            conn.mark_disconnected();
            return Err(CorrelationError::Mismatch {
                expected: expected_id.to_string(),
                received: resp.message_id,
            }
            .into());
        }
    }

    fn timed_out(
        &mut self,
        conn: &mut TransportConnection,
        expected_id: &str,
        skipped: usize,
    ) -> RequestError {
        log::warn!("Gave up waiting on {expected_id} after {skipped} skipped frames");
        conn.mark_disconnected();
        CorrelationError::Timeout {
            expected: expected_id.to_string(),
            skipped,
        }
        .into()
    }

    /// Send + wait for the matching response, which must carry the
    /// success code
    pub async fn request(
        &mut self,
        conn: &mut TransportConnection,
        command: &str,
        condition: &str,
        objects: Vec<ObjectQuery>,
    ) -> Result<Response, RequestError> {
        let message_id = self.send_request(conn, command, condition, objects).await?;
        let resp = self.read_matching_response(conn, &message_id).await?;
        if !resp.is_success() {
            let code = resp.response_code.unwrap_or_default();
            log::warn!("{command} ({message_id}) rejected with {code}");
            return Err(CorrelationError::Protocol {
                code,
                description: resp.description,
            }
            .into());
        }
        Ok(resp)
    }

    /// Drops pending entries older than `max_age`, returning how many
    pub fn sweep_stale(&mut self, max_age: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|id, sent| {
            let age = sent.elapsed();
            if age > max_age {
                log::warn!("Request {id} never answered ({age:?} old)");
                false
            } else {
                true
            }
        });
        before - self.pending.len()
    }
}
