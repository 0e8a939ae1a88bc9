use chrono::{DateTime, Utc};
use poolmindp_wire::ObjectData;
use std::collections::HashMap;
use std::fmt;

/// Which path observed a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Push,
    Poll,
}

impl Source {
    pub fn tag(&self) -> &'static str {
        match self {
            Source::Push => "[PUSH]",
            Source::Poll => "[POLL]",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Messages from the connection tasks to the state task
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// objnam -> menu flag for every feature circuit, loaded once
    FeatureFlags(HashMap<String, String>),
    /// State must be rebuilt; everything up to the next `Initial` is
    /// dropped
    Reset,
    Initial {
        source: Source,
        objects: Vec<ObjectData>,
    },
    PollCycle {
        objects: Vec<ObjectData>,
        /// At least one query of the cycle failed
        failed: bool,
    },
    Push(Vec<ObjectData>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Detected { key: String, value: String },
    Changed { key: String, old: String, new: String },
    NoChanges,
    Resynchronized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquipmentEvent {
    pub source: Source,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl EquipmentEvent {
    pub fn new(source: Source, kind: EventKind) -> Self {
        Self {
            source,
            at: Utc::now(),
            kind,
        }
    }
}

impl fmt::Display for EquipmentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::Detected { key, value } => {
                write!(f, "{} Detected {key} = {value}", self.source)
            }
            EventKind::Changed { key, old, new } => {
                write!(f, "{} Changed {key}: {old} -> {new}", self.source)
            }
            EventKind::NoChanges => write!(f, "{} No changes", self.source),
            EventKind::Resynchronized => write!(f, "{} Resynchronized after reconnect", self.source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_source_tag() {
        let event = EquipmentEvent::new(
            Source::Push,
            EventKind::Changed {
                key: "pump_speed:PMP01".to_string(),
                old: "1800".to_string(),
                new: "2400".to_string(),
            },
        );
        assert_eq!(event.to_string(), "[PUSH] Changed pump_speed:PMP01: 1800 -> 2400");
        assert_eq!(
            EquipmentEvent::new(Source::Poll, EventKind::NoChanges).to_string(),
            "[POLL] No changes"
        );
    }
}
