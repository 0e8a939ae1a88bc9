use std::fmt;
use tokio::sync::mpsc::UnboundedSender;

use crate::event::{EquipmentEvent, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Temperature,
    PumpSpeed,
    PumpPower,
    PumpFlow,
    Circuit,
    Thermal,
    Feature,
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Temperature => "temperature",
            Category::PumpSpeed => "pump_speed",
            Category::PumpPower => "pump_power",
            Category::PumpFlow => "pump_flow",
            Category::Circuit => "circuit",
            Category::Thermal => "thermal",
            Category::Feature => "feature",
            Category::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One derived observation of one piece of equipment
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub category: Category,
    /// Controller object name
    pub entity_id: String,
    pub display_name: String,
    pub value: f64,
    /// Human form of `value` (e.g. "Heating"), also what change
    /// detection compares
    pub display_value: String,
    pub labels: Vec<(String, String)>,
}

impl Reading {
    pub fn new(category: Category, entity_id: &str, display_name: &str, value: f64) -> Self {
        Self {
            category,
            entity_id: entity_id.to_string(),
            display_name: display_name.to_string(),
            value,
            display_value: format_value(value),
            labels: Vec::new(),
        }
    }

    pub fn with_display_value(mut self, display_value: &str) -> Self {
        self.display_value = display_value.to_string();
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    /// Change detection key
    pub fn key(&self) -> String {
        format!("{}:{}", self.category, self.entity_id)
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

/// Where derived readings go
pub trait MetricsSink: Send {
    fn observe(&mut self, reading: &Reading);
}

/// Where change events go
pub trait EventLog: Send {
    fn record(&mut self, event: &EquipmentEvent);
}

/// Writes every reading to the debug log
#[derive(Debug, Default)]
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn observe(&mut self, reading: &Reading) {
        log::debug!(
            "{} {} ({}) = {} {:?}",
            reading.category,
            reading.entity_id,
            reading.display_name,
            reading.value,
            reading.labels
        );
    }
}

/// Tagged log lines, one per event
#[derive(Debug, Default)]
pub struct LogEventLog;

impl EventLog for LogEventLog {
    fn record(&mut self, event: &EquipmentEvent) {
        match event.kind {
            EventKind::NoChanges => log::debug!("{event:}"),
            EventKind::Resynchronized => log::warn!("{event:}"),
            _ => log::info!("{event:}"),
        }
    }
}

/// Forwards events to a channel (e.g. for a front end or tests)
#[derive(Debug)]
pub struct ChannelEventLog {
    tx: UnboundedSender<EquipmentEvent>,
}

impl ChannelEventLog {
    pub fn new(tx: UnboundedSender<EquipmentEvent>) -> Self {
        Self { tx }
    }
}

impl EventLog for ChannelEventLog {
    fn record(&mut self, event: &EquipmentEvent) {
        if let Err(e) = self.tx.send(event.clone()) {
            log::error!("Event receiver dropped {e:}");
        }
    }
}
