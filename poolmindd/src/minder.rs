use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::event::{EquipmentEvent, EventKind, Source, Update};
use crate::sink::{EventLog, MetricsSink};
use crate::state::EquipmentState;

/// [`PoolMinder`] is the single owner of [`EquipmentState`]: the push
/// and poll tasks only ever publish [`Update`]s to it, so no lock is
/// shared between them. Derived readings go to the [`MetricsSink`],
/// change events to the [`EventLog`].
pub struct PoolMinder {
    state: EquipmentState,
    metrics: Box<dyn MetricsSink>,
    events: Box<dyn EventLog>,
    /// Between a `Reset` (or startup) and the next `Initial`
    awaiting_initial: bool,
    resynchronizing: bool,
}

impl PoolMinder {
    pub fn new(metrics: Box<dyn MetricsSink>, events: Box<dyn EventLog>) -> Self {
        Self {
            state: EquipmentState::new(),
            metrics,
            events,
            awaiting_initial: true,
            resynchronizing: false,
        }
    }

    pub fn state(&self) -> &EquipmentState {
        &self.state
    }

    pub async fn run(mut self, updates: UnboundedReceiver<Update>, cancel: CancellationToken) {
        let mut updates = UnboundedReceiverStream::new(updates);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("State task cancelled");
                    break;
                }
                update = updates.next() => match update {
                    Some(update) => self.handle(update),
                    None => {
                        log::warn!("All update senders closed, state task exiting");
                        break;
                    }
                }
            }
        }
    }

    fn emit(&mut self, event: EquipmentEvent) {
        self.events.record(&event);
    }

    fn apply(&mut self, objects: &[poolmindp_wire::ObjectData], source: Source) {
        let applied = self.state.apply(objects, source);
        for reading in applied.readings.iter() {
            self.metrics.observe(reading);
        }
        for event in applied.events {
            self.emit(event);
        }
    }

    pub fn handle(&mut self, update: Update) {
        match update {
            Update::FeatureFlags(flags) => self.state.set_feature_flags(flags),
            Update::Reset => {
                log::warn!("Resetting equipment state");
                self.state.reset();
                self.awaiting_initial = true;
                self.resynchronizing = true;
            }
            Update::Initial { source, objects } => {
                if self.resynchronizing {
                    self.emit(EquipmentEvent::new(source, EventKind::Resynchronized));
                    self.resynchronizing = false;
                }
                self.apply(&objects, source);
                self.state.mark_initial_done();
                self.awaiting_initial = false;
                log::info!("Initial snapshot applied ({} objects)", objects.len());
            }
            _ if self.awaiting_initial => {
                log::debug!("Dropping update while awaiting initial snapshot");
            }
            Update::Push(objects) => self.apply(&objects, Source::Push),
            Update::PollCycle { objects, failed } => {
                self.apply(&objects, Source::Poll);
                if !failed && self.state.changes() == 0 {
                    self.emit(EquipmentEvent::new(Source::Poll, EventKind::NoChanges));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChannelEventLog, LogMetricsSink};
    use poolmindp_wire::ObjectData;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn minder() -> (PoolMinder, UnboundedReceiver<EquipmentEvent>) {
        let (tx, rx) = unbounded_channel();
        (
            PoolMinder::new(Box::new(LogMetricsSink), Box::new(ChannelEventLog::new(tx))),
            rx,
        )
    }

    fn pump(rpm: &str) -> Vec<ObjectData> {
        vec![ObjectData::new(
            "PMP01",
            &[("OBJTYP", "PUMP"), ("SNAME", "Filter"), ("RPM", rpm)],
        )]
    }

    fn drain(rx: &mut UnboundedReceiver<EquipmentEvent>) -> Vec<EventKind> {
        let mut kinds = vec![];
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[test]
    fn push_change_then_quiet_poll() {
        let (mut minder, mut rx) = minder();
        minder.handle(Update::Initial {
            source: Source::Poll,
            objects: pump("1800"),
        });
        assert_eq!(drain(&mut rx).len(), 1);

        minder.handle(Update::Push(vec![ObjectData::new("PMP01", &[("RPM", "2400")])]));
        minder.handle(Update::PollCycle {
            objects: pump("2400"),
            failed: false,
        });

        let events = {
            let mut events = vec![];
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            events
        };
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].source, Source::Push);
        assert!(matches!(events[0].kind, EventKind::Changed { .. }));
        assert_eq!(events[1].source, Source::Poll);
        assert_eq!(events[1].kind, EventKind::NoChanges);
    }

    #[test]
    fn failed_cycle_is_not_reported_as_quiet() {
        let (mut minder, mut rx) = minder();
        minder.handle(Update::Initial {
            source: Source::Poll,
            objects: pump("1800"),
        });
        drain(&mut rx);
        minder.handle(Update::PollCycle {
            objects: vec![],
            failed: true,
        });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn updates_dropped_until_fresh_snapshot() {
        let (mut minder, mut rx) = minder();
        minder.handle(Update::Push(pump("1000")));
        assert!(drain(&mut rx).is_empty());

        minder.handle(Update::Initial {
            source: Source::Poll,
            objects: pump("1800"),
        });
        drain(&mut rx);

        minder.handle(Update::Reset);
        minder.handle(Update::PollCycle {
            objects: pump("2400"),
            failed: false,
        });
        assert!(drain(&mut rx).is_empty());
        assert!(!minder.state().is_initial_done());

        minder.handle(Update::Initial {
            source: Source::Push,
            objects: pump("2400"),
        });
        let kinds = drain(&mut rx);
        assert_eq!(kinds[0], EventKind::Resynchronized);
        assert_eq!(
            kinds[1],
            EventKind::Detected {
                key: "pump_speed:PMP01".to_string(),
                value: "2400".to_string()
            }
        );
    }
}
