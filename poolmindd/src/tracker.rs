use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// First sight of the key during the initial snapshot
    Detected,
    Changed { old: String },
    Unchanged,
    /// First sight of the key after the initial snapshot; recorded
    /// without an event
    Recorded,
}

/// Last seen value per key, used to turn repeated full observations
/// into change events
#[derive(Debug, Default)]
pub struct StateTracker {
    values: HashMap<String, String>,
    initial_done: bool,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, key: &str, value: &str) -> Observation {
        match self.values.get_mut(key) {
            Some(prev) if prev == value => Observation::Unchanged,
            Some(prev) => {
                let old = std::mem::replace(prev, value.to_string());
                Observation::Changed { old }
            }
            None => {
                self.values.insert(key.to_string(), value.to_string());
                if self.initial_done {
                    log::debug!("New key {key} = {value} after initial snapshot");
                    Observation::Recorded
                } else {
                    Observation::Detected
                }
            }
        }
    }

    pub fn mark_initial_done(&mut self) {
        self.initial_done = true;
    }

    pub fn is_initial_done(&self) -> bool {
        self.initial_done
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn reset(&mut self) {
        self.values.clear();
        self.initial_done = false;
    }
}
