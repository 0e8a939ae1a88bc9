use std::collections::{BTreeMap, HashMap, HashSet};

use poolmindp_wire::{key, objtyp, subtyp, ObjectData, FEATURE_PREFIX, SYSTEM_OBJECT};

use crate::classifier::{
    circuit_status, feature_visible, heat_circuit_demand, heater_assignment, is_heat_circuit,
    is_on, parse_number, thermal_status, unreferenced_heater_status, CircuitStatus,
    ThermalStatus,
};
use crate::event::{EquipmentEvent, EventKind, Source};
use crate::sink::{Category, Reading};
use crate::tracker::{Observation, StateTracker};

/// Object types the controller reports that carry nothing we export
const IGNORED_TYPES: &[&str] = &[
    "CIRCGRP", "CLOCK", "EXTINSTR", "MODULE", "PANEL", "PERMIT", "PRESS", "REMOTE", "SCHED",
    "STATUS", "VALVE",
];

fn of_type<'a>(
    objects: &'a BTreeMap<String, ObjectData>,
    typ: &'static str,
) -> impl Iterator<Item = &'a ObjectData> {
    objects.values().filter(move |o| o.object_type() == Some(typ))
}

/// The join between a water body and the heater it points at
#[derive(Debug, Clone, PartialEq)]
pub struct BodyHeaterInfo {
    pub body_name: String,
    pub body_id: String,
    pub heater_id: String,
    pub ht_mode: i64,
    pub current_temp: f64,
    pub low_setpoint: f64,
    pub high_setpoint: f64,
}

/// Output of one [`EquipmentState::apply`]
#[derive(Debug, Default)]
pub struct Applied {
    pub readings: Vec<Reading>,
    pub events: Vec<EquipmentEvent>,
}

/// Everything known about the equipment: the raw params last seen for
/// every object plus the readings derived from them. Each update is
/// folded into the raw view, then all readings are derived again from
/// scratch and diffed against the [`StateTracker`].
#[derive(Debug, Default)]
pub struct EquipmentState {
    objects: BTreeMap<String, ObjectData>,
    pub temperatures: HashMap<String, f64>,
    pub pump_speeds: HashMap<String, f64>,
    pub pump_power: HashMap<String, f64>,
    pub pump_flow: HashMap<String, f64>,
    pub circuits: HashMap<String, CircuitStatus>,
    pub thermal: HashMap<String, ThermalStatus>,
    pub features: HashMap<String, CircuitStatus>,
    pub unknown: HashMap<String, HashMap<String, String>>,
    pub body_heaters: Vec<BodyHeaterInfo>,
    body_heating: BTreeMap<String, bool>,
    freeze_active: bool,
    feature_flags: HashMap<String, String>,
    logged_parse_errors: HashSet<String>,
    logged_hidden_features: HashSet<String>,
    changes: usize,
    tracker: StateTracker,
}

impl EquipmentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Menu flags survive [`reset`](Self::reset): they are only loaded
    /// once
    pub fn set_feature_flags(&mut self, flags: HashMap<String, String>) {
        self.feature_flags = flags;
    }

    pub fn changes(&self) -> usize {
        self.changes
    }

    pub fn freeze_active(&self) -> bool {
        self.freeze_active
    }

    pub fn is_initial_done(&self) -> bool {
        self.tracker.is_initial_done()
    }

    pub fn mark_initial_done(&mut self) {
        self.tracker.mark_initial_done();
    }

    pub fn object(&self, name: &str) -> Option<&ObjectData> {
        self.objects.get(name)
    }

    pub fn reset(&mut self) {
        let feature_flags = std::mem::take(&mut self.feature_flags);
        *self = Self {
            feature_flags,
            ..Default::default()
        };
    }

    pub fn apply(&mut self, objects: &[ObjectData], source: Source) -> Applied {
        self.changes = 0;
        for obj in objects {
            self.objects
                .entry(obj.object_name.clone())
                .and_modify(|known| known.merge(obj))
                .or_insert_with(|| obj.clone());
        }

        let readings = self.derive();
        let mut events = vec![];
        for reading in readings.iter() {
            let key = reading.key();
            match self.tracker.observe(&key, &reading.display_value) {
                Observation::Detected => events.push(EquipmentEvent::new(
                    source,
                    EventKind::Detected {
                        key,
                        value: reading.display_value.clone(),
                    },
                )),
                Observation::Changed { old } => {
                    self.changes += 1;
                    events.push(EquipmentEvent::new(
                        source,
                        EventKind::Changed {
                            key,
                            old,
                            new: reading.display_value.clone(),
                        },
                    ));
                }
                Observation::Unchanged | Observation::Recorded => {}
            }
        }

        Applied { readings, events }
    }

    fn number(&mut self, obj: &ObjectData, param: &str) -> Option<f64> {
        let raw = obj.get(param)?;
        match parse_number(raw) {
            Ok(v) => Some(v),
            Err(e) => {
                let id = format!("{}.{}", obj.object_name, param);
                if self.logged_parse_errors.insert(id.clone()) {
                    log::warn!("Skipping {id}: {e:}");
                }
                None
            }
        }
    }

    fn derive(&mut self) -> Vec<Reading> {
        self.temperatures.clear();
        self.pump_speeds.clear();
        self.pump_power.clear();
        self.pump_flow.clear();
        self.circuits.clear();
        self.thermal.clear();
        self.features.clear();
        self.unknown.clear();
        self.body_heaters.clear();
        self.body_heating.clear();

        let objects = std::mem::take(&mut self.objects);
        self.freeze_active = objects
            .values()
            .filter(|o| {
                o.object_name == SYSTEM_OBJECT || o.object_type() == Some(objtyp::SYSTEM)
            })
            .any(|o| o.get(key::FREEZE).map(is_on).unwrap_or(false));

        let mut readings = vec![];

        // heater id -> (most active status, body)
        let mut referenced: BTreeMap<String, (ThermalStatus, String)> = BTreeMap::new();
        for body in of_type(&objects, objtyp::BODY) {
            self.body(body, &mut referenced, &mut readings);
        }

        for (heater_id, (status, body)) in referenced.iter() {
            let name = objects
                .get(heater_id)
                .map(|h| h.name().to_string())
                .unwrap_or_else(|| heater_id.clone());
            self.thermal.insert(heater_id.clone(), *status);
            readings.push(
                Reading::new(Category::Thermal, heater_id, &name, status.value())
                    .with_display_value(status.as_str())
                    .with_label("body", body),
            );
        }

        for heater in of_type(&objects, objtyp::HEATER) {
            if referenced.contains_key(&heater.object_name) {
                continue;
            }
            let status =
                unreferenced_heater_status(heater.name(), heater.get(key::STATUS), &self.body_heating);
            self.thermal.insert(heater.object_name.clone(), status);
            readings.push(
                Reading::new(Category::Thermal, &heater.object_name, heater.name(), status.value())
                    .with_display_value(status.as_str()),
            );
        }

        for pump in of_type(&objects, objtyp::PUMP) {
            self.pump(pump, &mut readings);
        }

        for circuit in of_type(&objects, objtyp::CIRCUIT) {
            self.circuit(circuit, &mut readings);
        }

        for sensor in of_type(&objects, objtyp::SENSOR) {
            let kind = match sensor.get(key::SUBTYP) {
                Some(subtyp::AIR) => "air",
                Some(subtyp::SOLAR) => "solar",
                _ => continue,
            };
            let raw = if sensor.get(key::PROBE).is_some() {
                key::PROBE
            } else {
                key::TEMP
            };
            if let Some(temp) = self.number(sensor, raw) {
                self.temperatures.insert(sensor.object_name.clone(), temp);
                readings.push(
                    Reading::new(Category::Temperature, &sensor.object_name, sensor.name(), temp)
                        .with_label("kind", kind),
                );
            }
        }

        for obj in objects.values() {
            let Some(typ) = obj.object_type() else {
                continue;
            };
            if [
                objtyp::BODY,
                objtyp::HEATER,
                objtyp::PUMP,
                objtyp::CIRCUIT,
                objtyp::SENSOR,
                objtyp::SYSTEM,
            ]
            .contains(&typ)
                || IGNORED_TYPES.contains(&typ)
            {
                continue;
            }
            let status = obj.get(key::STATUS);
            let value = if status.map(is_on).unwrap_or(false) { 1.0 } else { 0.0 };
            self.unknown
                .insert(obj.object_name.clone(), obj.params.clone());
            readings.push(
                Reading::new(Category::Unknown, &obj.object_name, obj.name(), value)
                    .with_display_value(status.unwrap_or("present"))
                    .with_label("objtyp", typ),
            );
        }

        self.objects = objects;
        readings
    }

    fn body(
        &mut self,
        body: &ObjectData,
        referenced: &mut BTreeMap<String, (ThermalStatus, String)>,
        readings: &mut Vec<Reading>,
    ) {
        let name = body.name().to_string();
        let temp = self.number(body, key::TEMP);
        if let Some(temp) = temp {
            self.temperatures.insert(body.object_name.clone(), temp);
            readings.push(
                Reading::new(Category::Temperature, &body.object_name, &name, temp)
                    .with_label("kind", "body"),
            );
        }

        let Some(heater_id) = body.get(key::HTSRC).and_then(heater_assignment) else {
            return;
        };
        let ht_mode = self.number(body, key::HTMODE);
        let low = self.number(body, key::LOTMP);
        let high = self.number(body, key::HITMP);
        let (Some(temp), Some(ht_mode), Some(low), Some(high)) = (temp, ht_mode, low, high) else {
            return;
        };

        let info = BodyHeaterInfo {
            body_name: name.clone(),
            body_id: body.object_name.clone(),
            heater_id: heater_id.to_string(),
            ht_mode: ht_mode as i64,
            current_temp: temp,
            low_setpoint: low,
            high_setpoint: high,
        };
        let status = thermal_status(info.ht_mode, temp, low, high);
        self.body_heating.insert(name.clone(), status.is_heating());

        // Bodies sharing a heater: report the most active demand
        referenced
            .entry(info.heater_id.clone())
            .and_modify(|(current, owner)| {
                if status > *current {
                    *current = status;
                    owner.clone_from(&name);
                }
            })
            .or_insert((status, name));
        self.body_heaters.push(info);
    }

    fn pump(&mut self, pump: &ObjectData, readings: &mut Vec<Reading>) {
        for (param, category) in [
            (key::RPM, Category::PumpSpeed),
            (key::WATTS, Category::PumpPower),
            (key::GPM, Category::PumpFlow),
        ] {
            let Some(value) = self.number(pump, param) else {
                continue;
            };
            let map = match category {
                Category::PumpSpeed => &mut self.pump_speeds,
                Category::PumpPower => &mut self.pump_power,
                _ => &mut self.pump_flow,
            };
            map.insert(pump.object_name.clone(), value);
            readings.push(Reading::new(category, &pump.object_name, pump.name(), value));
        }
    }

    fn circuit(&mut self, circuit: &ObjectData, readings: &mut Vec<Reading>) {
        let raw = circuit.get(key::STATUS).unwrap_or_default();
        let circuit_freeze = circuit.get(key::FREEZE).map(is_on).unwrap_or(false);
        let id = &circuit.object_name;

        if id.starts_with(FEATURE_PREFIX) || self.feature_flags.contains_key(id) {
            let flag = self
                .feature_flags
                .get(id)
                .map(|f| f.as_str())
                .or(circuit.get(key::SHOMNU));
            if !flag.map(feature_visible).unwrap_or(false) {
                if self.logged_hidden_features.insert(id.clone()) {
                    log::info!("Feature {} ({id}) is hidden, not reporting it", circuit.name());
                }
                return;
            }
            let status = circuit_status(raw, self.freeze_active, circuit_freeze);
            self.features.insert(id.clone(), status);
            readings.push(
                Reading::new(Category::Feature, id, circuit.name(), status.value())
                    .with_display_value(status.as_str()),
            );
            return;
        }

        let name = circuit.name();
        let demand = if is_heat_circuit(name) {
            heat_circuit_demand(name, &self.body_heating)
        } else {
            None
        };
        let status = match demand {
            Some(true) => CircuitStatus::On,
            Some(false) => CircuitStatus::Off,
            None => circuit_status(raw, self.freeze_active, circuit_freeze),
        };
        self.circuits.insert(id.clone(), status);
        readings.push(
            Reading::new(Category::Circuit, id, name, status.value())
                .with_display_value(status.as_str()),
        );
    }
}
