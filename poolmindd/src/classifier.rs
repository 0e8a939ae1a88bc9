//! Pure mapping from raw controller params to equipment states
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use poolmindp_wire::ON;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Not a number: {0:?}")]
    InvalidNumber(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThermalStatus {
    Off,
    Idle,
    Cooling,
    Heating,
}

impl ThermalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThermalStatus::Off => "Off",
            ThermalStatus::Heating => "Heating",
            ThermalStatus::Idle => "Idle",
            ThermalStatus::Cooling => "Cooling",
        }
    }

    /// Gauge value exported for the status
    pub fn value(&self) -> f64 {
        match self {
            ThermalStatus::Off => 0.0,
            ThermalStatus::Heating => 1.0,
            ThermalStatus::Idle => 2.0,
            ThermalStatus::Cooling => 3.0,
        }
    }

    pub fn is_heating(&self) -> bool {
        *self == ThermalStatus::Heating
    }
}

impl fmt::Display for ThermalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitStatus {
    Off,
    On,
    /// On because freeze protection turned it on
    FreezeProtected,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Off => "Off",
            CircuitStatus::On => "On",
            CircuitStatus::FreezeProtected => "On (freeze)",
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            CircuitStatus::Off => 0.0,
            CircuitStatus::On => 1.0,
            CircuitStatus::FreezeProtected => 2.0,
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_on(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case(ON)
}

pub fn parse_number(raw: &str) -> Result<f64, ParseError> {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::InvalidNumber(raw.to_string())),
    }
}

/// Heating demand of a body from its heater mode code
pub fn thermal_status(ht_mode: i64, temp: f64, low: f64, high: f64) -> ThermalStatus {
    match ht_mode {
        0 if low <= temp && temp <= high => ThermalStatus::Idle,
        0 => ThermalStatus::Off,
        1 | 4 => ThermalStatus::Heating,
        9 => ThermalStatus::Cooling,
        _ => ThermalStatus::Off,
    }
}

/// Status of a heater no body points at: borrow the heating flag of a
/// body whose name overlaps the heater's, else trust the heater's own
/// on/off param
pub fn unreferenced_heater_status(
    heater_name: &str,
    raw_status: Option<&str>,
    body_heating: &BTreeMap<String, bool>,
) -> ThermalStatus {
    let heater = heater_name.to_lowercase();
    let matched = body_heating.iter().find(|(body, _)| {
        let body = body.to_lowercase();
        !body.is_empty() && (heater.contains(&body) || body.contains(&heater))
    });

    match matched {
        Some((_, true)) => ThermalStatus::Heating,
        Some((_, false)) => ThermalStatus::Off,
        None if raw_status.map(is_on).unwrap_or(false) => ThermalStatus::Heating,
        None => ThermalStatus::Off,
    }
}

pub fn circuit_status(raw: &str, freeze_active: bool, circuit_freeze: bool) -> CircuitStatus {
    match is_on(raw) {
        true if freeze_active && circuit_freeze => CircuitStatus::FreezeProtected,
        true => CircuitStatus::On,
        false => CircuitStatus::Off,
    }
}

// NOTE: this is a name heuristic (display name containing "heat"),
// unlike every other classification here which relies on the
// controller's type metadata. Kept for compatibility with existing
// dashboards that expect heat circuits to follow heating demand.
pub fn is_heat_circuit(display_name: &str) -> bool {
    display_name.to_lowercase().contains("heat")
}

/// Heating flag of the body a heat circuit belongs to (the body whose
/// name appears in the circuit name)
pub fn heat_circuit_demand(
    circuit_name: &str,
    body_heating: &BTreeMap<String, bool>,
) -> Option<bool> {
    let circuit = circuit_name.to_lowercase();
    body_heating
        .iter()
        .find(|(body, _)| !body.is_empty() && circuit.contains(&body.to_lowercase()))
        .map(|(_, heating)| *heating)
}

/// Features are shown only when their menu flag carries the `w` marker
pub fn feature_visible(flag: &str) -> bool {
    flag.trim().ends_with('w')
}

/// Heater object a body points at, if any
pub fn heater_assignment(htsrc: &str) -> Option<&str> {
    let htsrc = htsrc.trim();
    if htsrc.is_empty() || htsrc.chars().all(|c| c == '0') {
        return None;
    }
    Some(htsrc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thermal_modes() {
        assert_eq!(thermal_status(0, 80.0, 75.0, 85.0), ThermalStatus::Idle);
        assert_eq!(thermal_status(0, 75.0, 75.0, 85.0), ThermalStatus::Idle);
        assert_eq!(thermal_status(0, 70.0, 75.0, 85.0), ThermalStatus::Off);
        assert_eq!(thermal_status(1, 70.0, 75.0, 85.0), ThermalStatus::Heating);
        assert_eq!(thermal_status(4, 90.0, 75.0, 85.0), ThermalStatus::Heating);
        assert_eq!(thermal_status(9, 90.0, 75.0, 85.0), ThermalStatus::Cooling);
        assert_eq!(thermal_status(99, 80.0, 75.0, 85.0), ThermalStatus::Off);
    }

    #[test]
    fn circuit_tri_state() {
        assert_eq!(circuit_status("ON", true, true), CircuitStatus::FreezeProtected);
        assert_eq!(circuit_status("ON", true, false), CircuitStatus::On);
        assert_eq!(circuit_status("ON", false, true), CircuitStatus::On);
        assert_eq!(circuit_status("OFF", true, true), CircuitStatus::Off);
        assert_eq!(circuit_status("", false, false), CircuitStatus::Off);
    }

    #[test]
    fn unreferenced_heater_fallbacks() {
        let mut bodies = BTreeMap::new();
        bodies.insert("Spa".to_string(), true);
        bodies.insert("Pool".to_string(), false);

        assert_eq!(
            unreferenced_heater_status("SPA HEATER", Some("OFF"), &bodies),
            ThermalStatus::Heating
        );
        assert_eq!(
            unreferenced_heater_status("Pool Heater", Some("ON"), &bodies),
            ThermalStatus::Off
        );
        assert_eq!(
            unreferenced_heater_status("Solar", Some("ON"), &bodies),
            ThermalStatus::Heating
        );
        assert_eq!(
            unreferenced_heater_status("Solar", None, &bodies),
            ThermalStatus::Off
        );
    }

    #[test]
    fn heat_circuits_follow_body_demand() {
        let mut bodies = BTreeMap::new();
        bodies.insert("Spa".to_string(), true);
        assert!(is_heat_circuit("Spa Heat"));
        assert!(!is_heat_circuit("Spa Light"));
        assert_eq!(heat_circuit_demand("Spa Heat", &bodies), Some(true));
        assert_eq!(heat_circuit_demand("Pool Heat", &bodies), None);
    }

    #[test]
    fn feature_flags_and_assignments() {
        assert!(feature_visible("fcsrtvhlw"));
        assert!(!feature_visible("fcsrtvhl"));
        assert!(!feature_visible(""));

        assert_eq!(heater_assignment("H0001"), Some("H0001"));
        assert_eq!(heater_assignment(""), None);
        assert_eq!(heater_assignment("00000"), None);
        assert_eq!(heater_assignment("0"), None);
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_number(" 82 "), Ok(82.0));
        assert_eq!(parse_number("2400.5"), Ok(2400.5));
        assert!(parse_number("--").is_err());
        assert!(parse_number("NaN").is_err());
    }
}
