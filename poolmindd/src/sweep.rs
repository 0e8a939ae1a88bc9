//! The queries making up one full observation of the controller
use std::collections::HashMap;

use poolmind_broker::{RequestCorrelator, RequestError, TransportConnection};
use poolmindp_wire::{
    command, key, objtyp, ObjectData, ObjectQuery, ALL_OBJECTS, FEATURE_PREFIX, SYSTEM_OBJECT,
};

/// One category of equipment and the params asked for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepQuery {
    pub name: &'static str,
    pub condition: String,
    pub objects: Vec<ObjectQuery>,
}

impl SweepQuery {
    fn of_type(name: &'static str, typ: &str, keys: &[&str]) -> Self {
        Self {
            name,
            condition: format!("{}={typ}", key::OBJTYP),
            objects: vec![ObjectQuery::new(ALL_OBJECTS, keys)],
        }
    }
}

pub fn queries() -> Vec<SweepQuery> {
    use key::*;
    vec![
        SweepQuery {
            name: "system",
            condition: String::new(),
            objects: vec![ObjectQuery::new(SYSTEM_OBJECT, &[FREEZE])],
        },
        SweepQuery::of_type(
            "bodies",
            objtyp::BODY,
            &[OBJTYP, SUBTYP, SNAME, STATUS, TEMP, HTMODE, HTSRC, LOTMP, HITMP],
        ),
        SweepQuery::of_type("heaters", objtyp::HEATER, &[OBJTYP, SUBTYP, SNAME, STATUS]),
        SweepQuery::of_type(
            "pumps",
            objtyp::PUMP,
            &[OBJTYP, SUBTYP, SNAME, STATUS, RPM, GPM, WATTS],
        ),
        SweepQuery::of_type(
            "circuits",
            objtyp::CIRCUIT,
            &[OBJTYP, SUBTYP, SNAME, STATUS, FREEZE],
        ),
        SweepQuery::of_type("sensors", objtyp::SENSOR, &[OBJTYP, SUBTYP, SNAME, PROBE]),
        SweepQuery {
            name: "all",
            condition: String::new(),
            objects: vec![ObjectQuery::new(ALL_OBJECTS, &[OBJTYP, SUBTYP, SNAME, STATUS])],
        },
    ]
}

#[derive(Debug, Default)]
pub struct Sweep {
    pub objects: Vec<ObjectData>,
    /// First failing query, if any; later queries were not sent
    pub error: Option<(&'static str, RequestError)>,
}

impl Sweep {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Runs every query in order, stopping at the first failure and
/// keeping what was collected before it
pub async fn sweep(correlator: &mut RequestCorrelator, conn: &mut TransportConnection) -> Sweep {
    let mut result = Sweep::default();
    for query in queries() {
        match correlator
            .request(
                conn,
                command::GET_PARAM_LIST,
                &query.condition,
                query.objects.clone(),
            )
            .await
        {
            Ok(resp) => {
                log::trace!("{} query: {} objects", query.name, resp.object_list.len());
                result.objects.extend(resp.object_list);
            }
            Err(e) => {
                log::warn!("{} query failed, ending sweep early: {e:}", query.name);
                result.error = Some((query.name, e));
                break;
            }
        }
    }
    result
}

/// objnam -> menu flag for every feature circuit
pub async fn load_feature_flags(
    correlator: &mut RequestCorrelator,
    conn: &mut TransportConnection,
) -> Result<HashMap<String, String>, RequestError> {
    let resp = correlator
        .request(
            conn,
            command::GET_PARAM_LIST,
            &format!("{}={}", key::OBJTYP, objtyp::CIRCUIT),
            vec![ObjectQuery::new(ALL_OBJECTS, &[key::SNAME, key::SHOMNU])],
        )
        .await?;

    let flags = resp
        .object_list
        .into_iter()
        .filter(|o| o.object_name.starts_with(FEATURE_PREFIX))
        .map(|o| {
            let flag = o.get(key::SHOMNU).unwrap_or_default().to_string();
            (o.object_name, flag)
        })
        .collect::<HashMap<_, _>>();
    log::info!("Loaded menu flags for {} features", flags.len());
    Ok(flags)
}

/// Push subscription covering every object seen in a sweep, asking
/// for the params that matter for its type
pub fn subscription(objects: &[ObjectData]) -> Vec<ObjectQuery> {
    use key::*;
    let mut seen = std::collections::BTreeMap::new();
    for obj in objects {
        let keys: &[&str] = match obj.object_type() {
            Some(objtyp::BODY) => &[TEMP, HTMODE, HTSRC, LOTMP, HITMP, STATUS],
            Some(objtyp::HEATER) => &[STATUS],
            Some(objtyp::PUMP) => &[RPM, GPM, WATTS, STATUS],
            Some(objtyp::CIRCUIT) => &[STATUS, FREEZE],
            Some(objtyp::SENSOR) => &[PROBE],
            None if obj.object_name == SYSTEM_OBJECT => &[FREEZE],
            _ => continue,
        };
        seen.entry(obj.object_name.clone())
            .or_insert_with(|| ObjectQuery::new(&obj.object_name, keys));
    }
    seen.into_values().collect()
}
