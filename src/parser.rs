//! powermetrics record decoding
//!
//! Turns one [`RawRecord`] into a [`ParsedSample`]: every known field that is present and
//! of the expected type, nothing else. Absent or mistyped fields are `None`; only a record
//! that is not a property-list dictionary at all is an error.
//!
//! Field layout (per sampler set and hardware generation):
//!
//! ```text
//! timestamp           date
//! elapsed_ns          integer
//! thermal_pressure    string   (thermal sampler)
//! processor
//!   clusters[]        name, freq_hz, idle_ratio, cpus[] { cpu, freq_hz, idle_ratio }
//!   cpu_power | cpu_energy, gpu_power | gpu_energy, ane_power | ane_energy
//!   combined_power
//! gpu                 freq_hz (MHz despite the name), idle_ratio
//! ```

use crate::error::{Error, Result};
use crate::profile::CoreKind;
use crate::stream::RawRecord;
use plist::{Dictionary, Value};
use serde::Serialize;
use std::fmt;
use std::io::Cursor;
use std::time::{Duration, SystemTime};

/// Thermal pressure level, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub enum ThermalPressure {
    #[default]
    Nominal,
    Moderate,
    Heavy,
    Trapping,
    Sleeping,
}

impl ThermalPressure {
    /// Parse the reported level; older releases use Fair/Serious/Critical
    pub fn from_reported(s: &str) -> Option<Self> {
        match s.trim() {
            "Nominal" => Some(Self::Nominal),
            "Moderate" | "Fair" => Some(Self::Moderate),
            "Heavy" | "Serious" => Some(Self::Heavy),
            "Trapping" | "Critical" => Some(Self::Trapping),
            "Sleeping" => Some(Self::Sleeping),
            _ => None,
        }
    }

    pub fn is_nominal(&self) -> bool {
        *self == Self::Nominal
    }
}

impl fmt::Display for ThermalPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Nominal => "Nominal",
            Self::Moderate => "Moderate",
            Self::Heavy => "Heavy",
            Self::Trapping => "Trapping",
            Self::Sleeping => "Sleeping",
        };
        f.write_str(s)
    }
}

/// Per-CPU fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCpu {
    pub cpu: Option<u32>,
    pub freq_hz: Option<f64>,
    pub idle_ratio: Option<f64>,
}

/// Per-cluster fields
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCluster {
    pub name: String,
    pub kind: CoreKind,
    pub freq_hz: Option<f64>,
    pub idle_ratio: Option<f64>,
    pub cpus: Vec<ParsedCpu>,
}

/// Power rails in milliwatts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPower {
    pub package_mw: Option<f64>,
    pub cpu_mw: Option<f64>,
    pub gpu_mw: Option<f64>,
    pub ane_mw: Option<f64>,
}

/// Decoded fields of one record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSample {
    pub timestamp: Option<SystemTime>,
    pub elapsed: Option<Duration>,
    pub thermal_pressure: Option<ThermalPressure>,
    /// Clusters in the order reported; unrecognized cluster names are dropped
    pub clusters: Vec<ParsedCluster>,
    pub gpu_freq_mhz: Option<f64>,
    pub gpu_idle_ratio: Option<f64>,
    pub power: ParsedPower,
}

/// Decode one record
pub fn parse_record(record: &RawRecord) -> Result<ParsedSample> {
    let bytes = trim_leading_whitespace(record.as_bytes());
    if bytes.is_empty() {
        return Err(Error::Parse("empty record".into()));
    }

    let value = Value::from_reader(Cursor::new(bytes))
        .map_err(|e| Error::Parse(format!("plist: {}", e)))?;
    let dict = value
        .as_dictionary()
        .ok_or_else(|| Error::Parse("record is not a dictionary".into()))?;

    Ok(parse_dictionary(dict))
}

fn parse_dictionary(dict: &Dictionary) -> ParsedSample {
    let mut sample = ParsedSample {
        timestamp: dict.get("timestamp").and_then(date),
        elapsed: dict
            .get("elapsed_ns")
            .and_then(number)
            .filter(|ns| *ns > 0.0)
            .map(|ns| Duration::from_nanos(ns as u64)),
        ..Default::default()
    };

    if let Some(Value::String(level)) = dict.get("thermal_pressure") {
        sample.thermal_pressure = ThermalPressure::from_reported(level);
        if sample.thermal_pressure.is_none() {
            log::debug!("Unknown thermal pressure level '{}'", level);
        }
    }

    if let Some(Value::Dictionary(processor)) = dict.get("processor") {
        if let Some(Value::Array(clusters)) = processor.get("clusters") {
            sample.clusters = clusters
                .iter()
                .filter_map(Value::as_dictionary)
                .filter_map(parse_cluster)
                .collect();
        }

        sample.power = ParsedPower {
            package_mw: processor.get("combined_power").and_then(number),
            cpu_mw: rail(processor, "cpu", sample.elapsed),
            gpu_mw: rail(processor, "gpu", sample.elapsed),
            ane_mw: rail(processor, "ane", sample.elapsed),
        };
    }

    if let Some(Value::Dictionary(gpu)) = dict.get("gpu") {
        sample.gpu_freq_mhz = gpu.get("freq_hz").and_then(number);
        sample.gpu_idle_ratio = gpu.get("idle_ratio").and_then(number).and_then(ratio);
    }

    sample
}

fn parse_cluster(cluster: &Dictionary) -> Option<ParsedCluster> {
    let name = cluster.get("name").and_then(Value::as_string)?;
    let Some(kind) = CoreKind::from_cluster_name(name) else {
        log::debug!("Ignoring unrecognized cluster '{}'", name);
        return None;
    };

    let cpus = match cluster.get("cpus") {
        Some(Value::Array(cpus)) => cpus
            .iter()
            .filter_map(Value::as_dictionary)
            .map(|cpu| ParsedCpu {
                cpu: cpu
                    .get("cpu")
                    .and_then(Value::as_unsigned_integer)
                    .and_then(|n| u32::try_from(n).ok()),
                freq_hz: cpu.get("freq_hz").and_then(number),
                idle_ratio: cpu.get("idle_ratio").and_then(number).and_then(ratio),
            })
            .collect(),
        _ => Vec::new(),
    };

    Some(ParsedCluster {
        name: name.to_string(),
        kind,
        freq_hz: cluster.get("freq_hz").and_then(number),
        idle_ratio: cluster.get("idle_ratio").and_then(number).and_then(ratio),
        cpus,
    })
}

/// Instantaneous rail power in mW
///
/// `<rail>_power` is already mW. Older releases only report `<rail>_energy`, the mJ spent
/// over the sample, which needs the sample's elapsed time to become a rate.
fn rail(processor: &Dictionary, rail: &str, elapsed: Option<Duration>) -> Option<f64> {
    if let Some(mw) = processor.get(&format!("{}_power", rail)).and_then(number) {
        return Some(mw);
    }
    let mj = processor.get(&format!("{}_energy", rail)).and_then(number)?;
    let secs = elapsed?.as_secs_f64();
    Some(mj / secs)
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Real(f) if f.is_finite() => Some(*f),
        Value::Integer(i) => i
            .as_signed()
            .map(|n| n as f64)
            .or_else(|| i.as_unsigned().map(|n| n as f64)),
        _ => None,
    }
}

fn ratio(value: f64) -> Option<f64> {
    (0.0..=1.0).contains(&value).then_some(value)
}

fn date(value: &Value) -> Option<SystemTime> {
    match value {
        Value::Date(d) => Some(SystemTime::from(d.clone())),
        _ => None,
    }
}

fn trim_leading_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}
