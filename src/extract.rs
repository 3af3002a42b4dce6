//! Metric extraction and normalization
//!
//! Builds a canonical [`MetricSnapshot`] from a [`ParsedSample`] and the active
//! [`HardwareProfile`]. Each field is resolved on its own:
//!
//! 1. present in the sample: [`Provenance::Fresh`]
//! 2. absent, previous snapshot exists: carried forward, [`Provenance::Stale`]
//! 3. absent on the first tick: neutral default (zero, `Nominal`), [`Provenance::Provisional`]
//!
//! Cluster and core counts follow the profile layout. Extra reported clusters or cores are
//! truncated, missing ones are padded through the same resolution rules.

use crate::parser::{ParsedCluster, ParsedCpu, ParsedSample, ThermalPressure};
use crate::profile::{CoreKind, HardwareProfile};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Where a field value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Provenance {
    Fresh,
    Stale,
    Provisional,
}

/// A resolved metric value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Field<T> {
    pub value: T,
    pub provenance: Provenance,
}

impl<T: Copy> Field<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value,
            provenance: Provenance::Fresh,
        }
    }

    pub fn provisional(value: T) -> Self {
        Self {
            value,
            provenance: Provenance::Provisional,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.provenance == Provenance::Fresh
    }

    /// Resolve a field: fresh value, else the previous value, else the default
    fn resolve(current: Option<T>, previous: Option<&Field<T>>, default: T) -> Self {
        match (current, previous) {
            (Some(value), _) => Self::fresh(value),
            (None, Some(prev)) => Self {
                value: prev.value,
                provenance: match prev.provenance {
                    Provenance::Provisional => Provenance::Provisional,
                    _ => Provenance::Stale,
                },
            },
            (None, None) => Self::provisional(default),
        }
    }
}

/// One core's metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreMetrics {
    /// Logical CPU number
    pub cpu: Field<u32>,
    pub active_percent: Field<f64>,
    pub freq_mhz: Field<f64>,
    /// Fraction of the sample spent idle
    pub idle_residency: Field<f64>,
}

/// One cluster's metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterMetrics {
    pub kind: CoreKind,
    /// Index among clusters of the same kind
    pub index: usize,
    pub active_percent: Field<f64>,
    pub freq_mhz: Field<f64>,
    /// Empty unless per-core extraction is enabled
    pub cores: Vec<CoreMetrics>,
}

/// Power draw per rail in milliwatts
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerMetrics {
    pub package_mw: Field<f64>,
    pub cpu_mw: Field<f64>,
    pub gpu_mw: Field<f64>,
    pub ane_mw: Field<f64>,
}

/// Canonical metrics for one sampling tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    /// Position in the snapshot sequence, starting at 1
    pub sequence: u64,
    /// Record timestamp, or receipt time when the record carries none
    pub timestamp: SystemTime,
    /// Sample duration reported by the sampler
    pub elapsed: Option<Duration>,
    pub clusters: Vec<ClusterMetrics>,
    pub gpu_active_percent: Field<f64>,
    pub gpu_freq_mhz: Field<f64>,
    /// Derived from ANE power against the profile's ANE ceiling
    pub ane_active_percent: Field<f64>,
    pub power: PowerMetrics,
    pub thermal_pressure: Field<ThermalPressure>,
}

/// Average utilization and frequency across all clusters of one kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub active_percent: f64,
    pub freq_mhz: f64,
}

impl MetricSnapshot {
    /// Merge multi-cluster layouts (`P0-Cluster`, `P1-Cluster`, ...) into one figure
    pub fn summary(&self, kind: CoreKind) -> Option<ClusterSummary> {
        let clusters: Vec<&ClusterMetrics> =
            self.clusters.iter().filter(|c| c.kind == kind).collect();
        if clusters.is_empty() {
            return None;
        }
        let n = clusters.len() as f64;
        Some(ClusterSummary {
            active_percent: clusters.iter().map(|c| c.active_percent.value).sum::<f64>() / n,
            freq_mhz: clusters.iter().map(|c| c.freq_mhz.value).sum::<f64>() / n,
        })
    }

    pub fn cores(&self, kind: CoreKind) -> impl Iterator<Item = &CoreMetrics> {
        self.clusters
            .iter()
            .filter(move |c| c.kind == kind)
            .flat_map(|c| c.cores.iter())
    }
}

/// Snapshot builder holding the last emitted snapshot for carry-forward
pub struct Extractor {
    profile: Arc<HardwareProfile>,
    per_core: bool,
    previous: Option<MetricSnapshot>,
    sequence: u64,
}

impl Extractor {
    pub fn new(profile: Arc<HardwareProfile>, per_core: bool) -> Self {
        Self {
            profile,
            per_core,
            previous: None,
            sequence: 0,
        }
    }

    pub fn profile(&self) -> &Arc<HardwareProfile> {
        &self.profile
    }

    /// Swap the profile after re-validation; carry-forward state is kept when the layout
    /// is unchanged and reset otherwise
    pub fn set_profile(&mut self, profile: Arc<HardwareProfile>) {
        if profile.clusters != self.profile.clusters {
            self.previous = None;
        }
        self.profile = profile;
    }

    /// The last snapshot produced
    pub fn previous(&self) -> Option<&MetricSnapshot> {
        self.previous.as_ref()
    }

    /// Build the next snapshot
    pub fn extract(&mut self, sample: &ParsedSample, received_at: SystemTime) -> MetricSnapshot {
        let snapshot = build(
            &self.profile,
            self.per_core,
            sample,
            self.previous.as_ref(),
            self.sequence + 1,
            received_at,
        );
        self.sequence = snapshot.sequence;
        self.previous = Some(snapshot.clone());
        snapshot
    }
}

fn build(
    profile: &HardwareProfile,
    per_core: bool,
    sample: &ParsedSample,
    prev: Option<&MetricSnapshot>,
    sequence: u64,
    received_at: SystemTime,
) -> MetricSnapshot {
    let power = PowerMetrics {
        package_mw: Field::resolve(sample.power.package_mw, prev.map(|p| &p.power.package_mw), 0.0),
        cpu_mw: Field::resolve(sample.power.cpu_mw, prev.map(|p| &p.power.cpu_mw), 0.0),
        gpu_mw: Field::resolve(sample.power.gpu_mw, prev.map(|p| &p.power.gpu_mw), 0.0),
        ane_mw: Field::resolve(sample.power.ane_mw, prev.map(|p| &p.power.ane_mw), 0.0),
    };

    let ane_ceiling_mw = profile.ane_max_power_w * 1000.0;
    let ane_active_percent = Field {
        value: if ane_ceiling_mw > 0.0 {
            (power.ane_mw.value / ane_ceiling_mw * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        },
        provenance: power.ane_mw.provenance,
    };

    MetricSnapshot {
        sequence,
        timestamp: sample.timestamp.unwrap_or(received_at),
        elapsed: sample.elapsed,
        clusters: clusters(profile, per_core, sample, prev),
        gpu_active_percent: Field::resolve(
            sample.gpu_idle_ratio.map(active_percent),
            prev.map(|p| &p.gpu_active_percent),
            0.0,
        ),
        gpu_freq_mhz: Field::resolve(sample.gpu_freq_mhz, prev.map(|p| &p.gpu_freq_mhz), 0.0),
        ane_active_percent,
        power,
        thermal_pressure: Field::resolve(
            sample.thermal_pressure,
            prev.map(|p| &p.thermal_pressure),
            ThermalPressure::Nominal,
        ),
    }
}

fn clusters(
    profile: &HardwareProfile,
    per_core: bool,
    sample: &ParsedSample,
    prev: Option<&MetricSnapshot>,
) -> Vec<ClusterMetrics> {
    let mut out = Vec::with_capacity(profile.clusters.len());

    for kind in [CoreKind::Efficiency, CoreKind::Performance] {
        let reported: Vec<&ParsedCluster> =
            sample.clusters.iter().filter(|c| c.kind == kind).collect();
        let declared: Vec<usize> = profile
            .clusters
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.cores)
            .collect();

        if reported.len() > declared.len() {
            log::debug!(
                "{} reported {} {}-clusters, profile declares {}; truncating",
                profile.name,
                reported.len(),
                kind.short(),
                declared.len()
            );
        }

        for (index, &size) in declared.iter().enumerate() {
            let current = reported.get(index).copied();
            let previous = prev.and_then(|p| {
                p.clusters
                    .iter()
                    .find(|c| c.kind == kind && c.index == index)
            });

            let cores = if per_core {
                let cpus = current.map(|c| c.cpus.as_slice()).unwrap_or(&[]);
                let prev_cores = previous.map(|c| c.cores.as_slice()).unwrap_or(&[]);
                (0..size)
                    .map(|i| core(cpus.get(i), prev_cores.get(i)))
                    .collect()
            } else {
                Vec::new()
            };

            out.push(ClusterMetrics {
                kind,
                index,
                active_percent: Field::resolve(
                    current.and_then(|c| c.idle_ratio).map(active_percent),
                    previous.map(|c| &c.active_percent),
                    0.0,
                ),
                freq_mhz: Field::resolve(
                    current.and_then(|c| c.freq_hz).map(hz_to_mhz),
                    previous.map(|c| &c.freq_mhz),
                    0.0,
                ),
                cores,
            });
        }
    }

    out
}

fn core(current: Option<&ParsedCpu>, previous: Option<&CoreMetrics>) -> CoreMetrics {
    let idle = current.and_then(|c| c.idle_ratio);
    CoreMetrics {
        cpu: Field::resolve(current.and_then(|c| c.cpu), previous.map(|c| &c.cpu), 0),
        active_percent: Field::resolve(
            idle.map(active_percent),
            previous.map(|c| &c.active_percent),
            0.0,
        ),
        freq_mhz: Field::resolve(
            current.and_then(|c| c.freq_hz).map(hz_to_mhz),
            previous.map(|c| &c.freq_mhz),
            0.0,
        ),
        // neutral default: fully idle
        idle_residency: Field::resolve(idle, previous.map(|c| &c.idle_residency), 1.0),
    }
}

fn active_percent(idle_ratio: f64) -> f64 {
    ((1.0 - idle_ratio) * 100.0).clamp(0.0, 100.0)
}

fn hz_to_mhz(hz: f64) -> f64 {
    hz / 1_000_000.0
}
