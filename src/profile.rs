//! Hardware profile resolution
//!
//! Maps the detected chip brand string (e.g. `Apple M2 Pro`) to a static profile: power
//! ceilings, core-cluster layout and memory bandwidth. The profile is resolved once at
//! startup and re-validated whenever the sampler is restarted; it is never mutated.
//!
//! Power ceilings follow asitop/fluidtop's table.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::process::Command;
use std::sync::OnceLock;

/// ANE power ceiling in watts, shared by every generation
pub const ANE_MAX_POWER_W: f64 = 8.0;

/// Apple Silicon generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChipFamily {
    M1,
    M2,
    M3,
    M4,
    /// An M-series part newer than the table
    Unlisted(u8),
}

/// Die configuration within a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChipTier {
    Base,
    Pro,
    Max,
    Ultra,
    /// A die suffix the table does not know
    Unlisted,
}

/// CPU core kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CoreKind {
    /// Efficiency cores (E-cores)
    Efficiency,
    /// Performance cores (P-cores)
    Performance,
}

impl CoreKind {
    /// Classify a powermetrics cluster name (`E-Cluster`, `P0-Cluster`, ...)
    pub fn from_cluster_name(name: &str) -> Option<Self> {
        match name.chars().next() {
            Some('E') => Some(CoreKind::Efficiency),
            Some('P') => Some(CoreKind::Performance),
            _ => None,
        }
    }

    pub fn short(&self) -> &'static str {
        match self {
            CoreKind::Efficiency => "E",
            CoreKind::Performance => "P",
        }
    }
}

/// One CPU cluster as declared by the profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClusterSpec {
    pub kind: CoreKind,
    /// Cores in this cluster
    pub cores: usize,
}

/// Static description of the monitored SoC
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareProfile {
    /// Brand string as reported by the OS
    pub name: String,
    pub family: ChipFamily,
    pub tier: ChipTier,
    /// CPU power ceiling in watts
    pub cpu_max_power_w: f64,
    /// GPU power ceiling in watts
    pub gpu_max_power_w: f64,
    /// ANE power ceiling in watts
    pub ane_max_power_w: f64,
    /// Cluster layout, efficiency clusters first
    pub clusters: Vec<ClusterSpec>,
    /// GPU core count, when known
    pub gpu_cores: Option<u32>,
    /// Unified memory bandwidth ceiling in GB/s
    pub memory_bandwidth_gbps: f64,
    /// True when the chip was not in the table and generic limits are used
    pub fallback: bool,
}

/// Table row: (family, tier, cpu W, gpu W, E clusters x size, P clusters x size, GB/s)
type Entry = (ChipFamily, ChipTier, f64, f64, (usize, usize), (usize, usize), f64);

const TABLE: &[Entry] = &[
    (ChipFamily::M1, ChipTier::Base, 20.0, 20.0, (1, 4), (1, 4), 68.0),
    (ChipFamily::M1, ChipTier::Pro, 30.0, 30.0, (1, 2), (2, 4), 200.0),
    (ChipFamily::M1, ChipTier::Max, 30.0, 60.0, (1, 2), (2, 4), 400.0),
    (ChipFamily::M1, ChipTier::Ultra, 60.0, 120.0, (2, 2), (4, 4), 800.0),
    (ChipFamily::M2, ChipTier::Base, 25.0, 15.0, (1, 4), (1, 4), 100.0),
    (ChipFamily::M2, ChipTier::Pro, 30.0, 19.0, (1, 4), (2, 4), 200.0),
    (ChipFamily::M2, ChipTier::Max, 38.0, 38.0, (1, 4), (2, 4), 400.0),
    (ChipFamily::M2, ChipTier::Ultra, 76.0, 76.0, (2, 4), (4, 4), 800.0),
    (ChipFamily::M3, ChipTier::Base, 22.0, 13.0, (1, 4), (1, 4), 100.0),
    (ChipFamily::M3, ChipTier::Pro, 37.0, 19.0, (1, 6), (1, 6), 150.0),
    (ChipFamily::M3, ChipTier::Max, 54.0, 47.0, (1, 4), (2, 6), 400.0),
    (ChipFamily::M3, ChipTier::Ultra, 108.0, 94.0, (2, 4), (4, 6), 819.0),
    (ChipFamily::M4, ChipTier::Base, 22.0, 13.0, (1, 6), (1, 4), 120.0),
    (ChipFamily::M4, ChipTier::Pro, 42.0, 23.0, (1, 4), (2, 5), 273.0),
    (ChipFamily::M4, ChipTier::Max, 68.0, 57.0, (1, 4), (2, 6), 546.0),
    (ChipFamily::M4, ChipTier::Ultra, 136.0, 114.0, (2, 4), (4, 6), 1092.0),
];

impl HardwareProfile {
    /// Resolve a profile from a brand string
    ///
    /// Listed chips get their table entry. An unlisted Apple M-series part gets generic
    /// 20 W / 20 W limits and a single-cluster layout. Anything else is not Apple Silicon
    /// and cannot be monitored.
    pub fn from_brand(brand: &str) -> Result<Self> {
        let name = brand.trim();
        let (family, tier) = parse_brand(name).ok_or_else(|| {
            Error::UnsupportedHardware(format!("'{}' is not an Apple Silicon chip", name))
        })?;

        let entry = TABLE
            .iter()
            .find(|(f, t, ..)| *f == family && *t == tier);

        let profile = match entry {
            Some(&(_, _, cpu_w, gpu_w, (e_n, e_size), (p_n, p_size), bandwidth)) => Self {
                name: name.to_string(),
                family,
                tier,
                cpu_max_power_w: cpu_w,
                gpu_max_power_w: gpu_w,
                ane_max_power_w: ANE_MAX_POWER_W,
                clusters: layout(e_n, e_size, p_n, p_size),
                gpu_cores: None,
                memory_bandwidth_gbps: bandwidth,
                fallback: false,
            },
            None => {
                log::warn!("{} is not in the chip table, using generic power limits", name);
                Self {
                    name: name.to_string(),
                    family,
                    tier,
                    cpu_max_power_w: 20.0,
                    gpu_max_power_w: 20.0,
                    ane_max_power_w: ANE_MAX_POWER_W,
                    clusters: layout(1, 4, 1, 4),
                    gpu_cores: None,
                    memory_bandwidth_gbps: 100.0,
                    fallback: true,
                }
            }
        };

        Ok(profile)
    }

    /// Override the table layout with core counts reported by the OS
    ///
    /// Binned parts (e.g. an 8-core M1 Pro) have fewer cores than the table assumes. The
    /// table's cluster count is kept and the detected cores are spread across it.
    pub fn with_core_counts(mut self, efficiency: Option<usize>, performance: Option<usize>) -> Self {
        for (kind, detected) in [
            (CoreKind::Efficiency, efficiency),
            (CoreKind::Performance, performance),
        ] {
            let Some(total) = detected else { continue };
            if total == 0 || total == self.core_count(kind) {
                continue;
            }
            let n = self.clusters.iter().filter(|c| c.kind == kind).count().max(1);
            let mut remaining = total;
            let mut sizes = Vec::with_capacity(n);
            for i in 0..n {
                let size = remaining.div_ceil(n - i);
                sizes.push(size);
                remaining -= size;
            }
            let others: Vec<ClusterSpec> = self
                .clusters
                .iter()
                .copied()
                .filter(|c| c.kind != kind)
                .collect();
            let ours = sizes
                .into_iter()
                .filter(|&cores| cores > 0)
                .map(|cores| ClusterSpec { kind, cores });
            self.clusters = match kind {
                CoreKind::Efficiency => ours.chain(others).collect(),
                CoreKind::Performance => others.into_iter().chain(ours).collect(),
            };
        }
        self
    }

    pub fn with_gpu_cores(mut self, gpu_cores: Option<u32>) -> Self {
        self.gpu_cores = gpu_cores;
        self
    }

    /// Total cores of one kind
    pub fn core_count(&self, kind: CoreKind) -> usize {
        self.clusters
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.cores)
            .sum()
    }

    /// Package ceiling used for the total power gauge
    pub fn package_max_power_w(&self) -> f64 {
        self.cpu_max_power_w + self.gpu_max_power_w + self.ane_max_power_w
    }
}

impl fmt::Display for HardwareProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (cores: {}E+{}P",
            self.name,
            self.core_count(CoreKind::Efficiency),
            self.core_count(CoreKind::Performance)
        )?;
        if let Some(gpu) = self.gpu_cores {
            write!(f, "+{}GPU", gpu)?;
        }
        write!(f, ")")
    }
}

fn layout(e_n: usize, e_size: usize, p_n: usize, p_size: usize) -> Vec<ClusterSpec> {
    let e = std::iter::repeat(ClusterSpec {
        kind: CoreKind::Efficiency,
        cores: e_size,
    })
    .take(e_n);
    let p = std::iter::repeat(ClusterSpec {
        kind: CoreKind::Performance,
        cores: p_size,
    })
    .take(p_n);
    e.chain(p).collect()
}

/// Parse `Apple M<n>[ Pro| Max| Ultra]`
fn parse_brand(name: &str) -> Option<(ChipFamily, ChipTier)> {
    let rest = name.strip_prefix("Apple M")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let generation: u8 = digits.parse().ok()?;
    let family = match generation {
        1 => ChipFamily::M1,
        2 => ChipFamily::M2,
        3 => ChipFamily::M3,
        4 => ChipFamily::M4,
        n => ChipFamily::Unlisted(n),
    };
    let tier = match rest[digits.len()..].trim() {
        "" => ChipTier::Base,
        "Pro" => ChipTier::Pro,
        "Max" => ChipTier::Max,
        "Ultra" => ChipTier::Ultra,
        _ => ChipTier::Unlisted,
    };
    Some((family, tier))
}

/// Profile lookup, honoring an optional brand override
///
/// The GPU core count needs a slow `system_profiler` run; it is queried once per resolver
/// and reused when the profile is re-validated.
#[derive(Debug, Clone, Default)]
pub struct ProfileResolver {
    chip_override: Option<String>,
    gpu_cores: OnceLock<Option<u32>>,
}

impl ProfileResolver {
    pub fn new(chip_override: Option<String>) -> Self {
        Self {
            chip_override,
            gpu_cores: OnceLock::new(),
        }
    }

    /// Resolve the profile for this machine
    pub fn resolve(&self) -> Result<HardwareProfile> {
        if let Some(brand) = &self.chip_override {
            log::debug!("Using chip override '{}'", brand);
            return HardwareProfile::from_brand(brand);
        }
        self.detect()
    }

    /// Query the OS for the chip identity
    #[cfg(target_os = "macos")]
    pub fn detect(&self) -> Result<HardwareProfile> {
        let output = Command::new("sysctl")
            .args(["-n", "machdep.cpu.brand_string"])
            .output()
            .map_err(|e| Error::Spawn {
                program: "sysctl".into(),
                source: e,
            })?;
        let brand = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let profile = HardwareProfile::from_brand(&brand)?
            .with_core_counts(
                get_sysctl_value("hw.perflevel1.logicalcpu"),
                get_sysctl_value("hw.perflevel0.logicalcpu"),
            )
            .with_gpu_cores(self.cached_gpu_cores(get_gpu_cores));

        Ok(profile)
    }

    #[cfg(not(target_os = "macos"))]
    pub fn detect(&self) -> Result<HardwareProfile> {
        Err(Error::UnsupportedPlatform(
            "chip detection requires macOS; set hardware.chip_override".into(),
        ))
    }

    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    fn cached_gpu_cores(&self, query: impl FnOnce() -> Option<u32>) -> Option<u32> {
        *self.gpu_cores.get_or_init(query)
    }
}

/// Get sysctl value as usize
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn get_sysctl_value(key: &str) -> Option<usize> {
    let output = Command::new("sysctl").args(["-n", key]).output().ok()?;
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

/// Get GPU core count from system_profiler
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn get_gpu_cores() -> Option<u32> {
    let output = Command::new("system_profiler")
        .args(["-detailLevel", "basic", "SPDisplaysDataType"])
        .output()
        .ok()?;

    parse_gpu_cores(&String::from_utf8_lossy(&output.stdout))
}

fn parse_gpu_cores(text: &str) -> Option<u32> {
    text.lines()
        .find(|line| line.contains("Total Number of Cores"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|cores| cores.trim().parse().ok())
}
