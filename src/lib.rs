//! # Apple Silicon Monitor (asmon)
//!
//! Live CPU, GPU, ANE, power and thermal telemetry for Apple Silicon Macs, sampled from
//! `powermetrics` and turned into stable, time-windowed metrics for display.
//!
//! ## Pipeline
//!
//! ```text
//! Supervisor -> RecordReader -> parse_record -> Extractor -> Aggregator -> ViewPublisher
//! ```
//!
//! - [`sampler`]: launches `powermetrics`, restarts it on exit, forwards control signals
//! - [`stream`]: splits the NUL-delimited output into records
//! - [`parser`]: decodes one property-list record, tolerating missing fields
//! - [`extract`]: builds a snapshot with carry-forward for absent fields
//! - [`aggregate`]: rolling power averages and a debounced throttle indicator
//! - [`view`]: the copy-on-publish view the renderer reads
//! - [`memory`]: RAM and swap usage, polled beside the sampler
//!
//! ## Quick Start
//!
//! ```no_run
//! use asmon::{Config, Monitor};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let monitor = Monitor::start(&Config::load()?)?;
//!
//! for _ in 0..10 {
//!     std::thread::sleep(Duration::from_secs(1));
//!     let view = monitor.latest();
//!     if let Some(snapshot) = &view.snapshot {
//!         println!(
//!             "package {:.2} W (avg {:.2} W), throttled: {}",
//!             snapshot.power.package_mw.value / 1000.0,
//!             view.averages.package_mw.unwrap_or(0.0) / 1000.0,
//!             view.throttle.throttled
//!         );
//!     }
//! }
//! monitor.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` - the `asmon` binary and its text/JSON renderer
//!
//! `powermetrics` requires root; run the binary with `sudo`.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod extract;
pub mod memory;
pub mod parser;
pub mod pipeline;
pub mod profile;
pub mod sampler;
pub mod stream;
pub mod view;

#[cfg(feature = "cli")]
pub mod display; // Text and JSON renderer for the binary

pub use aggregate::{Aggregator, PowerAverages, PowerPeaks, PowerRail, ThrottleState};
pub use config::Config;
pub use error::{Error, Result};
pub use extract::{Extractor, Field, MetricSnapshot, Provenance};
pub use memory::{MemoryInfo, MemoryPoller};
pub use parser::{parse_record, ParsedSample, ThermalPressure};
pub use pipeline::Pipeline;
pub use profile::{CoreKind, HardwareProfile, ProfileResolver};
pub use sampler::{SamplerCommand, SamplerState, SamplerStatus, Supervisor, SupervisorHandle};
pub use stream::{RawRecord, RecordReader};
pub use view::{Health, View, ViewReader};

use std::sync::Arc;

/// A running pipeline: supervised sampler plus the view it publishes
pub struct Monitor {
    supervisor: SupervisorHandle,
    memory: MemoryPoller,
    reader: ViewReader,
}

impl Monitor {
    /// Resolve the hardware profile and start sampling with `powermetrics`
    ///
    /// Fails on the fatal conditions: invalid configuration, unsupported hardware,
    /// missing privilege, or a sampler that cannot be launched.
    pub fn start(config: &Config) -> Result<Self> {
        Self::with_command(config, SamplerCommand::powermetrics(&config.sampler))
    }

    /// Start with an explicit sampler command, e.g. one replaying a capture
    pub fn with_command(config: &Config, command: SamplerCommand) -> Result<Self> {
        config.validate()?;

        let resolver = ProfileResolver::new(config.hardware.chip_override.clone());
        let profile = resolver.resolve()?;
        log::info!("Monitoring {}", profile);

        let pipeline = Pipeline::new(config, resolver, profile);
        let reader = pipeline.reader();
        let memory = MemoryPoller::start(pipeline.publisher(), config.display.refresh())?;
        let supervisor = Supervisor::start(command, &config.sampler, &config.restart, pipeline)?;

        Ok(Self {
            supervisor,
            memory,
            reader,
        })
    }

    /// The latest published view
    pub fn latest(&self) -> Arc<View> {
        self.reader.latest()
    }

    /// A reader for use on another thread
    pub fn reader(&self) -> ViewReader {
        self.reader.clone()
    }

    /// Request an immediate sample
    pub fn sample_now(&self) -> Result<()> {
        self.supervisor.sample_now()
    }

    /// Request the sampler to flush buffered output
    pub fn flush(&self) -> Result<()> {
        self.supervisor.flush()
    }

    /// Whether sampling has ended on its own (restart failure)
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Stop the sampler; no records are ingested after this returns
    pub fn stop(self) -> Result<()> {
        self.supervisor.stop()?;
        self.memory.stop()
    }
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
