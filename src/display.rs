//! Text and JSON rendering of the published view
//!
//! Stands in for a full dashboard: one screen of gauges redrawn per refresh, or one JSON
//! object per line for piping into other tools.

use crate::config::DisplayConfig;
use crate::error::{Error, Result};
use crate::extract::{Field, MetricSnapshot, Provenance};
use crate::memory::{gib, MemoryInfo};
use crate::profile::CoreKind;
use crate::sampler::SamplerState;
use crate::view::View;
use crossterm::style::{Color, Stylize};
use crossterm::{cursor, queue, terminal};
use std::io::Write;
use std::str::FromStr;

const BAR_WIDTH: usize = 30;

/// Output mode of the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!("unknown output format '{}'", other))),
        }
    }
}

/// Color theme by index: 0 disables color, 1-8 pick a terminal color
fn theme_color(index: u8) -> Option<Color> {
    match index {
        1 => Some(Color::Red),
        2 => Some(Color::Green),
        3 => Some(Color::Yellow),
        4 => Some(Color::Blue),
        5 => Some(Color::Magenta),
        6 => Some(Color::Cyan),
        7 => Some(Color::White),
        8 => Some(Color::Grey),
        _ => None,
    }
}

pub struct Renderer {
    format: OutputFormat,
    color: Option<Color>,
    show_cores: bool,
}

impl Renderer {
    pub fn new(config: &DisplayConfig) -> Result<Self> {
        Ok(Self {
            format: config.format.parse()?,
            color: theme_color(config.color),
            show_cores: config.show_cores,
        })
    }

    /// Draw one frame
    pub fn draw(&self, out: &mut impl Write, view: &View) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let line = serde_json::to_string(view)
                    .map_err(|e| Error::Unsupported(format!("JSON output: {}", e)))?;
                writeln!(out, "{}", line)?;
            }
            OutputFormat::Text => {
                queue!(
                    out,
                    terminal::Clear(terminal::ClearType::All),
                    cursor::MoveTo(0, 0)
                )?;
                for line in self.lines(view) {
                    writeln!(out, "{}", line)?;
                }
            }
        }
        out.flush()?;
        Ok(())
    }

    /// The text frame, one entry per line
    pub fn lines(&self, view: &View) -> Vec<String> {
        let mut lines = vec![self.header(view)];

        let Some(snapshot) = view.snapshot.as_deref() else {
            lines.push(format!("Waiting for samples ({})", state_name(view.sampler.state)));
            return lines;
        };

        lines.push(String::new());
        for (label, kind) in [("E-CPU", CoreKind::Efficiency), ("P-CPU", CoreKind::Performance)] {
            if let Some(summary) = snapshot.summary(kind) {
                lines.push(self.gauge(
                    label,
                    summary.active_percent,
                    format!("{:.1}% @ {:.0} MHz", summary.active_percent, summary.freq_mhz),
                ));
            }
            if self.show_cores {
                lines.extend(core_lines(snapshot, kind));
            }
        }
        lines.push(self.gauge(
            "GPU",
            snapshot.gpu_active_percent.value,
            format!(
                "{:.1}%{} @ {:.0} MHz",
                snapshot.gpu_active_percent.value,
                marker(&snapshot.gpu_active_percent),
                snapshot.gpu_freq_mhz.value
            ),
        ));
        lines.push(self.gauge(
            "ANE",
            snapshot.ane_active_percent.value,
            format!(
                "{:.1}%{} ({:.2} W)",
                snapshot.ane_active_percent.value,
                marker(&snapshot.ane_active_percent),
                snapshot.power.ane_mw.value / 1000.0
            ),
        ));
        if let Some(memory) = &view.memory {
            lines.push(self.memory_line(memory));
        }

        lines.push(String::new());
        lines.push(self.power_line(
            "CPU power",
            &snapshot.power.cpu_mw,
            view.averages.cpu_mw,
            view.peaks.cpu_mw,
            view.gauges.cpu_percent,
        ));
        lines.push(self.power_line(
            "GPU power",
            &snapshot.power.gpu_mw,
            view.averages.gpu_mw,
            view.peaks.gpu_mw,
            view.gauges.gpu_percent,
        ));
        lines.push(self.power_line(
            "Package",
            &snapshot.power.package_mw,
            view.averages.package_mw,
            view.peaks.package_mw,
            view.gauges.package_percent,
        ));

        lines.push(String::new());
        let thermal = if view.throttle.throttled {
            format!("THROTTLED ({})", view.throttle.severity)
                .with(Color::Red)
                .to_string()
        } else {
            format!("{}", snapshot.thermal_pressure.value)
        };
        lines.push(format!("Thermal: {}", thermal));
        lines.push(format!(
            "Sampler: {} (generation {}, {} planned / {} failed restarts)",
            state_name(view.sampler.state),
            view.sampler.generation,
            view.sampler.planned_restarts,
            view.sampler.failed_restarts
        ));
        lines
    }

    fn header(&self, view: &View) -> String {
        let mut header = format!("asmon  {}", view.profile);
        if let Some(snapshot) = &view.snapshot {
            let at = chrono::DateTime::<chrono::Local>::from(snapshot.timestamp);
            header.push_str(&format!("  {}", at.format("%H:%M:%S")));
        }
        if view.health.is_degraded() {
            let reason = match (view.health.degraded, view.health.flapping) {
                (true, true) => "unparsable records, sampler flapping",
                (true, false) => "unparsable records",
                _ => "sampler flapping",
            };
            let flag = format!("  [DEGRADED: {}]", reason);
            header.push_str(&flag.with(Color::Red).to_string());
        }
        header
    }

    fn gauge(&self, label: &str, percent: f64, detail: String) -> String {
        format!("{:<10}{}  {}", label, self.paint(bar(percent, BAR_WIDTH)), detail)
    }

    fn power_line(
        &self,
        label: &str,
        now: &Field<f64>,
        average: Option<f64>,
        peak: f64,
        percent: f64,
    ) -> String {
        let average = average
            .map(|mw| format!("{:.2} W", mw / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{:<10}{}  {:.2} W{}  (avg {}, peak {:.2} W)",
            label,
            self.paint(bar(percent, BAR_WIDTH)),
            now.value / 1000.0,
            marker(now),
            average,
            peak / 1000.0
        )
    }

    fn memory_line(&self, memory: &MemoryInfo) -> String {
        let swap = if memory.swap_active() {
            format!("swap {:.1}/{:.1} GB", gib(memory.swap.used), gib(memory.swap.total))
        } else {
            "swap inactive".to_string()
        };
        self.gauge(
            "RAM",
            memory.ram_usage_percent(),
            format!(
                "{:.1}/{:.1} GB - {}",
                gib(memory.ram.used),
                gib(memory.ram.total),
                swap
            ),
        )
    }

    fn paint(&self, s: String) -> String {
        match self.color {
            Some(color) => s.with(color).to_string(),
            None => s,
        }
    }
}

fn core_lines(snapshot: &MetricSnapshot, kind: CoreKind) -> Vec<String> {
    snapshot
        .cores(kind)
        .map(|core| {
            format!(
                "  {}{:<3} {:>5.1}%{} @ {:.0} MHz",
                kind.short(),
                core.cpu.value,
                core.active_percent.value,
                marker(&core.active_percent),
                core.freq_mhz.value
            )
        })
        .collect()
}

/// Suffix for values that were not freshly reported
fn marker<T>(field: &Field<T>) -> &'static str {
    match field.provenance {
        Provenance::Fresh => "",
        Provenance::Stale => "*",
        Provenance::Provisional => "?",
    }
}

fn bar(percent: f64, width: usize) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * width as f64).round() as usize;
    format!("[{}{}]", "#".repeat(filled), ".".repeat(width - filled))
}

fn state_name(state: SamplerState) -> &'static str {
    match state {
        SamplerState::Starting => "starting",
        SamplerState::Running => "running",
        SamplerState::Restarting => "restarting",
        SamplerState::Stopped => "stopped",
        SamplerState::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregator;
    use crate::extract::Extractor;
    use crate::parser::fixtures::{base_time, encode, record};
    use crate::parser::parse_record;
    use crate::profile::HardwareProfile;
    use std::sync::Arc;
    use std::time::Duration;

    fn renderer(format: &str, show_cores: bool) -> Renderer {
        Renderer::new(&DisplayConfig {
            color: 0,
            show_cores,
            format: format.into(),
            ..DisplayConfig::default()
        })
        .unwrap()
    }

    fn view() -> View {
        let profile = Arc::new(HardwareProfile::from_brand("Apple M1").unwrap());
        let mut extractor = Extractor::new(Arc::clone(&profile), true);
        let mut aggregator = Aggregator::new(Duration::from_secs(30), Duration::from_secs(3));
        let sample = parse_record(&encode(record(1, 4000.0))).unwrap();
        let mut view = View::new(profile);
        view.apply(aggregator.ingest(extractor.extract(&sample, base_time(1))));
        view
    }

    #[test]
    fn test_bar() {
        assert_eq!(bar(50.0, 10), "[#####.....]");
        assert_eq!(bar(150.0, 4), "[####]");
        assert_eq!(bar(-1.0, 4), "[....]");
    }

    #[test]
    fn test_text_frame() {
        let lines = renderer("text", false).lines(&view());
        assert!(lines[0].starts_with("asmon  Apple M1 (cores: 4E+4P)"));
        assert!(lines.iter().any(|l| l.starts_with("E-CPU") && l.contains("25.0% @ 1000 MHz")));
        assert!(lines.iter().any(|l| l.starts_with("Package") && l.contains("4.00 W")));
        assert!(lines.iter().any(|l| l == "Thermal: Nominal"));
        assert!(!lines.iter().any(|l| l.starts_with("  E0")));
    }

    #[test]
    fn test_memory_line() {
        use crate::memory::{RamInfo, SwapInfo};

        assert!(!renderer("text", false).lines(&view()).iter().any(|l| l.starts_with("RAM")));

        let mut view = view();
        view.memory = Some(MemoryInfo {
            ram: RamInfo {
                total: 16 << 30,
                used: 12 << 30,
            },
            swap: SwapInfo::default(),
        });
        let lines = renderer("text", false).lines(&view);
        let ram = lines.iter().find(|l| l.starts_with("RAM")).unwrap();
        assert!(ram.ends_with("12.0/16.0 GB - swap inactive"));

        view.memory = Some(MemoryInfo {
            swap: SwapInfo {
                total: 2 << 30,
                used: 1 << 29,
            },
            ..view.memory.unwrap()
        });
        let lines = renderer("text", false).lines(&view);
        assert!(lines.iter().any(|l| l.ends_with("swap 0.5/2.0 GB")));
    }

    #[test]
    fn test_text_frame_with_cores() {
        let lines = renderer("text", true).lines(&view());
        assert_eq!(lines.iter().filter(|l| l.starts_with("  E")).count(), 4);
        assert_eq!(lines.iter().filter(|l| l.starts_with("  P")).count(), 4);
    }

    #[test]
    fn test_waiting_frame() {
        let profile = Arc::new(HardwareProfile::from_brand("Apple M2").unwrap());
        let lines = renderer("text", false).lines(&View::new(profile));
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("Waiting for samples"));
    }

    #[test]
    fn test_json_output() {
        let mut out = Vec::new();
        renderer("json", false).draw(&mut out, &view()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["snapshot"]["sequence"], 1);
    }

    #[test]
    fn test_unknown_format_rejected() {
        assert!("yaml".parse::<OutputFormat>().is_err());
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
    }
}
