//! CLI tool for Apple Silicon Monitor (asmon)

#[cfg(feature = "cli")]
use clap::Parser;
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "asmon")]
#[command(about = "Apple Silicon Monitor: CPU, GPU, ANE, power and thermal telemetry from powermetrics", long_about = None)]
#[command(version)]
struct Cli {
    /// Sampling interval in seconds (0 samples once per display refresh)
    #[arg(short, long)]
    interval: Option<f64>,

    /// Color theme, 0 (no color) to 8
    #[arg(short, long)]
    color: Option<u8>,

    /// Power averaging window in seconds
    #[arg(short, long)]
    avg: Option<u64>,

    /// Show per-core utilization and frequency
    #[arg(long)]
    show_cores: bool,

    /// Restart powermetrics after this many samples (0 = never)
    #[arg(long)]
    max_count: Option<u64>,

    /// Configuration file (default: ~/.config/asmon/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(short, long)]
    format: Option<String>,
}

#[cfg(feature = "cli")]
impl Cli {
    /// Config file settings with the command-line flags layered on top
    fn load_config(&self) -> asmon::Result<asmon::Config> {
        let mut config = match &self.config {
            Some(path) => asmon::Config::load_from(path)?,
            None => asmon::Config::load()?,
        };

        if let Some(secs) = self.interval {
            if !secs.is_finite() || secs < 0.0 {
                return Err(asmon::Error::Config(format!(
                    "--interval must be a non-negative number of seconds, got {}",
                    secs
                )));
            }
            config.sampler.interval_ms = (secs * 1000.0).round() as u64;
            if config.sampler.interval_ms > 0 {
                config.display.refresh_ms = config.sampler.interval_ms;
            }
        }
        if let Some(color) = self.color {
            config.display.color = color;
        }
        if let Some(avg) = self.avg {
            config.aggregation.power_window_secs = avg;
        }
        if self.show_cores {
            config.display.show_cores = true;
        }
        if let Some(max_count) = self.max_count {
            config.sampler.max_sample_count = max_count;
        }
        if let Some(format) = &self.format {
            config.display.format = format.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(feature = "cli")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use asmon::display::Renderer;
    use asmon::{Monitor, SamplerState};
    use std::sync::mpsc::{self, RecvTimeoutError};

    let cli = Cli::parse();

    env_logger::init();

    let config = cli.load_config()?;
    let renderer = Renderer::new(&config.display)?;

    let monitor = match Monitor::start(&config) {
        Ok(monitor) => monitor,
        Err(e) => {
            log::error!("Cannot start monitoring: {}", e);
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;

    let on_demand = config.sampler.interval_ms == 0;
    let refresh = config.display.refresh();
    let stdout = std::io::stdout();

    loop {
        if on_demand {
            if let Err(e) = monitor.sample_now() {
                log::debug!("Sample request not delivered: {}", e);
            }
        }

        match shutdown_rx.recv_timeout(refresh) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("Shutting down");
                monitor.stop()?;
                break;
            }
        }

        let view = monitor.latest();
        renderer.draw(&mut stdout.lock(), &view)?;

        if monitor.is_finished() && view.sampler.state == SamplerState::Failed {
            monitor.stop()?;
            return Err("powermetrics could not be restarted".into());
        }
    }

    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Build with --features cli");
    std::process::exit(1);
}
