//! Sampler command line and process handle

use crate::config::SamplerConfig;
use crate::error::{Error, Result};
use std::io;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

/// How to launch the sampler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerCommand {
    program: String,
    args: Vec<String>,
}

impl SamplerCommand {
    /// powermetrics invocation for the given settings
    ///
    /// `powermetrics --samplers <sets> -f plist -i <ms> [-n <count>]`, writing to stdout.
    pub fn powermetrics(config: &SamplerConfig) -> Self {
        let mut args = vec![
            "--samplers".to_string(),
            config.samplers.join(","),
            "-f".to_string(),
            "plist".to_string(),
            "-i".to_string(),
            config.interval_ms.to_string(),
        ];
        if config.max_sample_count > 0 {
            args.push("-n".to_string());
            args.push(config.max_sample_count.to_string());
        }
        Self {
            program: config.program.clone(),
            args,
        }
    }

    /// Arbitrary command, used for replaying captures and for tests
    pub fn custom<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Launch the sampler with stdout piped
    ///
    /// On Unix the sampler leads its own process group, so stop signals also reach any
    /// children it forks (a wrapper shell, for instance) that share its stdout.
    pub fn spawn(&self) -> Result<SamplerProcess> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => {
                    Error::PermissionDenied(format!("{}: {}", self.program, e))
                }
                _ => Error::Spawn {
                    program: self.program.clone(),
                    source: e,
                },
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Supervisor("sampler stdout was not captured".into()))?;

        log::info!("Started {} (pid {})", self, child.id());
        Ok(SamplerProcess {
            child,
            stdout: Some(stdout),
        })
    }
}

impl std::fmt::Display for SamplerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A running sampler and its output stream
pub struct SamplerProcess {
    child: Child,
    stdout: Option<ChildStdout>,
}

impl SamplerProcess {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Take the byte stream; `None` once taken
    pub fn take_stream(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Reap the process
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        self.stdout.take();
        self.child.wait()
    }

    /// Forced kill of the sampler and everything in its process group
    pub fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Ok(pid) = i32::try_from(self.child.id()) {
                if killpg(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
                    return Ok(());
                }
            }
        }
        self.child.kill()
    }
}

/// Fail early when the sampler needs root and we are not root
pub fn check_privilege(program: &str) -> Result<()> {
    #[cfg(unix)]
    {
        if !nix::unistd::geteuid().is_root() {
            return Err(Error::PermissionDenied(format!(
                "{} must be run as root (try sudo)",
                program
            )));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        Err(Error::UnsupportedPlatform(format!(
            "{} requires a Unix host",
            program
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_powermetrics_args() {
        let config = SamplerConfig::default();
        let cmd = SamplerCommand::powermetrics(&config);
        assert_eq!(cmd.program(), "powermetrics");
        assert_eq!(
            cmd.args(),
            &["--samplers", "cpu_power,gpu_power,thermal", "-f", "plist", "-i", "1000"]
        );

        let config = SamplerConfig {
            interval_ms: 250,
            max_sample_count: 50,
            ..SamplerConfig::default()
        };
        let cmd = SamplerCommand::powermetrics(&config);
        assert_eq!(&cmd.args()[4..], &["-i", "250", "-n", "50"]);
        assert!(cmd.to_string().ends_with("-n 50"));
    }

    #[test]
    fn test_spawn_missing_program_is_fatal() {
        let cmd = SamplerCommand::custom("/nonexistent/asmon-sampler", Vec::<String>::new());
        let err = cmd.spawn().err().unwrap();
        assert!(err.is_fatal());
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_exposes_stream() {
        use std::io::Read;

        let cmd = SamplerCommand::custom("sh", ["-c", "printf 'a\\0b\\0'"]);
        let mut process = cmd.spawn().unwrap();
        let mut out = Vec::new();
        process.take_stream().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"a\0b\0");
        assert!(process.take_stream().is_none());
        assert!(process.wait().unwrap().success());
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_closes_stream_held_by_grandchild() {
        use std::io::Read;
        use std::time::{Duration, Instant};

        let cmd = SamplerCommand::custom("sh", ["-c", "sleep 30; :"]);
        let mut process = cmd.spawn().unwrap();
        let mut stream = process.take_stream().unwrap();
        let started = Instant::now();
        process.kill().unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!process.wait().unwrap().success());
    }
}
