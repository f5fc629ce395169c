//! Slow-query log.
//!
//! A session whose total elapsed time exceeds the configured threshold
//! emits one record on client-write completion. Records go to the
//! configured log file, or through the normal log stream when no path is
//! set.

use crate::config::{Config, SlowLogFormat};
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Durations of the three proxy phases of one round trip.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimes {
    /// Client request arriving and being relayed to the upstream.
    pub to_upstream: Duration,
    /// Upstream response arriving at the proxy.
    pub from_upstream: Duration,
    /// Response being relayed back to the client.
    pub to_client: Duration,
    pub total: Duration,
}

pub struct SlowLog {
    threshold: Option<Duration>,
    format: SlowLogFormat,
    file: Option<Mutex<File>>,
}

impl SlowLog {
    pub fn from_config(config: &Config) -> Self {
        let threshold = if config.slow_query_sec > 0.0 {
            Some(Duration::from_secs_f64(config.slow_query_sec))
        } else {
            None
        };

        let file = if threshold.is_some() && !config.slow_query_log_path.is_empty() {
            match open_log_file(&config.slow_query_log_path, config.slow_query_log_access_mask) {
                Ok(file) => Some(Mutex::new(file)),
                Err(e) => {
                    warn!(
                        path = %config.slow_query_log_path,
                        error = %e,
                        "Failed to open slow-query log, falling back to stderr"
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            threshold,
            format: config.slow_query_log_format,
            file,
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            threshold: None,
            format: SlowLogFormat::Json,
            file: None,
        }
    }

    /// Called at the end of every successful round trip.
    pub fn observe(&self, command: &str, times: &PhaseTimes) {
        let threshold = match self.threshold {
            Some(t) => t,
            None => return,
        };
        if times.total < threshold {
            return;
        }

        let line = self.render(command, times);
        match &self.file {
            Some(file) => {
                let mut file = file.lock().unwrap();
                if let Err(e) = writeln!(file, "{line}") {
                    warn!(error = %e, "Failed to write slow-query record");
                }
            }
            None => warn!(slow_query = %line, "Slow query"),
        }
    }

    fn render(&self, command: &str, times: &PhaseTimes) -> String {
        let time = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        match self.format {
            SlowLogFormat::Json => serde_json::json!({
                "time": time,
                "command": command,
                "to_upstream_sec": times.to_upstream.as_secs_f64(),
                "from_upstream_sec": times.from_upstream.as_secs_f64(),
                "to_client_sec": times.to_client.as_secs_f64(),
                "total_sec": times.total.as_secs_f64(),
            })
            .to_string(),
            SlowLogFormat::Ltsv => format!(
                "time:{}\tcommand:{}\tto_upstream_sec:{:.6}\tfrom_upstream_sec:{:.6}\tto_client_sec:{:.6}\ttotal_sec:{:.6}",
                time,
                command,
                times.to_upstream.as_secs_f64(),
                times.from_upstream.as_secs_f64(),
                times.to_client.as_secs_f64(),
                times.total.as_secs_f64(),
            ),
            SlowLogFormat::Plain => format!(
                "{} command={} to_upstream={:.6}s from_upstream={:.6}s to_client={:.6}s total={:.6}s",
                time,
                command,
                times.to_upstream.as_secs_f64(),
                times.from_upstream.as_secs_f64(),
                times.to_client.as_secs_f64(),
                times.total.as_secs_f64(),
            ),
        }
    }
}

fn open_log_file(path: &str, access_mask: u32) -> std::io::Result<File> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut permissions = file.metadata()?.permissions();
    permissions.set_mode(access_mask);
    file.set_permissions(permissions)?;
    Ok(file)
}
