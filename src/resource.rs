//! CPU and hardware decoder load sampling

use crate::error::{Error, Result};
use crate::types::SamplerConfig;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::debug;

/// One utilization figure, in percent
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Measured(f64),
    /// Sampling failed; `fallback` is what the rest of the system sees
    Degraded { fallback: f64, reason: String },
}

impl Reading {
    pub fn percent(&self) -> f64 {
        match self {
            Reading::Measured(value) => *value,
            Reading::Degraded { fallback, .. } => *fallback,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Reading::Degraded { .. })
    }

    fn degraded(fallback: f64, error: Error) -> Self {
        Reading::Degraded {
            fallback,
            reason: error.to_string(),
        }
    }
}

/// System load at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSample {
    pub cpu: Reading,
    pub decoder: Reading,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSample {
    /// Sample built from known values
    pub fn measured(cpu_percent: f64, decoder_percent: f64) -> Self {
        Self {
            cpu: Reading::Measured(clamp_percent(cpu_percent)),
            decoder: Reading::Measured(clamp_percent(decoder_percent)),
            sampled_at: Utc::now(),
        }
    }

    pub fn cpu_percent(&self) -> f64 {
        self.cpu.percent()
    }

    pub fn decoder_percent(&self) -> f64 {
        self.decoder.percent()
    }

    pub fn is_degraded(&self) -> bool {
        self.cpu.is_degraded() || self.decoder.is_degraded()
    }
}

/// Source of load readings.
///
/// Implementations keep counters between calls and are driven from the
/// control thread only.
pub trait ResourceSampler {
    fn sample(&mut self) -> ResourceSample;
}

/// Raw idle/total jiffies from the aggregate `cpu` line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub idle: u64,
    pub total: u64,
}

/// Parse the first line of a `/proc/stat` dump.
///
/// Total is the sum of every counter on the line, idle is the fourth one.
pub fn parse_cpu_counters(stat: &str) -> Result<CpuCounters> {
    let line = stat
        .lines()
        .next()
        .ok_or_else(|| Error::resource_degraded("cpu", "stat source is empty"))?;

    let mut fields = line.split_whitespace();
    match fields.next() {
        Some(label) if label.starts_with("cpu") => {}
        _ => {
            return Err(Error::resource_degraded(
                "cpu",
                format!("unexpected stat line: {}", line),
            ))
        }
    }

    let mut counters = CpuCounters::default();
    let mut count = 0usize;
    for field in fields {
        let value: u64 = field.parse().map_err(|_| {
            Error::resource_degraded("cpu", format!("bad counter '{}' in stat line", field))
        })?;
        if count == 3 {
            counters.idle = value;
        }
        counters.total = counters.total.saturating_add(value);
        count += 1;
    }

    if count < 4 {
        return Err(Error::resource_degraded(
            "cpu",
            format!("stat line has {} counters, need at least 4", count),
        ));
    }
    Ok(counters)
}

/// Busy percentage between consecutive counter snapshots.
///
/// The previous snapshot starts zeroed, so the first update reports the
/// average since boot and becomes the baseline for the next one.
#[derive(Debug, Default)]
pub struct CpuMeter {
    last: CpuCounters,
    last_percent: f64,
}

impl CpuMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, now: CpuCounters) -> f64 {
        let total_delta = now.total.saturating_sub(self.last.total);
        let idle_delta = now.idle.saturating_sub(self.last.idle);

        if total_delta > 0 {
            let busy = 100.0 - (idle_delta as f64 * 100.0 / total_delta as f64);
            self.last_percent = clamp_percent(busy);
        }

        self.last = now;
        self.last_percent
    }

    /// Last value reported, used as the fallback when a read fails
    pub fn last_percent(&self) -> f64 {
        self.last_percent
    }
}

/// Pull the decoder percentage out of the utility's report.
///
/// Looks at the first line containing `filter` and parses the first integer
/// that appears before its `%` sign.
pub fn parse_decoder_utilization(output: &str, filter: &str) -> Option<f64> {
    let line = output.lines().find(|line| line.contains(filter))?;
    let before_percent = match line.find('%') {
        Some(idx) => &line[..idx],
        None => line,
    };

    let start = before_percent.find(|c: char| c.is_ascii_digit())?;
    let digits: String = before_percent[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();

    digits.parse::<u32>().ok().map(|value| clamp_percent(value as f64))
}

/// Sampler backed by the kernel stat file and an external query utility.
///
/// The decoder query runs on `runtime`; `sample` blocks on it and must be
/// called from outside any async task.
pub struct SystemResourceSampler {
    stat_path: PathBuf,
    decoder_command: Vec<String>,
    decoder_line_filter: String,
    decoder_timeout: Duration,
    cpu: CpuMeter,
    runtime: Handle,
}

impl SystemResourceSampler {
    pub fn new(config: &SamplerConfig, runtime: Handle) -> Self {
        Self {
            stat_path: config.stat_path.clone(),
            decoder_command: config.decoder_command.clone(),
            decoder_line_filter: config.decoder_line_filter.clone(),
            decoder_timeout: Duration::from_millis(config.decoder_timeout_ms),
            cpu: CpuMeter::new(),
            runtime,
        }
    }

    fn sample_cpu(&mut self) -> Reading {
        let counters = std::fs::read_to_string(&self.stat_path)
            .map_err(|e| {
                Error::resource_degraded(
                    "cpu",
                    format!("cannot read {}: {}", self.stat_path.display(), e),
                )
            })
            .and_then(|raw| parse_cpu_counters(&raw));

        match counters {
            Ok(counters) => Reading::Measured(self.cpu.update(counters)),
            Err(e) => Reading::degraded(self.cpu.last_percent(), e),
        }
    }

    fn sample_decoder(&self) -> Reading {
        let output = match self.query_decoder() {
            Ok(output) => output,
            Err(e) => return Reading::degraded(0.0, e),
        };

        match parse_decoder_utilization(&output, &self.decoder_line_filter) {
            Some(value) => Reading::Measured(value),
            None => Reading::degraded(
                0.0,
                Error::resource_degraded(
                    "decoder",
                    format!("no '{}' percentage in query output", self.decoder_line_filter),
                ),
            ),
        }
    }

    /// Run the query utility and collect its stdout. The child is killed
    /// when the timeout drops the wait.
    fn query_decoder(&self) -> Result<String> {
        let (program, args) = self
            .decoder_command
            .split_first()
            .ok_or_else(|| Error::resource_degraded("decoder", "query command is empty"))?;
        let timeout = self.decoder_timeout;

        self.runtime.block_on(async move {
            let child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    Error::resource_degraded("decoder", format!("cannot run {}: {}", program, e))
                })?;

            let output = tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| {
                    Error::resource_degraded(
                        "decoder",
                        format!("{} did not finish within {:?}", program, timeout),
                    )
                })??;

            if !output.status.success() {
                return Err(Error::resource_degraded(
                    "decoder",
                    format!("{} exited with {}", program, output.status),
                ));
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
    }
}

impl ResourceSampler for SystemResourceSampler {
    fn sample(&mut self) -> ResourceSample {
        let decoder = self.sample_decoder();
        let cpu = self.sample_cpu();
        debug!(
            "Sampled load: cpu={:.1}% decoder={:.1}%",
            cpu.percent(),
            decoder.percent()
        );
        ResourceSample {
            cpu,
            decoder,
            sampled_at: Utc::now(),
        }
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}
