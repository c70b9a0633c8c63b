//! In-process benchmark suite.
//!
//! Each scenario binds a receiver on loopback, spawns it as a task and runs
//! a sender against it. The suite repeats every scenario and averages the
//! sender's throughput and elapsed time and the receiver's loss.

use crate::config::{Config, Mode, Protocol};
use crate::measurements::Metrics;
use crate::{Client, Error, Result, Server};
use log::{info, warn};
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// One protocol/size/count combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Scenario {
    pub protocol: Protocol,
    pub message_size: usize,
    pub message_count: u64,
}

impl Scenario {
    pub const fn new(protocol: Protocol, message_size: usize, message_count: u64) -> Self {
        Self {
            protocol,
            message_size,
            message_count,
        }
    }

    /// Short identifier, e.g. `UDP_1000b_1000msgs`.
    pub fn id(&self) -> String {
        format!(
            "{}_{}b_{}msgs",
            self.protocol, self.message_size, self.message_count
        )
    }
}

pub const DEFAULT_SCENARIOS: [Scenario; 6] = [
    Scenario::new(Protocol::Udp, 100, 100),
    Scenario::new(Protocol::Udp, 1000, 1000),
    Scenario::new(Protocol::Udp, 5000, 5000),
    Scenario::new(Protocol::Tcp, 100, 100),
    Scenario::new(Protocol::Tcp, 1000, 1000),
    Scenario::new(Protocol::Tcp, 5000, 5000),
];

/// Both ends of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioRun {
    pub sender: Metrics,
    pub receiver: Metrics,
}

/// Runs `scenario` once over loopback.
///
/// Timeouts, retries and pacing are taken from `base`; its mode, addresses
/// and message shape are overridden.
pub async fn run_scenario(scenario: &Scenario, base: &Config) -> Result<ScenarioRun> {
    let mut server_config = base
        .clone()
        .with_protocol(scenario.protocol)
        .with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST));
    server_config.mode = Mode::Server;
    server_config.port = 0;

    let bound = Server::new(server_config).bind().await?;
    let addr = bound.local_addr()?;
    let receiver = tokio::spawn(bound.run());

    let mut client_config = base
        .clone()
        .with_protocol(scenario.protocol)
        .with_message_size(scenario.message_size)
        .with_message_count(scenario.message_count);
    client_config.mode = Mode::Client;
    client_config.server_addr = Some(addr.ip().to_string());
    client_config.port = addr.port();

    let sender = match Client::new(client_config) {
        Ok(client) => client.run().await,
        Err(e) => Err(e),
    };
    let sender = match sender {
        Ok(metrics) => metrics,
        Err(e) => {
            receiver.abort();
            return Err(e);
        }
    };

    let receiver = receiver
        .await
        .map_err(|e| Error::Connection(format!("receiver task failed: {}", e)))??;

    Ok(ScenarioRun { sender, receiver })
}

/// Averages over all runs of one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSummary {
    pub scenario: Scenario,
    /// Runs that produced metrics on both ends
    pub runs: usize,
    pub failed_runs: usize,
    pub mean_throughput: f64,
    pub mean_elapsed: Duration,
    pub mean_loss: f64,
    pub loss_percent: f64,
}

impl ScenarioSummary {
    pub fn from_runs(scenario: Scenario, runs: &[ScenarioRun], failed_runs: usize) -> Self {
        let n = runs.len();
        let mean_throughput = mean(runs.iter().map(|r| r.sender.bytes_per_second()), n);
        let mean_secs = mean(runs.iter().map(|r| r.sender.elapsed.as_secs_f64()), n);
        let mean_loss = mean(runs.iter().map(|r| r.receiver.lost_messages as f64), n);
        let loss_percent = if scenario.message_count > 0 {
            mean_loss / scenario.message_count as f64 * 100.0
        } else {
            0.0
        };

        Self {
            scenario,
            runs: n,
            failed_runs,
            mean_throughput,
            mean_elapsed: Duration::from_secs_f64(mean_secs),
            mean_loss,
            loss_percent,
        }
    }
}

fn mean(values: impl Iterator<Item = f64>, n: usize) -> f64 {
    if n == 0 {
        0.0
    } else {
        values.sum::<f64>() / n as f64
    }
}

impl fmt::Display for ScenarioSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Results for [{}] over {} runs:", self.scenario.id(), self.runs)?;
        writeln!(f, "  - Mean throughput: {:.2} bytes/s", self.mean_throughput)?;
        writeln!(f, "  - Mean time......: {:.4} s", self.mean_elapsed.as_secs_f64())?;
        write!(
            f,
            "  - Mean loss......: {:.2} messages ({:.2}%)",
            self.mean_loss, self.loss_percent
        )?;
        if self.failed_runs > 0 {
            write!(f, "\n  - Failed runs....: {}", self.failed_runs)?;
        }
        Ok(())
    }
}

/// Runs every scenario `runs` times, one session at a time.
///
/// A failing run is logged and left out of the averages.
pub async fn run_suite(
    scenarios: &[Scenario],
    runs: usize,
    base: &Config,
) -> Vec<ScenarioSummary> {
    let mut summaries = Vec::with_capacity(scenarios.len());

    for scenario in scenarios {
        info!("Running {} ({} runs)", scenario.id(), runs);
        let mut results = Vec::with_capacity(runs);
        let mut failed = 0;

        for run in 1..=runs {
            match run_scenario(scenario, base).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!("{} run {}/{} failed: {}", scenario.id(), run, runs, e);
                    failed += 1;
                }
            }
        }

        summaries.push(ScenarioSummary::from_runs(*scenario, &results, failed));
    }

    summaries
}
