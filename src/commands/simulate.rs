// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Contention simulation against a configured lock manager.
//!
//! Each simulated client runs a fixed, deterministic schedule of resource and
//! temporal lock operations over a small key space so that clients collide.
//! SIGINT and SIGTERM stop every client; their blocked waits end with
//! `StoppedWait` and the run reports what it completed.

use crate::config::LockManagerConfig;
use crate::error::{LockError, Result};
use crate::locking::{
    ClientSession, LockManager, LockSnapshotEntry, ManagerOptions, ManagerStats, ResourceType,
};
use colored::Colorize;
use log::{debug, info, warn};
use serde::Serialize;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const KEY_SPACE: u64 = 8;
const PROPERTY_KEY: u32 = 1;
const WATCH_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
pub struct SimulationOptions<'a> {
    pub clients: usize,
    pub rounds: u32,
    pub timeout_override: Option<&'a str>,
    pub json: bool,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
struct ClientOutcome {
    completed_rounds: u32,
    timeouts: u32,
    stopped: bool,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub clients: usize,
    pub rounds: u32,
    pub completed_rounds: u64,
    pub timeouts: u64,
    pub stopped_clients: usize,
    pub interrupted: bool,
    pub elapsed_ms: u64,
    pub stats: ManagerStats,
    pub residual_locks: Vec<LockSnapshotEntry>,
}

pub struct SimulateCommand<'a> {
    config: &'a LockManagerConfig,
}

impl<'a> SimulateCommand<'a> {
    pub fn new(config: &'a LockManagerConfig) -> Result<Self> {
        Ok(Self { config })
    }

    pub fn execute(&self, options: SimulationOptions<'_>) -> Result<()> {
        let report = self.run(options)?;
        if options.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report);
        }
        Ok(())
    }

    fn run(&self, options: SimulationOptions<'_>) -> Result<SimulationReport> {
        if options.clients == 0 {
            return Err(LockError::InvalidConfig(
                "simulation needs at least one client".to_string(),
            ));
        }

        let types = self
            .config
            .resource_types_with_override(options.timeout_override)?;
        let manager = LockManager::with_options(
            types,
            ManagerOptions {
                stripes: self.config.stripes,
                ..ManagerOptions::default()
            },
        )?;
        manager.init()?;
        manager.start()?;

        let interrupted = Arc::new(AtomicBool::new(false));
        let handles = [SIGINT, SIGTERM]
            .into_iter()
            .map(|signal| signal_hook::flag::register(signal, interrupted.clone()))
            .collect::<std::io::Result<Vec<_>>>()?;

        let started = Instant::now();
        let finished = Arc::new(AtomicBool::new(false));
        let watcher = spawn_watcher(manager.clone(), interrupted.clone(), finished.clone());

        let rounds = options.rounds;
        let workers: Vec<_> = (0..options.clients)
            .map(|index| {
                let manager = manager.clone();
                let interrupted = interrupted.clone();
                thread::spawn(move || run_client(&manager, index as u64, rounds, &interrupted))
            })
            .collect();

        let mut outcomes = Vec::with_capacity(workers.len());
        let mut first_error = None;
        for worker in workers {
            match worker.join() {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(_) => warn!("Simulated client panicked"),
            }
        }
        finished.store(true, Ordering::SeqCst);
        if watcher.join().is_err() {
            warn!("Signal watcher panicked");
        }
        for handle in handles {
            signal_hook::low_level::unregister(handle);
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let report = SimulationReport {
            clients: options.clients,
            rounds: options.rounds,
            completed_rounds: outcomes.iter().map(|o| u64::from(o.completed_rounds)).sum(),
            timeouts: outcomes.iter().map(|o| u64::from(o.timeouts)).sum(),
            stopped_clients: outcomes.iter().filter(|o| o.stopped).count(),
            interrupted: interrupted.load(Ordering::SeqCst),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            stats: manager.stats(),
            residual_locks: manager.snapshot(),
        };
        manager.shutdown()?;
        Ok(report)
    }
}

fn spawn_watcher(
    manager: LockManager,
    interrupted: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !finished.load(Ordering::SeqCst) {
            if interrupted.load(Ordering::SeqCst) {
                info!("Interrupted; stopping simulated clients");
                if let Err(err) = manager.stop() {
                    warn!("Failed to stop lock manager: {err}");
                }
                return;
            }
            thread::sleep(WATCH_INTERVAL);
        }
    })
}

/// One client's deterministic schedule; ids inside a round are always ascending.
///
/// A timed-out round may leave locks behind, so the session is closed and
/// replaced before the next round.
fn run_client(
    manager: &LockManager,
    index: u64,
    rounds: u32,
    interrupted: &AtomicBool,
) -> Result<ClientOutcome> {
    let mut client = manager.new_client()?;
    let types = manager.resource_types();
    let mut outcome = ClientOutcome::default();

    for round in 0..rounds {
        if interrupted.load(Ordering::SeqCst) {
            outcome.stopped = true;
            break;
        }
        let resource_type = &types[(index as usize + round as usize) % types.len()];
        match run_round(&client, resource_type, index, u64::from(round)) {
            Ok(()) => outcome.completed_rounds += 1,
            Err(err) if err.is_timeout() => {
                outcome.timeouts += 1;
                client.close()?;
                client = manager.new_client()?;
            }
            Err(err) if err.is_stopped() => {
                outcome.stopped = true;
                break;
            }
            Err(err) => return Err(err),
        }
    }

    debug!(
        "Client {} finished {} round(s), {} timeout(s)",
        client.id(),
        outcome.completed_rounds,
        outcome.timeouts
    );
    client.close()?;
    Ok(outcome)
}

fn run_round(client: &ClientSession, resource_type: &ResourceType, index: u64, round: u64) -> Result<()> {
    let first = (index * 7 + round * 13) % KEY_SPACE;
    let second = (first + 1 + round % 3) % KEY_SPACE;
    let mut ids = [first, second];
    ids.sort_unstable();

    match (index + round) % 4 {
        0 => {
            client.acquire_exclusive(resource_type, &ids)?;
            thread::yield_now();
            for id in ids.iter().rev() {
                client.release_exclusive(resource_type, *id)?;
            }
        }
        1 => {
            client.acquire_exclusive(resource_type, &[first])?;
            client.acquire_shared(resource_type, &[first])?;
            client.release_exclusive(resource_type, first)?;
            thread::yield_now();
            client.release_shared(resource_type, first)?;
        }
        2 => {
            let time = (round % 20) as i64;
            client.acquire_temporal_prop_exclusive(resource_type, first, PROPERTY_KEY, time)?;
            client.release_temporal_prop_exclusive(resource_type, first, PROPERTY_KEY, time)?;
        }
        _ => {
            client.acquire_shared(resource_type, &ids)?;
            let start = (round % 10) as i64;
            client.acquire_temporal_prop_shared(resource_type, first, PROPERTY_KEY, start, start + 5)?;
            thread::yield_now();
            client.release_temporal_prop_shared(resource_type, first, PROPERTY_KEY, start, start + 5)?;
            for id in ids.iter().rev() {
                client.release_shared(resource_type, *id)?;
            }
        }
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!("{}", "Simulation finished".bold());
    println!(
        "  {} client(s) x {} round(s) in {}ms",
        report.clients, report.rounds, report.elapsed_ms
    );
    println!("  Completed rounds: {}", report.completed_rounds);
    println!(
        "  Grants: {}, waits: {}, releases: {}",
        report.stats.counters.grants, report.stats.counters.waits, report.stats.counters.releases
    );
    if report.timeouts > 0 {
        println!("  {}", format!("Timeouts: {}", report.timeouts).yellow());
    }
    if report.interrupted {
        println!(
            "  {}",
            format!("Interrupted; {} client(s) stopped", report.stopped_clients).yellow()
        );
    }
    for latency in &report.stats.latency {
        println!(
            "  Average wait for {}: {:.3}ms",
            latency.resource_type,
            latency.average_wait.as_secs_f64() * 1000.0
        );
    }
    if report.residual_locks.is_empty() {
        println!("  {}", "No residual locks ✓".green());
    } else {
        println!("  {}", "Residual locks:".red().bold());
        for entry in &report.residual_locks {
            println!("    {}", entry.description);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn simulation_leaves_no_residual_locks() {
        let config = LockManagerConfig::from_toml_str(
            r#"
default_timeout = "2s"
stripes = 4

[[resource_types]]
id = 0
name = "node"

[[resource_types]]
id = 1
name = "relationship"
strategy = "spin_then_block"
spins = 4
"#,
        )
        .unwrap();
        let command = SimulateCommand::new(&config).unwrap();
        let report = command
            .run(SimulationOptions {
                clients: 4,
                rounds: 25,
                timeout_override: None,
                json: true,
            })
            .unwrap();

        assert!(report.residual_locks.is_empty());
        assert_eq!(report.completed_rounds + report.timeouts, 100);
        assert_eq!(report.stats.live_clients, 0);
        assert!(!report.interrupted);
    }

    #[test]
    #[serial]
    fn zero_clients_is_rejected() {
        let config = LockManagerConfig::default();
        let command = SimulateCommand::new(&config).unwrap();
        assert!(matches!(
            command.run(SimulationOptions {
                clients: 0,
                rounds: 1,
                timeout_override: None,
                json: false,
            }),
            Err(LockError::InvalidConfig(_))
        ));
    }
}
