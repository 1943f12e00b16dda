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

use clap::{Parser, Subcommand};
use graphlock::commands::check_config::CheckConfigCommand;
use graphlock::commands::simulate::{SimulateCommand, SimulationOptions};
use graphlock::config::{CONFIG_FILE_NAME, LockManagerConfig};
use graphlock::error::{Result, format_error_for_terminal, get_exit_code};
use graphlock::logging;
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "graphlock")]
#[command(author, version, about = "Resource lock manager diagnostics", long_about = None)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and list its resource types
    #[command(visible_alias = "check")]
    CheckConfig {
        /// Configuration file to validate
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run concurrent clients against a lock manager and report contention
    #[command(long_about = "Run concurrent clients against a lock manager and report contention

Each client runs a fixed schedule of shared, exclusive and temporal lock
operations. Press Ctrl-C to stop every client; blocked waits end immediately.

Examples:
  graphlock simulate --clients 8 --rounds 1000
  GRAPHLOCK_LOCK_TIMEOUT=250ms graphlock simulate --json")]
    Simulate {
        /// Configuration file (defaults apply when absent)
        #[arg(long, value_name = "FILE", default_value = CONFIG_FILE_NAME)]
        config: PathBuf,

        /// Number of concurrent clients
        #[arg(long, default_value_t = 4)]
        clients: usize,

        /// Rounds per client
        #[arg(long, default_value_t = 100)]
        rounds: u32,

        /// Default lock timeout, e.g. "250ms", "5s" or "infinite"
        #[arg(long, value_name = "DURATION")]
        timeout: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn setup_logger(cli: &Cli) {
    logging::setup_logger(cli.verbose);
}

fn main() {
    let cli = Cli::parse();

    // Initialize logger based on CLI flags and environment
    setup_logger(&cli);

    let result: Result<()> = (|| match &cli.command {
        Commands::CheckConfig { path, json } => {
            let command = CheckConfigCommand::new(path)?;
            command.execute(*json)
        }
        Commands::Simulate {
            config,
            clients,
            rounds,
            timeout,
            json,
        } => {
            let config = LockManagerConfig::load(config)?;
            let command = SimulateCommand::new(&config)?;
            command.execute(SimulationOptions {
                clients: *clients,
                rounds: *rounds,
                timeout_override: timeout.as_deref(),
                json: *json,
            })
        }
    })();

    if let Err(e) = result {
        eprintln!(
            "{}",
            format_error_for_terminal(&e, std::io::stderr().is_terminal())
        );
        std::process::exit(get_exit_code(&e));
    }
}
