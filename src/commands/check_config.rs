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

use crate::config::LockManagerConfig;
use crate::error::{LockError, Result};
use crate::locking::{LockManager, ResourceType, WaitStrategy};
use colored::Colorize;
use comfy_table::{Table, presets::UTF8_FULL};
use log::debug;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct ResourceTypeRow {
    id: u32,
    name: String,
    strategy: String,
    timeout: String,
    spins: u32,
}

impl From<&ResourceType> for ResourceTypeRow {
    fn from(resource_type: &ResourceType) -> Self {
        let strategy = resource_type.wait_strategy();
        let label = match strategy {
            WaitStrategy::FailFast => "fail_fast",
            WaitStrategy::Block { .. } => "block",
            WaitStrategy::SpinThenBlock { .. } => "spin_then_block",
        };
        let timeout = match strategy {
            WaitStrategy::FailFast => "-".to_string(),
            _ => strategy.timeout().to_string(),
        };
        Self {
            id: resource_type.id(),
            name: resource_type.name().to_string(),
            strategy: label.to_string(),
            timeout,
            spins: strategy.spins(),
        }
    }
}

pub struct CheckConfigCommand<'a> {
    path: &'a Path,
}

impl<'a> CheckConfigCommand<'a> {
    pub fn new(path: &'a Path) -> Result<Self> {
        Ok(Self { path })
    }

    /// Validates the configuration by building a manager from it.
    pub fn execute(&self, json: bool) -> Result<()> {
        if !self.path.exists() {
            return Err(LockError::ConfigFile(format!(
                "{} does not exist",
                self.path.display()
            )));
        }
        let config = LockManagerConfig::load(self.path)?;
        let manager = LockManager::from_config(&config)?;
        debug!("Validated {manager:?}");

        let rows: Vec<ResourceTypeRow> = manager
            .resource_types()
            .iter()
            .map(ResourceTypeRow::from)
            .collect();

        if json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(());
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Id", "Name", "Strategy", "Timeout", "Spins"]);
        for row in &rows {
            table.add_row(vec![
                row.id.to_string(),
                row.name.clone(),
                row.strategy.clone(),
                row.timeout.clone(),
                row.spins.to_string(),
            ]);
        }

        println!("{table}");
        println!();
        println!(
            "{} {} resource type{}, {} stripe{}",
            "✓ Configuration valid:".green().bold(),
            rows.len(),
            if rows.len() == 1 { "" } else { "s" },
            config.stripes,
            if config.stripes == 1 { "" } else { "s" }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn row_describes_strategy() {
        let row = ResourceTypeRow::from(&ResourceType::new(
            2,
            "label",
            WaitStrategy::SpinThenBlock {
                spins: 16,
                timeout: crate::locking::LockTimeoutValue::from_millis(250),
            },
        ));
        assert_eq!(row.strategy, "spin_then_block");
        assert_eq!(row.timeout, "250ms");
        assert_eq!(row.spins, 16);
    }

    #[test]
    #[serial]
    fn valid_file_passes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("graphlock.toml");
        fs::write(
            &path,
            r#"
[[resource_types]]
id = 0
name = "node"
"#,
        )
        .unwrap();
        CheckConfigCommand::new(&path).unwrap().execute(true).unwrap();
    }

    #[test]
    #[serial]
    fn duplicate_ids_fail() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("graphlock.toml");
        fs::write(
            &path,
            r#"
[[resource_types]]
id = 0
name = "node"

[[resource_types]]
id = 0
name = "relationship"
"#,
        )
        .unwrap();
        let err = CheckConfigCommand::new(&path)
            .unwrap()
            .execute(false)
            .unwrap_err();
        assert!(matches!(err, LockError::FactoryMisconfiguration(_)));
    }

    #[test]
    fn missing_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.toml");
        let err = CheckConfigCommand::new(&path)
            .unwrap()
            .execute(false)
            .unwrap_err();
        assert!(matches!(err, LockError::ConfigFile(_)));
    }
}
