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

use crate::error::LockError;
use std::fmt;

pub struct ErrorContext<'a> {
    pub error: &'a LockError,
    pub suggestion: Option<String>,
    pub details: Option<String>,
}

impl<'a> ErrorContext<'a> {
    pub fn new(error: &'a LockError) -> Self {
        let (suggestion, details) = match error {
            LockError::AcquireTimeout { resource, waited } => {
                let suggestion = Some(
                    "Abort and retry the owning transaction. If this happens under normal load, \
                     raise the resource type timeout or check that every caller locks ids in the \
                     same order."
                        .to_string(),
                );
                let details = Some(format!(
                    "Waited {:.3}s for {resource}; no lock state was retained.",
                    waited.as_secs_f64()
                ));
                (suggestion, details)
            }
            LockError::StoppedWait { resource, session } => {
                let suggestion = Some(
                    "The client was stopped by its owner. Close it; it cannot acquire new locks."
                        .to_string(),
                );
                let details = Some(format!(
                    "Client {session} gave up waiting for {resource}; locks it already held are \
                     still held until close."
                ));
                (suggestion, details)
            }
            LockError::InvalidRelease { resource, mode, .. } => {
                let suggestion = Some(
                    "Every acquire must be paired with exactly one release of the same mode."
                        .to_string(),
                );
                let details = Some(format!("No {mode} hold recorded for {resource}."));
                (suggestion, details)
            }
            LockError::UseAfterClose { .. } => {
                let suggestion =
                    Some("Create a new client with LockManager::new_client.".to_string());
                (suggestion, None)
            }
            LockError::InvalidInterval { start, end } => {
                let suggestion =
                    Some("Temporal intervals must satisfy start <= end.".to_string());
                let details = Some(format!("Received start {start} and end {end}."));
                (suggestion, details)
            }
            LockError::UnknownResourceType(id) => {
                let suggestion = Some(format!(
                    "Declare resource type {id} in the [[resource_types]] section of the \
                     configuration."
                ));
                (suggestion, None)
            }
            LockError::FactoryMisconfiguration(msg) => {
                let suggestion = Some(
                    "Resource type ids and names must be unique; ids should be a dense sequence \
                     starting at 0."
                        .to_string(),
                );
                let details = Some(msg.clone());
                (suggestion, details)
            }
            LockError::ManagerShutdown => {
                let suggestion =
                    Some("Construct a new LockManager; a shut down manager is final.".to_string());
                (suggestion, None)
            }
            LockError::InvalidLifecycle { from, .. } => {
                let suggestion = Some(
                    "Call init, start, stop and shutdown in that order; start may follow stop."
                        .to_string(),
                );
                let details = Some(format!("The manager is currently {from}."));
                (suggestion, details)
            }
            LockError::InvalidConfig(msg) | LockError::ConfigFile(msg) => {
                let suggestion = Some(
                    "Check the configuration file against the documented format. Timeouts \
                     accept '250ms', '5s' or 'infinite'."
                        .to_string(),
                );
                let details = Some(msg.clone());
                (suggestion, details)
            }
            LockError::Io(io_err) => {
                let suggestion = match io_err.kind() {
                    std::io::ErrorKind::PermissionDenied => {
                        Some("Check the permissions of the configuration file.".to_string())
                    }
                    std::io::ErrorKind::NotFound => Some(
                        "Ensure the file or directory exists and the path is correct.".to_string(),
                    ),
                    _ => None,
                };
                let details = Some(format!("I/O error: {io_err}"));
                (suggestion, details)
            }
            LockError::Json(_) => (None, None),
        };

        ErrorContext {
            error,
            suggestion,
            details,
        }
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }
}

impl<'a> fmt::Display for ErrorContext<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\n\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}
