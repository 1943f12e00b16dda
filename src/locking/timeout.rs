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

//! Lock wait bounds and the precedence rules that pick one.
//!
//! Values are written as whole seconds (`"5"`, `"5s"`), milliseconds
//! (`"250ms"`) or `"infinite"`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// How long an acquire may stay queued before it gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTimeoutValue {
    Finite(Duration),
    Infinite,
}

impl LockTimeoutValue {
    pub const fn from_secs(seconds: u64) -> Self {
        Self::Finite(Duration::from_secs(seconds))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self::Finite(Duration::from_millis(millis))
    }

    /// The bound as a duration; `Duration::MAX` when unbounded.
    pub fn as_duration(&self) -> Duration {
        match self {
            LockTimeoutValue::Finite(duration) => *duration,
            LockTimeoutValue::Infinite => Duration::MAX,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, LockTimeoutValue::Infinite)
    }
}

impl fmt::Display for LockTimeoutValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTimeoutValue::Infinite => f.write_str("infinite"),
            LockTimeoutValue::Finite(duration) if duration.subsec_nanos() == 0 => {
                write!(f, "{}s", duration.as_secs())
            }
            LockTimeoutValue::Finite(duration) => write!(f, "{}ms", duration.as_millis()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockTimeoutParseError {
    #[error("Lock timeout value is empty")]
    Empty,

    #[error(
        "Lock timeout value '{0}' is invalid. Use whole seconds ('5', '5s'), milliseconds \
         ('250ms') or the word 'infinite'."
    )]
    Invalid(String),
}

impl FromStr for LockTimeoutValue {
    type Err = LockTimeoutParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(LockTimeoutParseError::Empty);
        }
        if trimmed.eq_ignore_ascii_case("infinite") {
            return Ok(LockTimeoutValue::Infinite);
        }

        let (digits, to_value): (&str, fn(u64) -> LockTimeoutValue) =
            if let Some(millis) = trimmed.strip_suffix("ms") {
                (millis, LockTimeoutValue::from_millis)
            } else {
                (
                    trimmed.strip_suffix('s').unwrap_or(trimmed),
                    LockTimeoutValue::from_secs,
                )
            };
        digits
            .trim()
            .parse::<u64>()
            .map(to_value)
            .map_err(|_| LockTimeoutParseError::Invalid(trimmed.to_string()))
    }
}

/// Parses a timeout given on the command line, in the environment or in a file.
pub fn parse_timeout_override(value: &str) -> Result<LockTimeoutValue, LockTimeoutParseError> {
    value.parse()
}

impl Serialize for LockTimeoutValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LockTimeoutValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Where an effective timeout came from, strongest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LockTimeoutSource {
    #[default]
    Default,
    Config,
    Environment,
    Override,
}

impl fmt::Display for LockTimeoutSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockTimeoutSource::Default => "built-in default",
            LockTimeoutSource::Config => "configuration file",
            LockTimeoutSource::Environment => "environment variable",
            LockTimeoutSource::Override => "explicit override",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeoutResolution {
    pub value: LockTimeoutValue,
    pub source: LockTimeoutSource,
}

/// Picks the effective default timeout: override, then environment, then
/// configuration, then the built-in default.
///
/// A configured value equal to the built-in default is reported as the default.
pub struct LockTimeoutResolver<'a> {
    explicit_override: Option<&'a str>,
    env_override: Option<&'a str>,
    config_value: LockTimeoutValue,
    default_value: LockTimeoutValue,
}

impl<'a> LockTimeoutResolver<'a> {
    pub fn new(
        explicit_override: Option<&'a str>,
        env_override: Option<&'a str>,
        config_value: LockTimeoutValue,
        default_value: LockTimeoutValue,
    ) -> Self {
        Self {
            explicit_override,
            env_override,
            config_value,
            default_value,
        }
    }

    pub fn resolve(self) -> Result<LockTimeoutResolution, LockTimeoutParseError> {
        let textual = [
            (self.explicit_override, LockTimeoutSource::Override),
            (self.env_override, LockTimeoutSource::Environment),
        ];
        for (raw, source) in textual {
            let Some(raw) = raw else {
                continue;
            };
            return Ok(LockTimeoutResolution {
                value: raw.parse()?,
                source,
            });
        }

        let source = if self.config_value == self.default_value {
            LockTimeoutSource::Default
        } else {
            LockTimeoutSource::Config
        };
        Ok(LockTimeoutResolution {
            value: self.config_value,
            source,
        })
    }
}
