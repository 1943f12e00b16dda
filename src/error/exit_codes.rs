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

pub fn get_exit_code(error: &LockError) -> i32 {
    match error {
        LockError::InvalidConfig(_)
        | LockError::ConfigFile(_)
        | LockError::FactoryMisconfiguration(_) => 2,

        LockError::AcquireTimeout { .. } => 3,

        LockError::StoppedWait { .. } => 130, // Matches the conventional SIGINT exit status

        LockError::InvalidRelease { .. }
        | LockError::UseAfterClose { .. }
        | LockError::InvalidInterval { .. }
        | LockError::UnknownResourceType(_)
        | LockError::ManagerShutdown
        | LockError::InvalidLifecycle { .. } => 70,

        _ => 1,
    }
}
