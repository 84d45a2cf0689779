// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Environment-driven runtime options.
//!
//! The following environment variables are recognised:
//!
//! - `DRIVER_ADDRESS`: URI of the driver daemon (default
//!   `unix:/run/driver.sock`). Must begin with `unix:` when shared memory is
//!   requested.
//! - `CORE_GROUP_SIZES`: core-grouping policy string, see [`CoreGroupPolicy`].
//! - `SHM_MAP`: `no` disables shared-memory transport; any other value
//!   (including unset) leaves it enabled.
//! - `PROFILE_DIR`: non-empty enables the profiler hook and names the dump
//!   directory.
//!
//! `:/opt/accel/bin` is appended to `PATH` once per process so the profiler
//! and other driver-side tools resolve without operator setup.

use std::sync::Once;

use crate::device_manager::MAX_NUM_CORES;

pub const DRIVER_ADDRESS_ENV: &str = "DRIVER_ADDRESS";
pub const CORE_GROUP_SIZES_ENV: &str = "CORE_GROUP_SIZES";
pub const SHM_MAP_ENV: &str = "SHM_MAP";
pub const PROFILE_DIR_ENV: &str = "PROFILE_DIR";

pub const DEFAULT_DRIVER_ADDRESS: &str = "unix:/run/driver.sock";

const ACCEL_TOOLS_PATH: &str = "/opt/accel/bin";

static PATH_SET: Once = Once::new();

/// Read an environment variable with a default for the unset case.
pub fn env_get(env_var: &str, default: &str) -> String {
    std::env::var(env_var).unwrap_or_else(|_| default.to_string())
}

/// Check if an environment variable is truthy.
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Evaluate a user-supplied string as a boolean.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// URI of the driver daemon.
pub fn driver_address() -> String {
    env_get(DRIVER_ADDRESS_ENV, DEFAULT_DRIVER_ADDRESS)
}

/// Whether shared-memory tensor transport is requested. `SHM_MAP=no` is the
/// only value that disables it.
pub fn shared_memory_requested() -> bool {
    env_get(SHM_MAP_ENV, "") != "no"
}

/// Profile dump directory; `None` disables the profiler hook.
pub fn profile_dir() -> Option<String> {
    match env_get(PROFILE_DIR_ENV, "") {
        dir if dir.is_empty() => None,
        dir => Some(dir),
    }
}

/// Append the accelerator tool directory to `PATH`. Idempotent.
pub fn append_tools_path() {
    PATH_SET.call_once(|| {
        let path = env_get("PATH", "");
        std::env::set_var("PATH", format!("{path}:{ACCEL_TOOLS_PATH}"));
    });
}

/// One device worth of execution groups: `num_cores` cores, duplicated
/// `num_duplicates` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSpec {
    pub num_cores: u32,
    pub num_duplicates: u32,
}

impl GroupSpec {
    pub fn new(num_cores: u32, num_duplicates: u32) -> Self {
        GroupSpec {
            num_cores,
            num_duplicates,
        }
    }
}

/// Parsed core-grouping policy.
///
/// Grammar (brackets stripped before parsing):
///
/// ```text
/// policy := group ("," group)*
/// group  := [multiplicity "x"] size
/// ```
///
/// `multiplicity` and `size` are integers in `[0, MAX_NUM_CORES]`. Each group
/// contributes one device of `size` cores with `multiplicity` (default 1)
/// duplicates. A malformed policy is discarded wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreGroupPolicy {
    pub groups: Vec<GroupSpec>,
    /// Set when the policy is a single defaulted group whose size is only a
    /// hint: the manager steps the request down until the driver grants a
    /// group.
    pub search_largest: bool,
}

impl CoreGroupPolicy {
    /// Read the policy from `CORE_GROUP_SIZES`, falling back to the default
    /// policy when the variable is unset or ill-formatted.
    pub fn from_env(opt_device_size: i64, max_num_duplicates: i64) -> CoreGroupPolicy {
        let raw = env_get(CORE_GROUP_SIZES_ENV, "");
        if raw.is_empty() {
            return Self::default_policy(opt_device_size, max_num_duplicates);
        }
        match Self::parse(&raw) {
            Some(policy) => policy,
            None => {
                tracing::warn!(
                    "{CORE_GROUP_SIZES_ENV}={raw} looks ill-formatted; falling back to the default core grouping"
                );
                Self::default_policy(opt_device_size, max_num_duplicates)
            }
        }
    }

    /// Parse a policy string. Returns `None` when any group is malformed; a
    /// partially valid policy is never applied.
    pub fn parse(raw: &str) -> Option<CoreGroupPolicy> {
        let cleaned: String = raw.chars().filter(|c| *c != '[' && *c != ']').collect();
        let mut groups = Vec::new();
        for part in cleaned.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (num_duplicates, size_str) = match part.split_once('x') {
                Some((dup, size)) => (parse_bounded(dup)?, size),
                None => (1, part),
            };
            let num_cores = parse_bounded(size_str)?;
            if num_duplicates == 0 {
                return None;
            }
            groups.push(GroupSpec::new(num_cores, num_duplicates));
            if groups.len() == MAX_NUM_CORES {
                break;
            }
        }
        if groups.is_empty() {
            return None;
        }
        Some(CoreGroupPolicy {
            groups,
            search_largest: false,
        })
    }

    /// The policy applied when `CORE_GROUP_SIZES` is absent or rejected.
    ///
    /// `opt_device_size` is the operator-supplied core-count hint;
    /// `max_num_duplicates` is advisory and only consulted where duplication
    /// is known to be legal (single-core groups).
    pub fn default_policy(opt_device_size: i64, max_num_duplicates: i64) -> CoreGroupPolicy {
        let max_dup = max_num_duplicates.clamp(1, MAX_NUM_CORES as i64) as u32;
        let (groups, search_largest) = match opt_device_size {
            1 => (vec![GroupSpec::new(1, 1); 4], false),
            2 => (vec![GroupSpec::new(2, max_dup.min(2)); 2], false),
            size if (1..=MAX_NUM_CORES as i64).contains(&size) => {
                // one device; the manager steps the request down until the
                // driver grants a group
                (vec![GroupSpec::new(size as u32, 1)], true)
            }
            _ => {
                // hint looks wrong; let the driver pick the largest group
                (vec![GroupSpec::new(0, 1)], false)
            }
        };
        CoreGroupPolicy {
            groups,
            search_largest,
        }
    }
}

fn parse_bounded(s: &str) -> Option<u32> {
    let value: u32 = s.trim().parse().ok()?;
    if value as usize > MAX_NUM_CORES {
        return None;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_sizes() {
        let policy = CoreGroupPolicy::parse("1,2,4").unwrap();
        assert_eq!(
            policy.groups,
            vec![
                GroupSpec::new(1, 1),
                GroupSpec::new(2, 1),
                GroupSpec::new(4, 1)
            ]
        );
    }

    #[test]
    fn parses_multiplicity_and_brackets() {
        let policy = CoreGroupPolicy::parse("[2x1,4]").unwrap();
        assert_eq!(
            policy.groups,
            vec![GroupSpec::new(1, 2), GroupSpec::new(4, 1)]
        );
    }

    #[test]
    fn empty_groups_are_skipped() {
        let policy = CoreGroupPolicy::parse("1,,2").unwrap();
        assert_eq!(policy.groups.len(), 2);
    }

    #[test]
    fn rejects_garbage_wholesale() {
        assert!(CoreGroupPolicy::parse("1,banana").is_none());
        assert!(CoreGroupPolicy::parse("0x4").is_none());
        assert!(CoreGroupPolicy::parse("-1").is_none());
        assert!(CoreGroupPolicy::parse("65").is_none());
        assert!(CoreGroupPolicy::parse("").is_none());
    }

    #[test]
    fn default_policy_shapes() {
        assert_eq!(
            CoreGroupPolicy::default_policy(1, 1).groups,
            vec![GroupSpec::new(1, 1); 4]
        );
        assert_eq!(
            CoreGroupPolicy::default_policy(2, 4).groups,
            vec![GroupSpec::new(2, 2); 2]
        );
        assert_eq!(
            CoreGroupPolicy::default_policy(16, 1).groups,
            vec![GroupSpec::new(16, 1)]
        );
        assert_eq!(
            CoreGroupPolicy::default_policy(-3, 1).groups,
            vec![GroupSpec::new(0, 1)]
        );
    }

    #[test]
    fn env_fallback_on_malformed_policy() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(CORE_GROUP_SIZES_ENV, "not-a-policy");
            let policy = CoreGroupPolicy::from_env(1, 1);
            assert_eq!(policy, CoreGroupPolicy::default_policy(1, 1));
            Ok(())
        });
    }

    #[test]
    fn env_policy_wins_when_valid() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(CORE_GROUP_SIZES_ENV, "[2x1]");
            let policy = CoreGroupPolicy::from_env(1, 1);
            assert_eq!(policy.groups, vec![GroupSpec::new(1, 2)]);
            Ok(())
        });
    }

    #[test]
    fn truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy("TRUE"));
        assert!(is_truthy("on"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("no"));
    }
}
