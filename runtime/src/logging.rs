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

//! Runtime logging.
//!
//! Configuration is layered, lowest priority first:
//!
//! 1. Built-in defaults.
//! 2. Optional TOML file pointed to by `NPU_LOGGING_CONFIG_PATH`.
//! 3. The `NPU_LOG` filter directive (highest priority).
//!
//! Output is compact human-readable text on stderr, or JSONL when
//! `NPU_LOG_JSON` is truthy.
//!
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "npu_runtime::device" = "debug"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::Directive, fmt, EnvFilter};

use crate::config::env_is_truthy;

/// ENV used to set the log filter
const FILTER_ENV: &str = "NPU_LOG";

/// ENV used to switch the output format to JSONL
const JSON_ENV: &str = "NPU_LOG_JSON";

/// ENV used to point at a TOML logging configuration file
const CONFIG_PATH_ENV: &str = "NPU_LOGGING_CONFIG_PATH";

const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::new(),
        }
    }
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(config_path))
        .extract()
        .unwrap_or_default()
}

/// Initialize the logger. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let config = load_config();

        let mut filter_layer = EnvFilter::builder()
            .with_default_directive(config.log_level.parse().unwrap_or_default())
            .with_env_var(FILTER_ENV)
            .from_env_lossy();

        for (module, level) in config.log_filters {
            match format!("{module}={level}").parse::<Directive>() {
                Ok(d) => {
                    filter_layer = filter_layer.add_directive(d);
                }
                Err(e) => {
                    eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
                }
            }
        }

        if env_is_truthy(JSON_ENV) {
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .with_filter(filter_layer);
            tracing_subscriber::registry().with(layer).init();
        } else {
            let layer = fmt::layer()
                .event_format(fmt::format().compact())
                .with_writer(std::io::stderr)
                .with_filter(filter_layer);
            tracing_subscriber::registry().with(layer).init();
        }
    });
}
