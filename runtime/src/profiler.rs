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

//! Profiler hook.
//!
//! Enabled by a non-empty `PROFILE_DIR`. At operator construction the
//! serialized subgraph and the compiled artifact are dumped as
//! `<dir>/<mangled>.pb` and `<dir>/<mangled>.neff`; each synchronous
//! inference is wrapped in an `npu-profile start-session`/`stop-session`
//! subprocess pair writing `<dir>/<mangled>-<nn_id>-<session>.ipd`.
//! Subprocess failures degrade to log lines and never fail the inference.

use tokio::process::Command;

use crate::config;

const PROFILE_TOOL: &str = "npu-profile";

/// Replace `/` with `+` so graph-node names survive as file names.
fn mangle_op_name(op_name: &str) -> String {
    op_name.replace('/', "+")
}

pub struct Profiler {
    dir: Option<String>,
    mangled_name: String,
    session_id: u64,
    session_file: Option<String>,
}

impl Profiler {
    pub fn from_env(op_name: &str) -> Profiler {
        Profiler {
            dir: config::profile_dir(),
            mangled_name: mangle_op_name(op_name),
            session_id: 0,
            session_file: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Dump the serialized subgraph and the artifact next to the sessions.
    pub fn dump_info(&self, graph_def: &[u8], executable: &[u8]) {
        let Some(dir) = &self.dir else {
            return;
        };
        let base = format!("{dir}/{}", self.mangled_name);
        if let Err(e) = std::fs::write(format!("{base}.pb"), graph_def) {
            tracing::warn!("cannot dump graph to {base}.pb: {e}");
        }
        if let Err(e) = std::fs::write(format!("{base}.neff"), executable) {
            tracing::warn!("cannot dump artifact to {base}.neff: {e}");
        }
    }

    pub async fn start_session(&mut self, driver_address: &str, nn_id: u32) {
        if !self.enabled() {
            return;
        }
        let dir = self.dir.as_deref().unwrap();
        let filename = format!(
            "{dir}/{}-{nn_id}-{}.ipd",
            self.mangled_name, self.session_id
        );
        tracing::debug!("starting profile session {filename}");
        match subprocess_run(&[
            "start-session",
            "-s",
            &filename,
            "-a",
            driver_address,
            &nn_id.to_string(),
        ])
        .await
        {
            Ok(()) => {
                self.session_file = Some(filename);
                self.session_id += 1;
            }
            Err(e) => {
                tracing::warn!(
                    "{PROFILE_TOOL} start-session failed ({e}); \
                     is the accelerator tools package installed?"
                );
            }
        }
    }

    pub async fn stop_session(&mut self) {
        let Some(filename) = self.session_file.take() else {
            return;
        };
        tracing::debug!("stopping profile session {filename}");
        if let Err(e) = subprocess_run(&["stop-session", "-s", &filename]).await {
            tracing::warn!("{PROFILE_TOOL} stop-session failed: {e}");
        }
    }
}

/// Guarded spawn + wait of the profiler tool.
async fn subprocess_run(args: &[&str]) -> std::io::Result<()> {
    let status = Command::new(PROFILE_TOOL).args(args).status().await?;
    if !status.success() {
        return Err(std::io::Error::other(
            "child process did not exit gracefully",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_names_are_mangled_for_filenames() {
        assert_eq!(mangle_op_name("scope/sub/op"), "scope+sub+op");
        assert_eq!(mangle_op_name("plain"), "plain");
    }

    #[test]
    fn disabled_without_profile_dir() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(config::PROFILE_DIR_ENV, "");
            let profiler = Profiler::from_env("op");
            assert!(!profiler.enabled());
            Ok(())
        });
    }

    #[test]
    fn dump_writes_both_artifacts() {
        figment::Jail::expect_with(|jail| {
            let dir = jail.directory().to_string_lossy().to_string();
            jail.set_env(config::PROFILE_DIR_ENV, &dir);
            let profiler = Profiler::from_env("a/b");
            assert!(profiler.enabled());
            profiler.dump_info(b"graph", b"artifact");
            assert_eq!(std::fs::read(format!("{dir}/a+b.pb")).unwrap(), b"graph");
            assert_eq!(
                std::fs::read(format!("{dir}/a+b.neff")).unwrap(),
                b"artifact"
            );
            Ok(())
        });
    }
}
