// Copyright 2024 Balena Ltd.
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

//! The fingerprint precondition: a yes/no answer to "does the live image
//! match a known-good checksum set?", skipped entirely with `--force`.
//!
//! Actually walking the rootfs and comparing MD5s against a known-image
//! database is someone else's system (the build pipeline that produces
//! those checksum sets in the first place); this agent only needs the
//! boolean answer, so the real work is delegated to an external scanner
//! command configured in `[FingerPrintScanner]`.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

use crate::hostconfig::HostConfig;

pub trait FingerprintOracle {
    /// `true` if the live image's fingerprint matches a known-good set.
    fn validate(&self, root_mount: &Path) -> Result<bool>;
}

/// Shells out to `[FingerPrintScanner].scanner_command`, passing the root
/// mountpoint as its only argument, and treats a zero exit status as
/// "validated". Mirrors `FingerPrintScanner.validateFingerPrints`'s
/// boolean result without reimplementing its MD5 tree walk.
pub struct ExternalScannerOracle<'a> {
    host_config: &'a HostConfig,
}

impl<'a> ExternalScannerOracle<'a> {
    pub fn new(host_config: &'a HostConfig) -> Self {
        ExternalScannerOracle { host_config }
    }
}

impl<'a> FingerprintOracle for ExternalScannerOracle<'a> {
    fn validate(&self, root_mount: &Path) -> Result<bool> {
        let command = self
            .host_config
            .fingerprint_scanner("scanner_command")
            .context("[FingerPrintScanner].scanner_command is not configured")?;

        let status = Command::new(command)
            .arg(root_mount)
            .status()
            .with_context(|| format!("running fingerprint scanner {}", command))?;
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_scanner_command_is_an_error_not_a_silent_pass() {
        let cfg = HostConfig::in_memory("[General]\n").unwrap();
        let oracle = ExternalScannerOracle::new(&cfg);
        assert!(oracle.validate(Path::new("/")).is_err());
    }

    #[test]
    fn scanner_exit_status_maps_to_boolean() {
        let cfg = HostConfig::in_memory("[FingerPrintScanner]\nscanner_command = /bin/true\n").unwrap();
        let oracle = ExternalScannerOracle::new(&cfg);
        assert!(oracle.validate(Path::new("/")).unwrap());

        let cfg = HostConfig::in_memory("[FingerPrintScanner]\nscanner_command = /bin/false\n").unwrap();
        let oracle = ExternalScannerOracle::new(&cfg);
        assert!(!oracle.validate(Path::new("/")).unwrap());
    }
}
