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

//! Command-line interface. Most of the flags here double as environment
//! variable overrides (`apply_env_overrides`), a holdover from the days
//! this agent ran unattended from a supervisor that set environment
//! instead of constructing an argv.

use clap::Parser;
use std::path::PathBuf;

pub const DEFAULT_CONFIGURATION_FILE: &str = "/etc/resinhup.conf";

#[derive(Debug, Parser)]
#[command(version, about = "Update the balena host OS on an A/B-partitioned device", long_about = None)]
pub struct Cli {
    /// Update the device to this host OS version
    #[arg(short = 'u', long, value_name = "version")]
    pub update_to_version: String,

    /// Force the device name and skip device detection
    #[arg(long, value_name = "name")]
    pub device: Option<String>,

    /// Configuration file to use
    #[arg(short = 'c', long, value_name = "path", default_value = DEFAULT_CONFIGURATION_FILE)]
    pub configuration_file: PathBuf,

    /// Force update while skipping fingerprint and version checks. Use
    /// at your own risk.
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Allow downgrading to an older version
    #[arg(long)]
    pub allow_downgrades: bool,

    /// Validate and configure config.json against staging values
    #[arg(short = 's', long)]
    pub staging: bool,

    /// Remote to search for update bundles, overriding the configuration
    /// file's [fetcher] remote
    #[arg(short = 'r', long, value_name = "url")]
    pub remote: Option<String>,

    /// Supervisor image to configure once the update completes
    #[arg(long, value_name = "image", requires = "supervisor_tag")]
    pub supervisor_image: Option<String>,

    /// Supervisor tag to configure once the update completes
    #[arg(long, value_name = "tag", requires = "supervisor_image")]
    pub supervisor_tag: Option<String>,

    /// Run in debug/verbose mode
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Don't colorize log output
    #[arg(short = 'n', long)]
    pub no_colors: bool,
}

impl Cli {
    /// Apply the legacy environment-variable overrides this agent has
    /// always honored, so it can be driven from a supervisor that sets
    /// environment rather than argv. Environment wins over the flag it
    /// shadows, matching the original's override order.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(remote) = std::env::var("REMOTE") {
            if !remote.is_empty() {
                self.remote = Some(remote);
            }
        }
        if let Ok(version) = std::env::var("VERSION") {
            if !version.is_empty() {
                self.update_to_version = version;
            }
        }
        if env_is_set("RESINHUP_STAGING") {
            self.staging = true;
        }
        if env_is_set("RESINHUP_FORCE") {
            self.force = true;
        }
        if env_is_set("ALLOW_DOWNGRADES") {
            self.allow_downgrades = true;
        }
        if let (Ok(image), Ok(tag)) = (std::env::var("SUPERVISOR_IMAGE"), std::env::var("SUPERVISOR_TAG")) {
            if !image.is_empty() && !tag.is_empty() {
                self.supervisor_image = Some(image);
                self.supervisor_tag = Some(tag);
            }
        }
    }
}

fn env_is_set(name: &str) -> bool {
    std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["resinhup", "--update-to-version", "2.43.1"]);
        assert_eq!(cli.update_to_version, "2.43.1");
        assert_eq!(cli.configuration_file, PathBuf::from(DEFAULT_CONFIGURATION_FILE));
        assert!(!cli.force);
        assert!(!cli.staging);
    }

    #[test]
    fn supervisor_image_requires_tag() {
        let result = Cli::try_parse_from(["resinhup", "--update-to-version", "2.43.1", "--supervisor-image", "balena/resinos-supervisor"]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_missing_version() {
        assert!(Cli::try_parse_from(["resinhup"]).is_err());
    }
}
