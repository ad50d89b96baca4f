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

//! The top-level pipeline: parse arguments, load configuration, run every
//! precondition check, then hand off to the repartitioner, fetcher, and
//! updater in turn. Mirrors `resinhup.py`'s `main()`.

use anyhow::{bail, Context, Result};
use rand::Rng;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use crate::bootloader;
use crate::cmdline::Cli;
use crate::configjson;
use crate::fetch;
use crate::fingerprint::{ExternalScannerOracle, FingerprintOracle};
use crate::hostconfig::HostConfig;
use crate::kernelcheck;
use crate::repartition::{Repartitioner, RepartitionerMode};
use crate::topology;
use crate::updater::Updater;

/// What the process should exit with. Kept distinct from `Result`'s
/// `Err` so "already at or past the requested version" can unwind
/// through `?` like any other early-out, while still mapping to its own
/// exit code (3) rather than a failure (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    Failure,
    AlreadyUpdated,
}

impl ExitCode {
    pub fn as_process_code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Failure => 1,
            ExitCode::AlreadyUpdated => 3,
        }
    }
}

pub fn run(cli: Cli) -> Result<ExitCode> {
    init_logger(&cli);

    let host_config = HostConfig::load(&cli.configuration_file)
        .with_context(|| format!("loading {}", cli.configuration_file.display()))?;

    if !nix::unistd::Uid::effective().is_root() {
        bail!("resinhup must be run as root");
    }
    log::debug!("using configuration file {}", cli.configuration_file.display());
    log::info!("update version {} selected", cli.update_to_version);

    let device = match &cli.device {
        Some(device) => device.clone(),
        None => {
            let config_json_path = configjson::locate(&host_config, None)
                .context("couldn't detect this board's name: no config.json found")?;
            configjson::running_device(&host_config, &config_json_path)
                .context("couldn't detect this board's name")?
        }
    };

    let supported = host_config.supported_machines();
    if supported.is_empty() {
        bail!("can't detect supported hardware ([General].supported_machines is unset)");
    }
    if !supported.iter().any(|m| m == &device) {
        bail!("{} is not a supported device for resinhup", device);
    }
    log::debug!("{} is a supported device for resinhup", device);

    if !cli.allow_downgrades {
        match current_host_os_version(&host_config) {
            Ok(current) => {
                log::debug!(
                    "current detected version: {}; requested version: {}",
                    current,
                    cli.update_to_version
                );
                if compare_versions(&current, &cli.update_to_version)? != std::cmp::Ordering::Less {
                    log::info!(
                        "the device ({}) is already at or past the requested version ({})",
                        current,
                        cli.update_to_version
                    );
                    return Ok(ExitCode::AlreadyUpdated);
                }
                log::info!("updating from {} to {}", current, cli.update_to_version);
            }
            Err(err) => {
                log::warn!("couldn't determine the current host OS version ({}); continuing update", err);
            }
        }
    } else {
        log::debug!("forcing version update since downgrades were allowed");
    }

    kernelcheck::assert_no_custom_modules().context("kernel custom-module check failed")?;
    log::info!("no custom loaded kernel modules detected");

    if !cli.force {
        validate_fingerprint(&host_config).context("fingerprint validation failed")?;
        log::info!("fingerprint validation succeeded on rootfs/boot partition");
    } else {
        log::debug!("fingerprint scan avoided as instructed");
    }

    let mut host_config = host_config;
    let config_type = if cli.staging { "staging" } else { "production" };
    log::info!("configuring update as {}", config_type);
    host_config.set("config.json", "type", config_type);

    if let (Some(image), Some(tag)) = (&cli.supervisor_image, &cli.supervisor_tag) {
        host_config.set("Supervisor", "supervisor_image", image);
        host_config.set("Supervisor", "supervisor_tag", tag);
    } else {
        log::debug!("no supervisor image/tag requested; supervisor conf won't be updated during hup");
    }

    let root_partition = topology::partition_of_mount(&host_config.host_bind_mount())
        .context("locating the live root partition")?;
    let mut repartitioner = Repartitioner::new(&root_partition, &host_config, RepartitionerMode::Live)
        .context("initializing the repartitioner")?;
    repartitioner
        .increase_boot_to(40)
        .context("failed to increase resin-boot to 40 MiB")?;

    let fetcher_kind = host_config.fetcher("type").unwrap_or("dockerhub");
    let mut fetcher = fetch::new(
        fetcher_kind,
        &host_config,
        &device,
        &cli.update_to_version,
        cli.remote.as_deref(),
    )
    .context("constructing the update fetcher")?;

    let mut last_err = None;
    for attempt in 0..3 {
        if attempt > 0 {
            let sleep_secs = rand::thread_rng().gen_range(30u64..120u64);
            log::error!("could not unpack update, retrying after {} seconds", sleep_secs);
            sleep(Duration::from_secs(sleep_secs));
        }
        match fetcher.unpack(true) {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) => last_err = Some(err),
        }
    }
    if let Some(err) = last_err {
        return Err(err).context("could not unpack update after 3 attempts");
    }

    let mut update = Updater::new(fetcher, &host_config);
    match update.upgrade_system() {
        Ok(()) => {
            update.cleanup();
            Ok(ExitCode::Success)
        }
        Err(err) => {
            update.cleanup();
            Err(err).context("could not upgrade the system")
        }
    }
}

fn init_logger(cli: &Cli) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(if cli.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    builder.parse_env("RUST_LOG");
    builder.write_style(if cli.no_colors {
        env_logger::WriteStyle::Never
    } else {
        env_logger::WriteStyle::Auto
    });
    builder.init();
    if cli.debug {
        log::debug!("running in debug/verbose mode");
    }
}

fn validate_fingerprint(host_config: &HostConfig) -> Result<()> {
    let root_mount = host_config.host_bind_mount();
    let boot_device = bootloader::boot_partition(host_config).context("locating the boot partition")?;
    let (_mount, _boot_mountpoint) = bootloader::mount_boot_rw(&boot_device).context("mounting resin-boot")?;

    let oracle = ExternalScannerOracle::new(host_config);
    if !oracle.validate(Path::new(&root_mount))? {
        bail!("cannot validate the current image fingerprint on the rootfs/boot partition");
    }
    Ok(())
}

/// Read `VERSION` out of `<host_bind_mount>/etc/os-release`. Mirrors
/// `getCurrentHostOSVersion`.
fn current_host_os_version(host_config: &HostConfig) -> Result<String> {
    let root_mount = host_config.host_bind_mount();
    let os_release = Path::new(&root_mount).join("etc/os-release");
    let text = std::fs::read_to_string(&os_release)
        .with_context(|| format!("reading {}", os_release.display()))?;
    for line in text.lines() {
        if let Some((attribute, value)) = line.split_once('=') {
            if attribute == "VERSION" {
                return Ok(value.trim().trim_matches('"').to_string());
            }
        }
    }
    bail!("{} has no VERSION line", os_release.display());
}

/// Compare two `x.y.z` version strings numerically, component by
/// component. Stands in for Python's `StrictVersion`: like it, this
/// rejects anything that isn't a well-formed `x.y[.z]` rather than
/// falling back to a lexicographic string compare.
fn compare_versions(a: &str, b: &str) -> Result<std::cmp::Ordering> {
    Ok(parse_version(a)?.cmp(&parse_version(b)?))
}

fn parse_version(v: &str) -> Result<(u64, u64, u64)> {
    let mut parts = v.trim().splitn(3, '.');
    let major = parts
        .next()
        .context("empty version string")?
        .parse()
        .with_context(|| format!("parsing major version of {}", v))?;
    let minor = parts
        .next()
        .unwrap_or("0")
        .parse()
        .with_context(|| format!("parsing minor version of {}", v))?;
    let patch = parts
        .next()
        .unwrap_or("0")
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("0")
        .parse()
        .with_context(|| format!("parsing patch version of {}", v))?;
    Ok((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn parse_version_handles_two_and_three_component_forms() {
        assert_eq!(parse_version("2.43.1").unwrap(), (2, 43, 1));
        assert_eq!(parse_version("2.43").unwrap(), (2, 43, 0));
    }

    #[test]
    fn compare_versions_detects_already_updated() {
        assert_eq!(compare_versions("2.43.1", "2.43.1").unwrap(), Ordering::Equal);
        assert_eq!(compare_versions("2.44.0", "2.43.1").unwrap(), Ordering::Greater);
        assert_eq!(compare_versions("2.40.0", "2.43.1").unwrap(), Ordering::Less);
    }

    #[test]
    fn compare_versions_rejects_malformed_input() {
        assert!(compare_versions("not-a-version", "2.43.1").is_err());
    }
}
