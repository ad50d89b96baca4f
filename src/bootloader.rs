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

//! Pointing the bootloader at a different root partition after an update
//! (or after a repartitioning reboot). Each supported board keeps this
//! pointer in a different file on `resin-boot`, in a different format, so
//! there's one small implementation per board rather than a shared one.

use anyhow::{bail, Context, Result};
use nix::mount::MsFlags;
use std::fs;
use std::path::{Path, PathBuf};

use crate::configjson;
use crate::hostconfig::HostConfig;
use crate::topology::{self, Mount};

/// Retarget the bootloader from `old` to `new` (partition device paths,
/// e.g. `/dev/mmcblk0p2` -> `/dev/mmcblk0p3`), dispatching on the running
/// device's `deviceType`. Mirrors `configureBootloader`.
pub fn configure(old: &str, new: &str, host_config: &HostConfig) -> Result<()> {
    let device_type = current_device_type(host_config)?;
    match device_type.as_str() {
        "raspberry-pi" | "raspberry-pi2" | "raspberrypi3" | "raspberrypi4-64" => {
            RaspberryPiBootloader.configure(old, new, host_config)
        }
        "intel-nuc" => GrubNucBootloader.configure(old, new, host_config),
        "beaglebone-black" => UBootBeagleboneBootloader.configure(old, new, host_config),
        other => bail!("no bootloader configuration support for device type {}", other),
    }
}

fn current_device_type(host_config: &HostConfig) -> Result<String> {
    let config_json_path = configjson::locate(host_config, None)
        .context("couldn't locate config.json to determine the running device type")?;
    configjson::running_device(host_config, &config_json_path)
}

trait Bootloader {
    /// Path, relative to the `resin-boot` mountpoint, of the file holding
    /// the bootloader's root-partition pointer.
    fn config_file(&self) -> &'static str;

    /// Replace `old` with `new` in `config_file`. The boot partition is
    /// mounted read-write for the duration of the call if it wasn't
    /// already.
    fn configure(&self, old: &str, new: &str, host_config: &HostConfig) -> Result<()> {
        let boot_device = boot_partition(host_config)?;
        let (mount, mountpoint) = mount_boot_rw(&boot_device)?;
        let config_path = mountpoint.join(self.config_file());
        self.transform(&config_path, old, new)?;
        drop(mount);
        Ok(())
    }

    fn transform(&self, config_path: &Path, old: &str, new: &str) -> Result<()> {
        apply_text_transformation(config_path, old, new)
    }
}

struct RaspberryPiBootloader;

impl Bootloader for RaspberryPiBootloader {
    fn config_file(&self) -> &'static str {
        "cmdline.txt"
    }
}

struct GrubNucBootloader;

impl Bootloader for GrubNucBootloader {
    fn config_file(&self) -> &'static str {
        "EFI/BOOT/grub.cfg"
    }
}

struct UBootBeagleboneBootloader;

impl Bootloader for UBootBeagleboneBootloader {
    fn config_file(&self) -> &'static str {
        "uEnv.txt"
    }

    fn transform(&self, config_path: &Path, old: &str, new: &str) -> Result<()> {
        tweak_u_env(config_path)?;
        let old_idx = partition_index(old)?;
        let new_idx = partition_index(new)?;
        apply_text_transformation(
            config_path,
            &format!("bootpart=1:{}", old_idx),
            &format!("bootpart=1:{}", new_idx),
        )
    }
}

fn partition_index(device: &str) -> Result<u32> {
    let (_, idx) = topology::split_trailing_index(device)
        .with_context(|| format!("{} has no numeric partition index", device))?;
    idx.parse().with_context(|| format!("parsing index of {}", device))
}

/// Drop `setemmcroot=...` lines (the current u-boot build no longer reads
/// that variable) and make sure `finduuid=` points at the configurable
/// `${bootpart}` variable rather than a hardcoded partition. Mirrors
/// `tweakUEnv`.
fn tweak_u_env(u_env_path: &Path) -> Result<()> {
    if !u_env_path.is_file() {
        bail!("{} doesn't exist; is uEnv.txt present on resin-boot?", u_env_path.display());
    }
    const FIND_UUID: &str = "finduuid=part uuid mmc ${bootpart} uuid\n";

    let text = fs::read_to_string(u_env_path).with_context(|| format!("reading {}", u_env_path.display()))?;
    let mut out = String::with_capacity(text.len());
    let mut found_find_uuid = false;
    for line in text.lines() {
        if line.contains("setemmcroot") {
            continue;
        }
        if line.starts_with("finduuid=") {
            out.push_str(FIND_UUID);
            found_find_uuid = true;
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !found_find_uuid {
        out.push_str(FIND_UUID);
    }

    crate::io_util::atomic_write(u_env_path, out.as_bytes())
}

/// Replace every occurrence of `old` with `new` in `config_path`, via a
/// scratch-file-and-rename so a crash mid-write can't leave a half
/// rewritten bootloader config behind. Mirrors
/// `BootloaderConfigurator.applyTextTransformation`.
fn apply_text_transformation(config_path: &Path, old: &str, new: &str) -> Result<()> {
    if !config_path.is_file() {
        bail!("{} doesn't exist", config_path.display());
    }
    let text = fs::read_to_string(config_path).with_context(|| format!("reading {}", config_path.display()))?;
    let replaced = text.replace(old, new);
    crate::io_util::atomic_write(config_path, replaced.as_bytes())
}

/// Mount the boot partition read-write, reusing its existing mountpoint
/// if it's already mounted (remounting `rw` if needed), otherwise mounting
/// it fresh. The owned `Mount` is `None` when we reused an existing
/// mountpoint, since that mount's lifetime isn't ours to manage.
pub(crate) fn mount_boot_rw(boot_device: &str) -> Result<(Option<Mount>, PathBuf)> {
    if topology::is_mounted(boot_device) {
        let existing = Mount::from_existing(boot_device)?;
        let mountpoint = existing.mountpoint().to_path_buf();
        ensure_rw(&mountpoint, boot_device)?;
        return Ok((None, mountpoint));
    }
    let mount = Mount::try_mount(boot_device, "vfat", MsFlags::empty())
        .with_context(|| format!("mounting {}", boot_device))?;
    let mountpoint = mount.mountpoint().to_path_buf();
    Ok((Some(mount), mountpoint))
}

fn ensure_rw(mountpoint: &Path, boot_device: &str) -> Result<()> {
    let stat = nix::sys::statvfs::statvfs(mountpoint)
        .with_context(|| format!("statvfs {}", mountpoint.display()))?;
    if !stat.flags().contains(nix::sys::statvfs::FsFlags::ST_RDONLY) {
        return Ok(());
    }
    nix::mount::mount::<str, Path, str, str>(
        None,
        mountpoint,
        None,
        MsFlags::MS_REMOUNT,
        None,
    )
    .with_context(|| format!("remounting {} ({}) read-write", mountpoint.display(), boot_device))?;
    Ok(())
}

pub(crate) fn boot_partition(host_config: &HostConfig) -> Result<String> {
    let root_partition = topology::partition_of_mount(&host_config.host_bind_mount())?;
    topology::boot_partition(&root_partition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn apply_text_transformation_replaces_all_occurrences() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cmdline.txt");
        fs::write(&path, "root=/dev/mmcblk0p2 rootwait quiet\n").unwrap();
        apply_text_transformation(&path, "/dev/mmcblk0p2", "/dev/mmcblk0p3").unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "root=/dev/mmcblk0p3 rootwait quiet\n");
    }

    #[test]
    fn apply_text_transformation_errors_on_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        assert!(apply_text_transformation(&path, "a", "b").is_err());
    }

    #[test]
    fn tweak_u_env_drops_setemmcroot_and_rewrites_finduuid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uEnv.txt");
        fs::write(&path, "setemmcroot=run emmcboot\nfinduuid=part uuid mmc 0 uuid\nbootpart=1:2\n").unwrap();
        tweak_u_env(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("setemmcroot"));
        assert!(contents.contains("finduuid=part uuid mmc ${bootpart} uuid"));
        assert!(contents.contains("bootpart=1:2"));
    }

    #[test]
    fn tweak_u_env_appends_finduuid_when_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uEnv.txt");
        fs::write(&path, "bootpart=1:2\n").unwrap();
        tweak_u_env(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("finduuid=part uuid mmc ${bootpart} uuid"));
    }

    #[test]
    fn partition_index_parses_trailing_digits() {
        assert_eq!(partition_index("/dev/mmcblk0p3").unwrap(), 3);
    }
}
