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

//! Laying a fetched update bundle down onto the inactive root partition
//! and preparing it to be booted into: formatting, overlaying configured
//! files, copying boot files, fixing up filesystem labels and
//! `config.json`, and retargeting the bootloader. Mirrors `Updater`.

use anyhow::{bail, Context, Result};
use nix::mount::MsFlags;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::bootloader;
use crate::configjson;
use crate::fetch::Fetcher;
use crate::hostconfig::HostConfig;
use crate::io_util;
use crate::topology::{self, Mount};

pub struct Updater<'a> {
    fetcher: Box<dyn Fetcher>,
    host_config: &'a HostConfig,
    root_mount: Option<Mount>,
    boot_mount: Option<Mount>,
    boot_mountpoint: Option<PathBuf>,
}

impl<'a> Updater<'a> {
    pub fn new(fetcher: Box<dyn Fetcher>, host_config: &'a HostConfig) -> Self {
        Updater {
            fetcher,
            host_config,
            root_mount: None,
            boot_mount: None,
            boot_mountpoint: None,
        }
    }

    /// Run every step of laying down and configuring the update, in order.
    /// Mirrors `upgradeSystem`.
    pub fn upgrade_system(&mut self) -> Result<()> {
        log::info!("starting system upgrade");
        self.update_rootfs().context("updating rootfs")?;
        self.update_boot().context("updating boot files")?;
        self.fix_fs_labels().context("fixing filesystem labels")?;
        configjson::verify(self.host_config, &self.config_json_path()?).context("verifying config.json")?;

        let current_root = topology::partition_of_mount(&self.host_config.host_bind_mount())
            .context("locating the live root partition")?;
        let (update_device, _) = to_update_root_device(self.host_config)
            .context("locating the update rootfs device to configure the bootloader against")?;
        bootloader::configure(&current_root, &update_device, self.host_config)
            .context("configuring the bootloader")?;

        self.update_supervisor_conf().context("updating supervisor conf")?;
        log::info!("finished system upgrade");
        Ok(())
    }

    /// Unmount the new rootfs. Leaves the boot partition mounted read-write
    /// the way `cleanup` does (the original agent remounts it `ro`, which
    /// only matters if the live OS itself bind-mounts `resin-boot`; this
    /// port leaves that to whatever unmounts `host_bind_mount` on exit).
    pub fn cleanup(&mut self) {
        log::info!("cleaning up updater state");
        self.root_mount = None;
        self.boot_mount = None;
        self.boot_mountpoint = None;
    }

    fn config_json_path(&self) -> Result<PathBuf> {
        let boot_mountpoint = self.boot_mountpoint.as_deref();
        configjson::locate(self.host_config, boot_mountpoint)
            .context("couldn't locate config.json on the updated boot partition")
    }

    fn ensure_boot_mounted(&mut self) -> Result<PathBuf> {
        if let Some(mountpoint) = &self.boot_mountpoint {
            return Ok(mountpoint.clone());
        }
        let boot_device = bootloader::boot_partition(self.host_config)?;
        let (mount, mountpoint) = bootloader::mount_boot_rw(&boot_device)?;
        self.boot_mount = mount;
        self.boot_mountpoint = Some(mountpoint.clone());
        Ok(mountpoint)
    }

    fn unpack_new_rootfs(&mut self) -> Result<()> {
        log::info!("preparing new rootfs; this will take a while");
        let current = topology::partition_of_mount(&self.host_config.host_bind_mount())
            .context("locating the live root partition")?;

        let (update_device, update_label) = match to_update_root_device(self.host_config) {
            Ok(pair) => pair,
            Err(_) => {
                // Old host OS: the live root isn't labeled at all yet.
                // Assume it's resin-root and retry the lookup once.
                topology::label_ext(&current, topology::LABEL_ROOT)
                    .with_context(|| format!("labeling {} as {}", current, topology::LABEL_ROOT))?;
                to_update_root_device(self.host_config).context("can't find the update rootfs device")?
            }
        };

        if topology::is_mounted(&update_device) {
            unmount_device(&update_device).with_context(|| format!("unmounting {}", update_device))?;
        }
        topology::format_ext3(&update_device, update_label)
            .with_context(|| format!("formatting {} as ext3", update_device))?;

        let mount = Mount::try_mount(&update_device, "ext3", MsFlags::empty())
            .with_context(|| format!("mounting {}", update_device))?;

        self.fetcher
            .unpack_rootfs(mount.mountpoint())
            .context("unpacking rootfs")?;
        self.fetcher
            .unpack_quirks(mount.mountpoint())
            .context("unpacking rootfs quirks")?;

        self.root_mount = Some(mount);
        Ok(())
    }

    /// Copy any files the host configuration says should survive the
    /// update from the live rootfs onto the new one. Mirrors
    /// `rootfsOverlay`.
    fn rootfs_overlay(&self) -> Result<()> {
        log::info!("overlaying configured files onto the new rootfs");
        let Some(overlay) = self.host_config.rootfs("to_keep_files") else {
            log::warn!("nothing configured to overlay");
            return Ok(());
        };

        let root_mount = self.host_config.host_bind_mount();
        let dest_root = self
            .root_mount
            .as_ref()
            .context("rootfs_overlay called before the new rootfs was mounted")?
            .mountpoint();

        for raw_item in overlay.split_whitespace() {
            let item = raw_item.trim();
            if item.is_empty() || item.starts_with('#') || item.starts_with(';') {
                continue;
            }
            let mut parts = item.splitn(2, ':');
            let src = parts.next().unwrap();
            let dst = parts.next().unwrap_or(src);

            let src_path = Path::new(&root_mount).join(src.strip_prefix('/').unwrap_or(src));
            if !src_path.exists() {
                log::warn!(
                    "{} was not found in the current mounted rootfs; can't overlay",
                    src_path.display()
                );
                continue;
            }
            let dst_path = dest_root.join(dst.strip_prefix('/').unwrap_or(dst));
            io_util::copy_any(&src_path, &dst_path, true, &[])
                .with_context(|| format!("overlaying {} onto {}", src_path.display(), dst_path.display()))?;
            log::debug!("overlaid {} in {}", src_path.display(), dest_root.display());
        }
        Ok(())
    }

    fn update_rootfs(&mut self) -> Result<()> {
        self.unpack_new_rootfs().context("could not unpack new rootfs")?;
        self.rootfs_overlay().context("could not overlay new rootfs")?;
        Ok(())
    }

    /// Copy each boot file the fetched bundle ships onto the boot
    /// partition, skipping anything whitelisted and backing up a
    /// same-named text file already there rather than clobbering it
    /// silently. Mirrors `updateBoot`.
    fn update_boot(&mut self) -> Result<()> {
        log::info!("upgrading boot files");
        let boot_files = self.fetcher.boot_files().context("listing update bundle boot files")?;

        let Some(ignore_raw) = self.host_config.fingerprint_scanner("boot_whitelist") else {
            log::warn!("update_boot: no files configured to be ignored");
            return Ok(());
        };
        let ignore: HashSet<&str> = ignore_raw.split_whitespace().collect();

        let boot_mountpoint = self.ensure_boot_mounted()?;
        let boot_files_src = self.fetcher.boot_files_dir().to_path_buf();

        for relative in boot_files {
            let relative_str = relative.to_string_lossy().into_owned();
            if ignore.contains(relative_str.as_str()) {
                log::warn!("{} was ignored due to boot_whitelist configuration", relative_str);
                continue;
            }
            let src = boot_files_src.join(&relative);
            let dst = boot_mountpoint.join(&relative);

            if dst.is_file() {
                if is_text_file(&src)? && is_text_file(&dst)? {
                    log::warn!("{} already exists in boot partition; backing it up", relative_str);
                    let backup = append_extension(&dst, "hup.old");
                    fs::rename(&dst, &backup)
                        .with_context(|| format!("backing up {} to {}", dst.display(), backup.display()))?;
                } else {
                    log::warn!("non-text file {} will be overwritten", relative_str);
                }
            }
            io_util::copy_any(&src, &dst, true, &[])
                .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
            log::debug!("copied {} to {}", src.display(), dst.display());
        }
        Ok(())
    }

    /// Rewrite `SUPERVISOR_IMAGE`/`SUPERVISOR_TAG` in the new rootfs's
    /// `etc/supervisor.conf` to the values configured for this run, if any
    /// were given. Mirrors `updateSupervisorConf`.
    fn update_supervisor_conf(&self) -> Result<()> {
        log::info!("upgrading supervisor conf");
        let (Some(image), Some(tag)) = (
            self.host_config.supervisor("supervisor_image"),
            self.host_config.supervisor("supervisor_tag"),
        ) else {
            log::debug!("no supervisor conf update performed; no supervisor info was passed");
            return Ok(());
        };

        let supervisor_conf = self
            .root_mount
            .as_ref()
            .context("update_supervisor_conf called before the new rootfs was mounted")?
            .mountpoint()
            .join("etc/supervisor.conf");

        let existing = fs::read_to_string(&supervisor_conf)
            .with_context(|| format!("reading {}", supervisor_conf.display()))?;
        let mut rewritten = String::with_capacity(existing.len());
        for line in existing.lines() {
            if line.starts_with("SUPERVISOR_IMAGE=") || line.starts_with("SUPERVISOR_TAG=") {
                continue;
            }
            rewritten.push_str(line);
            rewritten.push('\n');
        }
        log::debug!("adding SUPERVISOR_IMAGE={}", image);
        rewritten.push_str(&format!("SUPERVISOR_IMAGE={}\n", image));
        log::debug!("adding SUPERVISOR_TAG={}", tag);
        rewritten.push_str(&format!("SUPERVISOR_TAG={}\n", tag));

        io_util::atomic_write(&supervisor_conf, rewritten.as_bytes())
            .with_context(|| format!("writing {}", supervisor_conf.display()))
    }

    /// Make sure every well-known partition carries its expected label,
    /// recreating `config.json` from a legacy location if needed. Mirrors
    /// `fixFsLabels`.
    fn fix_fs_labels(&mut self) -> Result<()> {
        log::info!("fixing the labels of all the filesystems");

        if topology::device_by_label(topology::LABEL_BOOT).is_none() {
            let boot_device = bootloader::boot_partition(self.host_config)
                .context("locating the boot partition to label it")?;
            topology::label_vfat(&boot_device, topology::LABEL_BOOT)
                .with_context(|| format!("labeling {} as {}", boot_device, topology::LABEL_BOOT))?;
        }

        // resin-root and resin-updt are labeled as part of unpack_new_rootfs
        // and the pre-update relabel fallback in to_update_root_device; if
        // neither carries its label by now something upstream went wrong.
        if topology::device_by_label(topology::LABEL_ROOT).is_none() {
            bail!("no partition is labeled {}", topology::LABEL_ROOT);
        }
        if topology::device_by_label(topology::LABEL_UPDT).is_none() {
            bail!("no partition is labeled {}", topology::LABEL_UPDT);
        }

        let boot_mountpoint = self.ensure_boot_mounted()?;
        configjson::migrate(self.host_config, &boot_mountpoint).context("migrating config.json")?;

        if topology::device_by_label(topology::LABEL_DATA).is_none() {
            let current_root = topology::partition_of_mount(&self.host_config.host_bind_mount())
                .context("locating the live root partition")?;
            let disk = topology::root_device_of(&current_root);
            let hint = topology::data_partition_fallback(&disk)
                .map(|dev| format!(" (it looks like {})", dev))
                .unwrap_or_default();
            bail!(
                "can't label the btrfs data partition automatically; label it manually with: \
                 btrfs filesystem label <device> {}{}",
                topology::LABEL_DATA,
                hint
            );
        }

        Ok(())
    }
}

/// Locate the partition to update: the twin of whichever of
/// `resin-root`/`resin-updt` the device is currently booted from, falling
/// back to a relative-index guess if the twin isn't labeled yet. Mirrors
/// `toUpdateRootDevice`.
fn to_update_root_device(host_config: &HostConfig) -> Result<(String, &'static str)> {
    let current = topology::partition_of_mount(&host_config.host_bind_mount())
        .context("locating the live root partition")?;
    let current_label = partition_label(&current);

    if current_label.as_deref() == Some(topology::LABEL_ROOT) {
        if let Some(device) = topology::device_by_label(topology::LABEL_UPDT) {
            log::debug!("device to be used as rootfs update: {}", device);
            return Ok((device, topology::LABEL_UPDT));
        }
        let (prefix, idx) = topology::split_trailing_index(&current)
            .with_context(|| format!("{} has no numeric partition index", current))?;
        let idx: i64 = idx.parse().context("parsing partition index")?;
        if idx > 0 {
            let guess = format!("{}{}", prefix, idx + 1);
            log::warn!("didn't find resin-updt; guessed it as {}", guess);
            return Ok((guess, topology::LABEL_UPDT));
        }
        bail!("bad device path {}", current);
    } else if current_label.as_deref() == Some(topology::LABEL_UPDT) {
        if let Some(device) = topology::device_by_label(topology::LABEL_ROOT) {
            log::debug!("device to be used as rootfs update: {}", device);
            return Ok((device, topology::LABEL_ROOT));
        }
        let (prefix, idx) = topology::split_trailing_index(&current)
            .with_context(|| format!("{} has no numeric partition index", current))?;
        let idx: i64 = idx.parse().context("parsing partition index")?;
        if idx > 1 {
            let guess = format!("{}{}", prefix, idx - 1);
            log::warn!("didn't find resin-root; guessed it as {}", guess);
            return Ok((guess, topology::LABEL_ROOT));
        }
        bail!("bad device path {}", current);
    }

    bail!(
        "live root partition {} is labeled neither {} nor {}",
        current,
        topology::LABEL_ROOT,
        topology::LABEL_UPDT
    );
}

fn partition_label(device: &str) -> Option<String> {
    topology::lsblk_single(Path::new(device))
        .ok()?
        .get("LABEL")
        .filter(|s| !s.is_empty())
        .cloned()
}

/// Unmount a device we don't hold a [`Mount`] handle for, by looking up its
/// current mountpoint in the live mount table. Mirrors the original's plain
/// `umount(device)` calls, which operate by device path rather than a
/// handle the caller owns.
fn unmount_device(device: &str) -> Result<()> {
    let mounts = fs::read_to_string("/proc/self/mounts").context("reading mount table")?;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let Some(mount_device) = fields.next() else { continue };
        let Some(mountpoint) = fields.next() else { continue };
        if mount_device == device {
            nix::mount::umount(mountpoint).with_context(|| format!("unmounting {}", mountpoint))?;
            return Ok(());
        }
    }
    Ok(())
}

fn append_extension(path: &Path, extra: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(extra);
    path.with_file_name(name)
}

/// Whether `path` looks like a text file: no NUL byte in the first few KiB,
/// the same heuristic binary-content sniffers (and the original agent's
/// `is_binary` dependency) use in place of inspecting every byte.
fn is_text_file(path: &Path) -> Result<bool> {
    use std::io::Read;
    let mut file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut buf = [0u8; 8192];
    let n = file.read(&mut buf).with_context(|| format!("reading {}", path.display()))?;
    Ok(!buf[..n].contains(&0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_extension_preserves_original_name() {
        let path = Path::new("/mnt/resin-boot/config.txt");
        assert_eq!(append_extension(path, "hup.old"), Path::new("/mnt/resin-boot/config.txt.hup.old"));
    }

    #[test]
    fn is_text_file_detects_nul_bytes() {
        let dir = tempdir().unwrap();
        let text_path = dir.path().join("cmdline.txt");
        fs::write(&text_path, b"root=/dev/mmcblk0p2 quiet\n").unwrap();
        assert!(is_text_file(&text_path).unwrap());

        let binary_path = dir.path().join("bootcode.bin");
        fs::write(&binary_path, [0u8, 1, 2, 3, 0, 5]).unwrap();
        assert!(!is_text_file(&binary_path).unwrap());
    }

    #[test]
    fn update_supervisor_conf_is_a_noop_without_supervisor_config() {
        let dir = tempdir().unwrap();
        let cfg = HostConfig::in_memory("[General]\n").unwrap();
        struct NullFetcher;
        impl Fetcher for NullFetcher {
            fn download(&mut self) -> Result<()> {
                Ok(())
            }
            fn unpack(&mut self, _download_first: bool) -> Result<()> {
                Ok(())
            }
            fn unpack_rootfs(&self, _location: &Path) -> Result<()> {
                Ok(())
            }
            fn unpack_quirks(&self, _location: &Path) -> Result<()> {
                Ok(())
            }
            fn boot_files(&self) -> Result<Vec<PathBuf>> {
                Ok(Vec::new())
            }
            fn boot_files_dir(&self) -> &Path {
                Path::new("/dev/null")
            }
        }
        let updater = Updater::new(Box::new(NullFetcher), &cfg);
        updater.update_supervisor_conf().unwrap();
        let _ = dir;
    }
}
