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

//! Discovery of the A/B partition layout of the running device, and the
//! handful of block-device primitives (mounting, lsblk parsing, partition
//! table reread) the rest of the agent builds on.

use anyhow::{anyhow, bail, Context, Result};
use nix::{errno::Errno, mount, sched};
use regex::Regex;
use std::collections::HashMap;
use std::env;
use std::fs::{read_to_string, remove_dir, File, OpenOptions};
use std::num::NonZeroU32;
use std::os::raw::c_int;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Once;
use std::thread::sleep;
use std::time::Duration;

use crate::runcmd;
use crate::util::cmd_output;

/// Well-known partition labels on a balena-style host OS disk, in on-disk
/// order for the primary table. `resin-conf` and `resin-data` live inside
/// the extended partition and are discovered separately. `resin-root` and
/// `resin-updt` are the two symmetric A/B root partitions; exactly one of
/// them is live at any moment.
pub const LABEL_BOOT: &str = "resin-boot";
pub const LABEL_ROOT: &str = "resin-root";
pub const LABEL_UPDT: &str = "resin-updt";
pub const LABEL_CONF: &str = "resin-conf";
pub const LABEL_DATA: &str = "resin-data";

/// Primary-table partition numbers on the standard layout (§6 of the
/// agent's external interface contract): boot first, then the A/B roots,
/// then the extended partition holding the logical config/data volumes.
pub const PARTNO_BOOT: u32 = 1;
pub const PARTNO_ROOT: u32 = 2;
pub const PARTNO_UPDT: u32 = 3;
pub const PARTNO_EXTENDED: u32 = 4;

#[derive(Debug, Clone)]
pub struct Partition {
    pub path: String,
    pub label: Option<String>,
    pub fstype: Option<String>,
    pub parent: String,
    pub mountpoint: Option<String>,
}

impl Partition {
    /// The trailing numeric index of a partition device node, e.g. `3` for
    /// `/dev/mmcblk0p3` or `/dev/sda3`. Used throughout the original agent
    /// to find a partition "relative to" another one on the same disk.
    pub fn index(&self) -> Result<u32> {
        let (_, idx) = split_trailing_index(&self.path)
            .with_context(|| format!("partition {} has no numeric index", self.path))?;
        idx.parse()
            .with_context(|| format!("parsing index of {}", self.path))
    }
}

/// Format `path` as ext3 with filesystem label `label`. Mirrors
/// `formatEXT3`.
pub fn format_ext3(path: &str, label: &str) -> Result<()> {
    runcmd!("mkfs.ext3", "-F", "-L", label, path)
}

/// Format `path` as FAT32 with volume label `label`. Mirrors `formatVFAT`
/// (the original also pins the sector size to 512 via `-S 512`).
pub fn format_vfat(path: &str, label: &str) -> Result<()> {
    runcmd!("mkfs.vfat", "-n", label, "-S", "512", path)
}

/// Set the label of an already-formatted ext* filesystem. Mirrors
/// `setDeviceLabel`.
pub fn label_ext(path: &str, label: &str) -> Result<()> {
    runcmd!("e2label", path, label)
}

/// Set the label of an already-formatted FAT filesystem. Mirrors
/// `setVFATDeviceLabel`.
pub fn label_vfat(path: &str, label: &str) -> Result<()> {
    runcmd!("dosfslabel", path, label)
}

/// Split a device path into its non-digit prefix and its trailing digit
/// run, e.g. `/dev/mmcblk0p12` -> (`/dev/mmcblk0p`, `12`). Mirrors the
/// regex `(.*?)(\d+$)` used throughout the original Python agent to guess
/// a sibling partition from a known one.
pub fn split_trailing_index(path: &str) -> Option<(&str, &str)> {
    lazy_static::lazy_static! {
        static ref RE: Regex = Regex::new(r"^(.*?)(\d+)$").unwrap();
    }
    let caps = RE.captures(path)?;
    let whole = caps.get(0)?.as_str();
    let digits = caps.get(2)?.as_str();
    let prefix_len = whole.len() - digits.len();
    Some((&path[..prefix_len], digits))
}

/// Truncate a partition device path down to its parent disk device, e.g.
/// `/dev/sda1` -> `/dev/sda`, `/dev/mmcblk0p1` -> `/dev/mmcblk0`. The
/// original strips one trailing digit for `sdX`-style names and two for
/// `mmcblkXpY`/`nvmeXnYpZ`-style names (the `p` before the partition
/// index on devices whose base name already ends in a digit).
pub fn root_device_of(partition: &str) -> String {
    if partition.contains("mmcblk") || partition.contains("nvme") {
        let trimmed = partition.trim_end_matches(char::is_numeric);
        trimmed.trim_end_matches('p').to_string()
    } else {
        partition.trim_end_matches(char::is_numeric).to_string()
    }
}

#[derive(Debug)]
pub struct Disk {
    pub path: String,
}

impl Disk {
    pub fn new(path: &str) -> Result<Self> {
        let canon_path = Path::new(path)
            .canonicalize()
            .with_context(|| format!("canonicalizing {}", path))?;
        let canon_path = canon_path
            .to_str()
            .with_context(|| format!("path {} is not UTF-8", canon_path.display()))?
            .to_string();
        Ok(Disk { path: canon_path })
    }

    pub fn get_partitions(&self) -> Result<Vec<Partition>> {
        let mut result = Vec::new();
        for devinfo in lsblk(Path::new(&self.path), true)? {
            let name = match devinfo.get("NAME") {
                Some(n) => n.clone(),
                None => continue,
            };
            match devinfo.get("TYPE").map(String::as_str) {
                Some("part") => (),
                _ => continue,
            }
            result.push(Partition {
                path: name,
                label: devinfo.get("LABEL").cloned(),
                fstype: devinfo.get("FSTYPE").cloned(),
                parent: self.path.clone(),
                mountpoint: devinfo.get("MOUNTPOINT").filter(|s| !s.is_empty()).cloned(),
            });
        }
        Ok(result)
    }

    pub fn partition_by_label(&self, label: &str) -> Result<Partition> {
        let matches: Vec<Partition> = self
            .get_partitions()?
            .into_iter()
            .filter(|p| p.label.as_deref() == Some(label))
            .collect();
        match matches.len() {
            0 => bail!("couldn't find a partition labeled {} on {}", label, self.path),
            1 => Ok(matches.into_iter().next().unwrap()),
            _ => bail!("found multiple partitions labeled {} on {}", label, self.path),
        }
    }

    pub fn mount_by_label(&self, label: &str, flags: mount::MsFlags) -> Result<Mount> {
        let part = self.partition_by_label(label)?;
        match &part.fstype {
            Some(fstype) => Mount::try_mount(&part.path, fstype, flags),
            None => bail!("couldn't determine filesystem type of {}", label),
        }
    }

    pub fn reread_partition_table(&self) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path))?;
        reread_partition_table(&mut file)
    }
}

#[derive(Debug)]
pub struct Mount {
    device: String,
    mountpoint: PathBuf,
    owned: bool,
}

impl Mount {
    pub fn try_mount(device: &str, fstype: &str, flags: mount::MsFlags) -> Result<Mount> {
        let tempdir = tempfile::Builder::new()
            .prefix("resinhup-")
            .tempdir()
            .context("creating temporary mountpoint")?;
        // avoid auto-cleanup of tempdir, which could recursively remove
        // the partition contents if umount failed
        let mountpoint = tempdir.into_path();

        match env::var("RESINHUP_NO_MOUNT_NAMESPACE")
            .as_ref()
            .map(|v| v as &str)
        {
            Ok("") | Err(env::VarError::NotPresent) => {
                sched::unshare(sched::CloneFlags::CLONE_NEWNS)
                    .context("unsharing mount namespace")?
            }
            _ => {
                static WARNED: Once = Once::new();
                WARNED.call_once(|| {
                    eprintln!("mounting in parent namespace: RESINHUP_NO_MOUNT_NAMESPACE is set");
                });
            }
        }

        mount::mount::<str, Path, str, str>(Some(device), &mountpoint, Some(fstype), flags, None)
            .with_context(|| format!("mounting {} on {}", device, mountpoint.display()))?;

        Ok(Mount {
            device: device.to_string(),
            mountpoint,
            owned: true,
        })
    }

    pub fn from_existing(path: &str) -> Result<Mount> {
        let mounts = read_to_string("/proc/self/mounts").context("reading mount table")?;
        for line in mounts.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 6 {
                bail!("invalid line in /proc/self/mounts: {}", line);
            }
            if fields[1] == path {
                return Ok(Mount {
                    device: fields[0].to_string(),
                    mountpoint: path.into(),
                    owned: false,
                });
            }
        }
        bail!("mountpoint {} not found", path);
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        for retries in (0..20).rev() {
            match mount::umount(&self.mountpoint) {
                Ok(_) => break,
                Err(err) => {
                    if retries == 0 {
                        eprintln!("umounting {}: {}", self.device, err);
                        return;
                    }
                    sleep(Duration::from_millis(100));
                }
            }
        }
        if let Err(err) = remove_dir(&self.mountpoint) {
            eprintln!("removing {}: {}", self.mountpoint.display(), err);
        }
    }
}

pub fn is_mounted(path: &str) -> bool {
    Mount::from_existing(path).is_ok()
}

pub fn lsblk(dev: &Path, with_deps: bool) -> Result<Vec<HashMap<String, String>>> {
    let mut cmd = Command::new("lsblk");
    cmd.arg("--pairs")
        .arg("--paths")
        .arg("--output")
        .arg("NAME,LABEL,FSTYPE,TYPE,MOUNTPOINT,UUID")
        .arg(dev);
    if !with_deps {
        cmd.arg("--nodeps");
    }
    let output = cmd_output(&mut cmd)?;
    Ok(output.lines().map(split_lsblk_line).collect())
}

pub fn lsblk_single(dev: &Path) -> Result<HashMap<String, String>> {
    let mut devinfos = lsblk(dev, false)?;
    if devinfos.is_empty() {
        bail!("no lsblk results for {}", dev.display());
    }
    Ok(devinfos.remove(0))
}

/// Parse key-value pairs from `lsblk --pairs`. Newer lsblk supports JSON but
/// older ones shipped on these devices don't.
fn split_lsblk_line(line: &str) -> HashMap<String, String> {
    lazy_static::lazy_static! {
        static ref RE: Regex = Regex::new(r#"([A-Z-]+)="([^"]*)""#).unwrap();
    }
    let mut fields = HashMap::new();
    for cap in RE.captures_iter(line) {
        fields.insert(cap[1].to_string(), cap[2].to_string());
    }
    fields
}

fn reread_partition_table(file: &mut File) -> Result<()> {
    let fd = file.as_raw_fd();
    for retries in (0..20).rev() {
        match unsafe { ioctl::blkrrpart(fd) } {
            Ok(_) => break,
            Err(err) => {
                if retries == 0 {
                    if err == nix::Error::from_errno(Errno::EINVAL) {
                        return Err(err)
                            .context("couldn't reread partition table: device may not support partitions");
                    } else if err == nix::Error::from_errno(Errno::EBUSY) {
                        return Err(err).context("couldn't reread partition table: device is in use");
                    }
                    return Err(err).context("couldn't reread partition table");
                }
                sleep(Duration::from_millis(100));
            }
        }
    }
    Ok(())
}

/// Get the logical sector size of a block device.
pub fn get_sector_size(file: &File) -> Result<NonZeroU32> {
    let fd = file.as_raw_fd();
    let mut size: c_int = 0;
    match unsafe { ioctl::blksszget(fd, &mut size) } {
        Ok(_) => {
            let size_u32: u32 = size
                .try_into()
                .with_context(|| format!("sector size {} doesn't fit in u32", size))?;
            NonZeroU32::new(size_u32).ok_or_else(|| anyhow!("found sector size of zero"))
        }
        Err(e) => Err(anyhow!(e).context("getting sector size")),
    }
}

/// Start udevd if it isn't already running (balenaOS host OS images run
/// without a system-wide init controlling it), then ensure the kernel's
/// view of the partition table is in sync with what udev has picked up.
pub fn ensure_udevd_running() -> Result<()> {
    let mut pgrep = Command::new("pgrep");
    pgrep.arg("udevd");
    if cmd_output(&mut pgrep).is_ok() {
        return Ok(());
    }
    for candidate in &["/lib/systemd/systemd-udevd", "/sbin/udevd", "/usr/sbin/udevd"] {
        if Path::new(candidate).exists() {
            Command::new(candidate)
                .arg("--daemon")
                .status()
                .with_context(|| format!("starting {}", candidate))?;
            return Ok(());
        }
    }
    bail!("couldn't find a udevd binary to start");
}

pub fn udev_settle() -> Result<()> {
    if !Path::new("/run/udev/control").exists() {
        bail!("udevd socket missing; is /run/udev mounted?");
    }
    // There's a potential window after rereading the partition table where
    // udevd hasn't yet received updates from the kernel, settle will return
    // immediately, and lsblk won't pick up partition labels.
    sleep(Duration::from_millis(200));
    runcmd!("udevadm", "settle")?;
    Ok(())
}

/// Find the partition device backing the filesystem mounted at
/// `mount_path`, by matching its `st_dev` against `/sys/class/block/*/dev`.
/// Mirrors `getRootPartition()`.
pub fn partition_of_mount(mount_path: &str) -> Result<String> {
    let st = nix::sys::stat::stat(mount_path)
        .with_context(|| format!("statting {}", mount_path))?;
    let wanted = format!(
        "{}:{}",
        nix::sys::stat::major(st.st_dev),
        nix::sys::stat::minor(st.st_dev)
    );
    for entry in std::fs::read_dir("/sys/class/block")
        .context("reading /sys/class/block")?
    {
        let entry = entry.context("reading /sys/class/block entry")?;
        let dev_file = entry.path().join("dev");
        if let Ok(contents) = read_to_string(&dev_file) {
            if contents.trim() == wanted {
                return Ok(format!("/dev/{}", entry.file_name().to_string_lossy()));
            }
        }
    }
    bail!(
        "couldn't find the partition backing {} (dev {})",
        mount_path,
        wanted
    );
}

/// Look up a partition device by filesystem label, via `blkid`. Returns
/// `Ok(None)` rather than erroring when no device carries the label;
/// `blkid` exits non-zero in that case, which isn't itself a failure.
pub fn device_by_label(label: &str) -> Option<String> {
    let mut cmd = Command::new("blkid");
    cmd.arg("-l").arg("-o").arg("device").arg("-t").arg(format!("LABEL={}", label));
    cmd_output(&mut cmd).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Find the boot partition: first by label, falling back to "partition 1
/// of whichever disk the live root lives on". This heuristic assumes boot
/// is always partition 1 when unlabeled; that assumption is not checked.
pub fn boot_partition(root_partition: &str) -> Result<String> {
    if let Some(dev) = device_by_label(LABEL_BOOT) {
        return Ok(dev);
    }
    let (prefix, _) = split_trailing_index(root_partition)
        .with_context(|| format!("{} has no numeric partition index", root_partition))?;
    Ok(format!("{}1", prefix))
}

/// Find a partition some fixed offset away from the boot partition, first
/// by label, falling back to boot-index + offset. Used to locate
/// `resin-root`/`resin-updt` when they aren't labeled yet (mirrors
/// `getPartitionRelativeToBoot`).
pub fn partition_relative_to_boot(boot_partition: &str, label: &str, relative_index: i64) -> Result<String> {
    if let Some(dev) = device_by_label(label) {
        return Ok(dev);
    }
    let (prefix, idx) = split_trailing_index(boot_partition)
        .with_context(|| format!("{} has no numeric partition index", boot_partition))?;
    let idx: i64 = idx.parse()?;
    Ok(format!("{}{}", prefix, idx + relative_index))
}

/// Device paths of the logical partitions inside the extended partition, in
/// on-disk order (`resin-conf` first, `resin-data` second on the standard
/// layout). Used as a last-resort fallback for legacy images that predate
/// `blkid` labels on these two volumes: mirrors `getConfigPartition` and
/// `getBTRFSPartition`'s index-based guesses, but computed from the actual
/// EBR chain rather than assumed fixed indices, since a disk that has been
/// repartitioned by this agent may have shifted the extended partition's
/// logical volumes around.
pub fn logical_partitions(disk_path: &str) -> Result<Vec<String>> {
    let table = crate::mbr::PartitionTable::open(disk_path)
        .with_context(|| format!("opening the partition table of {}", disk_path))?;
    let extended = table.slot(PARTNO_EXTENDED)?;
    let logicals = crate::mbr::read_logical_partitions(disk_path, extended.starting_lba as u64)
        .context("walking the extended partition's EBR chain")?;
    let prefix = if disk_path.contains("mmcblk") || disk_path.contains("nvme") {
        format!("{}p", disk_path)
    } else {
        disk_path.to_string()
    };
    Ok((0..logicals.len()).map(|i| format!("{}{}", prefix, 5 + i)).collect())
}

/// `resin-conf`'s device path: by label first, falling back to the first
/// logical partition inside the extended partition.
pub fn config_partition_fallback(disk_path: &str) -> Option<String> {
    if let Some(dev) = device_by_label(LABEL_CONF) {
        return Some(dev);
    }
    logical_partitions(disk_path).ok()?.into_iter().next()
}

/// `resin-data`'s device path: by label first, falling back to the second
/// logical partition inside the extended partition.
pub fn data_partition_fallback(disk_path: &str) -> Option<String> {
    if let Some(dev) = device_by_label(LABEL_DATA) {
        return Some(dev);
    }
    logical_partitions(disk_path).ok()?.into_iter().nth(1)
}

mod ioctl {
    use std::os::raw::c_int;
    use nix::{ioctl_none, ioctl_read_bad, request_code_none};
    ioctl_none!(blkrrpart, 0x12, 95);
    ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), c_int);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_trailing_index_sd() {
        assert_eq!(split_trailing_index("/dev/sda3"), Some(("/dev/sda", "3")));
    }

    #[test]
    fn split_trailing_index_mmcblk() {
        assert_eq!(
            split_trailing_index("/dev/mmcblk0p12"),
            Some(("/dev/mmcblk0p", "12"))
        );
    }

    #[test]
    fn split_trailing_index_nvme() {
        assert_eq!(
            split_trailing_index("/dev/nvme0n1p2"),
            Some(("/dev/nvme0n1p", "2"))
        );
    }

    #[test]
    fn root_device_truncation() {
        assert_eq!(root_device_of("/dev/sda1"), "/dev/sda");
        assert_eq!(root_device_of("/dev/mmcblk0p2"), "/dev/mmcblk0");
        assert_eq!(root_device_of("/dev/nvme0n1p3"), "/dev/nvme0n1");
    }

    #[test]
    fn split_lsblk_line_parses_pairs() {
        let line = r#"NAME="/dev/sda1" LABEL="resin-boot" FSTYPE="vfat" TYPE="part" MOUNTPOINT="""#;
        let fields = split_lsblk_line(line);
        assert_eq!(fields.get("NAME").map(String::as_str), Some("/dev/sda1"));
        assert_eq!(fields.get("LABEL").map(String::as_str), Some("resin-boot"));
    }
}
