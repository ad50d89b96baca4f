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

//! Retrieving an update bundle and materializing it under the fetcher's
//! workspace. Two implementations satisfy the same contract: one pulls a
//! plain tarball over HTTP, the other pulls a container image and exports
//! it, feeding the exact same tar-extraction path.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::hostconfig::HostConfig;
use crate::io_util::{self, AutoDecompressReader};
use crate::runcmd;

pub trait Fetcher {
    /// Place the update payload's byte stream where `unpack` can read it.
    fn download(&mut self) -> Result<()>;

    /// Materialize the payload under the workspace's `update/` directory,
    /// downloading first if `download_first`, then assert every
    /// configured fingerprint path exists.
    fn unpack(&mut self, download_first: bool) -> Result<()>;

    /// Copy everything unpacked except `resin-boot/` and `quirks/` into
    /// `location`.
    fn unpack_rootfs(&self, location: &Path) -> Result<()>;

    /// Copy `quirks/` into `location`; a no-op if the bundle has none.
    fn unpack_quirks(&self, location: &Path) -> Result<()>;

    /// Relative paths of every file under the unpacked `resin-boot/`.
    fn boot_files(&self) -> Result<Vec<PathBuf>>;

    /// The unpacked `resin-boot/` directory itself, so callers can resolve
    /// the paths `boot_files` returns into real files to copy.
    fn boot_files_dir(&self) -> &Path;
}

/// Build the fetcher named by `[fetcher].type` (`tar` or `dockerhub`).
/// `machine` is the already-resolved device type (`running_device` /
/// `--device`); `remote_override` is `--remote`/`REMOTE`, which wins over
/// `[fetcher].remote`.
pub fn new(
    kind: &str,
    host_config: &HostConfig,
    machine: &str,
    version: &str,
    remote_override: Option<&str>,
) -> Result<Box<dyn Fetcher>> {
    match kind {
        "tar" => Ok(Box::new(TarFetcher::new(host_config, machine, version, remote_override)?)),
        "dockerhub" => Ok(Box::new(RegistryFetcher::new(host_config, machine, version, remote_override)?)),
        other => bail!("unknown fetcher type {} (expected tar or dockerhub)", other),
    }
}

struct Workspace {
    root: PathBuf,
    unpack: PathBuf,
    boot_files_dir: PathBuf,
    update_file_fingerprints: Vec<String>,
}

impl Workspace {
    fn new(host_config: &HostConfig) -> Result<Self> {
        let root: PathBuf = host_config
            .fetcher("workspace")
            .context("[fetcher].workspace is not configured")?
            .into();
        let update_file_fingerprints = host_config
            .fetcher("update_file_fingerprints")
            .context("[fetcher].update_file_fingerprints is not configured")?
            .split_whitespace()
            .map(String::from)
            .collect();
        let unpack = root.join("update");
        let boot_files_dir = unpack.join("resin-boot");
        Ok(Workspace {
            root,
            unpack,
            boot_files_dir,
            update_file_fingerprints,
        })
    }

    fn clean_workspace(&self) -> Result<()> {
        if self.root.is_dir() {
            fs::remove_dir_all(&self.root).with_context(|| format!("clearing {}", self.root.display()))?;
        }
        fs::create_dir_all(&self.root).with_context(|| format!("creating {}", self.root.display()))
    }

    fn clean_unpack(&self) -> Result<()> {
        if self.unpack.is_dir() {
            fs::remove_dir_all(&self.unpack).with_context(|| format!("clearing {}", self.unpack.display()))?;
        }
        fs::create_dir_all(&self.unpack).with_context(|| format!("creating {}", self.unpack.display()))
    }

    fn assert_fingerprints_present(&self) -> Result<()> {
        for entry in &self.update_file_fingerprints {
            if !self.unpack.join(entry).exists() {
                bail!(
                    "unpacked update is missing {}, not a resinhup update package",
                    entry
                );
            }
        }
        Ok(())
    }

    fn unpack_rootfs(&self, location: &Path) -> Result<()> {
        io_util::copy_any(&self.unpack, location, true, &["resin-boot", "quirks"])
            .with_context(|| format!("unpacking rootfs from {} to {}", self.unpack.display(), location.display()))
    }

    fn unpack_quirks(&self, location: &Path) -> Result<()> {
        let quirks_path = self.unpack.join("quirks");
        if !quirks_path.is_dir() {
            return Ok(());
        }
        io_util::copy_any(&quirks_path, location, true, &[])
            .with_context(|| format!("unpacking quirks from {} to {}", quirks_path.display(), location.display()))
    }

    fn boot_files(&self) -> Result<Vec<PathBuf>> {
        if !self.boot_files_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut result = Vec::new();
        for entry in walkdir::WalkDir::new(&self.boot_files_dir) {
            let entry = entry.with_context(|| format!("walking {}", self.boot_files_dir.display()))?;
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(&self.boot_files_dir)
                    .expect("walkdir entry under boot_files_dir");
                result.push(rel.to_path_buf());
            }
        }
        Ok(result)
    }
}

/// Extract a tar stream (optionally compressed, auto-detected) into
/// `workspace.unpack`, then assert it looks like a real update package.
/// Shared by both fetcher implementations, since a dockerhub export and a
/// downloaded tarball end up as the exact same kind of stream.
fn unpack_tar_stream(reader: impl Read, workspace: &Workspace) -> Result<()> {
    workspace.clean_unpack()?;
    let decoder = AutoDecompressReader::new(BufReader::new(reader)).context("sniffing update archive format")?;
    tar::Archive::new(decoder)
        .unpack(&workspace.unpack)
        .with_context(|| format!("extracting update archive to {}", workspace.unpack.display()))?;
    workspace.assert_fingerprints_present()
}

pub struct TarFetcher {
    workspace: Workspace,
    remote_file: String,
    stream: Option<Box<dyn Read>>,
}

impl TarFetcher {
    fn new(host_config: &HostConfig, machine: &str, version: &str, remote_override: Option<&str>) -> Result<Self> {
        let workspace = Workspace::new(host_config)?;
        let remote = remote_override
            .map(String::from)
            .or_else(|| host_config.fetcher("remote").map(String::from))
            .context("no remote configured: pass --remote or set [fetcher].remote")?;
        let remote_file = format!("{}/resinos-{}/resinhup-{}.tar.gz", remote.trim_end_matches('/'), machine, version);
        Ok(TarFetcher {
            workspace,
            remote_file,
            stream: None,
        })
    }
}

impl Fetcher for TarFetcher {
    fn download(&mut self) -> Result<()> {
        self.workspace.clean_workspace()?;
        log::info!("downloading {}", self.remote_file);
        let response = reqwest::blocking::get(&self.remote_file)
            .with_context(|| format!("requesting {}", self.remote_file))?;
        if !response.status().is_success() {
            bail!("fetching {} returned HTTP {}", self.remote_file, response.status());
        }
        self.stream = Some(Box::new(response));
        Ok(())
    }

    fn unpack(&mut self, download_first: bool) -> Result<()> {
        if download_first {
            self.download().context("downloading update package")?;
        }
        let stream = self.stream.take().context("unpack called without a downloaded stream")?;
        log::info!("unpacking update archive");
        unpack_tar_stream(stream, &self.workspace)
    }

    fn unpack_rootfs(&self, location: &Path) -> Result<()> {
        self.workspace.unpack_rootfs(location)
    }

    fn unpack_quirks(&self, location: &Path) -> Result<()> {
        self.workspace.unpack_quirks(location)
    }

    fn boot_files(&self) -> Result<Vec<PathBuf>> {
        self.workspace.boot_files()
    }

    fn boot_files_dir(&self) -> &Path {
        &self.workspace.boot_files_dir
    }
}

/// Pulls `<remote>:<version>-<machine>`, exports a one-off container of
/// it, and feeds the export straight into the same tar extraction path a
/// plain tarball uses.
pub struct RegistryFetcher {
    workspace: Workspace,
    image: String,
    container_name: String,
    stream: Option<Box<dyn Read>>,
}

impl RegistryFetcher {
    fn new(host_config: &HostConfig, machine: &str, version: &str, remote_override: Option<&str>) -> Result<Self> {
        let workspace = Workspace::new(host_config)?;
        let remote = remote_override
            .map(String::from)
            .or_else(|| host_config.fetcher("remote").map(String::from))
            .context("no remote configured: pass --remote or set [fetcher].remote")?;
        let image = format!("{}:{}-{}", remote, version, machine);
        Ok(RegistryFetcher {
            workspace,
            image,
            container_name: "resinhup".to_string(),
            stream: None,
        })
    }
}

impl Fetcher for RegistryFetcher {
    fn download(&mut self) -> Result<()> {
        self.workspace.clean_workspace()?;

        log::info!("pulling {}", self.image);
        runcmd!("docker", "pull", &self.image)?;

        // Best-effort: a leftover container from a previous failed run
        // shouldn't block this one.
        let _ = Command::new("docker")
            .args(["rm", "-f", &self.container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        runcmd!("docker", "create", "--name", &self.container_name, &self.image, "/bin/bash")?;

        log::info!("exporting {}", self.container_name);
        let mut export = Command::new("docker")
            .args(["export", &self.container_name])
            .stdout(Stdio::piped())
            .spawn()
            .context("spawning docker export")?;
        let stdout = export.stdout.take().context("docker export produced no stdout")?;
        self.stream = Some(Box::new(ChildStream { child: export, stdout }));
        Ok(())
    }

    fn unpack(&mut self, download_first: bool) -> Result<()> {
        if download_first {
            self.download().context("pulling and exporting update image")?;
        }
        let stream = self.stream.take().context("unpack called without a downloaded stream")?;
        log::info!("unpacking update archive");
        unpack_tar_stream(stream, &self.workspace)?;
        let _ = runcmd!("docker", "rm", "-f", &self.container_name);
        Ok(())
    }

    fn unpack_rootfs(&self, location: &Path) -> Result<()> {
        self.workspace.unpack_rootfs(location)
    }

    fn unpack_quirks(&self, location: &Path) -> Result<()> {
        self.workspace.unpack_quirks(location)
    }

    fn boot_files(&self) -> Result<Vec<PathBuf>> {
        self.workspace.boot_files()
    }

    fn boot_files_dir(&self) -> &Path {
        &self.workspace.boot_files_dir
    }
}

/// A `docker export` child process's stdout, plus the child itself so it
/// can be reaped once the stream is fully read.
struct ChildStream {
    child: std::process::Child,
    stdout: std::process::ChildStdout,
}

impl Read for ChildStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_host_config(workspace: &Path) -> HostConfig {
        let mut cfg = HostConfig::in_memory("[fetcher]\n").unwrap();
        cfg.set("fetcher", "workspace", &workspace.to_string_lossy());
        cfg.set("fetcher", "update_file_fingerprints", "resin-boot/bootcode.bin etc/os-release");
        cfg.set("fetcher", "remote", "https://downloads.example.com");
        cfg
    }

    #[test]
    fn tar_fetcher_builds_expected_url() {
        let dir = tempdir().unwrap();
        let cfg = sample_host_config(dir.path());
        let fetcher = TarFetcher::new(&cfg, "raspberrypi3", "2.43.1", None).unwrap();
        assert_eq!(
            fetcher.remote_file,
            "https://downloads.example.com/resinos-raspberrypi3/resinhup-2.43.1.tar.gz"
        );
    }

    #[test]
    fn remote_override_wins_over_configured_remote() {
        let dir = tempdir().unwrap();
        let cfg = sample_host_config(dir.path());
        let fetcher = TarFetcher::new(&cfg, "raspberrypi3", "2.43.1", Some("https://staging.example.com")).unwrap();
        assert!(fetcher.remote_file.starts_with("https://staging.example.com/"));
    }

    #[test]
    fn assert_fingerprints_present_fails_on_missing_entry() {
        let dir = tempdir().unwrap();
        let cfg = sample_host_config(dir.path());
        let workspace = Workspace::new(&cfg).unwrap();
        fs::create_dir_all(&workspace.unpack).unwrap();
        assert!(workspace.assert_fingerprints_present().is_err());
    }

    #[test]
    fn boot_files_lists_relative_paths() {
        let dir = tempdir().unwrap();
        let cfg = sample_host_config(dir.path());
        let workspace = Workspace::new(&cfg).unwrap();
        fs::create_dir_all(workspace.boot_files_dir.join("overlays")).unwrap();
        fs::write(workspace.boot_files_dir.join("config.txt"), b"x").unwrap();
        fs::write(workspace.boot_files_dir.join("overlays").join("foo.dtbo"), b"x").unwrap();

        let mut files = workspace.boot_files().unwrap();
        files.sort();
        assert_eq!(files, vec![PathBuf::from("config.txt"), PathBuf::from("overlays/foo.dtbo")]);
    }
}
