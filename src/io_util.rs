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

//! Power-loss-safe filesystem primitives: atomic file writes, and a
//! recursive copy that mirrors a source tree onto a destination without
//! ever leaving a half-written file behind.

use anyhow::{bail, Context, Result};
use flate2::bufread::GzDecoder;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, ErrorKind, Read, Write};
use std::os::unix::fs::{symlink, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;
use xz2::bufread::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

// The default BufReader/BufWriter buffer size is 8 KiB, which isn't large
// enough to fully amortize system call overhead.
// https://github.com/rust-lang/rust/issues/49921
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Like `std::io::copy()` but stops after at most `n` bytes.
pub fn copy_n(
    reader: &mut (impl Read + ?Sized),
    writer: &mut (impl Write + ?Sized),
    mut n: u64,
    buf: &mut [u8],
) -> Result<u64> {
    let mut written = 0;
    loop {
        if n == 0 {
            return Ok(written);
        }
        let bufn = if n < (buf.len() as u64) {
            &mut buf[..n as usize]
        } else {
            &mut buf[..]
        };
        let len = match reader.read(bufn) {
            Ok(0) => return Ok(written),
            Ok(len) => len,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&bufn[..len])?;
        written += len as u64;
        n -= len as u64;
    }
}

enum Decoder<R: BufRead> {
    Plain(R),
    Gzip(GzDecoder<R>),
    Xz(XzDecoder<R>),
    Zstd(ZstdDecoder<'static, R>),
}

/// A format-sniffing decompressor, picking gzip/xz/zstd/plain based on the
/// magic bytes at the start of the stream. Update bundles are historically
/// shipped as `.tar.gz`, but the sniffing means any of the three "just
/// works" without the caller needing to inspect the filename.
pub struct AutoDecompressReader<R: BufRead> {
    decoder: Decoder<R>,
}

impl<R: BufRead> AutoDecompressReader<R> {
    pub fn new(mut source: R) -> Result<Self> {
        let sniff = source.fill_buf().context("sniffing input")?;
        let decoder = if sniff.len() > 2 && sniff[0..2] == [0x1f, 0x8b] {
            Decoder::Gzip(GzDecoder::new(source))
        } else if sniff.len() > 6 && sniff[0..6] == *b"\xfd7zXZ\x00" {
            Decoder::Xz(XzDecoder::new(source))
        } else if sniff.len() > 4 && sniff[0..4] == [0x28, 0xb5, 0x2f, 0xfd] {
            Decoder::Zstd(ZstdDecoder::with_buffer(source).context("initializing zstd decoder")?)
        } else {
            Decoder::Plain(source)
        };
        Ok(Self { decoder })
    }
}

impl<R: BufRead> Read for AutoDecompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.decoder {
            Decoder::Plain(d) => d.read(buf),
            Decoder::Gzip(d) => d.read(buf),
            Decoder::Xz(d) => d.read(buf),
            Decoder::Zstd(d) => d.read(buf),
        }
    }
}

/// Write `contents` to `path` via a sibling `.tmp` file, `fsync`ed, renamed
/// into place, with the parent directory `fsync`ed afterward so the rename
/// itself survives a crash. Mirrors the tmp-file/fsync/rename/fsync-parent
/// sequence used throughout the original agent for config.json and
/// bootloader config edits.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = sibling_tmp_path(path);
    {
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        tmp.write_all(contents)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        tmp.sync_all()
            .with_context(|| format!("syncing {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;
    sync_parent_dir(path)?;
    Ok(())
}

fn sibling_tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".hup.tmp");
    path.with_file_name(name)
}

fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let dirfd = OpenOptions::new()
        .read(true)
        .open(parent)
        .with_context(|| format!("opening {} for fsync", parent.display()))?;
    dirfd
        .sync_all()
        .with_context(|| format!("syncing directory {}", parent.display()))?;
    Ok(())
}

/// Copy `src` onto `dst`, whether `src` is a file, symlink, or directory.
/// Directories are merged into an existing destination rather than
/// replacing it. Each individual file is written through [`atomic_write`]-
/// style tmp+rename. `sync` controls whether each file is additionally
/// `fsync`ed and the destination directory is `sync(2)`ed at the end; the
/// repartitioner's one-time root clone passes `sync: false` and syncs once
/// at the end itself, since fsyncing every file in a whole rootfs clone
/// would be needlessly slow.
pub fn copy_any(src: &Path, dst: &Path, sync: bool, ignore: &[&str]) -> Result<()> {
    let meta = fs::symlink_metadata(src).with_context(|| format!("statting {}", src.display()))?;
    if meta.file_type().is_symlink() || meta.is_file() {
        copy_file(src, dst, sync)
    } else if meta.is_dir() {
        copy_dir(src, dst, sync, ignore)
    } else {
        bail!("{}: unsupported file type for copy", src.display());
    }
}

fn copy_dir(src: &Path, dst: &Path, sync: bool, ignore: &[&str]) -> Result<()> {
    if !src.is_dir() {
        bail!("{} is not a directory", src.display());
    }
    let canon_src = src.canonicalize().unwrap_or_else(|_| src.to_path_buf());
    let canon_dst = dst.canonicalize().unwrap_or_else(|_| dst.to_path_buf());
    if canon_src == canon_dst {
        bail!("refusing to copy {} onto itself", src.display());
    }

    let root_dev = fs::metadata(src).with_context(|| format!("statting {}", src.display()))?.dev();

    for entry in walkdir::WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            if ignore.contains(&name.as_ref()) {
                return false;
            }
            // Stay on one filesystem: a directory that's itself a mount
            // point (e.g. a live rootfs's /proc, /sys, or a separate
            // data volume) is excluded rather than descended into.
            if e.file_type().is_dir() {
                if let Ok(meta) = e.metadata() {
                    if meta.dev() != root_dev {
                        return false;
                    }
                }
            }
            true
        })
    {
        let entry = entry.with_context(|| format!("walking {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir entry under src");
        let dst_path = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            copy_file(entry.path(), &dst_path, sync)?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&dst_path)
                .with_context(|| format!("creating {}", dst_path.display()))?;
            let mode = entry
                .metadata()
                .with_context(|| format!("statting {}", entry.path().display()))?
                .permissions()
                .mode();
            fs::set_permissions(&dst_path, fs::Permissions::from_mode(mode)).ok();
        } else if file_type.is_file() {
            // Pipes and other special files can't be meaningfully copied;
            // skip them like the original agent does.
            let ftype = entry
                .metadata()
                .with_context(|| format!("statting {}", entry.path().display()))?
                .file_type();
            if ftype.is_fifo() {
                continue;
            }
            copy_file(entry.path(), &dst_path, sync)?;
        }
    }

    if sync {
        nix::unistd::sync();
    }
    Ok(())
}

fn copy_file(src: &Path, dst: &Path, sync: bool) -> Result<()> {
    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let tmp_path = sibling_tmp_path(dst);
    let src_meta = fs::symlink_metadata(src).with_context(|| format!("statting {}", src.display()))?;

    if src_meta.file_type().is_symlink() {
        let target = fs::read_link(src).with_context(|| format!("reading link {}", src.display()))?;
        if tmp_path.exists() {
            fs::remove_file(&tmp_path).ok();
        }
        symlink(&target, &tmp_path)
            .with_context(|| format!("symlinking {}", tmp_path.display()))?;
    } else {
        let mut reader = File::open(src).with_context(|| format!("opening {}", src.display()))?;
        let mut writer = File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        copy_buf_loop(&mut reader, &mut writer, &mut buf)
            .with_context(|| format!("copying {} to {}", src.display(), tmp_path.display()))?;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(src_meta.mode()))
            .with_context(|| format!("setting permissions on {}", tmp_path.display()))?;
        if sync {
            writer
                .sync_all()
                .with_context(|| format!("syncing {}", tmp_path.display()))?;
        }
    }

    fs::rename(&tmp_path, dst)
        .with_context(|| format!("renaming {} to {}", tmp_path.display(), dst.display()))?;
    if sync {
        sync_parent_dir(dst)?;
    }
    Ok(())
}

// std::io::copy exists, but we want an explicit buffer we control the size
// of (see BUFFER_SIZE above).
fn copy_buf_loop(reader: &mut impl Read, writer: &mut impl Write, buf: &mut [u8]) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let n = match reader.read(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(!sibling_tmp_path(&path).exists());
    }

    #[test]
    fn copy_any_merges_into_existing_directory() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("a"), b"a").unwrap();
        fs::write(dst.path().join("preexisting"), b"keep me").unwrap();

        copy_any(src.path(), dst.path(), true, &[]).unwrap();

        assert_eq!(fs::read(dst.path().join("a")).unwrap(), b"a");
        assert_eq!(fs::read(dst.path().join("preexisting")).unwrap(), b"keep me");
    }

    #[test]
    fn copy_any_honors_ignore_list() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir(src.path().join("skip-me")).unwrap();
        fs::write(src.path().join("skip-me").join("f"), b"x").unwrap();
        fs::write(src.path().join("keep"), b"y").unwrap();

        copy_any(src.path(), dst.path(), true, &["skip-me"]).unwrap();

        assert!(!dst.path().join("skip-me").exists());
        assert_eq!(fs::read(dst.path().join("keep")).unwrap(), b"y");
    }

    #[test]
    fn copy_any_rejects_self_copy() {
        let src = tempdir().unwrap();
        assert!(copy_any(src.path(), src.path(), true, &[]).is_err());
    }
}
