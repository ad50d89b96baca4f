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

//! Refuses to proceed if any currently loaded kernel module can't be
//! traced back to an on-disk file. A module loaded from a custom,
//! out-of-tree path is a sign the device has been tampered with in a way
//! an update shouldn't paper over.

use anyhow::{bail, Context, Result};
use std::fs::read_to_string;
use std::process::Command;

use crate::util::cmd_output;

/// Names of every module the kernel currently has loaded, from
/// `/proc/modules`. Replaces the original's `lsmod` shell-out: the kernel
/// exposes the same listing directly, without a subprocess.
fn loaded_modules() -> Result<Vec<String>> {
    let contents = read_to_string("/proc/modules").context("reading /proc/modules")?;
    Ok(contents
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect())
}

/// The on-disk path a loaded module was read from, per `modinfo`'s
/// `filename:` field. `None` if modinfo has no such field for this
/// module, which is exactly the "loaded from a custom path" condition
/// this check exists to catch.
fn module_filename(name: &str) -> Result<Option<String>> {
    let mut cmd = Command::new("modinfo");
    cmd.arg(name);
    let output = cmd_output(&mut cmd).with_context(|| format!("running modinfo {}", name))?;
    for line in output.lines() {
        if let Some((attribute, value)) = line.split_once(':') {
            if attribute.trim() == "filename" {
                return Ok(Some(value.trim().to_string()));
            }
        }
    }
    Ok(None)
}

/// Mirrors `ResinKernel.customLoadedModules`, inverted to the success
/// case: `Ok(())` if every loaded module resolves to an on-disk file,
/// `Err` naming the first one that doesn't.
pub fn assert_no_custom_modules() -> Result<()> {
    for module in loaded_modules()? {
        if module_filename(&module)?.is_none() {
            bail!("kernel module {} appears to have been loaded from a custom path", module);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loaded_modules_parses_proc_modules_format() {
        // /proc/modules lines look like:
        // ext4 737280 1 - Live 0xffffffffc0123000
        let sample = "ext4 737280 1 - Live 0xffffffffc0123000\nvfat 20480 0 - Live 0xffffffffc0234000\n";
        let names: Vec<&str> = sample.lines().filter_map(|l| l.split_whitespace().next()).collect();
        assert_eq!(names, vec!["ext4", "vfat"]);
    }
}
