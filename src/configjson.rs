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

//! Reading, locating, and migrating `config.json`, the device identity
//! file that normally lives on `resin-boot`. Values are read and written
//! through `serde_json::Value` rather than shelling out to `jq`, since the
//! rest of the agent already depends on `serde_json` for other things.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hostconfig::HostConfig;
use crate::io_util;

/// Find `config.json` by walking `[config.json].possible_locations`
/// relative to `host_bind_mount`, with the fetcher's temporary
/// boot-partition mountpoint checked first. Mirrors `getConfJsonPath`.
pub fn locate(host_config: &HostConfig, boot_tempmountpoint: Option<&Path>) -> Option<PathBuf> {
    let root_mount = host_config.host_bind_mount();
    let possible_locations = host_config.config_json("possible_locations")?;

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(temp) = boot_tempmountpoint {
        candidates.push(temp.to_path_buf());
    }
    candidates.extend(possible_locations.split_whitespace().map(PathBuf::from));

    // Every candidate, including the already-absolute temp mountpoint, is
    // rooted under `host_bind_mount` (mirrors the original building this
    // path via plain string concatenation + normpath, which collapses a
    // leading slash on `location` rather than treating it as an anchor).
    for location in candidates {
        let relative = location.strip_prefix("/").unwrap_or(&location);
        let candidate = Path::new(&root_mount).join(relative).join("config.json");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn load(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {} as JSON", path.display()))
}

fn store(path: &Path, value: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("encoding config.json")?;
    io_util::atomic_write(path, text.as_bytes())
}

pub fn get_attribute(path: &Path, attribute: &str) -> Result<Option<Value>> {
    let doc = load(path)?;
    Ok(doc.get(attribute).cloned())
}

pub fn attribute_exists(path: &Path, attribute: &str) -> Result<bool> {
    Ok(get_attribute(path, attribute)?.is_some())
}

/// Set `attribute` to `value`. Mirrors `jsonSetAttribute`.
pub fn set_attribute(path: &Path, attribute: &str, value: Value) -> Result<()> {
    let mut doc = load(path)?;
    let map = doc
        .as_object_mut()
        .with_context(|| format!("{} does not hold a JSON object", path.display()))?;
    map.insert(attribute.to_string(), value);
    store(path, &doc)
}

/// Set `attribute` to `value` only if it isn't already present. Mirrors
/// `jsonSetAttribute(..., onlyIfNotDefined=True)`.
pub fn set_if_absent(path: &Path, attribute: &str, value: Value) -> Result<()> {
    if attribute_exists(path, attribute)? {
        return Ok(());
    }
    set_attribute(path, attribute, value)
}

/// Read `[config.json]`'s `deviceType`, which picks the bootloader
/// retargeter. Mirrors `runningDevice`.
pub fn running_device(host_config: &HostConfig, config_json_path: &Path) -> Result<String> {
    let device_type = get_attribute(config_json_path, "deviceType")?
        .context("config.json has no deviceType attribute")?;
    let _ = host_config; // device type lookup only needs the resolved path
    device_type
        .as_str()
        .map(str::to_string)
        .context("config.json's deviceType is not a string")
}

const LEGACY_VARIABLE_MAP: &[(&str, &str)] = &[
    ("API_ENDPOINT", "apiEndpoint"),
    ("REGISTRY_ENDPOINT", "registryEndpoint"),
    ("PUBNUB_SUBSCRIBE_KEY", "pubnubSubscribeKey"),
    ("PUBNUB_PUBLISH_KEY", "pubnubPublishKey"),
    ("MIXPANEL_TOKEN", "mixpanelToken"),
    ("LISTEN_PORT", "listenPort"),
];

/// Recreate `config.json` on `resin-boot` from one of the two legacy
/// locations it used to live in, if it isn't there already. Mirrors
/// `fixOldConfigJson`.
///
/// - `mnt/data-disk/config.json` + `etc/resin.conf`: the oldest layout,
///   where device identity was split between a `KEY=value` conf file and
///   a partial JSON blob. The conf file's recognized variables are
///   mapped onto their config.json names and filled in only if absent,
///   then a `vpnEndpoint` is derived from `registryEndpoint`.
/// - `mnt/conf/config.json`: a later layout where the full file already
///   existed, just on the wrong (now-removed) `resin-conf` mountpoint.
pub fn migrate(host_config: &HostConfig, boot_mountpoint: &Path) -> Result<()> {
    let target = boot_mountpoint.join("config.json");
    if target.is_file() {
        return Ok(());
    }

    let root_mount = host_config.host_bind_mount();
    let root_mount = Path::new(&root_mount);
    let legacy_data_config = root_mount.join("mnt/data-disk/config.json");
    let legacy_resin_conf = root_mount.join("etc/resin.conf");
    let legacy_conf_config = root_mount.join("mnt/conf/config.json");

    if legacy_data_config.is_file() && legacy_resin_conf.is_file() {
        let scratch = tempfile::Builder::new()
            .prefix(".config.json.")
            .tempfile_in(boot_mountpoint)
            .context("creating scratch file for config.json migration")?;
        let tmp_config = scratch.path();
        fs::copy(&legacy_data_config, tmp_config)
            .with_context(|| format!("copying {} for migration", legacy_data_config.display()))?;

        let resin_conf = fs::read_to_string(&legacy_resin_conf)
            .with_context(|| format!("reading {}", legacy_resin_conf.display()))?;
        for line in resin_conf.lines() {
            let Some((variable, value)) = line.split_once('=') else {
                continue;
            };
            if let Some((_, mapped)) = LEGACY_VARIABLE_MAP.iter().find(|(k, _)| *k == variable) {
                set_if_absent(tmp_config, mapped, Value::String(value.trim().to_string()))?;
            }
        }

        let registry_endpoint = get_attribute(tmp_config, "registryEndpoint")?
            .and_then(|v| v.as_str().map(str::to_string))
            .context("migrated config.json has no registryEndpoint to derive vpnEndpoint from")?;
        let vpn_endpoint = registry_endpoint.replace("registry", "vpn");
        set_if_absent(tmp_config, "vpnEndpoint", Value::String(vpn_endpoint))?;

        fs::copy(tmp_config, &target)
            .with_context(|| format!("installing migrated config.json at {}", target.display()))?;
        Ok(())
    } else if legacy_conf_config.is_file() {
        fs::copy(&legacy_conf_config, &target)
            .with_context(|| format!("installing migrated config.json at {}", target.display()))?;
        Ok(())
    } else {
        bail!("can't detect an old config.json to migrate from");
    }
}

/// Fill in any `[<type>]` option from `HostConfig` that `config.json` is
/// missing or disagrees with, where `<type>` is `[config.json].type`
/// (`production`/`staging`). Mirrors `verifyConfigJson`. `registered_at`
/// is the one option this function is willing to synthesize a value for
/// when neither `config.json` nor `HostConfig` has one.
pub fn verify(host_config: &HostConfig, config_json_path: &Path) -> Result<()> {
    let ctype = host_config
        .config_json("type")
        .context("don't know if staging/production ([config.json].type is unset)")?;
    let options = host_config
        .environment(ctype)
        .with_context(|| format!("no [{}] section in host configuration", ctype))?;

    for option in options {
        // An option present but set to the empty string counts as "no
        // value configured", same as absent.
        match host_config.get(ctype, option).filter(|v| !v.is_empty()) {
            Some(value) => {
                let current = get_attribute(config_json_path, option)?;
                if current.as_ref().and_then(Value::as_str) != Some(value) {
                    set_attribute(config_json_path, option, Value::String(value.to_string()))?;
                }
            }
            None => {
                if !attribute_exists(config_json_path, option)? {
                    let value = if option == "registered_at" {
                        let now = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .context("system clock is before the Unix epoch")?
                            .as_secs();
                        now.to_string()
                    } else {
                        bail!("don't know the value of {}", option);
                    };
                    set_attribute(config_json_path, option, Value::String(value))?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_config_json(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("config.json");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn set_if_absent_does_not_overwrite() {
        let dir = tempdir().unwrap();
        let path = write_config_json(dir.path(), r#"{"apiEndpoint":"https://api.balena-cloud.com"}"#);
        set_if_absent(&path, "apiEndpoint", Value::String("https://example.com".into())).unwrap();
        let doc = load(&path).unwrap();
        assert_eq!(doc["apiEndpoint"], "https://api.balena-cloud.com");
    }

    #[test]
    fn set_if_absent_fills_missing_key() {
        let dir = tempdir().unwrap();
        let path = write_config_json(dir.path(), r#"{}"#);
        set_if_absent(&path, "vpnEndpoint", Value::String("vpn.balena-cloud.com".into())).unwrap();
        let doc = load(&path).unwrap();
        assert_eq!(doc["vpnEndpoint"], "vpn.balena-cloud.com");
    }

    #[test]
    fn migrate_translates_legacy_resin_conf_and_derives_vpn_endpoint() {
        let root = tempdir().unwrap();
        let boot = tempdir().unwrap();

        let data_disk = root.path().join("mnt/data-disk");
        fs::create_dir_all(&data_disk).unwrap();
        fs::write(data_disk.join("config.json"), r#"{"apiEndpoint":"https://api.example.com"}"#).unwrap();

        let etc = root.path().join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(
            etc.join("resin.conf"),
            "REGISTRY_ENDPOINT=registry.example.com/v1\nLISTEN_PORT=48484\n",
        )
        .unwrap();

        let mut cfg = HostConfig::in_memory("[General]\n").unwrap();
        cfg.set("General", "host_bind_mount", &root.path().display().to_string());

        migrate(&cfg, boot.path()).unwrap();

        let migrated = load(&boot.path().join("config.json")).unwrap();
        assert_eq!(migrated["apiEndpoint"], "https://api.example.com");
        assert_eq!(migrated["registryEndpoint"], "registry.example.com/v1");
        assert_eq!(migrated["listenPort"], "48484");
        assert_eq!(migrated["vpnEndpoint"], "vpn.example.com/v1");
    }

    #[test]
    fn migrate_is_a_noop_when_config_json_already_on_boot() {
        let root = tempdir().unwrap();
        let boot = tempdir().unwrap();
        fs::write(boot.path().join("config.json"), r#"{"apiEndpoint":"https://already.here"}"#).unwrap();

        let mut cfg = HostConfig::in_memory("[General]\n").unwrap();
        cfg.set("General", "host_bind_mount", &root.path().display().to_string());

        migrate(&cfg, boot.path()).unwrap();

        let doc = load(&boot.path().join("config.json")).unwrap();
        assert_eq!(doc["apiEndpoint"], "https://already.here");
    }

    #[test]
    fn running_device_reads_device_type() {
        let dir = tempdir().unwrap();
        let path = write_config_json(dir.path(), r#"{"deviceType":"raspberrypi3"}"#);
        let cfg = HostConfig::in_memory("[General]\n").unwrap();
        assert_eq!(running_device(&cfg, &path).unwrap(), "raspberrypi3");
    }

    #[test]
    fn verify_fills_registered_at_when_unspecified() {
        let dir = tempdir().unwrap();
        let path = write_config_json(dir.path(), r#"{"apiEndpoint":"https://api.balena-cloud.com"}"#);
        let cfg = HostConfig::in_memory(
            "[config.json]\ntype = production\n\n[production]\napiEndpoint = https://api.balena-cloud.com\nregistered_at =\n",
        )
        .unwrap();
        // registered_at has no value in HostConfig (empty), so verify()
        // must synthesize one rather than treat the empty string as the
        // value to write.
        verify(&cfg, &path).unwrap();
        let doc = load(&path).unwrap();
        assert!(doc.get("registered_at").is_some());
    }
}
