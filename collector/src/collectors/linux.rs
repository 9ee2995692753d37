//! Linux host collection.

use super::files::{directory_listing, file_record, regular_files, DirectoryListing};
use super::{capture_files, run_commands, store_file, tolerate, Context};
use crate::error::Result;
use crate::sink::Sink;
use crate::workers::RecordEmitter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DMI_DIR: &str = "/sys/class/dmi/id";
pub const NET_DIR: &str = "/sys/class/net";
pub const UDEV_DIR: &str = "/etc/udev/rules.d";
pub const SAR_DIRS: [&str; 2] = ["/var/log/sa", "/var/log/sysstat"];

/// DMI attributes that are not host properties.
const DMI_SKIP: [&str; 2] = ["modalias", "uevent"];

/// Read every readable single-value attribute file in `dir`.
pub fn read_attributes(dir: &Path, skip: &[&str]) -> BTreeMap<String, String> {
    regular_files(dir)
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            if skip.contains(&name.as_str()) {
                return None;
            }
            // Some attributes are readable by root only
            let value = fs::read_to_string(&path).ok()?;
            Some((name, value.trim().to_string()))
        })
        .collect()
}

/// One network interface.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NicInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplex: Option<String>,
}

/// Interfaces below `dir`, loopback excluded.
pub fn nic_info(dir: &Path) -> Vec<NicInfo> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "lo")
            .collect(),
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "No network interfaces");
            Vec::new()
        }
    };
    names.sort();

    names
        .into_iter()
        .map(|name| {
            // speed and duplex fail with EINVAL on interfaces that are down
            let attr = |attr: &str| {
                fs::read_to_string(dir.join(&name).join(attr))
                    .ok()
                    .map(|v| v.trim().to_string())
            };
            NicInfo {
                mtu: attr("mtu"),
                speed: attr("speed"),
                address: attr("address"),
                duplex: attr("duplex"),
                name,
            }
        })
        .collect()
}

/// Binary SAR data file, not a text report.
pub fn is_sar_file(name: &str) -> bool {
    name.starts_with("sa") && !name.starts_with("sar")
}

#[derive(Debug, Serialize)]
struct SarInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    sar_version: Option<String>,
    directories: Vec<DirectoryListing>,
}

pub async fn collect(ctx: &Context, sink: &mut Sink) -> Result<()> {
    info!("Collecting Linux host information");

    tolerate(sink.write_json("hostinfo.json", &read_attributes(Path::new(DMI_DIR), &DMI_SKIP)))?;
    tolerate(sink.write_json("nicinfo.json", &nic_info(Path::new(NET_DIR))))?;

    run_commands(ctx, &ctx.catalog.commands, "cmd", sink).await?;
    capture_files(&ctx.catalog.files, sink).await?;

    for rule in regular_files(Path::new(UDEV_DIR))
        .into_iter()
        .filter(|p| p.extension().map_or(false, |ext| ext == "rules"))
    {
        sink.emit(file_record(&rule)).await?;
    }

    if ctx.options.no_sar {
        info!("Skipping SAR");
        return Ok(());
    }
    collect_sar(ctx, sink).await
}

async fn collect_sar(ctx: &Context, sink: &mut Sink) -> Result<()> {
    let dirs: Vec<PathBuf> = SAR_DIRS.iter().map(PathBuf::from).collect();
    info!("Collecting SAR data");

    let version = if ctx.options.is_skipped("sar") {
        None
    } else {
        let output = ctx.runner.run_args("sar", &["-V"]).await;
        // older sysstat prints the version on stderr
        String::from_utf8_lossy(&output.stderr)
            .lines()
            .chain(String::from_utf8_lossy(&output.stdout).lines())
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    };
    let info = SarInfo {
        sar_version: version,
        directories: directory_listing(&dirs),
    };
    tolerate(sink.write_json("sarinfo.json", &info))?;

    for dir in &dirs {
        for path in regular_files(dir) {
            let is_sa = path
                .file_name()
                .map_or(false, |n| is_sar_file(&n.to_string_lossy()));
            if is_sa {
                store_file(sink, &path)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_attributes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sys_vendor"), "QEMU\n").unwrap();
        fs::write(dir.path().join("product_name"), "Standard PC\n").unwrap();
        fs::write(dir.path().join("uevent"), "MODALIAS=dmi:x\n").unwrap();

        let attrs = read_attributes(dir.path(), &DMI_SKIP);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["sys_vendor"], "QEMU");
        assert!(!attrs.contains_key("uevent"));
    }

    #[test]
    fn test_nic_info() {
        let dir = tempfile::tempdir().unwrap();
        for nic in ["lo", "eth0"] {
            fs::create_dir(dir.path().join(nic)).unwrap();
            fs::write(dir.path().join(nic).join("mtu"), "1500\n").unwrap();
        }
        fs::write(dir.path().join("eth0").join("address"), "52:54:00:12:34:56\n").unwrap();

        let nics = nic_info(dir.path());
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].name, "eth0");
        assert_eq!(nics[0].mtu.as_deref(), Some("1500"));
        assert_eq!(nics[0].address.as_deref(), Some("52:54:00:12:34:56"));
        assert_eq!(nics[0].speed, None);
    }

    #[test]
    fn test_sar_file_names() {
        assert!(is_sar_file("sa01"));
        assert!(is_sar_file("sa20240101"));
        assert!(!is_sar_file("sar01"));
        assert!(!is_sar_file("pacct"));
    }
}
