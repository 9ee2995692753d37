//! Per-platform collection catalogs.
//!
//! A [`Catalog`] lists what to collect on one operating system: ordered
//! `tag -> command` tables for unprivileged and privileged commands, files to
//! capture verbatim and database queries. [`Catalogs`] holds one catalog per
//! [`Platform`]; it is built once at startup and only read afterwards.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Operating systems with a dedicated collection path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Aix,
    SunOs,
    HpUx,
    /// Any other system, carrying the reported system name
    Unknown(String),
}

impl Platform {
    /// Map a `uname` system name to a platform.
    pub fn from_sysname(sysname: &str) -> Self {
        match sysname {
            "Linux" => Platform::Linux,
            "AIX" => Platform::Aix,
            "SunOS" => Platform::SunOs,
            "HP-UX" => Platform::HpUx,
            other => Platform::Unknown(other.to_string()),
        }
    }

    /// Key used for this platform in configuration files.
    pub fn key(&self) -> &str {
        match self {
            Platform::Linux => "linux",
            Platform::Aix => "aix",
            Platform::SunOs => "sunos",
            Platform::HpUx => "hpux",
            Platform::Unknown(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Platform::Unknown(_))
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Linux => write!(f, "Linux"),
            Platform::Aix => write!(f, "AIX"),
            Platform::SunOs => write!(f, "SunOS"),
            Platform::HpUx => write!(f, "HP-UX"),
            Platform::Unknown(name) => write!(f, "{}", name),
        }
    }
}

/// What to collect on one platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    /// Commands run by the unprivileged worker
    pub commands: IndexMap<String, String>,
    /// Commands run by the privileged worker
    pub root_commands: IndexMap<String, String>,
    /// Files captured verbatim
    pub files: Vec<String>,
    /// Statements sent to every database instance
    pub queries: IndexMap<String, String>,
}

impl Catalog {
    /// Merge another catalog over this one.
    ///
    /// Entries with an existing tag are replaced in place so the declared
    /// order is kept; new tags and files are appended.
    pub fn merge(&mut self, overlay: &Catalog) {
        for (tag, cmd) in &overlay.commands {
            self.commands.insert(tag.clone(), cmd.clone());
        }
        for (tag, cmd) in &overlay.root_commands {
            self.root_commands.insert(tag.clone(), cmd.clone());
        }
        for (tag, query) in &overlay.queries {
            self.queries.insert(tag.clone(), query.clone());
        }
        for file in &overlay.files {
            if !self.files.contains(file) {
                self.files.push(file.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
            && self.root_commands.is_empty()
            && self.files.is_empty()
            && self.queries.is_empty()
    }
}

/// Catalogs for all platforms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalogs {
    catalogs: BTreeMap<Platform, Catalog>,
}

impl Catalogs {
    /// Catalogs with nothing in them.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in catalogs.
    pub fn builtin() -> Self {
        let mut catalogs = BTreeMap::new();
        catalogs.insert(Platform::Linux, linux());
        catalogs.insert(Platform::Aix, aix());
        catalogs.insert(Platform::SunOs, sunos());
        catalogs.insert(Platform::HpUx, hpux());
        Self { catalogs }
    }

    /// Replace the catalog of one platform.
    pub fn with_catalog(mut self, platform: Platform, catalog: Catalog) -> Self {
        self.catalogs.insert(platform, catalog);
        self
    }

    /// Catalog for a platform. Unknown platforms get an empty catalog.
    pub fn for_platform(&self, platform: &Platform) -> Catalog {
        self.catalogs.get(platform).cloned().unwrap_or_default()
    }

    /// Merge an overlay catalog for one platform.
    pub fn merge(&mut self, platform: Platform, overlay: &Catalog) {
        self.catalogs.entry(platform).or_default().merge(overlay);
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.catalogs.keys()
    }
}

fn table(entries: &[(&str, &str)]) -> IndexMap<String, String> {
    entries
        .iter()
        .map(|(tag, cmd)| (tag.to_string(), cmd.to_string()))
        .collect()
}

fn list(entries: &[&str]) -> Vec<String> {
    entries.iter().map(|s| s.to_string()).collect()
}

fn oracle_queries() -> IndexMap<String, String> {
    table(&[
        ("instance", "select * from v$instance;"),
        ("database", "select * from v$database;"),
        ("version", "select banner from v$version;"),
        ("parameters", "select name, value from v$parameter order by name;"),
        ("sga", "select * from v$sgainfo;"),
        ("datafiles", "select file_name, bytes, autoextensible from dba_data_files;"),
        ("redologs", "select group#, thread#, bytes, members, status from v$log;"),
        ("options", "select parameter, value from v$option;"),
        ("feature_usage", "select name, detected_usages, currently_used from dba_feature_usage_statistics;"),
        ("awr_snapshots", "select snap_id, begin_interval_time, end_interval_time from dba_hist_snapshot order by snap_id;"),
    ])
}

fn linux() -> Catalog {
    Catalog {
        commands: table(&[
            ("uname", "uname -a"),
            ("uptime", "uptime"),
            ("lscpu", "lscpu"),
            ("lsblk", "lsblk -P -b -o NAME,KNAME,MAJ:MIN,FSTYPE,MOUNTPOINT,SIZE,TYPE,MODEL"),
            ("lspci", "lspci"),
            ("df", "df -PT"),
            ("mount", "mount"),
            ("ip_addr", "ip addr"),
            ("ip_link", "ip -s link"),
            ("ps", "ps -eo user,pid,ppid,pcpu,vsz,rss,stime,args"),
            ("free", "free -k"),
            ("sysctl", "sysctl -a"),
            ("lsmod", "lsmod"),
            ("rpm", "rpm -qa --queryformat %{NAME}|%{VERSION}|%{RELEASE}|%{ARCH}\\n"),
            ("systemctl", "systemctl list-units --no-pager"),
            ("vgs", "vgs"),
            ("pvs", "pvs"),
            ("lvs", "lvs"),
        ]),
        root_commands: table(&[
            ("dmidecode", "dmidecode"),
            ("lvm_pvs", "pvs --units k"),
            ("multipath", "multipath -ll"),
            ("fdisk", "fdisk -l"),
        ]),
        files: list(&[
            "/etc/os-release",
            "/etc/system-release",
            "/proc/cpuinfo",
            "/proc/meminfo",
            "/proc/filesystems",
            "/proc/partitions",
            "/proc/swaps",
            "/etc/fstab",
            "/etc/hosts",
            "/etc/resolv.conf",
            "/etc/sysctl.conf",
            "/etc/security/limits.conf",
            "/etc/oratab",
            "/sys/kernel/mm/transparent_hugepage/enabled",
        ]),
        queries: oracle_queries(),
    }
}

fn aix() -> Catalog {
    Catalog {
        commands: table(&[
            ("uname", "uname -a"),
            ("oslevel", "oslevel -s"),
            ("prtconf", "prtconf"),
            ("lparstat", "lparstat -i"),
            ("lsdev", "lsdev -C"),
            ("lsvg", "lsvg"),
            ("df", "df -k"),
            ("mount", "mount"),
            ("ifconfig", "ifconfig -a"),
            ("vmstat", "vmstat -v"),
            ("ps", "ps -eo user,pid,ppid,pcpu,vsz,args"),
            ("lslpp", "lslpp -L"),
        ]),
        root_commands: IndexMap::new(),
        files: list(&["/etc/filesystems", "/etc/hosts", "/etc/oratab"]),
        queries: oracle_queries(),
    }
}

fn sunos() -> Catalog {
    Catalog {
        commands: table(&[
            ("uname", "uname -a"),
            ("prtconf", "prtconf"),
            ("psrinfo", "psrinfo -v"),
            ("prtdiag", "prtdiag -v"),
            ("zonename", "zonename"),
            ("df", "df -k"),
            ("mount", "mount"),
            ("ifconfig", "ifconfig -a"),
            ("zpool", "zpool list"),
            ("zfs", "zfs list"),
            ("ps", "ps -eo user,pid,ppid,pcpu,vsz,args"),
            ("pkginfo", "pkginfo"),
        ]),
        root_commands: IndexMap::new(),
        files: list(&["/etc/release", "/etc/vfstab", "/etc/hosts", "/etc/system", "/var/opt/oracle/oratab"]),
        queries: oracle_queries(),
    }
}

fn hpux() -> Catalog {
    Catalog {
        commands: table(&[
            ("uname", "uname -a"),
            ("machinfo", "machinfo"),
            ("bdf", "bdf"),
            ("mount", "mount -v"),
            ("netstat", "netstat -in"),
            ("ps", "ps -ef"),
            ("swlist", "swlist"),
            ("kctune", "kctune"),
            ("vgdisplay", "vgdisplay -v"),
        ]),
        root_commands: table(&[("ioscan", "ioscan -fnC disk"), ("swapinfo", "swapinfo -a")]),
        files: list(&["/etc/fstab", "/etc/hosts", "/etc/oratab"]),
        queries: oracle_queries(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_sysname() {
        assert_eq!(Platform::from_sysname("Linux"), Platform::Linux);
        assert_eq!(Platform::from_sysname("AIX"), Platform::Aix);
        assert_eq!(Platform::from_sysname("SunOS"), Platform::SunOs);
        assert_eq!(Platform::from_sysname("HP-UX"), Platform::HpUx);
        assert_eq!(
            Platform::from_sysname("FreeBSD"),
            Platform::Unknown("FreeBSD".to_string())
        );
        assert!(!Platform::from_sysname("Darwin").is_known());
    }

    #[test]
    fn test_builtin_covers_known_platforms() {
        let catalogs = Catalogs::builtin();
        for platform in [Platform::Linux, Platform::Aix, Platform::SunOs, Platform::HpUx] {
            assert!(!catalogs.for_platform(&platform).commands.is_empty());
        }
        assert!(catalogs
            .for_platform(&Platform::Unknown("Plan9".into()))
            .is_empty());
    }

    #[test]
    fn test_merge_keeps_order() {
        let mut base = Catalog {
            commands: table(&[("a", "one"), ("b", "two")]),
            files: list(&["/etc/hosts"]),
            ..Catalog::default()
        };
        let overlay = Catalog {
            commands: table(&[("a", "uno"), ("c", "three")]),
            files: list(&["/etc/hosts", "/etc/motd"]),
            ..Catalog::default()
        };

        base.merge(&overlay);

        let tags: Vec<&str> = base.commands.keys().map(|k| k.as_str()).collect();
        assert_eq!(tags, vec!["a", "b", "c"]);
        assert_eq!(base.commands["a"], "uno");
        assert_eq!(base.files, list(&["/etc/hosts", "/etc/motd"]));
    }
}
