//! Detection of running database instances.

use regex::Regex;
use std::sync::OnceLock;
use sysinfo::System;

/// One running instance, found through its process monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningInstance {
    /// Instance name
    pub sid: String,
    /// Owner of the monitor process
    pub uid: Option<u32>,
    pub pid: u32,
}

fn pmon_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^ora_pmon_(\w+)$").expect("Invalid pmon regex"))
}

/// Instance name from a process name, if it is a monitor process.
pub fn sid_from_process_name(name: &str) -> Option<String> {
    pmon_pattern()
        .captures(name.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Scan the process table for `ora_pmon_<SID>` processes.
///
/// The command line is preferred over the process name since the kernel
/// truncates the latter.
pub fn running_instances() -> Vec<RunningInstance> {
    let mut sys = System::new();
    sys.refresh_processes();

    let mut instances: Vec<RunningInstance> = sys
        .processes()
        .iter()
        .filter_map(|(pid, process)| {
            let sid = process
                .cmd()
                .first()
                .and_then(|arg0| sid_from_process_name(arg0))
                .or_else(|| sid_from_process_name(process.name()))?;
            Some(RunningInstance {
                sid,
                uid: process.user_id().map(|uid| **uid),
                pid: pid.as_u32(),
            })
        })
        .collect();

    instances.sort_by(|a, b| a.sid.cmp(&b.sid));
    instances.dedup_by(|a, b| a.sid == b.sid);
    instances
}
