use chrono::{Local, TimeZone};
use itertools::Itertools;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};

use crate::prelude::*;

/// Written in place of a name when the command line is empty and the
/// per-process status metadata cannot be read either.
const UNKNOWN_KERNEL_THREAD: &str = "[unknown kernel thread]";

/// One observed process, one field per column of the log line.
///
/// Fields that could not be read are left empty rather than failing
/// the whole snapshot; a process that exits mid-enumeration simply
/// yields a partial record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub username: String,
    pub pid: u32,
    pub ppid: u32,
    pub create_time: String,
    pub cmdline: String,
}

impl ProcessRecord {
    /// The space-delimited line written to the log.
    ///
    /// The full string is also the deduplication key: two observations
    /// count as the same process only when every field coincides. A
    /// reused pid whose remaining fields all match is therefore not
    /// distinguished from the original process.
    pub fn signature(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.username, self.pid, self.ppid, self.create_time, self.cmdline
        )
    }
}

/// Where snapshots come from: the OS process table in production,
/// scripted lists in tests.
pub trait ProcessSource {
    fn snapshot(&mut self) -> Result<Vec<ProcessRecord>>;
}

/// Reads the live process table through `sysinfo`.
pub struct SystemProcessSource {
    system: System,
    users: Users,
}

impl SystemProcessSource {
    pub fn new() -> Self {
        SystemProcessSource {
            system: System::new(),
            users: Users::new_with_refreshed_list(),
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing()
            .with_cmd(UpdateKind::Always)
            .with_user(UpdateKind::Always)
    }

    fn username_of(&self, process: &sysinfo::Process) -> String {
        process
            .user_id()
            .and_then(|uid| self.users.get_user_by_id(uid))
            .map(|user| user.name().to_string())
            .unwrap_or_default()
    }
}

impl Default for SystemProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SystemProcessSource {
    fn snapshot(&mut self) -> Result<Vec<ProcessRecord>> {
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());

        let mut records = Vec::new();
        for (&pid, process) in self
            .system
            .processes()
            .iter()
            .sorted_by_key(|(pid, _)| **pid)
        {
            let cmdline = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .join(" ");

            records.push(ProcessRecord {
                username: self.username_of(process),
                pid: pid.as_u32(),
                ppid: process.parent().map(|ppid| ppid.as_u32()).unwrap_or(0),
                create_time: format_create_time(process.start_time()),
                cmdline: resolve_cmdline(cmdline, || kernel_thread_name(pid)),
            });
        }

        Ok(records)
    }
}

fn format_create_time(epoch_secs: u64) -> String {
    Local
        .timestamp_opt(epoch_secs as i64, 0)
        .single()
        .map(|created| created.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Kernel threads have no command line; fall back to the name the
/// kernel reports for them, then to a fixed placeholder.
fn resolve_cmdline(cmdline: String, kernel_name: impl FnOnce() -> Option<String>) -> String {
    if !cmdline.is_empty() {
        return cmdline;
    }

    kernel_name().unwrap_or_else(|| UNKNOWN_KERNEL_THREAD.to_string())
}

/// Reads the `Name:` field of `/proc/<pid>/status`.
#[cfg(target_os = "linux")]
fn kernel_thread_name(pid: Pid) -> Option<String> {
    let process = procfs::process::Process::new(pid.as_u32() as i32).ok()?;
    Some(process.status().ok()?.name)
}

#[cfg(not(target_os = "linux"))]
fn kernel_thread_name(_pid: Pid) -> Option<String> {
    None
}
