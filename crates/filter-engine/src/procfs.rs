//! procfs scanning: find processes by command name.
//!
//! Reads `<root>/<pid>/comm` for every numeric entry and, for matches, the
//! `Tgid:` line of `<root>/<pid>/status`. Processes that exit mid-scan or
//! cannot be read are skipped.

use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

use crate::registry::ProcessRecord;
use crate::rule::ProcessName;

/// Returns a record for every process whose comm equals `name`.
///
/// Fails only when `root` itself cannot be listed.
pub fn scan_by_comm(root: &Path, name: &ProcessName) -> io::Result<Vec<ProcessRecord>> {
    let mut found = Vec::new();

    for entry in fs::read_dir(root)? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };

        match read_record(root, pid) {
            Some(record) if record.command_name == *name => found.push(record),
            Some(_) => {}
            None => debug!(pid, "skipping unreadable procfs entry"),
        }
    }

    found.sort_by_key(|r| r.pid);
    Ok(found)
}

/// Reads one process. `None` when comm is missing or unreadable.
pub fn read_record(root: &Path, pid: u32) -> Option<ProcessRecord> {
    let dir = root.join(pid.to_string());
    let comm = fs::read(dir.join("comm")).ok()?;
    let comm = comm.strip_suffix(b"\n").unwrap_or(&comm[..]);

    let tgid = fs::read_to_string(dir.join("status"))
        .ok()
        .and_then(|status| parse_tgid(&status))
        .unwrap_or(pid);

    Some(ProcessRecord {
        command_name: ProcessName::from_kernel_bytes(comm),
        pid,
        tgid,
    })
}

fn parse_tgid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_proc(root: &Path, pid: u32, comm: &str, tgid: Option<u32>) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        if let Some(tgid) = tgid {
            fs::write(
                dir.join("status"),
                format!("Name:\t{comm}\nUmask:\t0022\nState:\tS (sleeping)\nTgid:\t{tgid}\nPid:\t{pid}\n"),
            )
            .unwrap();
        }
    }

    #[test]
    fn finds_matching_processes() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 1000, "myprocess", Some(1000));
        fake_proc(dir.path(), 1001, "myprocess", Some(1000));
        fake_proc(dir.path(), 2000, "sshd", Some(2000));

        let name = ProcessName::new("myprocess").unwrap();
        let found = scan_by_comm(dir.path(), &name).unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].pid, 1000);
        assert_eq!(found[1].pid, 1001);
        assert_eq!(found[1].tgid, 1000);
    }

    #[test]
    fn missing_status_falls_back_to_pid() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 42, "worker", None);

        let record = read_record(dir.path(), 42).unwrap();
        assert_eq!(record.tgid, 42);
        assert_eq!(record.command_name.to_string(), "worker");
    }

    #[test]
    fn skips_non_numeric_and_broken_entries() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 10, "target", Some(10));
        fs::create_dir_all(dir.path().join("self")).unwrap();
        fs::create_dir_all(dir.path().join("11")).unwrap(); // no comm
        fs::write(dir.path().join("uptime"), "1.0 1.0\n").unwrap();

        let name = ProcessName::new("target").unwrap();
        let found = scan_by_comm(dir.path(), &name).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, 10);
    }

    #[test]
    fn long_comm_is_truncated_before_compare() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 5, "a-very-long-kernel-comm", Some(5));

        let name = ProcessName::new("a-very-long-kern").unwrap();
        assert_eq!(scan_by_comm(dir.path(), &name).unwrap().len(), 1);
    }

    #[test]
    fn missing_root_is_error() {
        let name = ProcessName::new("x").unwrap();
        assert!(scan_by_comm(Path::new("/nonexistent/proc/root"), &name).is_err());
    }
}
