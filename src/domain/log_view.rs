//! Rendering of job logs for `stoke view`.
//!
//! Jobs mark each provisioning command with a `PROFILE_COMMAND <name>: <header>`
//! line; the lines that follow are task records of the form
//! `time - playbook - task - action - category - data`.

use std::path::{Path, PathBuf};

use super::node::NodeStatus;

const SUCCESS: &[&str] = &["ok", "changed", "rescued"];
const FAILURE: &[&str] = &["failed", "fatal", "unreachable"];
const MARKER: &str = "PROFILE_COMMAND";

/// One `time - playbook - task - action - category - data` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord<'a> {
    pub time: &'a str,
    pub playbook: &'a str,
    pub task: &'a str,
    pub action: &'a str,
    pub category: &'a str,
    pub data: &'a str,
}

impl<'a> TaskRecord<'a> {
    pub fn parse(line: &'a str) -> Option<Self> {
        let mut parts = line.splitn(6, " - ");
        Some(Self {
            time: parts.next()?,
            playbook: parts.next()?,
            task: parts.next()?,
            action: parts.next()?,
            category: parts.next()?,
            data: parts.next().unwrap_or_default(),
        })
    }
}

/// Most recent `<log_dir>/<name>-<action>-<ts>.log` for a node.
pub fn latest_log(log_dir: &Path, name: &str) -> std::io::Result<Option<PathBuf>> {
    let prefix = format!("{name}-");
    let mut newest: Option<(i64, PathBuf)> = None;
    for entry in std::fs::read_dir(log_dir)?.flatten() {
        let file_name = entry.file_name();
        let Some(rest) = file_name
            .to_str()
            .and_then(|f| f.strip_prefix(&prefix))
            .and_then(|f| f.strip_suffix(".log"))
        else {
            continue;
        };
        // `<action>-<ts>`; the action itself contains no dash
        let Some((action, stamp)) = rest.split_once('-') else {
            continue;
        };
        let Ok(stamp) = stamp.parse::<i64>() else {
            continue;
        };
        if action.is_empty() {
            continue;
        }
        if newest.as_ref().map_or(true, |(best, _)| stamp > *best) {
            newest = Some((stamp, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// Render every command section of `log`, followed by the node's status.
pub fn render(log: &str, status: NodeStatus, raw: bool) -> String {
    let mut out = String::new();
    for section in sections(log) {
        out.push_str(&render_section(section, status, raw));
        out.push('\n');
    }
    out
}

fn sections(log: &str) -> Vec<&str> {
    let starts: Vec<usize> = log.match_indices(MARKER).map(|(i, _)| i).collect();
    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| {
            let end = starts.get(n + 1).copied().unwrap_or(log.len());
            &log[start..end]
        })
        .collect()
}

fn render_section(section: &str, status: NodeStatus, raw: bool) -> String {
    let mut lines = section.lines();
    let first = lines.next().unwrap_or_default();
    let after_marker = first.strip_prefix(MARKER).unwrap_or(first).trim_start();
    let name = after_marker.split(':').next().unwrap_or_default();
    let header = match after_marker.rfind(": ") {
        Some(i) => &after_marker[i + 2..],
        None => after_marker,
    };

    let mut progress = String::new();
    for line in lines {
        if raw {
            progress.push_str(line);
            progress.push('\n');
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        let Some(record) = TaskRecord::parse(line) else {
            continue;
        };
        let category = record.category.to_lowercase();
        if SUCCESS.contains(&category.as_str()) {
            progress.push_str(&format!("   \u{2705} {}\n", record.task));
        } else if FAILURE.contains(&category.as_str()) {
            progress.push_str(&format!("   \u{274c} {}\n", record.task));
        }
    }

    format!(
        "Command:\n    {name}\n\nRunning:\n    {header}\n\nProgress:\n{}\n\nStatus:\n    {}\n",
        progress.trim_end_matches('\n'),
        status.as_str().to_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
PROFILE_COMMAND base: Running base playbook
2024-01-01 - base.yml - Install packages - yum - OK - {}
2024-01-01 - base.yml - Skip me - debug - skipped - {}
2024-01-01 - base.yml - Configure - template - changed - a - b
PROFILE_COMMAND slurm: Running slurm playbook: compute
2024-01-01 - slurm.yml - Start daemon - service - FATAL - {}
";

    #[test]
    fn parses_records_keeping_dashes_in_data() {
        let record = TaskRecord::parse("t - p - Configure - template - changed - a - b").unwrap();
        assert_eq!(record.task, "Configure");
        assert_eq!(record.category, "changed");
        assert_eq!(record.data, "a - b");
        assert!(TaskRecord::parse("not a record").is_none());
    }

    #[test]
    fn renders_sections_with_task_marks() {
        let out = render(LOG, NodeStatus::Failed, false);
        assert_eq!(
            out,
            "Command:\n    base\n\nRunning:\n    Running base playbook\n\nProgress:\n   \u{2705} Install packages\n   \u{2705} Configure\n\nStatus:\n    FAILED\n\n\
Command:\n    slurm\n\nRunning:\n    compute\n\nProgress:\n   \u{274c} Start daemon\n\nStatus:\n    FAILED\n\n"
        );
    }

    #[test]
    fn raw_keeps_section_bodies() {
        let out = render(LOG, NodeStatus::Complete, true);
        assert!(out.contains("Progress:\n2024-01-01 - base.yml - Install packages - yum - OK - {}\n"));
        assert!(out.contains("    COMPLETE"));
        assert!(!out.contains('\u{2705}'));
    }

    #[test]
    fn picks_newest_log_for_node() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["n1-apply-100.log", "n1-remove-200.log", "n10-apply-300.log", "n1-notes.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let latest = latest_log(dir.path(), "n1").unwrap().unwrap();
        assert!(latest.ends_with("n1-remove-200.log"));
        assert_eq!(latest_log(dir.path(), "n2").unwrap(), None);
    }
}
