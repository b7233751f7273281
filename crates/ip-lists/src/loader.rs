use std::io::BufRead;
use std::net::IpAddr;
use std::path::Path;

use chrono::Utc;
use tracing::warn;

use crate::{EntrySource, ListEntry};

/// Parse a list file into snapshot entries.
///
/// One address per line, optionally followed by `# reason`. Empty lines and
/// lines starting with `#` are skipped. Lines that fail to parse are logged
/// and skipped.
pub fn parse_list_file(path: &Path) -> anyhow::Result<Vec<ListEntry>> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path.display(), e))?;
    let reader = std::io::BufReader::new(file);
    let now = Utc::now();

    let mut entries = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (addr_part, reason) = match trimmed.split_once('#') {
            Some((addr, reason)) => (addr.trim(), reason.trim()),
            None => (trimmed, ""),
        };
        let reason = if reason.is_empty() {
            format!("listed in {}", path.display())
        } else {
            reason.to_string()
        };

        match addr_part.parse::<IpAddr>() {
            Ok(ip) => entries.push(ListEntry::new_at(ip, &reason, None, EntrySource::Snapshot, now)),
            Err(_) => warn!(
                path = %path.display(),
                line = line_num + 1,
                content = trimmed,
                "skipping unparseable line"
            ),
        }
    }

    Ok(entries)
}
