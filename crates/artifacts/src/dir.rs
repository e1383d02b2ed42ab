//! Naming and discovery of on-disk artifacts. Snapshots are named by a
//! 10-digit decimal timestamp; updates concatenate two of them.

use std::path::{Path, PathBuf};

pub fn snapshot_name(timestamp: u32) -> String {
    format!("{timestamp:010}")
}

pub fn update_name(from: u32, to: u32) -> String {
    format!("{from:010}{to:010}")
}

pub fn parse_snapshot_name(name: &str) -> Option<u32> {
    if name.len() == 10 && name.bytes().all(|b| b.is_ascii_digit()) {
        name.parse().ok()
    } else {
        None
    }
}

pub fn parse_update_name(name: &str) -> Option<(u32, u32)> {
    if name.len() != 20 {
        return None;
    }
    let (from, to) = name.split_at(10);
    Some((parse_snapshot_name(from)?, parse_snapshot_name(to)?))
}

/// Every well-named snapshot in `dir`, unsorted.
pub fn list_snapshots(dir: &Path) -> std::io::Result<Vec<(PathBuf, u32)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(ts) = entry.file_name().to_str().and_then(parse_snapshot_name) {
            out.push((entry.path(), ts));
        }
    }
    Ok(out)
}

/// Every well-named update in `dir`, unsorted.
pub fn list_updates(dir: &Path) -> std::io::Result<Vec<(PathBuf, u32, u32)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some((from, to)) = entry.file_name().to_str().and_then(parse_update_name) {
            out.push((entry.path(), from, to));
        }
    }
    Ok(out)
}

pub fn newest_snapshot(dir: &Path) -> std::io::Result<Option<(PathBuf, u32)>> {
    Ok(list_snapshots(dir)?.into_iter().max_by_key(|(_, ts)| *ts))
}

pub fn oldest_snapshot(dir: &Path) -> std::io::Result<Option<(PathBuf, u32)>> {
    Ok(list_snapshots(dir)?.into_iter().min_by_key(|(_, ts)| *ts))
}

/// The update with the greatest `to`, which is where the next delta
/// resumes.
pub fn newest_update(dir: &Path) -> std::io::Result<Option<(PathBuf, u32, u32)>> {
    Ok(list_updates(dir)?.into_iter().max_by_key(|(_, _, to)| *to))
}
