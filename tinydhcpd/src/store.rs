//! Lease-file persistence: the on-disk mirror of [`crate::lease::LeaseTable`].
//!
//! The format is intentionally flat and line-oriented, one binding per
//! line, so a corrupt trailing line never prevents the rest of the file
//! from loading. This is a single small file rewritten atomically on every
//! flush, so plain `std::fs` calls are all it needs -- no async I/O or
//! backend abstraction.

use std::fs;
use std::io::{self, Write as _};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::lease::{Binding, LeaseState, LeaseTable};
use crate::wire::HardwareAddress;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lease file I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct LeaseStore;

impl LeaseStore {
    /// Loads every well-formed line in `path` into `table`. Missing files
    /// are treated as an empty store, since a fresh install has no lease
    /// file yet. Malformed lines are logged and skipped rather than
    /// aborting the load.
    pub fn load(path: &Path, now: u64) -> Result<LeaseTable, StoreError> {
        let mut table = LeaseTable::new();

        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(table),
            Err(e) => return Err(e.into()),
        };

        for (lineno, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            match parse_line(line, now) {
                Some((hw, ip, expires_at)) => {
                    if hw == crate::lease::declined_owner() {
                        table.mark_declined(ip);
                    } else if expires_at <= now {
                        // Already expired: drop it rather than insert a
                        // binding that would just be reclaimed on the next
                        // sweep anyway.
                    } else {
                        // Bypass collision checking: the file is the
                        // prior authoritative state, not a live request.
                        let ttl = expires_at - now;
                        let _ = table.upsert(hw, ip, ttl, LeaseState::Bound, now);
                    }
                }
                None => {
                    log_malformed(lineno + 1, line);
                }
            }
        }

        Ok(table)
    }

    /// Rewrites `path` from scratch with the current contents of `table`,
    /// via a temp file + rename so a crash mid-write never truncates the
    /// file a reader might be loading concurrently.
    pub fn flush(path: &Path, table: &LeaseTable) -> Result<(), StoreError> {
        let mut buf = String::new();

        for (hw, binding) in table.iter() {
            write_line(&mut buf, hw, binding);
        }

        let tmp_path = tmp_path_for(path);
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(buf.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "leases".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_line(buf: &mut String, hw: &HardwareAddress, binding: &Binding) {
    buf.push_str(&hw.to_string());
    buf.push(':');
    buf.push(',');
    buf.push_str(&binding.ip.to_string());
    buf.push(',');
    buf.push_str(&binding.expires_at.to_string());
    buf.push('\n');
}

/// Parses one `<hwaddr-colon-hex>:,<ipv4-dotted>,<expires-at-decimal>` line.
/// The trailing colon after the hardware address is tolerated (and is what
/// the original writer always emitted); returns `None` for anything that
/// doesn't have exactly two commas or whose fields don't parse.
fn parse_line(line: &str, _now: u64) -> Option<(HardwareAddress, Ipv4Addr, u64)> {
    if line.matches(',').count() != 2 {
        return None;
    }

    let mut parts = line.splitn(3, ',');
    let hw_field = parts.next()?;
    let ip_field = parts.next()?;
    let expiry_field = parts.next()?;

    let hw_field = hw_field.trim_end_matches(':');
    let hw: HardwareAddress = hw_field.parse().ok()?;
    let ip: Ipv4Addr = ip_field.parse().ok()?;
    let expires_at: u64 = expiry_field.parse().ok()?;

    Some((hw, ip, expires_at))
}

#[cfg(feature = "log")]
fn log_malformed(lineno: usize, line: &str) {
    log::warn!("skipping malformed lease file line {lineno}: {line:?}");
}

#[cfg(not(feature = "log"))]
fn log_malformed(_lineno: usize, _line: &str) {}
