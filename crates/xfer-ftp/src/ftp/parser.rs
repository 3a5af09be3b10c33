//! LIST / MLSD response parser.
//!
//! Supports three formats:
//! 1. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **Windows/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//! 3. **MLSD facts** (RFC 3659): `type=file;size=1234;modify=20260101120000; file.txt`
//!
//! The parser tries MLSD first (if the raw line contains `=` and `;`),
//! then Unix, then Windows. Lines matching none of them are counted, not
//! guessed at.

use crate::ftp::types::{FtpEntry, FtpEntryKind, ParsedListing};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref UNIX_RE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStT-]{9})[+@.]?\s+  # permissions
        (\d+)\s+                            # link count
        (\S+)\s+                            # owner
        (\S+)\s+                            # group
        (\d+)\s+                            # size
        (\w{3}\s+\d{1,2}\s+[\d:]+)\s        # date
        (.+)$                               # filename (possibly with -> target)
        ",
    )
    .expect("valid unix listing regex");
    static ref WINDOWS_RE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4})\s+         # date
        (\d{1,2}:\d{2}(?:AM|PM)?)\s+      # time
        (<DIR>|\d+)\s+                    # size or <DIR>
        (.+)$                             # filename
        ",
    )
    .expect("valid windows listing regex");
    static ref TOTAL_RE: Regex = Regex::new(r"^total\s+\d+$").expect("valid total regex");
}

/// Parse a full multi-line LIST or MLSD response body.
pub fn parse_listing(raw: &str) -> ParsedListing {
    let mut listing = ParsedListing::default();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || TOTAL_RE.is_match(line.trim()) {
            continue;
        }
        match parse_line(line) {
            Some(e) if e.name == "." || e.name == ".." => {}
            Some(e) => listing.entries.push(e),
            None => {
                log::debug!("Unparseable listing line: {}", line);
                listing.skipped += 1;
            }
        }
    }
    listing
}

/// Parse a single line from a listing.
pub fn parse_line(line: &str) -> Option<FtpEntry> {
    if line.contains(';') && line.contains('=') {
        if let Some(e) = parse_mlsd(line) {
            return Some(e);
        }
    }
    let trimmed = line.trim_start();
    parse_unix(trimmed).or_else(|| parse_windows(trimmed))
}

// ─── MLSD parser ─────────────────────────────────────────────────────

/// Parse MLSD fact-line: `fact1=val1;fact2=val2; filename`
fn parse_mlsd(line: &str) -> Option<FtpEntry> {
    let pos = line.find("; ")?;
    let (facts_str, name) = (&line[..pos + 1], line[pos + 2..].to_string());
    if name.is_empty() {
        return None;
    }

    let mut facts: HashMap<String, String> = HashMap::new();
    for segment in facts_str.split(';') {
        if let Some((k, v)) = segment.trim().split_once('=') {
            facts.insert(k.to_lowercase(), v.to_string());
        }
    }
    if !facts.contains_key("type") {
        return None;
    }

    let kind = match facts.get("type").map(|s| s.to_lowercase()).as_deref() {
        Some("dir") | Some("cdir") | Some("pdir") => FtpEntryKind::Directory,
        Some("file") => FtpEntryKind::File,
        Some("os.unix=symlink") | Some("os.unix=slink") => FtpEntryKind::Symlink,
        _ => FtpEntryKind::Unknown,
    };

    let size = facts
        .get("size")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    Some(FtpEntry {
        name,
        kind,
        size,
        modified: facts.get("modify").and_then(|v| parse_mlsd_time(v)),
        permissions: facts.get("unix.mode").cloned(),
        owner: facts.get("unix.owner").cloned(),
        group: facts.get("unix.group").cloned(),
        link_target: None,
    })
}

/// Parse an RFC 3659 timestamp: `YYYYMMDDHHmmSS[.fraction]`.
///
/// Also used for MDTM replies.
pub fn parse_mlsd_time(s: &str) -> Option<DateTime<Utc>> {
    let base = s.get(..14)?;
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// Format a timestamp the way MFMT and MLSD expect it.
pub fn format_mlsd_time(t: &DateTime<Utc>) -> String {
    t.format("%Y%m%d%H%M%S").to_string()
}

// ─── Unix-style parser ───────────────────────────────────────────────

/// Parse a Unix `ls -l` line:
/// ```text
/// drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
/// -rw-r--r--   1 user group  1234 Jan  1  2025 file.txt
/// lrwxrwxrwx   1 user group    42 Jan  1 12:00 link -> target
/// ```
fn parse_unix(line: &str) -> Option<FtpEntry> {
    let caps = UNIX_RE.captures(line)?;

    let perms = caps.get(1)?.as_str();
    let size = caps.get(5)?.as_str().parse::<u64>().ok()?;
    let date_str = caps.get(6)?.as_str();
    // Exactly one separator is consumed by the regex. Some servers right-pad
    // a year to the width of "HH:MM", leaving one extra space to drop; any
    // other leading space belongs to the filename.
    let name_raw = caps.get(7)?.as_str();
    let name_raw = if ends_with_year(date_str) {
        name_raw.strip_prefix(' ').unwrap_or(name_raw)
    } else {
        name_raw
    };

    let kind = match perms.as_bytes().first() {
        Some(b'd') => FtpEntryKind::Directory,
        Some(b'l') => FtpEntryKind::Symlink,
        Some(b'-') => FtpEntryKind::File,
        _ => FtpEntryKind::Unknown,
    };

    let (name, link_target) = match (kind, name_raw.find(" -> ")) {
        (FtpEntryKind::Symlink, Some(pos)) => (
            name_raw[..pos].to_string(),
            Some(name_raw[pos + 4..].to_string()),
        ),
        _ => (name_raw.to_string(), None),
    };
    if name.is_empty() {
        return None;
    }

    Some(FtpEntry {
        name,
        kind,
        size,
        modified: parse_unix_date(date_str, Utc::now()),
        permissions: Some(perms.to_string()),
        owner: caps.get(3).map(|m| m.as_str().to_string()),
        group: caps.get(4).map(|m| m.as_str().to_string()),
        link_target,
    })
}

fn ends_with_year(date: &str) -> bool {
    date.rsplit(char::is_whitespace)
        .next()
        .map_or(false, |t| t.len() == 4 && t.bytes().all(|b| b.is_ascii_digit()))
}

/// Parse the date portion: "Jan  1 12:00" or "Jan  1  2025".
///
/// The short form has no year; it is the most recent such date that is
/// not more than a day in the future.
fn parse_unix_date(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalised.contains(':') {
        let year = now.year();
        let parse = |y: i32| {
            NaiveDateTime::parse_from_str(&format!("{} {}", y, normalised), "%Y %b %d %H:%M")
                .ok()
                .map(|dt| Utc.from_utc_datetime(&dt))
        };
        return match parse(year) {
            Some(dt) if dt > now + Duration::days(1) => parse(year - 1),
            // Feb 29 outside a leap year
            None => parse(year - 1),
            other => other,
        };
    }

    let date = NaiveDate::parse_from_str(&normalised, "%b %d %Y").ok()?;
    Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::from_hms_opt(0, 0, 0)?)))
}

// ─── Windows-style parser ────────────────────────────────────────────

/// Parse Windows / IIS style line:
/// ```text
/// 01-01-26  12:00AM       1234 file.txt
/// 01-01-26  12:00PM      <DIR> Directory Name
/// ```
fn parse_windows(line: &str) -> Option<FtpEntry> {
    let caps = WINDOWS_RE.captures(line)?;

    let date_str = caps.get(1)?.as_str();
    let time_str = caps.get(2)?.as_str();
    let size_or_dir = caps.get(3)?.as_str();
    let name = caps.get(4)?.as_str().to_string();

    let (kind, size) = if size_or_dir == "<DIR>" {
        (FtpEntryKind::Directory, 0)
    } else {
        (FtpEntryKind::File, size_or_dir.parse::<u64>().ok()?)
    };

    Some(FtpEntry {
        name,
        kind,
        size,
        modified: parse_windows_date(date_str, time_str),
        permissions: None,
        owner: None,
        group: None,
        link_target: None,
    })
}

fn parse_windows_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let combined = format!("{} {}", date, time);
    ["%m-%d-%y %I:%M%p", "%m-%d-%y %H:%M", "%m-%d-%Y %I:%M%p", "%m-%d-%Y %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&combined, fmt).ok())
        .map(|dt| Utc.from_utc_datetime(&dt))
}

// ─── Reconstruction ──────────────────────────────────────────────────

/// Render an entry as an `ls -l` line that parses back to the same entry.
///
/// The `HH:MM` form is only used when it resolves to the same instant,
/// otherwise the year form is emitted.
pub fn format_unix_line(entry: &FtpEntry) -> String {
    let type_char = match entry.kind {
        FtpEntryKind::Directory => 'd',
        FtpEntryKind::Symlink => 'l',
        _ => '-',
    };
    let perms = entry
        .permissions
        .as_deref()
        .filter(|p| p.len() == 10)
        .map(|p| format!("{}{}", type_char, &p[1..]))
        .unwrap_or_else(|| format!("{}rw-r--r--", type_char));

    let date = match entry.modified {
        Some(t) => {
            let short = t.format("%b %e %H:%M").to_string();
            if parse_unix_date(&short, Utc::now()) == Some(t) {
                short
            } else {
                t.format("%b %e  %Y").to_string()
            }
        }
        None => "Jan  1  1970".to_string(),
    };

    let name = match (&entry.link_target, entry.kind) {
        (Some(target), FtpEntryKind::Symlink) => format!("{} -> {}", entry.name, target),
        _ => entry.name.clone(),
    };

    format!(
        "{} 1 {} {} {:>8} {} {}",
        perms,
        entry.owner.as_deref().unwrap_or("owner"),
        entry.group.as_deref().unwrap_or("group"),
        entry.size,
        date,
        name
    )
}

/// Render an entry as an MLSD fact line.
pub fn format_mlsd_line(entry: &FtpEntry) -> String {
    let kind = match entry.kind {
        FtpEntryKind::Directory => "dir",
        FtpEntryKind::Symlink => "OS.unix=symlink",
        _ => "file",
    };
    let mut facts = format!("type={};size={};", kind, entry.size);
    if let Some(t) = entry.modified {
        facts.push_str(&format!("modify={};", format_mlsd_time(&t)));
    }
    if let Some(mode) = &entry.permissions {
        facts.push_str(&format!("UNIX.mode={};", mode));
    }
    if let Some(owner) = &entry.owner {
        facts.push_str(&format!("UNIX.owner={};", owner));
    }
    if let Some(group) = &entry.group {
        facts.push_str(&format!("UNIX.group={};", group));
    }
    format!("{} {}", facts, entry.name)
}

// ─── Conversion helpers ──────────────────────────────────────────────

/// Convert `rwxr-xr-x` (with or without type char) or an octal string
/// into permission bits.
pub fn permission_bits(perms: &str) -> Option<u32> {
    if perms.chars().all(|c| c.is_ascii_digit()) && !perms.is_empty() {
        return u32::from_str_radix(perms, 8).ok();
    }
    let rwx = match perms.len() {
        10 => &perms[1..],
        9 => perms,
        _ => return None,
    };
    let mut bits = 0u32;
    for (i, c) in rwx.chars().enumerate() {
        let set = !matches!(c, '-' | 'S' | 'T');
        if set {
            bits |= 1 << (8 - i);
        }
    }
    Some(bits)
}
