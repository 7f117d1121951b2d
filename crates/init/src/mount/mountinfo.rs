//! `/proc/self/mountinfo` parser, matching `mountutil.c`'s
//! `MountParseMountInfoLine`/`MountEnumNext`.
//!
//! Field layout (space-separated, with an optional-fields run terminated by
//! a lone `-`):
//! `id parent-id major:minor root mount-point options optional... - fstype
//! source super-options`

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub id: i32,
    pub parent_id: i32,
    pub device: u64,
    pub root: String,
    pub mount_point: String,
    pub mount_options: String,
    pub file_system_type: String,
    pub source: String,
    pub super_options: String,
}

fn parse_device(field: &str) -> Option<u64> {
    let (major, minor) = field.split_once(':')?;
    let major: u32 = major.parse().ok()?;
    let minor: u32 = minor.parse().ok()?;
    Some(nix::sys::stat::makedev(major as u64, minor as u64))
}

/// The kernel escapes space, tab, newline, and backslash as `\ooo` octal
/// sequences in `root`/`mount-point`/`source` fields. Unescape in place so
/// callers see the real path.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(octal) = std::str::from_utf8(&bytes[i + 1..i + 4]) {
                if let Ok(value) = u8::from_str_radix(octal, 8) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }

        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Parses one line of `mountinfo`. Returns `None` for malformed lines (the
/// original skips these rather than failing the whole enumeration).
pub fn parse_mount_info_line(line: &str) -> Option<MountEntry> {
    let mut fields = line.split(' ');
    let id = fields.next()?.parse().ok()?;
    let parent_id = fields.next()?.parse().ok()?;
    let device = parse_device(fields.next()?)?;
    let root = unescape_octal(fields.next()?);
    let mount_point = unescape_octal(fields.next()?);
    let mount_options = fields.next()?.to_string();

    // Skip the run of optional fields up to (and including) the "-"
    // separator.
    loop {
        let field = fields.next()?;
        if field == "-" {
            break;
        }
    }

    let file_system_type = fields.next()?.to_string();
    let source = unescape_octal(fields.next()?);
    let super_options = fields.next().unwrap_or("").trim_end().to_string();

    Some(MountEntry {
        id,
        parent_id,
        device,
        root,
        mount_point,
        mount_options,
        file_system_type,
        source,
        super_options,
    })
}

/// Iterates the entries of a mountinfo file, skipping malformed lines.
pub struct MountEnum {
    lines: std::vec::IntoIter<String>,
}

impl MountEnum {
    pub fn new() -> io::Result<Self> {
        Self::with_path("/proc/self/mountinfo")
    }

    pub fn with_path(path: &str) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        let lines: Vec<String> = content.lines().map(str::to_string).collect();
        Ok(Self {
            lines: lines.into_iter(),
        })
    }
}

impl Iterator for MountEnum {
    type Item = MountEntry;

    fn next(&mut self) -> Option<MountEntry> {
        for line in self.lines.by_ref() {
            if let Some(entry) = parse_mount_info_line(&line) {
                return Some(entry);
            }
        }

        None
    }
}

/// Returns the `st_rdev` device number for the block device at `path`,
/// matching `GetBlockDeviceNumber`.
pub fn block_device_number(path: &str) -> io::Result<u64> {
    let meta = fs::metadata(path)?;
    Ok(meta.rdev())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LINE: &str =
        "36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue";

    #[test]
    fn parses_a_well_formed_line() {
        let entry = parse_mount_info_line(SAMPLE_LINE).unwrap();
        assert_eq!(entry.id, 36);
        assert_eq!(entry.parent_id, 35);
        assert_eq!(entry.device, nix::sys::stat::makedev(98, 0));
        assert_eq!(entry.mount_point, "/mnt2");
        assert_eq!(entry.file_system_type, "ext3");
        assert_eq!(entry.source, "/dev/root");
        assert_eq!(entry.super_options, "rw,errors=continue");
    }

    #[test]
    fn rejects_a_line_with_no_optional_field_terminator() {
        assert!(parse_mount_info_line("36 35 98:0 /mnt1 /mnt2 rw,noatime ext3").is_none());
    }

    #[test]
    fn rejects_a_line_with_unparsable_device_field() {
        assert!(parse_mount_info_line("36 35 bogus /mnt1 /mnt2 rw - ext3 /dev/root rw").is_none());
    }

    #[test]
    fn unescapes_octal_sequences_in_path_fields() {
        let line = r"36 35 98:0 / /mnt\040with\040space rw,noatime - ext3 /dev/root rw";
        let entry = parse_mount_info_line(line).unwrap();
        assert_eq!(entry.mount_point, "/mnt with space");
    }
}
