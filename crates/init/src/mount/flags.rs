//! Mount option parser — exact port of `mountflags.cpp`'s `c_flagMap`.
//!
//! Based on the options `mount(8)` forwards to mount helpers; not every
//! option in the manpage is represented for that reason.

use nix::mount::MsFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParseFlags(u8);

impl ParseFlags {
    const NONE: ParseFlags = ParseFlags(0);
    const REMOVE: ParseFlags = ParseFlags(0x1);
    const NO_FAIL: ParseFlags = ParseFlags(0x2);
    const OPTIONAL_VALUE: ParseFlags = ParseFlags(0x4);

    fn has(self, bit: ParseFlags) -> bool {
        self.0 & bit.0 != 0
    }
}

struct MountFlagEntry {
    name: &'static str,
    mount_flags: MsFlags,
    parse_flags: ParseFlags,
}

macro_rules! entry {
    ($name:expr, $flags:expr) => {
        MountFlagEntry {
            name: $name,
            mount_flags: $flags,
            parse_flags: ParseFlags::NONE,
        }
    };
    ($name:expr, $flags:expr, $parse:expr) => {
        MountFlagEntry {
            name: $name,
            mount_flags: $flags,
            parse_flags: $parse,
        }
    };
}

/// "opt", "noopt" pair where "opt" adds the flag and "noopt" removes it.
macro_rules! flag_with_inverse {
    ($name:expr, $flags:expr) => {
        [
            entry!($name, $flags),
            MountFlagEntry {
                name: concat!("no", $name),
                mount_flags: $flags,
                parse_flags: ParseFlags::REMOVE,
            },
        ]
    };
}

/// "opt", "noopt" pair where "noopt" adds the flag and "opt" removes it.
macro_rules! no_flag_with_inverse {
    ($name:expr, $flags:expr) => {
        [
            MountFlagEntry {
                name: concat!("no", $name),
                mount_flags: $flags,
                parse_flags: ParseFlags::NONE,
            },
            MountFlagEntry {
                name: $name,
                mount_flags: $flags,
                parse_flags: ParseFlags::REMOVE,
            },
        ]
    };
}

fn flag_map() -> Vec<MountFlagEntry> {
    let mut map = Vec::new();
    map.push(entry!("sync", MsFlags::MS_SYNCHRONOUS));
    map.push(MountFlagEntry {
        name: "async",
        mount_flags: MsFlags::MS_SYNCHRONOUS,
        parse_flags: ParseFlags::REMOVE,
    });
    map.extend(no_flag_with_inverse!("atime", MsFlags::MS_NOATIME));
    map.push(entry!("defaults", MsFlags::empty()));
    map.extend(no_flag_with_inverse!("dev", MsFlags::MS_NODEV));
    map.extend(no_flag_with_inverse!("diratime", MsFlags::MS_NODIRATIME));
    map.push(entry!("dirsync", MsFlags::MS_DIRSYNC));
    map.extend(no_flag_with_inverse!("exec", MsFlags::MS_NOEXEC));
    map.push(entry!(
        "group",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV
    ));
    map.push(entry!("nogroup", MsFlags::empty()));
    map.extend(flag_with_inverse!("iversion", MsFlags::MS_I_VERSION));
    map.extend(flag_with_inverse!("mand", MsFlags::MS_MANDLOCK));
    map.push(entry!("_netdev", MsFlags::empty()));
    map.push(entry!(
        "nofail",
        MsFlags::empty(),
        ParseFlags::NO_FAIL
    ));
    map.extend(flag_with_inverse!("relatime", MsFlags::MS_RELATIME));
    map.extend(flag_with_inverse!("strictatime", MsFlags::MS_STRICTATIME));
    map.extend(flag_with_inverse!("lazytime", MsFlags::MS_LAZYTIME));
    map.extend(no_flag_with_inverse!("suid", MsFlags::MS_NOSUID));
    map.push(entry!("silent", MsFlags::MS_SILENT));
    map.push(MountFlagEntry {
        name: "loud",
        mount_flags: MsFlags::MS_SILENT,
        parse_flags: ParseFlags::REMOVE,
    });
    map.push(entry!(
        "owner",
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID
    ));
    map.push(entry!("noowner", MsFlags::empty()));
    map.push(entry!("remount", MsFlags::MS_REMOUNT));
    map.push(entry!("ro", MsFlags::MS_RDONLY));
    map.push(MountFlagEntry {
        name: "rw",
        mount_flags: MsFlags::MS_RDONLY,
        parse_flags: ParseFlags::REMOVE,
    });
    map.push(entry!(
        "user",
        MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
        ParseFlags::OPTIONAL_VALUE
    ));
    map.push(entry!("nouser", MsFlags::empty()));
    map.push(entry!(
        "users",
        MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_NOSUID
    ));
    map.push(entry!("nousers", MsFlags::empty()));
    map
}

fn find_option(option: &str) -> Option<(MsFlags, ParseFlags)> {
    let (name, has_value) = match option.find('=') {
        Some(index) => (&option[..index], true),
        None => (option, false),
    };

    flag_map().into_iter().find_map(|flag| {
        if has_value && !flag.parse_flags.has(ParseFlags::OPTIONAL_VALUE) {
            return None;
        }

        if flag.name == name {
            Some((flag.mount_flags, flag.parse_flags))
        } else {
            None
        }
    })
}

#[derive(Debug, Clone, Default)]
pub struct ParsedOptions {
    pub string_options: String,
    pub mount_flags: MsFlags,
    pub no_fail: bool,
}

/// Parses a comma-separated mount option string into kernel `MsFlags` plus a
/// leftover free-form options string for the filesystem driver.
pub fn parse_flags(options: &str) -> ParsedOptions {
    let mut result = ParsedOptions::default();
    for option in options.split(',').filter(|o| !o.is_empty()) {
        match find_option(option) {
            None => {
                if !result.string_options.is_empty() {
                    result.string_options.push(',');
                }
                result.string_options.push_str(option);
            }
            Some((flags, parse_flags)) => {
                if parse_flags.has(ParseFlags::REMOVE) {
                    result.mount_flags.remove(flags);
                } else {
                    result.mount_flags.insert(flags);
                }

                if parse_flags.has(ParseFlags::NO_FAIL) {
                    result.no_fail = true;
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ro_sets_rdonly_and_rw_clears_it() {
        let ro = parse_flags("ro");
        assert!(ro.mount_flags.contains(MsFlags::MS_RDONLY));

        let rw_after_ro = parse_flags("ro,rw");
        assert!(!rw_after_ro.mount_flags.contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn noatime_sets_flag_atime_clears_it() {
        let noatime = parse_flags("noatime");
        assert!(noatime.mount_flags.contains(MsFlags::MS_NOATIME));

        let atime = parse_flags("noatime,atime");
        assert!(!atime.mount_flags.contains(MsFlags::MS_NOATIME));
    }

    #[test]
    fn nofail_sets_no_fail_without_touching_mount_flags() {
        let parsed = parse_flags("nofail");
        assert!(parsed.no_fail);
        assert!(parsed.mount_flags.is_empty());
    }

    #[test]
    fn unrecognized_tokens_are_forwarded_as_string_options() {
        let parsed = parse_flags("noatime,lowerdir=/a,upperdir=/b");
        assert_eq!(parsed.string_options, "lowerdir=/a,upperdir=/b");
    }

    #[test]
    fn user_accepts_a_value_but_users_does_not() {
        let user = parse_flags("user=1000");
        assert!(user.string_options.is_empty());
        assert!(user.mount_flags.contains(MsFlags::MS_NOSUID));

        let users = parse_flags("users=1000");
        assert_eq!(users.string_options, "users=1000");
    }
}
