// ── Mode bits ────────────────────────────────────────────────────────────────

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

const TYPE_CHARS: [(u32, char); 6] = [
    (S_IFDIR, 'd'),
    (S_IFLNK, 'l'),
    (0o010000, 'p'),
    (0o140000, 's'),
    (0o060000, 'b'),
    (0o020000, 'c'),
];

/// (read, write, exec, special bit, special-with-exec, special-without-exec)
/// for owner, group and others.
const CLASSES: [(u32, u32, u32, u32, char, char); 3] = [
    (0o400, 0o200, 0o100, 0o4000, 's', 'S'),
    (0o040, 0o020, 0o010, 0o2000, 's', 'S'),
    (0o004, 0o002, 0o001, 0o1000, 't', 'T'),
];

pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn is_regular(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

pub fn is_symlink(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Render mode bits as an `ls -l` style string such as "drwxr-xr-x".
pub fn format_permissions(mode: u32) -> String {
    let mut s = String::with_capacity(10);
    let kind = mode & S_IFMT;
    s.push(
        TYPE_CHARS
            .iter()
            .find(|(bits, _)| *bits == kind)
            .map(|(_, c)| *c)
            .unwrap_or('-'),
    );

    for (r, w, x, special, on, off) in CLASSES {
        s.push(if mode & r != 0 { 'r' } else { '-' });
        s.push(if mode & w != 0 { 'w' } else { '-' });
        s.push(match (mode & special != 0, mode & x != 0) {
            (true, true) => on,
            (true, false) => off,
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_common_modes() {
        assert_eq!(format_permissions(0o040755), "drwxr-xr-x");
        assert_eq!(format_permissions(0o100644), "-rw-r--r--");
        assert_eq!(format_permissions(0o120777), "lrwxrwxrwx");
        assert_eq!(format_permissions(0o100600), "-rw-------");
    }

    #[test]
    fn renders_special_bits() {
        assert_eq!(format_permissions(0o104755), "-rwsr-xr-x");
        assert_eq!(format_permissions(0o102644), "-rw-r-Sr--");
        assert_eq!(format_permissions(0o041777), "drwxrwxrwt");
        assert_eq!(format_permissions(0o041776), "drwxrwxrwT");
    }

    #[test]
    fn classifies_entry_types() {
        assert!(is_dir(0o040700));
        assert!(!is_regular(0o040700));
        assert!(is_regular(0o100644));
        assert!(is_symlink(0o120777));
        assert!(!is_dir(0));
    }
}
