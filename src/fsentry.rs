/*!
Path classification: resolve a request path under the serving root and snapshot the
filesystem entry it names.

Classification is a pure function of the `st_mode` word. Entries are read with `lstat`,
so a symbolic link is classified as itself (`Other`), never as its target.
*/

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::errors::ShaasError;

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;
const S_IFLNK: u32 = libc::S_IFLNK as u32;
const S_IFBLK: u32 = libc::S_IFBLK as u32;
const S_IFCHR: u32 = libc::S_IFCHR as u32;
const S_IFIFO: u32 = libc::S_IFIFO as u32;
const S_IFSOCK: u32 = libc::S_IFSOCK as u32;
const S_ISUID: u32 = libc::S_ISUID as u32;
const S_ISGID: u32 = libc::S_ISGID as u32;
const S_ISVTX: u32 = libc::S_ISVTX as u32;

/// Owner-execute or group-execute. World-execute alone does not count.
pub const EXEC_MASK: u32 = 0o110;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    ExecutableFile,
    NonExecutableFile,
    Other,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Directory => "directory",
            EntryKind::ExecutableFile => "regular-executable",
            EntryKind::NonExecutableFile => "regular-nonexecutable",
            EntryKind::Other => "other",
        }
    }
}

/// Classify a raw `st_mode` (file type bits plus permission bits).
pub fn classify(mode: u32) -> EntryKind {
    match mode & S_IFMT {
        S_IFDIR => EntryKind::Directory,
        S_IFREG if mode & EXEC_MASK != 0 => EntryKind::ExecutableFile,
        S_IFREG => EntryKind::NonExecutableFile,
        _ => EntryKind::Other,
    }
}

/// Single-character file type indicator, in the order a Unix mode string would
/// report the first set flag: d, L, D, p, S, u, g, t, otherwise '-'.
pub fn type_indicator(mode: u32) -> char {
    match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'L',
        S_IFBLK | S_IFCHR => 'D',
        S_IFIFO => 'p',
        S_IFSOCK => 'S',
        _ => {
            if mode & S_ISUID != 0 {
                'u'
            } else if mode & S_ISGID != 0 {
                'g'
            } else if mode & S_ISVTX != 0 {
                't'
            } else {
                '-'
            }
        }
    }
}

/// Snapshot of one filesystem entry, taken once per request.
#[derive(Debug, Clone)]
pub struct FilesystemEntry {
    path: PathBuf,
    kind: EntryKind,
    size: u64,
    mode: u32,
    modified: Option<SystemTime>,
}

impl FilesystemEntry {
    pub fn from_metadata(path: PathBuf, meta: &fs::Metadata) -> Self {
        let mode = meta.mode();
        FilesystemEntry {
            path,
            kind: classify(mode),
            size: meta.len(),
            mode,
            modified: meta.modified().ok(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Permission bits only (rwx for user, group, other).
    pub fn permission(&self) -> u32 {
        self.mode & 0o777
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub fn type_indicator(&self) -> char {
        type_indicator(self.mode)
    }

    /// Working directory for executing this entry: the directory itself, or the
    /// parent of an executable file.
    pub fn working_dir(&self) -> PathBuf {
        match self.kind {
            EntryKind::Directory => self.path.clone(),
            _ => self
                .path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/")),
        }
    }
}

/// `lstat` the path and classify it. NotFound and other metadata failures are
/// returned as errors, never as `Other`.
pub fn inspect(path: &Path) -> Result<FilesystemEntry, ShaasError> {
    let meta = fs::symlink_metadata(path).map_err(ShaasError::from)?;
    Ok(FilesystemEntry::from_metadata(path.to_path_buf(), &meta))
}

/// Join a decoded URL path under `root`. Empty and `.` segments are dropped and
/// `..` never climbs above `root`.
pub fn resolve(root: &Path, url_path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    let mut depth = 0usize;
    for seg in url_path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                }
            }
            s => {
                out.push(s);
                depth += 1;
            }
        }
    }
    out
}

/// Read a directory the way listings need it: every child `lstat`ed, sorted by name.
pub fn read_dir_sorted(dir: &Path) -> io::Result<Vec<(String, FilesystemEntry)>> {
    let mut out = Vec::new();
    for ent in fs::read_dir(dir)? {
        let ent = ent?;
        let path = ent.path();
        let meta = fs::symlink_metadata(&path)?;
        let name = ent.file_name().to_string_lossy().into_owned();
        out.push((name, FilesystemEntry::from_metadata(path, &meta)));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, PermissionsExt};

    #[test]
    fn regular_file_exec_bits_policy() {
        for perm in 0..=0o777u32 {
            let kind = classify(S_IFREG | perm);
            if perm & 0o110 != 0 {
                assert_eq!(kind, EntryKind::ExecutableFile, "perm {:o}", perm);
            } else {
                assert_eq!(kind, EntryKind::NonExecutableFile, "perm {:o}", perm);
            }
        }
        // world-execute alone is not enough
        assert_eq!(classify(S_IFREG | 0o001), EntryKind::NonExecutableFile);
        assert_eq!(classify(S_IFREG | 0o100), EntryKind::ExecutableFile);
        assert_eq!(classify(S_IFREG | 0o010), EntryKind::ExecutableFile);
    }

    #[test]
    fn directory_ignores_permission_bits() {
        assert_eq!(classify(S_IFDIR), EntryKind::Directory);
        assert_eq!(classify(S_IFDIR | 0o777), EntryKind::Directory);
        assert_eq!(classify(S_IFDIR | 0o000), EntryKind::Directory);
    }

    #[test]
    fn special_files_are_other() {
        for t in [S_IFLNK, S_IFBLK, S_IFCHR, S_IFIFO, S_IFSOCK] {
            assert_eq!(classify(t | 0o755), EntryKind::Other);
        }
    }

    #[test]
    fn type_indicator_matches_mode_string_order() {
        assert_eq!(type_indicator(S_IFDIR | 0o755), 'd');
        assert_eq!(type_indicator(S_IFDIR | S_ISVTX | 0o777), 'd');
        assert_eq!(type_indicator(S_IFLNK | 0o777), 'L');
        assert_eq!(type_indicator(S_IFCHR | 0o666), 'D');
        assert_eq!(type_indicator(S_IFBLK | 0o660), 'D');
        assert_eq!(type_indicator(S_IFIFO | 0o644), 'p');
        assert_eq!(type_indicator(S_IFSOCK | 0o755), 'S');
        assert_eq!(type_indicator(S_IFREG | S_ISUID | 0o755), 'u');
        assert_eq!(type_indicator(S_IFREG | S_ISGID | 0o755), 'g');
        assert_eq!(type_indicator(S_IFREG | S_ISVTX | 0o644), 't');
        assert_eq!(type_indicator(S_IFREG | 0o644), '-');
    }

    #[test]
    fn resolve_stays_under_root() {
        let root = Path::new("/srv/files");
        assert_eq!(resolve(root, "/"), PathBuf::from("/srv/files"));
        assert_eq!(resolve(root, "/a/b/"), PathBuf::from("/srv/files/a/b"));
        assert_eq!(resolve(root, "/a/./b"), PathBuf::from("/srv/files/a/b"));
        assert_eq!(resolve(root, "/a/../b"), PathBuf::from("/srv/files/b"));
        assert_eq!(resolve(root, "/../../etc/passwd"), PathBuf::from("/srv/files/etc/passwd"));
        assert_eq!(resolve(Path::new("/"), "/tmp//x"), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn inspect_reports_not_found_distinctly() {
        let td = tempfile::tempdir().expect("tmpdir");
        match inspect(&td.path().join("missing")) {
            Err(ShaasError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn inspect_classifies_real_entries() {
        let td = tempfile::tempdir().expect("tmpdir");
        let dir = td.path();

        let script = dir.join("run.sh");
        fs::write(&script, "#!/bin/sh\necho ok\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();
        let e = inspect(&script).unwrap();
        assert_eq!(e.kind(), EntryKind::ExecutableFile);
        assert_eq!(e.permission(), 0o750);
        assert_eq!(e.working_dir(), dir.to_path_buf());

        let data = dir.join("data.txt");
        fs::write(&data, "hello").unwrap();
        fs::set_permissions(&data, fs::Permissions::from_mode(0o641)).unwrap();
        let e = inspect(&data).unwrap();
        assert_eq!(e.kind(), EntryKind::NonExecutableFile);
        assert_eq!(e.size(), 5);

        let link = dir.join("link");
        symlink(&script, &link).unwrap();
        let e = inspect(&link).unwrap();
        assert_eq!(e.kind(), EntryKind::Other);
        assert_eq!(e.type_indicator(), 'L');

        let e = inspect(dir).unwrap();
        assert_eq!(e.kind(), EntryKind::Directory);
        assert_eq!(e.working_dir(), dir.to_path_buf());
    }

    #[test]
    fn read_dir_sorted_orders_by_name() {
        let td = tempfile::tempdir().expect("tmpdir");
        fs::write(td.path().join("b"), "").unwrap();
        fs::write(td.path().join("a"), "").unwrap();
        fs::create_dir(td.path().join("c")).unwrap();
        let names: Vec<String> = read_dir_sorted(td.path())
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
