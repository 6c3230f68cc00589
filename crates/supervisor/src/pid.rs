use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

pub const PID_FILE_NAME: &str = "gateway.pid";

/// The pid of the gateway child, persisted at `<stateDir>/gateway.pid`.
///
/// Purely advisory: a record only says which pid to check, never that the
/// process is alive.
#[derive(Debug, Clone)]
pub struct PidStore {
    path: PathBuf,
}

impl PidStore {
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(PID_FILE_NAME),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded pid. Missing, unreadable or malformed records read as
    /// `None`.
    #[must_use]
    pub fn read(&self) -> Option<u32> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable pid record");
                return None;
            },
        };
        match raw.trim().parse::<u32>() {
            Ok(0) | Err(_) => {
                debug!(path = %self.path.display(), content = raw.trim(), "ignoring malformed pid record");
                None
            },
            Ok(pid) => Some(pid),
        }
    }

    /// Write the pid via a temp file and rename.
    pub fn write(&self, pid: u32) -> std::io::Result<()> {
        write_atomic(&self.path, pid.to_string().as_bytes())
    }

    /// Remove the record; a missing file is fine.
    pub fn clear(&self) -> std::io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Replace `path` with `contents` so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp_name);

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn write_read_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = PidStore::new(dir.path());
        assert_eq!(store.read(), None);

        store.write(4242).unwrap();
        assert_eq!(store.read(), Some(4242));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "4242");

        store.clear().unwrap();
        assert_eq!(store.read(), None);
        store.clear().unwrap();
    }

    #[rstest]
    #[case("abc")]
    #[case("")]
    #[case("-12")]
    #[case("0")]
    #[case("12 34")]
    fn malformed_records_read_as_none(#[case] content: &str) {
        let dir = tempfile::tempdir().unwrap();
        let store = PidStore::new(dir.path());
        fs::write(store.path(), content).unwrap();
        assert_eq!(store.read(), None);
    }

    #[test]
    fn surrounding_whitespace_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = PidStore::new(dir.path());
        fs::write(store.path(), " 77\n").unwrap();
        assert_eq!(store.read(), Some(77));
    }

    #[test]
    fn write_creates_the_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = PidStore::new(&dir.path().join("nested/state"));
        store.write(9).unwrap();
        assert_eq!(store.read(), Some(9));
    }
}
