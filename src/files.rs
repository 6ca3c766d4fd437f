//! Capability-scoped file helpers.
//!
//! Every read and write goes through `cap-std` so callers name a directory
//! explicitly before touching a file inside it.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is unset the input is returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), String> {
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("path has no file name: {path}"))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    Ok((parent, file_name))
}

/// Reads a UTF-8 file, resolving its parent directory with ambient authority.
///
/// # Errors
///
/// Returns a human-readable message when the directory cannot be opened or
/// the file cannot be read.
pub fn read_to_string(path: &Utf8Path) -> Result<String, String> {
    let (parent, file_name) = split_path(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_name).map_err(|err| err.to_string())
}

/// Creates `path` and any missing parents.
///
/// # Errors
///
/// Returns a human-readable message when creation fails.
pub fn ensure_dir(path: &Utf8Path) -> Result<(), String> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| err.to_string())
}

/// Writes `contents` to `path`, creating parent directories first.
///
/// # Errors
///
/// Returns a human-readable message when the directory cannot be prepared or
/// the write fails.
pub fn write(path: &Utf8Path, contents: impl AsRef<[u8]>) -> Result<(), String> {
    let (parent, file_name) = split_path(path)?;
    ensure_dir(parent)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| err.to_string())?;
    dir.write(file_name, contents).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn utf8_tmp() -> (TempDir, Utf8PathBuf) {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 tempdir: {}", path.display()));
        (tmp, path)
    }

    #[test]
    fn write_creates_missing_parents_and_reads_back() {
        let (_tmp, root) = utf8_tmp();
        let target = root.join("nested/dir/file.txt");

        write(&target, "payload").unwrap_or_else(|err| panic!("write: {err}"));
        let read = read_to_string(&target).unwrap_or_else(|err| panic!("read: {err}"));

        assert_eq!(read, "payload");
    }

    #[test]
    fn read_missing_file_reports_error() {
        let (_tmp, root) = utf8_tmp();
        let err = read_to_string(&root.join("absent.json")).expect_err("missing file");
        assert!(!err.is_empty());
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths_alone() {
        assert_eq!(expand_tilde("/etc/hangar.toml"), "/etc/hangar.toml");
    }
}
