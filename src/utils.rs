//! Utility functions

use crate::error::{Error, Result};
use serde::Serialize;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use walkdir::WalkDir;

/// Extensions the engine recognises as compilable C/C++/assembly sources.
pub const SOURCE_EXTENSIONS: &[&str] =
    &["c", "cpp", "cc", "cxx", "c++", "cppm", "ixx", "mpp", "ccm", "m", "mm", "s", "S", "asm"];

/// Returns an iterator over all source files under the given root path, or the
/// `root` itself if it is a source file.
///
/// This also follows symlinks.
pub fn source_files_iter<'a>(
    root: &Path,
    extensions: &'a [&'a str],
) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path().extension().map(|ext| extensions.iter().any(|e| ext == *e)).unwrap_or_default()
        })
        .map(|e| e.path().into())
}

/// Returns a list of all source files under the root, see [`source_files_iter`].
pub fn source_files(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    source_files_iter(root, extensions).collect()
}

/// Creates the parent directory of the `file` and all its ancestors.
pub fn create_parent_dir_all(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| Error::io(err, parent))?;
    }
    Ok(())
}

/// Creates a directory and all of its ancestors; an already existing directory
/// is treated as success.
pub fn create_dir_all(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|err| Error::io(err, dir))
}

/// Writes serialized json to the given path, creating parent directories as
/// needed.
pub fn write_json_file<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    create_parent_dir_all(path)?;
    let file = fs::File::create(path).map_err(|err| Error::io(err, path))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|err| Error::msg(format!("failed to serialize {}: {err}", path.display())))?;
    writer.flush().map_err(|err| Error::io(err, path))?;
    Ok(())
}

/// The size in bytes of the file at `path`.
pub fn file_size(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path).map_err(|err| Error::io(err, path))?.len())
}

/// Seconds since the unix epoch, `0` if the clock is before it.
pub fn unix_timestamp() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or_default()
}

/// The file name of `path` as a `&str`, lossy on non-unicode names.
pub fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// The file stem of `path` as a `&str`, lossy on non-unicode names.
pub fn file_stem(path: &Path) -> String {
    path.file_stem().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_sources() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.c"), "int main() {}").unwrap();
        fs::write(dir.path().join("sub/b.cppm"), "export module b;").unwrap();
        fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut files = source_files(dir.path(), SOURCE_EXTENSIONS);
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.c"));
        assert!(files[1].ends_with("sub/b.cppm"));
    }

    #[test]
    fn timestamp_is_positive() {
        assert!(unix_timestamp() > 0);
    }

    #[test]
    fn stem_and_name() {
        let p = Path::new("src/foo.cppm");
        assert_eq!(file_name(p), "foo.cppm");
        assert_eq!(file_stem(p), "foo");
    }
}
