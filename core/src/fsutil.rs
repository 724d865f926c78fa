use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Hidden sibling of `path` with a unique suffix, used as a staging name before a rename.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(format!(".{}", Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// Replace `path` with `contents` by writing a sibling file and renaming it over the original.
/// The permissions of an existing file are carried over.
pub fn replace_file(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = staging_path(path);
    let result = fs::write(&tmp, contents)
        .and_then(|()| match fs::metadata(path) {
            Ok(meta) => fs::set_permissions(&tmp, meta.permissions()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        })
        .and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
