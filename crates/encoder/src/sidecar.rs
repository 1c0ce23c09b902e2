use std::ffi::OsString;
use std::path::{Path, PathBuf};

fn with_suffix(file_path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = file_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Get the path of the backup kept for a replaced file (`<file>.backup`)
pub fn backup_path(file_path: &Path) -> PathBuf {
    with_suffix(file_path, ".backup")
}

/// Get the path the encoded file is staged at before it replaces the original
///
/// Lives next to the original so the final rename stays on one filesystem.
pub fn staged_path(file_path: &Path) -> PathBuf {
    with_suffix(file_path, ".encoding.tmp")
}

/// Get a unique download path for an encoded copy of `source` inside `temp_dir`
pub fn download_path(temp_dir: &Path, source: &Path, extension: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    temp_dir.join(format!(
        "encoded_{}_{}.{}",
        uuid::Uuid::new_v4().simple(),
        stem,
        extension
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_paths_keep_original_name() {
        let p = Path::new("/videos/2025/06/01/a.mp4");
        assert_eq!(backup_path(p), PathBuf::from("/videos/2025/06/01/a.mp4.backup"));
        assert_eq!(staged_path(p), PathBuf::from("/videos/2025/06/01/a.mp4.encoding.tmp"));
    }

    #[test]
    fn download_paths_are_unique() {
        let src = Path::new("/videos/2025/06/01/a.mp4");
        let a = download_path(Path::new("/tmp/x"), src, "mp4");
        let b = download_path(Path::new("/tmp/x"), src, "mp4");
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/x"));
        assert!(a.to_string_lossy().ends_with("_a.mp4"));
    }
}
