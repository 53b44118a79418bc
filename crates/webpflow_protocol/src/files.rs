//! File handling utilities shared by the dispatcher and worker.

use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use zip::ZipArchive;

pub const ALLOWED_IMG_EXTS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Lowercased extension without the dot, if any.
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn is_allowed_image(name: &str) -> bool {
    extension_of(name)
        .map(|ext| ALLOWED_IMG_EXTS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Reduce an untrusted filename to a safe basename.
///
/// Keeps ASCII alphanumerics, dots, dashes and underscores; everything
/// else becomes an underscore. Returns None when nothing usable is left.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c == '_');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Check that `target` resolves inside `base`.
pub fn is_in_dir(base: &Path, target: &Path) -> bool {
    let Ok(base) = base.canonicalize() else {
        return false;
    };
    let parent = match target.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => return false,
    };
    match parent.canonicalize() {
        Ok(parent) => parent.starts_with(&base),
        Err(_) => false,
    }
}

/// Materialize the images inside an upload under `dest_dir`.
///
/// A single allowed image is copied under a sanitized name; a ZIP is
/// walked entry by entry, skipping directories, `__MACOSX/` droppings,
/// `.DS_Store`, non-image extensions, and any entry whose resolved
/// path would escape the destination. Returns the absolute paths of
/// the files written; unusable inputs yield an empty list.
pub fn extract_files(file_path: &Path, dest_dir: &Path) -> Vec<PathBuf> {
    if let Err(e) = fs::create_dir_all(dest_dir) {
        error!("Failed to create {}: {}", dest_dir.display(), e);
        return Vec::new();
    }

    let name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if is_allowed_image(&name) {
        let Some(safe_name) = sanitize_filename(&name) else {
            warn!("Invalid filename: {}", name);
            return Vec::new();
        };
        let out_path = dest_dir.join(&safe_name);
        if !is_in_dir(dest_dir, &out_path) {
            warn!("Path traversal attempt: {}", name);
            return Vec::new();
        }
        return match fs::copy(file_path, &out_path) {
            Ok(_) => vec![absolutize(out_path)],
            Err(e) => {
                error!("Failed to copy {}: {}", file_path.display(), e);
                Vec::new()
            }
        };
    }

    if extension_of(&name).as_deref() != Some("zip") {
        warn!("Unsupported file type: {}", name);
        return Vec::new();
    }

    let file = match File::open(file_path) {
        Ok(f) => f,
        Err(e) => {
            error!("Failed to open {}: {}", file_path.display(), e);
            return Vec::new();
        }
    };
    let mut archive = match ZipArchive::new(file) {
        Ok(a) => a,
        Err(e) => {
            error!("Invalid ZIP file {}: {}", file_path.display(), e);
            return Vec::new();
        }
    };

    let mut extracted = Vec::new();
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                error!("Failed to read ZIP entry {}: {}", index, e);
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }

        let raw_name = entry.name().to_string();
        if raw_name.starts_with("__MACOSX/") || raw_name.ends_with(".DS_Store") {
            continue;
        }
        if entry.enclosed_name().is_none() {
            warn!("Path traversal attempt: {}", raw_name);
            continue;
        }
        if !is_allowed_image(&raw_name) {
            debug!("Skipping non-image entry: {}", raw_name);
            continue;
        }
        let Some(safe_name) = sanitize_filename(&raw_name) else {
            continue;
        };

        let out_path = dest_dir.join(&safe_name);
        if !is_in_dir(dest_dir, &out_path) {
            continue;
        }

        let result = File::create(&out_path).and_then(|mut dst| io::copy(&mut entry, &mut dst));
        match result {
            Ok(_) => extracted.push(absolutize(out_path)),
            Err(e) => error!("Failed to extract {}: {}", raw_name, e),
        }
    }

    info!(
        "Extracted {} files from {}",
        extracted.len(),
        file_path.display()
    );
    extracted
}

fn absolutize(path: PathBuf) -> PathBuf {
    path.canonicalize().unwrap_or(path)
}

/// Find an available TCP port starting from `start_port`.
pub fn find_free_tcp_port(host: &str, start_port: u16, max_tries: u16) -> io::Result<u16> {
    let end = start_port.saturating_add(max_tries);
    for port in start_port..=end {
        match TcpListener::bind((host, port)) {
            Ok(listener) => {
                drop(listener);
                debug!("Found free port: {}", port);
                return Ok(port);
            }
            Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) => {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        ErrorKind::AddrNotAvailable,
        format!("no free TCP port in range {}-{}", start_port, end),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        for (name, data) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn sanitize_keeps_safe_names() {
        assert_eq!(sanitize_filename("photo.png"), Some("photo.png".into()));
        assert_eq!(
            sanitize_filename("My cool pic.jpg"),
            Some("My_cool_pic.jpg".into())
        );
    }

    #[test]
    fn sanitize_strips_directories_and_dots() {
        assert_eq!(sanitize_filename("a/b/c.png"), Some("c.png".into()));
        assert_eq!(sanitize_filename("..\\evil.png"), Some("evil.png".into()));
        assert_eq!(sanitize_filename("..."), None);
        assert_eq!(sanitize_filename(""), None);
    }

    #[test]
    fn single_image_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("input.png");
        fs::write(&src, b"png bytes").unwrap();
        let dest = dir.path().join("out");

        let files = extract_files(&src, &dest);
        assert_eq!(files.len(), 1);
        assert_eq!(fs::read(&files[0]).unwrap(), b"png bytes");
    }

    #[test]
    fn unsupported_input_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("input.txt");
        fs::write(&src, b"hello").unwrap();

        assert!(extract_files(&src, &dir.path().join("out")).is_empty());
    }

    #[test]
    fn zip_extraction_skips_junk_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("upload.zip");
        write_zip(
            &archive,
            &[
                ("one.png", b"one".as_slice()),
                ("__MACOSX/one.png", b"resource fork"),
                ("sub/.DS_Store", b"finder"),
                ("notes.txt", b"text"),
                ("two.jpeg", b"two"),
            ],
        );
        let dest = dir.path().join("out");

        let files = extract_files(&archive, &dest);
        let mut names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["one.png", "two.jpeg"]);
    }

    #[test]
    fn zip_traversal_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../evil.png", b"escape".as_slice())]);
        let dest = dir.path().join("out");

        let files = extract_files(&archive, &dest);
        assert!(files.is_empty());
        assert!(!dir.path().join("evil.png").exists());
    }

    #[test]
    fn corrupt_zip_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();

        assert!(extract_files(&archive, &dir.path().join("out")).is_empty());
    }

    #[test]
    fn free_port_probe_skips_a_bound_port() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = holder.local_addr().unwrap().port();

        let free = find_free_tcp_port("127.0.0.1", taken, 100).unwrap();
        assert_ne!(free, taken);
        assert!(free > taken);
    }
}
