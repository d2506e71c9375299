use std::path::{Path, PathBuf};

use log::{debug, info};
use rayon::prelude::*;

use super::image::{self, read_image};
use super::mda::read_mda;
use super::mimetype::{MimetypeDetector, IGNORE, MDA, SPEC_DATA};
use super::model::{placeholder, Metadata, Node};
use super::spec::read_spec_data;
use crate::config::Settings;
use crate::error::{ReadError, ReadResult};

/// Every reader has this shape: a pure function of the path.
pub type Reader = fn(&Path) -> ReadResult<Node>;

// ---------------------------------------------------------------------------
// Associations
// ---------------------------------------------------------------------------

/// File extensions with a fixed mimetype. SPEC data has no extension of its
/// own and is recognized by content only.
pub const EXTENSION_MIMETYPES: &[(&str, &str)] = &[
    ("bmp", "image/bmp"),
    ("gif", "image/gif"),
    ("ico", "image/vnd.microsoft.icon"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("mda", MDA),
    ("png", "image/png"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("webp", "image/webp"),
];

/// Mimetype associated with the extension of `path`, if any.
pub fn mimetype_for_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    EXTENSION_MIMETYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, m)| *m)
}

/// Reader registered for `mimetype`.
pub fn reader_for(mimetype: &str) -> Option<Reader> {
    match mimetype {
        SPEC_DATA => Some(read_spec_data as Reader),
        MDA => Some(read_mda),
        IGNORE => Some(read_ignore),
        m if image::MIMETYPES.contains(&m) => Some(read_image),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Read `path` with the reader registered for `mimetype`.
pub fn read_file(path: &Path, mimetype: &str) -> ReadResult<Node> {
    let reader = reader_for(mimetype).ok_or_else(|| {
        ReadError::not_recognized(path, "supported", format!("no reader for {mimetype}"))
    })?;
    debug!("{}: reading as {mimetype}", path.display());
    reader(path)
}

/// Placeholder for files whose contents are deliberately not read.
pub fn read_ignore(path: &Path) -> ReadResult<Node> {
    let mut md = Metadata::new();
    md.insert("filename".into(), path.display().to_string().into());
    md.insert("purpose".into(), "ignore this file's contents".into());
    Ok(placeholder(md).into())
}

/// Detect and read every regular file directly inside `dir`, in parallel.
///
/// Results come back sorted by path; each file keeps its own result.
pub fn read_directory(
    dir: &Path,
    settings: &Settings,
) -> std::io::Result<Vec<(PathBuf, String, ReadResult<Node>)>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let detector = MimetypeDetector::new(settings);
    let results: Vec<_> = paths
        .into_par_iter()
        .map(|path| {
            let mimetype = detector.detect(&path, mimetype_for_extension(&path));
            let result = read_file(&path, &mimetype);
            (path, mimetype, result)
        })
        .collect();

    let failed = results.iter().filter(|(_, _, r)| r.is_err()).count();
    info!(
        "{}: read {} files ({} failed)",
        dir.display(),
        results.len(),
        failed
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_lookup_case_insensitive() {
        assert_eq!(mimetype_for_extension(Path::new("/d/scan_0001.MDA")), Some(MDA));
        assert_eq!(mimetype_for_extension(Path::new("a.JPG")), Some("image/jpeg"));
        assert_eq!(mimetype_for_extension(Path::new("spec.dat")), None);
        assert_eq!(mimetype_for_extension(Path::new("README")), None);
    }

    #[test]
    fn test_every_extension_has_a_reader() {
        for (ext, mimetype) in EXTENSION_MIMETYPES {
            assert!(reader_for(mimetype).is_some(), "no reader for .{ext}");
        }
        assert!(reader_for(SPEC_DATA).is_some());
        assert!(reader_for(IGNORE).is_some());
        assert!(reader_for("text/csv").is_none());
    }

    #[test]
    fn test_unsupported_mimetype_not_recognized() {
        let err = read_file(Path::new("/tmp/x.csv"), "text/csv").unwrap_err();
        assert!(matches!(err, ReadError::NotRecognizedFormat { .. }));
    }

    #[test]
    fn test_ignore_reader() {
        let node = read_ignore(Path::new("/data/skip.bin")).unwrap();
        let map = node.as_mapping().unwrap();
        assert_eq!(map.metadata()["filename"].as_str(), Some("/data/skip.bin"));
        assert_eq!(
            map.metadata()["purpose"].as_str(),
            Some("ignore this file's contents")
        );
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["ignore"]);
    }
}
