use std::fs;

use image::{Rgb, RgbImage};

use scantree::data::loader::{mimetype_for_extension, read_directory};
use scantree::data::mimetype::{MimetypeDetector, SPEC_DATA, TEXT_CSV, TEXT_PLAIN};
use scantree::{ReadError, Settings};

const SPEC_TEXT: &str = "#F demo.dat\n#E 1554043854\n#D Sun Mar 31 09:50:54 2019\n\n#S 1  ascan th 0 1 2 1\n#L th  I0\n0 1\n1 2\n";

fn settings(dir: &std::path::Path) -> Settings {
    Settings {
        unrecognized_log: dir.join("unrecognized.txt"),
        ..Settings::default()
    }
}

#[test]
fn test_directory_scan_sorted_with_per_file_results() {
    let data = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    fs::write(data.path().join("b_scan"), SPEC_TEXT).unwrap();
    fs::write(data.path().join("a_table.txt"), "x y\n1 2\n").unwrap();
    fs::write(data.path().join("c_bad.mda"), b"not an mda file").unwrap();
    RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]))
        .save(data.path().join("d_pic.png"))
        .unwrap();
    fs::create_dir(data.path().join("subdir")).unwrap();

    let results = read_directory(data.path(), &settings(logs.path())).unwrap();
    let names: Vec<String> = results
        .iter()
        .map(|(p, _, _)| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["a_table.txt", "b_scan", "c_bad.mda", "d_pic.png"]);

    let (_, mimetype, table) = &results[0];
    assert_eq!(mimetype, TEXT_CSV);
    assert!(matches!(table, Err(ReadError::NotRecognizedFormat { .. })));

    let (_, mimetype, spec) = &results[1];
    assert_eq!(mimetype, SPEC_DATA);
    assert!(spec.as_ref().unwrap().as_mapping().unwrap().get("S1").is_some());

    assert!(results[2].2.is_err());
    assert_eq!(results[3].1, "image/png");
    assert_eq!(results[3].2.as_ref().unwrap().as_array().unwrap().shape(), &[3, 2, 2]);
}

#[test]
fn test_log_file_is_plain_text_even_with_spec_content() {
    let data = tempfile::tempdir().unwrap();
    let path = data.path().join("session.log");
    fs::write(&path, SPEC_TEXT).unwrap();

    let detector = MimetypeDetector::new(&settings(data.path()));
    assert_eq!(detector.detect(&path, mimetype_for_extension(&path)), TEXT_PLAIN);
}

#[test]
fn test_missing_directory_is_io_error() {
    let logs = tempfile::tempdir().unwrap();
    assert!(read_directory(&logs.path().join("absent"), &settings(logs.path())).is_err());
}
