use std::fs::{self, File};
use std::io::Cursor;
use std::path::Path;

use image::codecs::gif::GifEncoder;
use image::{Frame, GrayImage, ImageFormat, Luma, Rgb, RgbImage, Rgba, RgbaImage};

use scantree::data::image::read_image;
use scantree::data::model::{ElementType, MetadataValue, Node};

fn assert_placeholder(node: &Node, filename: &str) {
    let map = node.as_mapping().expect("placeholder is a mapping");
    assert_eq!(map.keys().collect::<Vec<_>>(), vec!["ignore"]);
    let md = map.metadata();
    assert_eq!(md["filename"].as_str(), Some(filename));
    assert_eq!(md["purpose"].as_str(), Some("decode failure"));
    assert!(!md["exception"].as_str().unwrap_or_default().is_empty());
    let ignore = map.get("ignore").and_then(Node::as_array).unwrap();
    assert!(ignore.data().is_empty());
}

#[test]
fn test_rgb_png_is_band_first() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rgb.png");
    RgbImage::from_fn(4, 3, |x, y| Rgb([x as u8, y as u8, 200]))
        .save(&path)
        .unwrap();

    let node = read_image(&path).unwrap();
    let array = node.as_array().expect("decoded image is an array");
    assert_eq!(array.shape(), &[3, 3, 4]);
    assert_eq!(array.dtype(), ElementType::Uint8);

    // band 0 holds x, band 1 holds y
    let values = array.data().to_f64_vec();
    assert_eq!(&values[..4], &[0.0, 1.0, 2.0, 3.0]);
    assert_eq!(values[12 + 4 * 2], 2.0);
    assert!(values[24..].iter().all(|&v| v == 200.0));

    let md = array.metadata();
    assert_eq!(md["format"].as_str(), Some("PNG"));
    assert_eq!(md["format_description"].as_str(), Some("Portable network graphics"));
    assert_eq!(md["mode"].as_str(), Some("RGB"));
    assert_eq!(md["bits"], MetadataValue::Integer(8));
    assert_eq!(md["layers"], MetadataValue::Integer(3));
    assert_eq!(md["is_animated"], MetadataValue::Bool(false));
    assert_eq!(
        md["size"],
        MetadataValue::List(vec![4i64.into(), 3i64.into()])
    );
    let extrema = md["extrema"].as_list().unwrap();
    assert_eq!(extrema[2], MetadataValue::List(vec![200i64.into(), 200i64.into()]));
    assert!(!md["info"].as_map().unwrap().contains_key("icc_profile"));
}

#[test]
fn test_grayscale_is_two_dimensional() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gray.png");
    GrayImage::from_fn(5, 2, |x, _| Luma([x as u8 * 10])).save(&path).unwrap();

    let node = read_image(&path).unwrap();
    let array = node.as_array().unwrap();
    assert_eq!(array.shape(), &[2, 5]);
    assert_eq!(array.metadata()["mode"].as_str(), Some("L"));
    assert_eq!(
        array.metadata()["extrema"],
        MetadataValue::List(vec![0i64.into(), 40i64.into()])
    );
}

#[test]
fn test_animated_gif_frame_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("anim.gif");
    {
        let mut encoder = GifEncoder::new(File::create(&path).unwrap());
        let frames = (0..3u8).map(|i| Frame::new(RgbaImage::from_pixel(2, 2, Rgba([i * 50, 0, 0, 255]))));
        encoder.encode_frames(frames).unwrap();
    }

    let node = read_image(&path).unwrap();
    let md = node.metadata();
    assert_eq!(md["format"].as_str(), Some("GIF"));
    assert_eq!(md["n_frames"], MetadataValue::Integer(3));
    assert_eq!(md["is_animated"], MetadataValue::Bool(true));
}

/// Big-endian TIFF block with Make, XResolution, YResolution and
/// ResolutionUnit (inches) in IFD0.
fn exif_tiff_block() -> Vec<u8> {
    fn entry(out: &mut Vec<u8>, tag: u16, kind: u16, count: u32, value: [u8; 4]) {
        out.extend_from_slice(&tag.to_be_bytes());
        out.extend_from_slice(&kind.to_be_bytes());
        out.extend_from_slice(&count.to_be_bytes());
        out.extend_from_slice(&value);
    }
    let mut out = b"MM\0\x2A".to_vec();
    out.extend_from_slice(&8u32.to_be_bytes());
    out.extend_from_slice(&4u16.to_be_bytes());
    entry(&mut out, 0x010F, 2, 9, 62u32.to_be_bytes());
    entry(&mut out, 0x011A, 5, 1, 72u32.to_be_bytes());
    entry(&mut out, 0x011B, 5, 1, 80u32.to_be_bytes());
    entry(&mut out, 0x0128, 3, 1, [0, 2, 0, 0]);
    out.extend_from_slice(&0u32.to_be_bytes());
    assert_eq!(out.len(), 62);
    out.extend_from_slice(b"Scantree\0\0");
    for _ in 0..2 {
        out.extend_from_slice(&300u32.to_be_bytes());
        out.extend_from_slice(&1u32.to_be_bytes());
    }
    out
}

#[test]
fn test_jpeg_exif_resolution_and_tags() {
    let mut jpeg = Vec::new();
    RgbImage::from_pixel(8, 8, Rgb([90, 120, 150]))
        .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .unwrap();

    // APP1 segment right after SOI
    let tiff = exif_tiff_block();
    let mut app1 = vec![0xFF, 0xE1];
    app1.extend_from_slice(&((2 + 6 + tiff.len()) as u16).to_be_bytes());
    app1.extend_from_slice(b"Exif\0\0");
    app1.extend_from_slice(&tiff);
    let mut tagged = jpeg[..2].to_vec();
    tagged.extend_from_slice(&app1);
    tagged.extend_from_slice(&jpeg[2..]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tagged.jpg");
    fs::write(&path, &tagged).unwrap();

    let node = read_image(&path).unwrap();
    let md = node.as_array().expect("decoded image is an array").metadata();
    assert_eq!(md["format"].as_str(), Some("JPEG"));

    let exif = md["exif"].as_map().unwrap();
    assert_eq!(exif["Make"].as_str(), Some("Scantree"));
    assert_eq!(exif["ResolutionUnit"], MetadataValue::Integer(2));

    let info = md["info"].as_map().unwrap();
    assert!(!info.contains_key("exif"));
    let dpi = info["dpi"].as_list().unwrap();
    assert_eq!(dpi.len(), 2);
    assert_eq!(dpi[0].as_map().unwrap()["real"], MetadataValue::Float(300.0));
    assert_eq!(dpi[1].as_map().unwrap()["denominator"], MetadataValue::Integer(1));
}

#[test]
fn test_tiff_tags_read_from_file_ifd() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.tif");
    GrayImage::from_fn(3, 2, |x, y| Luma([(x + y) as u8])).save(&path).unwrap();

    let node = read_image(&path).unwrap();
    let md = node.as_array().expect("decoded image is an array").metadata();
    assert_eq!(md["format"].as_str(), Some("TIFF"));

    let exif = md["exif"].as_map().unwrap();
    assert_eq!(exif["ImageWidth"], MetadataValue::Integer(3));
    assert_eq!(exif["ImageLength"], MetadataValue::Integer(2));
    assert!(exif.contains_key("XResolution"));

    let info = md["info"].as_map().unwrap();
    assert!(info.contains_key("resolution") || info.contains_key("dpi"));
    assert!(!info.contains_key("exif"));
}

#[test]
fn test_missing_file_gives_placeholder() {
    let node = read_image(Path::new("/nonexistent/dir/missing.png")).unwrap();
    assert_placeholder(&node, "missing.png");
}

#[test]
fn test_garbage_gives_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.png");
    fs::write(&path, b"\x89PNG\r\n\x1a\nthis is not a png body").unwrap();

    let node = read_image(&path).unwrap();
    assert_placeholder(&node, "broken.png");
}

#[test]
fn test_placeholder_serializes() {
    let node = read_image(Path::new("/nonexistent/x.jpg")).unwrap();
    let json = serde_json::to_value(&node).unwrap();
    assert_eq!(json["structure_family"], "mapping");
    assert_eq!(json["metadata"]["purpose"], "decode failure");
}
