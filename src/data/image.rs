//! Raster images (BMP, GIF, ICO, JPEG, PNG, TIFF, WebP) as band-first arrays.
//!
//! Pixels are stored `(rows, cols)` for one band and `(bands, rows, cols)`
//! otherwise. Metadata stays small: embedded color profiles, raw EXIF and
//! XMP blocks are removed from `info`, and EXIF entries are decoded into
//! named, JSON-friendly values.
//!
//! Reading never fails. Anything that goes wrong yields a placeholder tree
//! whose metadata names the file and the error.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context, Result};
use exif::{In, Tag, Value};
use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::{AnimationDecoder, ColorType, DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use log::warn;
use ndarray::{Array3, ArrayD, IxDyn};
use thiserror::Error;

use crate::data::exif_tags::tag_name;
use crate::data::model::{make_array, placeholder, ArrayData, Metadata, MetadataValue, Node};
use crate::error::ReadResult;

pub const MIMETYPES: &[&str] = &[
    "image/bmp",
    "image/gif",
    "image/jpeg",
    "image/png",
    "image/tiff",
    "image/vnd.microsoft.icon",
    "image/webp",
];

/// `info` keys holding binary blocks that never reach the metadata.
pub const BINARY_INFO_KEYS: [&str; 3] = ["exif", "icc_profile", "xmp"];

pub const DECODE_FAILURE: &str = "decode failure";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExifError {
    #[error("{found} value is not a rational")]
    NotRational { found: &'static str },

    #[error("rational value has no element {index}")]
    MissingElement { index: usize },

    #[error("rational {numerator}/0 has a zero denominator")]
    ZeroDenominator { numerator: i64 },

    #[error("invalid EXIF block: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// EXIF values
// ---------------------------------------------------------------------------

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Byte(_) => "BYTE",
        Value::Ascii(_) => "ASCII",
        Value::Short(_) => "SHORT",
        Value::Long(_) => "LONG",
        Value::Rational(_) => "RATIONAL",
        Value::SByte(_) => "SBYTE",
        Value::Undefined(..) => "UNDEFINED",
        Value::SShort(_) => "SSHORT",
        Value::SLong(_) => "SLONG",
        Value::SRational(_) => "SRATIONAL",
        Value::Float(_) => "FLOAT",
        Value::Double(_) => "DOUBLE",
        _ => "UNKNOWN",
    }
}

fn is_rational(value: &Value) -> bool {
    matches!(value, Value::Rational(_) | Value::SRational(_))
}

/// `{numerator, denominator, real, imag}` for one rational.
pub fn rational_metadata(numerator: i64, denominator: i64) -> Result<Metadata, ExifError> {
    if denominator == 0 {
        return Err(ExifError::ZeroDenominator { numerator });
    }
    let mut md = Metadata::new();
    md.insert("numerator".into(), numerator.into());
    md.insert("denominator".into(), denominator.into());
    md.insert("real".into(), (numerator as f64 / denominator as f64).into());
    md.insert("imag".into(), 0.0.into());
    Ok(md)
}

/// Expand element `index` of a rational EXIF value; any other value kind is
/// a type error.
pub fn expand_rational(value: &Value, index: usize) -> Result<MetadataValue, ExifError> {
    let pair = match value {
        Value::Rational(v) => v.get(index).map(|r| (i64::from(r.num), i64::from(r.denom))),
        Value::SRational(v) => v.get(index).map(|r| (i64::from(r.num), i64::from(r.denom))),
        other => {
            return Err(ExifError::NotRational {
                found: value_kind(other),
            })
        }
    };
    let (num, den) = pair.ok_or(ExifError::MissingElement { index })?;
    Ok(rational_metadata(num, den)?.into())
}

fn decode_bytes(bytes: &[u8]) -> MetadataValue {
    String::from_utf8_lossy(bytes).trim_end_matches('\0').into()
}

fn scalar_or_list(mut items: Vec<MetadataValue>) -> MetadataValue {
    if items.len() == 1 {
        items.remove(0)
    } else {
        MetadataValue::List(items)
    }
}

/// Convert one EXIF value; multi-element values become lists.
pub fn exif_value(value: &Value) -> Result<MetadataValue, ExifError> {
    let items: Vec<MetadataValue> = match value {
        Value::Byte(b) | Value::Undefined(b, _) => return Ok(decode_bytes(b)),
        Value::Ascii(parts) => parts.iter().map(|p| decode_bytes(p)).collect(),
        Value::Short(v) => v.iter().map(|&x| i64::from(x).into()).collect(),
        Value::Long(v) => v.iter().map(|&x| i64::from(x).into()).collect(),
        Value::SByte(v) => v.iter().map(|&x| i64::from(x).into()).collect(),
        Value::SShort(v) => v.iter().map(|&x| i64::from(x).into()).collect(),
        Value::SLong(v) => v.iter().map(|&x| i64::from(x).into()).collect(),
        Value::Rational(v) => (0..v.len())
            .map(|i| expand_rational(value, i))
            .collect::<Result<Vec<_>, ExifError>>()?,
        Value::SRational(v) => (0..v.len())
            .map(|i| expand_rational(value, i))
            .collect::<Result<Vec<_>, ExifError>>()?,
        Value::Float(v) => v.iter().map(|&x| x.into()).collect(),
        Value::Double(v) => v.iter().map(|&x| x.into()).collect(),
        _ => return Ok(MetadataValue::Null),
    };
    Ok(scalar_or_list(items))
}

fn parse_exif(raw: &[u8]) -> Result<exif::Exif, ExifError> {
    let tiff = raw.strip_prefix(b"Exif\0\0").unwrap_or(raw);
    exif::Reader::new()
        .read_raw(tiff.to_vec())
        .map_err(|e| ExifError::Parse(e.to_string()))
}

/// TIFF files carry their tags in the file's own IFDs, not in a separate
/// EXIF block the decoder could hand over.
fn tiff_exif(path: &Path) -> Result<exif::Exif> {
    let mut reader = BufReader::new(File::open(path)?);
    let exif = exif::Reader::new()
        .read_from_container(&mut reader)
        .map_err(|e| ExifError::Parse(e.to_string()))?;
    Ok(exif)
}

/// Primary-IFD tags keyed by name (or by the numeric id when the tag table
/// has no name for it).
pub fn interpret_exif(exif: &exif::Exif) -> Result<Metadata, ExifError> {
    let mut md = Metadata::new();
    for field in exif
        .fields()
        .filter(|f| f.ifd_num == In::PRIMARY && f.tag.context() == exif::Context::Tiff)
    {
        let id = field.tag.number();
        let key = tag_name(id).map(str::to_string).unwrap_or_else(|| id.to_string());
        md.insert(key, exif_value(&field.value)?);
    }
    Ok(md)
}

// ---------------------------------------------------------------------------
// Decoder info
// ---------------------------------------------------------------------------

/// Decoder-side `info` entry, before conversion to metadata.
#[derive(Debug, Clone)]
pub enum InfoValue {
    Blob(Vec<u8>),
    Sequence(Vec<Value>),
    Meta(MetadataValue),
}

pub type Info = BTreeMap<String, InfoValue>;

pub fn strip_binary_blocks(info: &mut Info) {
    for key in BINARY_INFO_KEYS {
        info.remove(key);
    }
}

/// Convert stripped `info`; sequences are expanded element-wise, rationals
/// through [`expand_rational`].
pub fn info_metadata(info: Info) -> Result<Metadata> {
    let mut md = Metadata::new();
    for (key, value) in info {
        let converted = match value {
            InfoValue::Blob(bytes) => bail!("binary block '{key}' ({} bytes) left in info", bytes.len()),
            InfoValue::Meta(v) => v,
            InfoValue::Sequence(items) => MetadataValue::List(
                items
                    .iter()
                    .map(|v| {
                        if is_rational(v) {
                            expand_rational(v, 0)
                        } else {
                            exif_value(v)
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .with_context(|| format!("converting info '{key}'"))?,
            ),
        };
        md.insert(key, converted);
    }
    Ok(md)
}

/// `dpi` (inches) or `resolution` (other units) from the EXIF resolution tags.
fn resolution_info(exif: &exif::Exif) -> Option<(&'static str, InfoValue)> {
    let x = exif.get_field(Tag::XResolution, In::PRIMARY)?;
    let y = exif.get_field(Tag::YResolution, In::PRIMARY)?;
    let unit = exif
        .get_field(Tag::ResolutionUnit, In::PRIMARY)
        .and_then(|f| f.value.get_uint(0));
    let key = if unit == Some(2) { "dpi" } else { "resolution" };
    Some((key, InfoValue::Sequence(vec![x.value.clone(), y.value.clone()])))
}

// ---------------------------------------------------------------------------
// Pixels
// ---------------------------------------------------------------------------

fn format_names(format: ImageFormat) -> (String, &'static str) {
    let (name, description) = match format {
        ImageFormat::Bmp => ("BMP", "Windows Bitmap"),
        ImageFormat::Gif => ("GIF", "Compuserve GIF"),
        ImageFormat::Ico => ("ICO", "Windows Icon"),
        ImageFormat::Jpeg => ("JPEG", "JPEG (ISO 10918)"),
        ImageFormat::Png => ("PNG", "Portable network graphics"),
        ImageFormat::Tiff => ("TIFF", "Adobe TIFF"),
        ImageFormat::WebP => ("WEBP", "WebP image"),
        other => return (format!("{other:?}").to_uppercase(), ""),
    };
    (name.to_string(), description)
}

fn mode_name(color: ColorType) -> String {
    let mode = match color {
        ColorType::L8 => "L",
        ColorType::La8 => "LA",
        ColorType::Rgb8 => "RGB",
        ColorType::Rgba8 => "RGBA",
        ColorType::L16 => "I;16",
        ColorType::La16 => "LA;16",
        ColorType::Rgb16 => "RGB;16",
        ColorType::Rgba16 => "RGBA;16",
        ColorType::Rgb32F => "RGBF",
        ColorType::Rgba32F => "RGBAF",
        other => return format!("{other:?}"),
    };
    mode.to_string()
}

/// Interleaved `(rows, cols, bands)` samples reordered band-first.
pub fn band_first<T: Clone>(
    raw: Vec<T>,
    rows: usize,
    cols: usize,
    bands: usize,
) -> Result<ArrayD<T>, ndarray::ShapeError> {
    if bands == 1 {
        return ArrayD::from_shape_vec(IxDyn(&[rows, cols]), raw);
    }
    let interleaved = Array3::from_shape_vec((rows, cols, bands), raw)?;
    Ok(interleaved
        .permuted_axes([2, 0, 1])
        .as_standard_layout()
        .into_owned()
        .into_dyn())
}

/// Per-band `[min, max]`; a single band gives one pair.
fn extrema<T: Copy + Into<f64>>(raw: &[T], bands: usize, integral: bool) -> MetadataValue {
    let to_value = |v: f64| {
        if integral {
            MetadataValue::Integer(v as i64)
        } else {
            MetadataValue::from_f64(v)
        }
    };
    let pairs: Vec<MetadataValue> = (0..bands)
        .map(|b| {
            let (lo, hi) = raw
                .iter()
                .skip(b)
                .step_by(bands)
                .map(|&v| -> f64 { v.into() })
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
            if lo > hi {
                MetadataValue::Null
            } else {
                MetadataValue::List(vec![to_value(lo), to_value(hi)])
            }
        })
        .collect();
    scalar_or_list(pairs)
}

struct Pixels {
    data: ArrayData,
    extrema: MetadataValue,
    bands: usize,
}

fn pixels<T>(raw: Vec<T>, rows: usize, cols: usize, bands: usize, integral: bool) -> Result<(ArrayD<T>, MetadataValue)>
where
    T: Copy + Into<f64>,
{
    let ext = extrema(&raw, bands, integral);
    let array = band_first(raw, rows, cols, bands).context("arranging pixel bands")?;
    Ok((array, ext))
}

fn image_pixels(image: DynamicImage) -> Result<Pixels> {
    let rows = image.height() as usize;
    let cols = image.width() as usize;
    let (data, extrema) = match image {
        DynamicImage::ImageLuma8(b) => wrap(pixels(b.into_raw(), rows, cols, 1, true)?),
        DynamicImage::ImageLumaA8(b) => wrap(pixels(b.into_raw(), rows, cols, 2, true)?),
        DynamicImage::ImageRgb8(b) => wrap(pixels(b.into_raw(), rows, cols, 3, true)?),
        DynamicImage::ImageRgba8(b) => wrap(pixels(b.into_raw(), rows, cols, 4, true)?),
        DynamicImage::ImageLuma16(b) => wrap(pixels(b.into_raw(), rows, cols, 1, true)?),
        DynamicImage::ImageLumaA16(b) => wrap(pixels(b.into_raw(), rows, cols, 2, true)?),
        DynamicImage::ImageRgb16(b) => wrap(pixels(b.into_raw(), rows, cols, 3, true)?),
        DynamicImage::ImageRgba16(b) => wrap(pixels(b.into_raw(), rows, cols, 4, true)?),
        DynamicImage::ImageRgb32F(b) => wrap(pixels(b.into_raw(), rows, cols, 3, false)?),
        DynamicImage::ImageRgba32F(b) => wrap(pixels(b.into_raw(), rows, cols, 4, false)?),
        other => wrap(pixels(other.to_rgba8().into_raw(), rows, cols, 4, true)?),
    };
    let bands = match data.shape() {
        [_, _] => 1,
        shape => shape[0],
    };
    Ok(Pixels { data, extrema, bands })
}

fn wrap<T>((array, extrema): (ArrayD<T>, MetadataValue)) -> (ArrayData, MetadataValue)
where
    ArrayData: From<ArrayD<T>>,
{
    (ArrayData::from(array), extrema)
}

/// Frame count; formats that cannot animate hold one frame.
fn frame_count(path: &Path, format: ImageFormat) -> Result<usize> {
    let open = || -> Result<BufReader<File>> { Ok(BufReader::new(File::open(path)?)) };
    let frames = match format {
        ImageFormat::Gif => GifDecoder::new(open()?)?.into_frames().count(),
        ImageFormat::Png => {
            let decoder = PngDecoder::new(open()?)?;
            if decoder.is_apng()? {
                decoder.apng()?.into_frames().count()
            } else {
                1
            }
        }
        ImageFormat::WebP => {
            let decoder = WebPDecoder::new(open()?)?;
            if decoder.has_animation() {
                decoder.into_frames().count()
            } else {
                1
            }
        }
        _ => 1,
    };
    Ok(frames)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn decode_image(path: &Path) -> Result<Node> {
    let reader = ImageReader::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .with_guessed_format()
        .context("guessing image format")?;
    let format = reader.format().context("unrecognized image format")?;
    let mut decoder = reader.into_decoder().context("creating image decoder")?;
    let icc_profile = decoder.icc_profile().context("reading ICC profile")?;
    let exif_block = decoder.exif_metadata().context("reading EXIF block")?;
    let color = decoder.color_type();
    let (width, height) = decoder.dimensions();
    let image = DynamicImage::from_decoder(decoder).context("decoding pixels")?;

    let exif = match exif_block.as_deref() {
        Some(raw) => Some(parse_exif(raw)?),
        None if format == ImageFormat::Tiff => Some(tiff_exif(path).context("reading TIFF tags")?),
        None => None,
    };

    let mut info = Info::new();
    info.insert("color_type".into(), InfoValue::Meta(format!("{color:?}").into()));
    if let Some(icc) = icc_profile {
        info.insert("icc_profile".into(), InfoValue::Blob(icc));
    }
    if let Some(raw) = exif_block {
        info.insert("exif".into(), InfoValue::Blob(raw));
    }
    if let Some((key, value)) = exif.as_ref().and_then(resolution_info) {
        info.insert(key.into(), value);
    }
    strip_binary_blocks(&mut info);

    let (format_name, format_description) = format_names(format);
    let mut md = Metadata::new();
    md.insert(
        "bits".into(),
        (u32::from(color.bits_per_pixel()) / u32::from(color.channel_count().max(1))).into(),
    );
    md.insert("format".into(), format_name.into());
    md.insert("format_description".into(), format_description.into());
    md.insert("mode".into(), mode_name(color).into());
    md.insert("size".into(), vec![width, height].into());
    let n_frames = frame_count(path, format).context("counting frames")?;
    md.insert("n_frames".into(), n_frames.into());
    md.insert("is_animated".into(), (n_frames > 1).into());
    md.insert("info".into(), info_metadata(info)?.into());
    let exif_md = match &exif {
        Some(exif) => interpret_exif(exif)?,
        None => Metadata::new(),
    };
    md.insert("exif".into(), exif_md.into());

    let pixels = image_pixels(image)?;
    md.insert("layers".into(), pixels.bands.into());
    md.insert("extrema".into(), pixels.extrema);
    Ok(make_array(pixels.data, md)?.into())
}

/// Read an image file. Failures come back as a placeholder tree, never as
/// an error.
pub fn read_image(path: &Path) -> ReadResult<Node> {
    Ok(decode_image(path).unwrap_or_else(|err| {
        warn!("{}: image decode failed: {err:#}", path.display());
        let mut md = Metadata::new();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        md.insert("filename".into(), name.into());
        md.insert("exception".into(), format!("{err:#}").into());
        md.insert("purpose".into(), DECODE_FAILURE.into());
        placeholder(md).into()
    }))
}
