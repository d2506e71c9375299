//! synApps MDA files: XDR-encoded (big-endian) multi-dimensional scans.
//!
//! ```text
//!  header      version, scan_number, rank, dimensions[rank], isRegular, pExtra
//!  scan (rank) rank, npts, curr_pt, [plower_scans[npts]], name, time,
//!              positioner/detector/trigger descriptors, positioner + detector data
//!    └─ scan (rank-1) at plower_scans[i], one per acquired point ...
//!  extra PVs   at pExtra
//! ```
//!
//! Each dimension becomes one `S<rank>` mapping. The arrays of dimension `k`
//! have shape `[npts_1, .., npts_k]`; rows of inner scans that were never
//! acquired stay zero. The scan timestamp is passed through as written: MDA
//! files do not record a time zone.

use std::collections::HashSet;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use log::{debug, warn};
use ndarray::{ArrayD, IxDyn};
use thiserror::Error;

use crate::data::model::{make_array, make_mapping, ArrayData, Metadata, MetadataValue, Node};
use crate::error::{ReadError, ReadResult};

const FORMAT: &str = "MDA";

/// Highest rank accepted by the recognition check.
const MAX_RANK: i32 = 16;

/// Zero-filled arrays may be at most this many elements per file byte,
/// and never need to be refused below [`MIN_ELEMENT_LIMIT`].
const ELEMENTS_PER_BYTE: usize = 64;
const MIN_ELEMENT_LIMIT: usize = 1 << 22;

pub const TIME_ZONE_NOTE: &str = "unknown (not recorded in MDA file)";

/// EPICS DBR type codes used in the extra-PV section.
pub const EPICS_TYPES: &[(i32, &str)] = &[
    (0, "DBR_STRING"),
    (29, "DBR_CTRL_SHORT"),
    (30, "DBR_CTRL_FLOAT"),
    (32, "DBR_CTRL_CHAR"),
    (33, "DBR_CTRL_LONG"),
    (34, "DBR_CTRL_DOUBLE"),
];

pub fn epics_type_name(code: i32) -> String {
    EPICS_TYPES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("unknown #{code}"))
}

#[derive(Debug, Error)]
pub enum MdaError {
    #[error("unexpected end of data at offset {offset} reading {what}")]
    Truncated { offset: u64, what: &'static str },

    #[error("{0}")]
    Inconsistent(String),
}

type Result<T> = std::result::Result<T, MdaError>;

// ---------------------------------------------------------------------------
// XDR primitives
// ---------------------------------------------------------------------------

struct Xdr<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Xdr<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    fn remaining(&self) -> u64 {
        (self.cursor.get_ref().len() as u64).saturating_sub(self.cursor.position())
    }

    fn truncated(&self, what: &'static str) -> impl Fn(io::Error) -> MdaError {
        let offset = self.cursor.position();
        move |_| MdaError::Truncated { offset, what }
    }

    fn seek(&mut self, offset: i32, what: &'static str) -> Result<()> {
        let len = self.cursor.get_ref().len() as u64;
        let target = u64::try_from(offset).unwrap_or(u64::MAX);
        if target >= len {
            return Err(MdaError::Truncated { offset: target, what });
        }
        self.cursor
            .seek(SeekFrom::Start(target))
            .map_err(self.truncated(what))?;
        Ok(())
    }

    fn i32(&mut self, what: &'static str) -> Result<i32> {
        let on_err = self.truncated(what);
        self.cursor.read_i32::<BigEndian>().map_err(on_err)
    }

    fn f32(&mut self, what: &'static str) -> Result<f32> {
        let on_err = self.truncated(what);
        self.cursor.read_f32::<BigEndian>().map_err(on_err)
    }

    fn f64(&mut self, what: &'static str) -> Result<f64> {
        let on_err = self.truncated(what);
        self.cursor.read_f64::<BigEndian>().map_err(on_err)
    }

    /// A count that must fit in the bytes that are left.
    fn count(&mut self, what: &'static str, item_size: u64) -> Result<usize> {
        let offset = self.cursor.position();
        let n = self.i32(what)?;
        let n = usize::try_from(n).map_err(|_| MdaError::Inconsistent(format!("negative {what} count {n}")))?;
        if n as u64 * item_size > self.remaining() {
            return Err(MdaError::Truncated { offset, what });
        }
        Ok(n)
    }

    fn checked_len(&self, n: usize, item_size: u64, what: &'static str) -> Result<()> {
        if n as u64 * item_size > self.remaining() {
            return Err(MdaError::Truncated {
                offset: self.cursor.position(),
                what,
            });
        }
        Ok(())
    }

    fn i32s(&mut self, n: usize, what: &'static str) -> Result<Vec<i32>> {
        self.checked_len(n, 4, what)?;
        (0..n).map(|_| self.i32(what)).collect()
    }

    fn f32s(&mut self, n: usize, what: &'static str) -> Result<Vec<f32>> {
        self.checked_len(n, 4, what)?;
        (0..n).map(|_| self.f32(what)).collect()
    }

    fn f64s(&mut self, n: usize, what: &'static str) -> Result<Vec<f64>> {
        self.checked_len(n, 8, what)?;
        (0..n).map(|_| self.f64(what)).collect()
    }

    /// XDR string: length, bytes, zero padding to a multiple of four.
    fn string(&mut self, what: &'static str) -> Result<String> {
        let len = self.count(what, 1)?;
        let mut buf = vec![0u8; len];
        let on_err = self.truncated(what);
        self.cursor.read_exact(&mut buf).map_err(on_err)?;
        let pad = (4 - len % 4) % 4;
        if pad as u64 > self.remaining() {
            return Err(MdaError::Truncated {
                offset: self.cursor.position(),
                what,
            });
        }
        self.cursor.set_position(self.cursor.position() + pad as u64);
        Ok(decode_text(&buf))
    }

    /// MDA writes its own length ahead of the XDR string; a zero length
    /// means the string itself is omitted.
    fn optional_string(&mut self, what: &'static str) -> Result<String> {
        if self.i32(what)? > 0 {
            self.string(what)
        } else {
            Ok(String::new())
        }
    }

    /// Length-prefixed string that is always present.
    fn prefixed_string(&mut self, what: &'static str) -> Result<String> {
        self.i32(what)?;
        self.string(what)
    }
}

/// Byte strings become text; trailing NULs from fixed-size EPICS buffers
/// are dropped.
fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MdaHeader {
    version: f32,
    scan_number: i32,
    rank: i32,
    dimensions: Vec<i32>,
    is_regular: i32,
    extra_offset: i32,
    main_offset: u64,
}

#[derive(Debug, Default)]
struct Positioner {
    number: i32,
    name: String,
    desc: String,
    step_mode: String,
    unit: String,
    readback_name: String,
    readback_desc: String,
    readback_unit: String,
    data: Vec<f64>,
}

#[derive(Debug, Default)]
struct Detector {
    number: i32,
    name: String,
    desc: String,
    unit: String,
    data: Vec<f32>,
}

#[derive(Debug, Default)]
struct Trigger {
    number: i32,
    name: String,
    command: f32,
}

#[derive(Debug, Default)]
struct ScanRecord {
    rank: i32,
    npts: usize,
    curr_pt: usize,
    lower_scans: Vec<i32>,
    name: String,
    time: String,
    positioners: Vec<Positioner>,
    detectors: Vec<Detector>,
    triggers: Vec<Trigger>,
}

#[derive(Debug)]
struct ScanTree {
    record: ScanRecord,
    children: Vec<ScanTree>,
}

fn positioner_field(number: i32) -> String {
    format!("P{}", number + 1)
}

/// Detector field name as used by the sscan record: `D1`..`DF`, then `D01`..`D70`.
pub fn detector_field(number: i32) -> String {
    match number {
        0..=14 => format!("D{:X}", number + 1),
        15..=84 => format!("D{:02}", number - 14),
        _ => format!("D?{number}"),
    }
}

fn read_header(xdr: &mut Xdr<'_>) -> Result<MdaHeader> {
    let version = xdr.f32("version")?;
    let scan_number = xdr.i32("scan_number")?;
    let rank = xdr.i32("rank")?;
    if !(1..=MAX_RANK).contains(&rank) {
        return Err(MdaError::Inconsistent(format!("implausible rank {rank}")));
    }
    let dimensions = xdr.i32s(rank as usize, "dimensions")?;
    let is_regular = xdr.i32("isRegular")?;
    let extra_offset = xdr.i32("pExtra")?;
    Ok(MdaHeader {
        version,
        scan_number,
        rank,
        dimensions,
        is_regular,
        extra_offset,
        main_offset: xdr.cursor.position(),
    })
}

fn read_scan(xdr: &mut Xdr<'_>) -> Result<ScanRecord> {
    let mut scan = ScanRecord {
        rank: xdr.i32("scan rank")?,
        ..ScanRecord::default()
    };
    scan.npts = xdr.count("npts", 0)?;
    scan.curr_pt = usize::try_from(xdr.i32("curr_pt")?).unwrap_or(0);
    if scan.rank > 1 {
        scan.lower_scans = xdr.i32s(scan.npts, "plower_scans")?;
    }
    scan.name = xdr.prefixed_string("scan name")?;
    scan.time = xdr.prefixed_string("scan time")?;
    let np = xdr.count("positioner", 4)?;
    let nd = xdr.count("detector", 4)?;
    let nt = xdr.count("trigger", 4)?;

    for _ in 0..np {
        let number = xdr.i32("positioner number")?;
        scan.positioners.push(Positioner {
            number,
            name: xdr.optional_string("positioner name")?,
            desc: xdr.optional_string("positioner desc")?,
            step_mode: xdr.optional_string("positioner step mode")?,
            unit: xdr.optional_string("positioner unit")?,
            readback_name: xdr.optional_string("readback name")?,
            readback_desc: xdr.optional_string("readback desc")?,
            readback_unit: xdr.optional_string("readback unit")?,
            data: Vec::new(),
        });
    }
    for _ in 0..nd {
        let number = xdr.i32("detector number")?;
        scan.detectors.push(Detector {
            number,
            name: xdr.optional_string("detector name")?,
            desc: xdr.optional_string("detector desc")?,
            unit: xdr.optional_string("detector unit")?,
            data: Vec::new(),
        });
    }
    for _ in 0..nt {
        let number = xdr.i32("trigger number")?;
        let name = xdr.optional_string("trigger name")?;
        let command = xdr.f32("trigger command")?;
        scan.triggers.push(Trigger { number, name, command });
    }

    for p in &mut scan.positioners {
        p.data = xdr.f64s(scan.npts, "positioner data")?;
    }
    for d in &mut scan.detectors {
        d.data = xdr.f32s(scan.npts, "detector data")?;
    }
    Ok(scan)
}

/// Read the scan at `offset` and, recursively, the lower-rank scans it
/// points to. Ranks must strictly decrease on the way down, and each record
/// is read at most once.
fn read_tree(
    xdr: &mut Xdr<'_>,
    offset: u64,
    max_rank: i32,
    visited: &mut HashSet<u64>,
) -> Result<ScanTree> {
    if !visited.insert(offset) {
        return Err(MdaError::Inconsistent(format!(
            "scan record at offset {offset} is referenced more than once"
        )));
    }
    xdr.cursor.set_position(offset);
    let record = read_scan(xdr)?;
    if record.rank > max_rank || record.rank < 1 {
        return Err(MdaError::Inconsistent(format!(
            "scan of rank {} where at most {max_rank} is possible",
            record.rank
        )));
    }
    let mut children = Vec::new();
    if record.rank > 1 {
        for &pointer in record.lower_scans.iter().take(record.curr_pt.min(record.npts)) {
            if pointer <= 0 {
                break;
            }
            xdr.seek(pointer, "lower scan")?;
            let at = xdr.cursor.position();
            children.push(read_tree(xdr, at, record.rank - 1, visited)?);
        }
    }
    Ok(ScanTree { record, children })
}

fn read_extra_pvs(xdr: &mut Xdr<'_>, offset: i32) -> Result<Metadata> {
    let mut pvs = Metadata::new();
    if offset <= 0 {
        return Ok(pvs);
    }
    xdr.seek(offset, "extra PVs")?;
    let count = xdr.count("extra PV", 4)?;
    for _ in 0..count {
        let name = xdr.optional_string("PV name")?;
        let desc = xdr.optional_string("PV desc")?;
        let type_code = xdr.i32("PV type")?;
        let mut unit = String::new();
        let mut n = 0usize;
        if type_code != 0 {
            n = xdr.count("PV count", 1)?;
            unit = xdr.optional_string("PV unit")?;
        }
        let value: Option<MetadataValue> = match type_code {
            0 => Some(xdr.optional_string("PV value")?.into()),
            32 => {
                let chars = xdr.i32s(n, "PV value")?;
                let bytes: Vec<u8> = chars.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
                Some(decode_text(&bytes).into())
            }
            29 | 33 => Some(scalar_or_list(xdr.i32s(n, "PV value")?)),
            30 => Some(scalar_or_list(xdr.f32s(n, "PV value")?)),
            34 => Some(scalar_or_list(xdr.f64s(n, "PV value")?)),
            _ => None,
        };

        let mut md = Metadata::new();
        md.insert("desc".into(), desc.into());
        md.insert("unit".into(), unit.into());
        md.insert("EPICS_type".into(), epics_type_name(type_code).into());
        md.insert("count".into(), n.into());
        let known = value.is_some();
        md.insert("value".into(), value.unwrap_or(MetadataValue::Null));
        pvs.insert(name.clone(), md.into());

        if !known {
            warn!("PV {name}: unknown EPICS type {type_code}; remaining extra PVs not read");
            break;
        }
    }
    Ok(pvs)
}

fn scalar_or_list<T: Into<MetadataValue>>(mut values: Vec<T>) -> MetadataValue {
    if values.len() == 1 {
        values.remove(0).into()
    } else {
        values.into()
    }
}

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

/// All records of one dimension, each with its index path through the
/// enclosing scans.
struct Level<'t> {
    records: Vec<(Vec<usize>, &'t ScanRecord)>,
}

fn collect_levels<'t>(tree: &'t ScanTree, path: Vec<usize>, levels: &mut Vec<Level<'t>>) {
    let depth = path.len();
    if levels.len() <= depth {
        levels.push(Level { records: Vec::new() });
    }
    for (i, child) in tree.children.iter().enumerate() {
        let mut child_path = path.clone();
        child_path.push(i);
        collect_levels(child, child_path, levels);
    }
    levels[depth].records.push((path, &tree.record));
}

/// Flat offset of `path` within `shape`, or `None` when out of range.
fn ravel(path: &[usize], shape: &[usize]) -> Option<usize> {
    path.iter().zip(shape).try_fold(0usize, |acc, (&i, &n)| (i < n).then_some(acc * n + i))
}

/// Stack the per-record arrays of one dimension into a single array.
fn assemble<T: Copy + Default>(
    level: &Level<'_>,
    shape: &[usize],
    extract: impl Fn(&ScanRecord) -> Option<&[T]>,
) -> std::result::Result<ArrayD<T>, ndarray::ShapeError> {
    let (outer, inner) = shape.split_at(shape.len() - 1);
    let row = inner[0];
    let mut buf = vec![T::default(); shape.iter().product()];
    for (path, record) in &level.records {
        let (Some(slot), Some(data)) = (ravel(path, outer), extract(record)) else {
            continue;
        };
        let n = data.len().min(row);
        buf[slot * row..slot * row + n].copy_from_slice(&data[..n]);
    }
    ArrayD::from_shape_vec(IxDyn(shape), buf)
}

fn text_md(md: &mut Metadata, key: &str, value: &str) {
    md.insert(key.into(), value.into());
}

fn scan_node(level: &Level<'_>, dim: usize, shape: &[usize], path: &Path) -> ReadResult<Node> {
    // Metadata of a dimension comes from its first record.
    let first = level.records[0].1;
    let construction = |e| ReadError::from_construction(path, e);
    let shape_err = |e: ndarray::ShapeError| ReadError::malformed(path, e.to_string());

    let mut md = Metadata::new();
    md.insert("dim".into(), dim.into());
    md.insert("rank".into(), first.rank.into());
    md.insert("number_points_requested".into(), first.npts.into());
    md.insert("number_points_acquired".into(), first.curr_pt.into());
    md.insert("number_detectors".into(), first.detectors.len().into());
    md.insert("number_positioners".into(), first.positioners.len().into());
    md.insert("number_triggers".into(), first.triggers.len().into());
    text_md(&mut md, "PV", &first.name);
    text_md(&mut md, "time", &first.time);
    text_md(&mut md, "time_zone", TIME_ZONE_NOTE);
    for (i, t) in first.triggers.iter().enumerate() {
        let mut tmd = Metadata::new();
        tmd.insert("command".into(), t.command.into());
        tmd.insert("number".into(), t.number.into());
        text_md(&mut tmd, "EPICS_PV", &t.name);
        md.insert(format!("T{}", i + 1), tmd.into());
    }

    let mut children = Vec::new();
    for (j, d) in first.detectors.iter().enumerate() {
        let field = detector_field(d.number);
        let mut dmd = Metadata::new();
        text_md(&mut dmd, "desc", &d.desc);
        text_md(&mut dmd, "fieldName", &field);
        dmd.insert("number".into(), d.number.into());
        text_md(&mut dmd, "unit", &d.unit);
        text_md(&mut dmd, "EPICS_PV", &d.name);
        let data = assemble(level, shape, |r| r.detectors.get(j).map(|d| d.data.as_slice()))
            .map_err(shape_err)?;
        let array = make_array(ArrayData::from(data), dmd).map_err(construction)?;
        children.push((field, Node::from(array)));
    }
    for (j, p) in first.positioners.iter().enumerate() {
        let field = positioner_field(p.number);
        let mut pmd = Metadata::new();
        text_md(&mut pmd, "desc", &p.desc);
        text_md(&mut pmd, "fieldName", &field);
        pmd.insert("number".into(), p.number.into());
        text_md(&mut pmd, "readback_desc", &p.readback_desc);
        text_md(&mut pmd, "readback_PV", &p.readback_name);
        text_md(&mut pmd, "readback_unit", &p.readback_unit);
        text_md(&mut pmd, "step_mode", &p.step_mode);
        text_md(&mut pmd, "unit", &p.unit);
        text_md(&mut pmd, "EPICS_PV", &p.name);
        let data = assemble(level, shape, |r| r.positioners.get(j).map(|p| p.data.as_slice()))
            .map_err(shape_err)?;
        let array = make_array(ArrayData::from(data), pmd).map_err(construction)?;
        children.push((field, Node::from(array)));
    }
    Ok(make_mapping(children, md).map_err(construction)?.into())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Read an MDA file into a mapping with one `S<rank>` entry per dimension.
pub fn read_mda(path: &Path) -> ReadResult<Node> {
    let bytes = std::fs::read(path).map_err(|e| ReadError::not_recognized(path, FORMAT, e.to_string()))?;
    read_mda_bytes(path, &bytes)
}

/// [`read_mda`] over bytes already in memory; `path` is used for metadata
/// and error reports.
pub fn read_mda_bytes(path: &Path, bytes: &[u8]) -> ReadResult<Node> {
    let malformed = |e: MdaError| ReadError::malformed(path, e.to_string());
    let mut xdr = Xdr::new(bytes);

    let header = read_header(&mut xdr).map_err(|e| ReadError::not_recognized(path, FORMAT, e.to_string()))?;
    if !header.version.is_finite() || header.version <= 0.0 || header.version >= 100.0 {
        return Err(ReadError::not_recognized(
            path,
            FORMAT,
            format!("implausible version {}", header.version),
        ));
    }

    let mut visited = HashSet::new();
    let tree = read_tree(&mut xdr, header.main_offset, header.rank, &mut visited).map_err(malformed)?;
    let pvs = read_extra_pvs(&mut xdr, header.extra_offset).map_err(malformed)?;

    let mut levels = Vec::new();
    collect_levels(&tree, Vec::new(), &mut levels);

    let records_in_file = levels.len() + 1;
    if records_in_file != header.rank as usize + 1 {
        return Err(ReadError::malformed(
            path,
            format!(
                "rank={} but file holds {records_in_file} records (header + {} scans)",
                header.rank,
                levels.len()
            ),
        ));
    }

    let mut md = Metadata::new();
    md.insert("filename".into(), path.display().to_string().into());
    // f32 1.3 reads back as 1.2999999523...
    md.insert(
        "version".into(),
        ((f64::from(header.version) * 100.0).round() / 100.0).into(),
    );
    md.insert("scan_number".into(), header.scan_number.into());
    md.insert("rank".into(), header.rank.into());
    md.insert("dimensions".into(), header.dimensions.clone().into());
    md.insert("isRegular".into(), header.is_regular.into());
    md.insert("PVs".into(), pvs.into());

    let element_limit = bytes.len().saturating_mul(ELEMENTS_PER_BYTE).max(MIN_ELEMENT_LIMIT);
    let mut shape = Vec::with_capacity(levels.len());
    let mut scans = Vec::with_capacity(levels.len());
    for (depth, level) in levels.iter().enumerate() {
        shape.push(level.records[0].1.npts);
        let elements = shape
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))
            .filter(|&n| n <= element_limit);
        if elements.is_none() {
            return Err(ReadError::malformed(
                path,
                format!(
                    "dimensions {shape:?} exceed {element_limit} elements for a {}-byte file",
                    bytes.len()
                ),
            ));
        }
        let node = scan_node(level, depth + 1, &shape, path)?;
        scans.push((format!("S{}", level.records[0].1.rank), node));
    }
    debug!("{}: rank {} with {} dimensions", path.display(), header.rank, scans.len());

    let root = make_mapping(scans, md).map_err(|e| ReadError::from_construction(path, e))?;
    Ok(root.into())
}
