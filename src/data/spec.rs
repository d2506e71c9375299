//! SPEC data files: text headers (`#E` blocks) followed by scans (`#S` blocks).
//!
//! ```text
//!  #F file.dat          file name
//!  #E 1554043854        header block: epoch, date, comments, #O/#o, #J/#j
//!  ...
//!  #S 1  ascan ...      scan block: control lines, #L labels, numeric rows
//!  ...
//! ```
//!
//! A scan whose rows cannot be decoded becomes an empty mapping carrying the
//! error text; the rest of the file is still read.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;

use chrono::DateTime;
use log::{debug, warn};
use thiserror::Error;

use crate::data::mimetype::read_head;
use crate::data::model::{
    make_array, make_mapping, ConstructionError, MappingNode, Metadata, MetadataValue, Node,
};
use crate::error::{ReadError, ReadResult};

const FORMAT: &str = "SPEC";

/// Value-level problems inside one scan block.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScanError {
    #[error("line {line}: could not convert '{token}' to float")]
    BadNumber { line: usize, token: String },

    #[error("line {line}: expected {expected} values, found {found}")]
    RowWidth {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: data row before any #L column labels")]
    DataBeforeLabels { line: usize },
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Split a `#KEY rest` control line.
fn control(line: &str) -> Option<(&str, &str)> {
    let body = line.strip_prefix('#')?;
    let end = body.find(char::is_whitespace).unwrap_or(body.len());
    if end == 0 {
        return None;
    }
    Some((&body[..end], body[end..].trim()))
}

/// First non-blank line is `#F`, and a `#E` header line comes before any scan.
pub fn has_header_signature(text: &str) -> bool {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    match lines.next().and_then(control) {
        Some(("F", _)) => {}
        _ => return false,
    }
    for line in lines {
        match control(line) {
            Some(("E", _)) => return true,
            Some(("S", _)) => return false,
            _ => {}
        }
    }
    false
}

/// Probe form of [`has_header_signature`], looking at the first
/// `sniff_bytes` of the file.
pub fn is_spec_file_with_header(path: &Path, sniff_bytes: usize) -> io::Result<bool> {
    let head = read_head(path, sniff_bytes)?;
    Ok(has_header_signature(&String::from_utf8_lossy(&head)))
}

// ---------------------------------------------------------------------------
// Block model
// ---------------------------------------------------------------------------

/// Names separated by two or more spaces (single spaces may occur inside a name).
fn split_names(text: &str) -> Vec<String> {
    text.split("  ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Default)]
struct SpecHeader {
    file: Option<String>,
    epoch: Option<i64>,
    date: Option<String>,
    comments: Vec<String>,
    positioner_names: Vec<String>,
    positioner_mnemonics: Vec<String>,
    counter_names: Vec<String>,
    counter_mnemonics: Vec<String>,
}

impl SpecHeader {
    fn apply(&mut self, key: &str, rest: &str) {
        match key {
            "F" => self.file = Some(rest.to_string()),
            "D" => self.date = Some(rest.to_string()),
            "C" => self.comments.push(rest.to_string()),
            k if k.starts_with('O') => self.positioner_names.extend(split_names(rest)),
            k if k.starts_with('o') => self
                .positioner_mnemonics
                .extend(rest.split_whitespace().map(str::to_string)),
            k if k.starts_with('J') => self.counter_names.extend(split_names(rest)),
            k if k.starts_with('j') => self
                .counter_mnemonics
                .extend(rest.split_whitespace().map(str::to_string)),
            _ => {}
        }
    }

    fn metadata(&self) -> Metadata {
        let mut md = Metadata::new();
        if let Some(date) = &self.date {
            md.insert("date".into(), date.as_str().into());
        }
        if let Some(epoch) = self.epoch {
            md.insert("epoch".into(), epoch.into());
            if let Some(t) = DateTime::from_timestamp(epoch, 0) {
                md.insert("iso8601".into(), t.to_rfc3339().into());
            }
        }
        if let Some(file) = &self.file {
            md.insert("file".into(), file.as_str().into());
        }
        md.insert(
            "positioner_xref".into(),
            xref(&self.positioner_mnemonics, &self.positioner_names).into(),
        );
        md.insert(
            "counter_xref".into(),
            xref(&self.counter_mnemonics, &self.counter_names).into(),
        );
        if !self.comments.is_empty() {
            let comments: Metadata = self
                .comments
                .iter()
                .enumerate()
                .map(|(i, c)| (format!("C{}", i + 1), c.as_str().into()))
                .collect();
            md.insert("comments".into(), comments.into());
        }
        md
    }
}

fn xref(mnemonics: &[String], names: &[String]) -> Metadata {
    mnemonics
        .iter()
        .zip(names)
        .map(|(m, n)| (m.clone(), n.as_str().into()))
        .collect()
}

#[derive(Debug)]
struct RawScan<'a> {
    number: String,
    scan_line: &'a str,
    header: Option<usize>,
    lines: Vec<(usize, &'a str)>,
}

#[derive(Debug, Default)]
struct SpecFile<'a> {
    spec_file: Option<String>,
    headers: Vec<SpecHeader>,
    scans: Vec<RawScan<'a>>,
}

enum Block {
    Preamble,
    Header,
    Scan,
}

impl<'a> SpecFile<'a> {
    fn parse(text: &'a str) -> Self {
        let mut file = SpecFile::default();
        let mut last_f: Option<String> = None;
        let mut block = Block::Preamble;

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let ctl = control(line);
            match ctl {
                Some(("E", rest)) => {
                    file.headers.push(SpecHeader {
                        file: last_f.clone(),
                        epoch: rest.split_whitespace().next().and_then(|t| t.parse().ok()),
                        ..SpecHeader::default()
                    });
                    block = Block::Header;
                    continue;
                }
                Some(("S", rest)) => {
                    let number = rest.split_whitespace().next().unwrap_or_default().to_string();
                    file.scans.push(RawScan {
                        number,
                        scan_line: rest,
                        header: file.headers.len().checked_sub(1),
                        lines: Vec::new(),
                    });
                    block = Block::Scan;
                    continue;
                }
                Some(("F", rest)) => {
                    if file.spec_file.is_none() {
                        file.spec_file = Some(rest.to_string());
                    }
                    last_f = Some(rest.to_string());
                }
                _ => {}
            }

            match block {
                Block::Preamble => {}
                Block::Header => {
                    if let (Some((key, rest)), Some(header)) = (ctl, file.headers.last_mut()) {
                        header.apply(key, rest);
                    }
                }
                Block::Scan => {
                    if let Some(scan) = file.scans.last_mut() {
                        scan.lines.push((line_no, line));
                    }
                }
            }
        }
        file
    }
}

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

fn parse_floats(line: usize, text: &str) -> Result<Vec<f64>, ScanError> {
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<f64>().map_err(|_| ScanError::BadNumber {
                line,
                token: tok.to_string(),
            })
        })
        .collect()
}

/// `base` when still free, otherwise the first `base<sep><k>` (k from 1)
/// that is neither taken nor one of the `reserved` source names.
fn unique_name(base: &str, sep: char, taken: &HashSet<String>, reserved: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (1usize..)
        .map(|k| format!("{base}{sep}{k}"))
        .find(|name| !taken.contains(name) && !reserved.contains(name))
        .unwrap_or_else(|| base.to_string())
}

/// Make repeated labels unique with `_<k>` suffixes.
fn unique_labels(labels: Vec<String>) -> Vec<String> {
    let reserved: HashSet<String> = labels.iter().cloned().collect();
    let mut taken = HashSet::with_capacity(labels.len());
    labels
        .into_iter()
        .map(|label| {
            let name = unique_name(&label, '_', &taken, &reserved);
            taken.insert(name.clone());
            name
        })
        .collect()
}

/// Decoded content of one scan block.
#[derive(Debug, Default)]
struct ScanContent {
    metadata: Metadata,
    labels: Vec<String>,
    columns: Vec<Vec<f64>>,
}

fn parse_scan(scan: &RawScan<'_>, header: Option<&SpecHeader>) -> Result<ScanContent, ScanError> {
    let mut md = Metadata::new();
    let mut g_lines: Vec<(String, usize, &str)> = Vec::new();
    let mut user_md = Metadata::new();
    let mut p_values: Vec<f64> = Vec::new();
    let mut labels: Option<Vec<String>> = None;
    let mut columns: Vec<Vec<f64>> = Vec::new();

    let cmd = scan
        .scan_line
        .trim_start()
        .strip_prefix(scan.number.as_str())
        .unwrap_or_default()
        .trim();
    md.insert("S".into(), scan.scan_line.into());
    md.insert("scanNum".into(), scan.number.as_str().into());
    md.insert("scanCmd".into(), cmd.into());
    if let Some(epoch) = header.and_then(|h| h.epoch) {
        md.insert("epoch".into(), epoch.into());
    }

    for &(line_no, line) in &scan.lines {
        if let Some((key, rest)) = control(line) {
            match key {
                "D" => {
                    md.insert("date".into(), rest.into());
                }
                "T" | "M" => {
                    let (value, unit) = match rest.split_once('(') {
                        Some((v, u)) => (v.trim(), Some(u.trim_end_matches(')').trim())),
                        None => (rest, None),
                    };
                    md.insert(key.into(), value.into());
                    let default_name = if key == "T" { "Seconds" } else { "Monitor" };
                    if key == "T" || !md.contains_key("time_name") {
                        md.insert("time_name".into(), unit.unwrap_or(default_name).into());
                    }
                }
                "L" => labels = Some(unique_labels(split_names(rest))),
                "MD" => {
                    if let Some((k, v)) = rest.split_once('=') {
                        user_md.insert(k.trim().to_string(), v.trim().into());
                    }
                }
                k if k.starts_with('G') && k.len() > 1 => g_lines.push((k.to_string(), line_no, rest)),
                k if k.starts_with('P') && k[1..].chars().all(|c| c.is_ascii_digit()) => {
                    p_values.extend(parse_floats(line_no, rest)?);
                }
                _ => {}
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('@') {
            continue;
        }
        let Some(labels) = labels.as_ref() else {
            return Err(ScanError::DataBeforeLabels { line: line_no });
        };
        let row = parse_floats(line_no, trimmed)?;
        if row.len() != labels.len() {
            return Err(ScanError::RowWidth {
                line: line_no,
                expected: labels.len(),
                found: row.len(),
            });
        }
        if columns.is_empty() {
            columns = vec![Vec::new(); labels.len()];
        }
        for (column, value) in columns.iter_mut().zip(row) {
            column.push(value);
        }
    }

    let labels = labels.unwrap_or_default();
    if columns.is_empty() {
        columns = vec![Vec::new(); labels.len()];
    }
    if let (Some(first), Some(last)) = (labels.first(), labels.last()) {
        md.insert("column_first".into(), first.as_str().into());
        md.insert("column_last".into(), last.as_str().into());
    }
    md.insert(
        "L".into(),
        MetadataValue::List(labels.iter().map(|l| l.as_str().into()).collect()),
    );

    if !g_lines.is_empty() {
        let g: Metadata = g_lines
            .iter()
            .map(|(k, _, rest)| (k.clone(), (*rest).into()))
            .collect();
        md.insert("G".into(), g.into());
    }
    if !user_md.is_empty() {
        md.insert("metadata".into(), user_md.into());
    }
    if let Some(header) = header {
        let positioners: Metadata = header
            .positioner_names
            .iter()
            .zip(&p_values)
            .map(|(name, v)| (name.clone(), MetadataValue::from_f64(*v)))
            .collect();
        if !positioners.is_empty() {
            md.insert("positioner".into(), positioners.into());
        }
    }

    let mut g_values: HashMap<&str, Vec<f64>> = HashMap::new();
    for (key, line_no, rest) in &g_lines {
        g_values.insert(key.as_str(), parse_floats(*line_no, rest)?);
    }
    let angle_names = header.map(|h| h.positioner_names.as_slice()).unwrap_or_default();
    // SPEC opens each header with `#C <geometry>  User = <name>`.
    let geometry = header
        .and_then(|h| h.comments.first())
        .and_then(|c| c.split_whitespace().next());
    md.extend(diffractometer_metadata(&g_values, angle_names, geometry));

    Ok(ScanContent {
        metadata: md,
        labels,
        columns,
    })
}

/// Orientation context from the `#G` lines, following the four-circle
/// layout. Empty when the scan carries neither `#G1` nor `#G3`.
fn diffractometer_metadata(
    g: &HashMap<&str, Vec<f64>>,
    angle_names: &[String],
    geometry: Option<&str>,
) -> Metadata {
    let mut md = Metadata::new();
    if !g.contains_key("G1") && !g.contains_key("G3") {
        return md;
    }
    if let Some(name) = geometry {
        md.insert("geometry_name".into(), name.into());
    }

    if let Some(ub) = g.get("G3").filter(|v| v.len() >= 9) {
        let rows: Vec<MetadataValue> = ub[..9]
            .chunks(3)
            .map(|row| MetadataValue::from(row.to_vec()))
            .collect();
        md.insert("UB".into(), MetadataValue::List(rows));
    }

    if let Some(g1) = g.get("G1") {
        if g1.len() >= 6 {
            let lattice: Metadata = ["a", "b", "c", "alpha", "beta", "gamma"]
                .iter()
                .zip(&g1[..6])
                .map(|(k, v)| (k.to_string(), MetadataValue::from_f64(*v)))
                .collect();
            md.insert("lattice".into(), lattice.into());
        }
        // a..gamma, a*..gamma*, hkl0, hkl1, angles0, angles1, lambda0, lambda1
        if g1.len() >= 20 && (g1.len() - 20) % 2 == 0 {
            let n = (g1.len() - 20) / 2;
            let lambdas = [g1[18 + 2 * n], g1[19 + 2 * n]];
            let reflections: Metadata = (0..2)
                .map(|r| {
                    let hkl = &g1[12 + 3 * r..15 + 3 * r];
                    let angles: Metadata = g1[18 + n * r..18 + n * (r + 1)]
                        .iter()
                        .enumerate()
                        .map(|(i, v)| {
                            let name = angle_names.get(i).cloned().unwrap_or_else(|| format!("A{i}"));
                            (name, MetadataValue::from_f64(*v))
                        })
                        .collect();
                    let mut refl = Metadata::new();
                    refl.insert("h".into(), hkl[0].into());
                    refl.insert("k".into(), hkl[1].into());
                    refl.insert("l".into(), hkl[2].into());
                    refl.insert("wavelength".into(), lambdas[r].into());
                    refl.insert("angles".into(), angles.into());
                    (format!("R{r}"), MetadataValue::Map(refl))
                })
                .collect();
            md.insert("reflections".into(), reflections.into());
        }
    }

    if let Some(g0) = g.get("G0").filter(|v| !v.is_empty()) {
        let params: Metadata = g0
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let key = format!("g{i}");
                let mut p = Metadata::new();
                p.insert("key".into(), key.as_str().into());
                p.insert("value".into(), (*v).into());
                (key, MetadataValue::Map(p))
            })
            .collect();
        md.insert("geometry_parameters".into(), params.into());
    }

    if let Some(wavelength) = g.get("G4").and_then(|v| v.get(3)) {
        md.insert("wavelength".into(), (*wavelength).into());
    }
    md
}

fn scan_mapping(content: ScanContent) -> Result<MappingNode, ConstructionError> {
    let children = content
        .labels
        .into_iter()
        .zip(content.columns)
        .map(|(label, column)| Ok((label, Node::from(make_array(column, Metadata::new())?))))
        .collect::<Result<Vec<_>, ConstructionError>>()?;
    make_mapping(children, content.metadata)
}

/// Empty stand-in for a scan whose content could not be used.
fn skipped_scan(reason: String) -> Result<MappingNode, ConstructionError> {
    let mut md = Metadata::new();
    md.insert("ValueError".into(), reason.into());
    md.insert("disposition".into(), "skipping".into());
    make_mapping(Vec::new(), md)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Read a SPEC data file into a mapping of `S<n>` scans.
pub fn read_spec_data(path: &Path) -> ReadResult<Node> {
    let bytes = std::fs::read(path).map_err(|e| ReadError::not_recognized(path, FORMAT, e.to_string()))?;
    let text = String::from_utf8_lossy(&bytes);
    if !has_header_signature(&text) {
        return Err(ReadError::not_recognized(path, FORMAT, "missing #F/#E header signature"));
    }
    let file = SpecFile::parse(&text);

    let mut md = Metadata::new();
    md.insert("fileName".into(), path.display().to_string().into());
    md.insert(
        "specFile".into(),
        file.spec_file.clone().unwrap_or_else(|| path.display().to_string()).into(),
    );
    if !file.headers.is_empty() {
        let headers: Metadata = file
            .headers
            .iter()
            .enumerate()
            .map(|(i, h)| (format!("H{}", i + 1), h.metadata().into()))
            .collect();
        md.insert("headers".into(), headers.into());
    }

    let reserved: HashSet<String> = file.scans.iter().map(|s| format!("S{}", s.number)).collect();
    let mut taken = HashSet::with_capacity(file.scans.len());
    let mut scans = Vec::with_capacity(file.scans.len());
    for raw in &file.scans {
        let name = unique_name(&format!("S{}", raw.number), '.', &taken, &reserved);
        taken.insert(name.clone());

        let header = raw.header.and_then(|i| file.headers.get(i));
        let outcome = parse_scan(raw, header)
            .map_err(|e| e.to_string())
            .and_then(|content| scan_mapping(content).map_err(|e| e.to_string()));
        let node = match outcome {
            Ok(node) => node,
            Err(reason) => {
                warn!("{}: skipping scan {name}: {reason}", path.display());
                skipped_scan(reason).map_err(|e| ReadError::from_construction(path, e))?
            }
        };
        scans.push((name, Node::from(node)));
    }
    debug!("{}: {} scans", path.display(), scans.len());

    let root = make_mapping(scans, md).map_err(|e| ReadError::from_construction(path, e))?;
    Ok(root.into())
}
