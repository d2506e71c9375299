use std::path::Path;

use scantree::data::mda::{read_mda, read_mda_bytes};
use scantree::data::model::{ElementType, MetadataValue, Node};
use scantree::ReadError;

// ---------------------------------------------------------------------------
// Minimal XDR writer for fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn pos(&self) -> usize {
        self.buf.len()
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn f32(&mut self, v: f32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn f64(&mut self, v: f64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn xdr_string(&mut self, s: &str) -> &mut Self {
        self.i32(s.len() as i32);
        self.buf.extend_from_slice(s.as_bytes());
        let pad = (4 - s.len() % 4) % 4;
        self.buf.extend(std::iter::repeat(0u8).take(pad));
        self
    }

    /// Own length, then the XDR string when non-empty.
    fn opt_string(&mut self, s: &str) -> &mut Self {
        self.i32(s.len() as i32);
        if !s.is_empty() {
            self.xdr_string(s);
        }
        self
    }

    fn prefixed(&mut self, s: &str) -> &mut Self {
        self.i32(s.len() as i32);
        self.xdr_string(s)
    }

    fn patch_i32(&mut self, at: usize, v: i32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }
}

struct ScanSpec<'a> {
    rank: i32,
    name: &'a str,
    positioner: Vec<f64>,
    detector: Vec<f32>,
    trigger: Option<(&'a str, f32)>,
}

/// Write one scan record; returns the offset of its `plower_scans` table.
fn write_scan(w: &mut Writer, scan: &ScanSpec<'_>) -> usize {
    let npts = scan.positioner.len() as i32;
    w.i32(scan.rank).i32(npts).i32(npts);
    let lower = w.pos();
    if scan.rank > 1 {
        for _ in 0..npts {
            w.i32(0);
        }
    }
    w.prefixed(scan.name).prefixed("Mar 31, 2019 09:50:54.000000000");
    w.i32(1).i32(1).i32(scan.trigger.is_some() as i32);

    w.i32(0)
        .opt_string(&format!("{}:m1", scan.name))
        .opt_string("motor one")
        .opt_string("LINEAR")
        .opt_string("mm")
        .opt_string(&format!("{}:m1.RBV", scan.name))
        .opt_string("")
        .opt_string("mm");
    w.i32(0).opt_string("ioc:scaler1.S1").opt_string("clock").opt_string("counts");
    if let Some((name, command)) = scan.trigger {
        w.i32(0).opt_string(name).f32(command);
    }

    for &v in &scan.positioner {
        w.f64(v);
    }
    for &v in &scan.detector {
        w.f32(v);
    }
    lower
}

fn write_header(w: &mut Writer, version: f32, dims: &[i32]) -> usize {
    w.f32(version).i32(17).i32(dims.len() as i32);
    for &d in dims {
        w.i32(d);
    }
    w.i32(1);
    let extra = w.pos();
    w.i32(0);
    extra
}

fn one_d(version: f32) -> Writer {
    let mut w = Writer::default();
    write_header(&mut w, version, &[3]);
    write_scan(
        &mut w,
        &ScanSpec {
            rank: 1,
            name: "ioc:scan1",
            positioner: vec![0.0, 0.5, 1.0],
            detector: vec![10.0, 20.0, 30.0],
            trigger: Some(("ioc:scaler1.CNT", 1.0)),
        },
    );
    w
}

fn two_d(inner_scans: usize) -> Writer {
    let mut w = Writer::default();
    write_header(&mut w, 1.4, &[2, 3]);
    let lower = write_scan(
        &mut w,
        &ScanSpec {
            rank: 2,
            name: "ioc:scan2",
            positioner: vec![5.0, 6.0],
            detector: vec![1.0, 2.0],
            trigger: None,
        },
    );
    for i in 0..inner_scans {
        let at = w.pos() as i32;
        w.patch_i32(lower + 4 * i, at);
        let base = i as f64 * 10.0;
        write_scan(
            &mut w,
            &ScanSpec {
                rank: 1,
                name: "ioc:scan1",
                positioner: vec![base, base + 1.0, base + 2.0],
                detector: vec![1.0, 2.0, 3.0],
                trigger: None,
            },
        );
    }
    w
}

fn array<'a>(node: &'a Node, scan: &str, field: &str) -> &'a scantree::ArrayNode {
    node.as_mapping()
        .and_then(|m| m.get(scan))
        .and_then(Node::as_mapping)
        .and_then(|m| m.get(field))
        .and_then(Node::as_array)
        .unwrap_or_else(|| panic!("no array {scan}/{field}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_one_dimensional_scan() {
    let node = read_mda_bytes(Path::new("scan_0017.mda"), &one_d(1.3).buf).unwrap();
    let root = node.as_mapping().unwrap();
    assert_eq!(root.keys().collect::<Vec<_>>(), vec!["S1"]);
    assert_eq!(root.metadata()["version"], MetadataValue::Float(1.3));
    assert_eq!(root.metadata()["rank"], MetadataValue::Integer(1));
    assert_eq!(root.metadata()["scan_number"], MetadataValue::Integer(17));

    let scan = root.get("S1").and_then(Node::as_mapping).unwrap();
    assert_eq!(scan.keys().collect::<Vec<_>>(), vec!["D1", "P1"]);
    assert_eq!(scan.metadata()["PV"].as_str(), Some("ioc:scan1"));
    let trigger = scan.metadata()["T1"].as_map().unwrap();
    assert_eq!(trigger["EPICS_PV"].as_str(), Some("ioc:scaler1.CNT"));

    let p1 = array(&node, "S1", "P1");
    assert_eq!(p1.dtype(), ElementType::Float64);
    assert_eq!(p1.data().to_f64_vec(), vec![0.0, 0.5, 1.0]);
    assert_eq!(p1.metadata()["unit"].as_str(), Some("mm"));

    let d1 = array(&node, "S1", "D1");
    assert_eq!(d1.dtype(), ElementType::Float32);
    assert_eq!(d1.metadata()["EPICS_PV"].as_str(), Some("ioc:scaler1.S1"));
}

#[test]
fn test_two_dimensional_scan_stacks_inner_records() {
    let node = read_mda_bytes(Path::new("scan_2d.mda"), &two_d(2).buf).unwrap();
    let root = node.as_mapping().unwrap();
    assert_eq!(root.keys().collect::<Vec<_>>(), vec!["S2", "S1"]);

    assert_eq!(array(&node, "S2", "P1").shape(), &[2]);
    let inner = array(&node, "S1", "P1");
    assert_eq!(inner.shape(), &[2, 3]);
    assert_eq!(
        inner.data().to_f64_vec(),
        vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]
    );
}

#[test]
fn test_missing_dimension_is_malformed() {
    let err = read_mda_bytes(Path::new("short.mda"), &two_d(0).buf).unwrap_err();
    match err {
        ReadError::MalformedStructure { reason, .. } => {
            assert!(reason.contains("rank=2"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_implausible_version_not_recognized() {
    let err = read_mda_bytes(Path::new("x.mda"), &one_d(1.0e9).buf).unwrap_err();
    assert!(matches!(err, ReadError::NotRecognizedFormat { .. }));

    let err = read_mda_bytes(Path::new("x.mda"), b"GIF89a").unwrap_err();
    assert!(matches!(err, ReadError::NotRecognizedFormat { .. }));
}

#[test]
fn test_truncated_body_is_malformed() {
    let mut w = one_d(1.3);
    w.buf.truncate(w.buf.len() - 6);
    let err = read_mda_bytes(Path::new("cut.mda"), &w.buf).unwrap_err();
    assert!(matches!(err, ReadError::MalformedStructure { .. }));
}

#[test]
fn test_extra_pvs() {
    let mut w = Writer::default();
    let extra = write_header(&mut w, 1.3, &[3]);
    write_scan(
        &mut w,
        &ScanSpec {
            rank: 1,
            name: "ioc:scan1",
            positioner: vec![1.0, 2.0, 3.0],
            detector: vec![1.0, 1.0, 1.0],
            trigger: None,
        },
    );
    let at = w.pos() as i32;
    w.patch_i32(extra, at);
    w.i32(3);
    // DBR_STRING
    w.opt_string("ioc:userName").opt_string("operator").i32(0).opt_string("jdoe");
    // DBR_CTRL_DOUBLE, one value
    w.opt_string("ioc:ringCurrent").opt_string("beam").i32(34).i32(1).opt_string("mA").f64(102.5);
    // unsupported type ends the table
    w.opt_string("ioc:odd").opt_string("").i32(7).i32(1).opt_string("");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pvs.mda");
    std::fs::write(&path, &w.buf).unwrap();

    let node = read_mda(&path).unwrap();
    let pvs = node.metadata()["PVs"].as_map().unwrap();
    assert_eq!(pvs["ioc:userName"].as_map().unwrap()["value"].as_str(), Some("jdoe"));

    let current = pvs["ioc:ringCurrent"].as_map().unwrap();
    assert_eq!(current["value"], MetadataValue::Float(102.5));
    assert_eq!(current["EPICS_type"].as_str(), Some("DBR_CTRL_DOUBLE"));
    assert_eq!(current["unit"].as_str(), Some("mA"));

    let odd = pvs["ioc:odd"].as_map().unwrap();
    assert_eq!(odd["value"], MetadataValue::Null);
    assert_eq!(odd["EPICS_type"].as_str(), Some("unknown #7"));
}

#[test]
fn test_shared_lower_scan_is_malformed() {
    let mut w = two_d(1);
    // point the second outer point at the first inner record as well
    let header_len = 4 + 4 + 4 + 2 * 4 + 4 + 4;
    let lower = header_len + 3 * 4;
    let first = i32::from_be_bytes(w.buf[lower..lower + 4].try_into().unwrap());
    w.patch_i32(lower + 4, first);

    let err = read_mda_bytes(Path::new("shared.mda"), &w.buf).unwrap_err();
    match err {
        ReadError::MalformedStructure { reason, .. } => {
            assert!(reason.contains("more than once"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_oversized_zero_fill_is_malformed() {
    let mut w = Writer::default();
    write_header(&mut w, 1.4, &[3000, 4000]);
    let lower = write_scan(
        &mut w,
        &ScanSpec {
            rank: 2,
            name: "ioc:scan2",
            positioner: vec![0.0; 3000],
            detector: vec![0.0; 3000],
            trigger: None,
        },
    );
    let at = w.pos() as i32;
    w.patch_i32(lower, at);
    write_scan(
        &mut w,
        &ScanSpec {
            rank: 1,
            name: "ioc:scan1",
            positioner: vec![0.0; 4000],
            detector: vec![0.0; 4000],
            trigger: None,
        },
    );
    assert!(w.buf.len() * 64 < 3000 * 4000);

    let err = read_mda_bytes(Path::new("sparse.mda"), &w.buf).unwrap_err();
    match err {
        ReadError::MalformedStructure { reason, .. } => {
            assert!(reason.contains("exceed"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
}
