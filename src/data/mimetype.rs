//! Content-type classification for files handed to the readers.
//!
//! Precedence, highest first:
//!
//! 1. `.log` anywhere in the file name (or a `/.log` path segment) → `text/plain`
//! 2. a mimetype already known to the caller
//! 3. the [`PROBE_TABLE`], in declaration order; first match wins, default `text/csv`
//! 4. a base name of exactly `README` → `text/readme`, whatever came before
//!
//! Anything still undetermined after that is written to the unrecognized-file
//! log. Because rule 3 always supplies its default, that branch cannot be
//! reached through [`MimetypeDetector::detect`] today; it is kept behind the
//! still-undetermined check rather than folded into rule 3.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use log::debug;

use crate::config::Settings;
use crate::data::spec;

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_CSV: &str = "text/csv";
pub const TEXT_README: &str = "text/readme";
pub const SPEC_DATA: &str = "text/spec_data";
pub const HDF5: &str = "application/x-hdf5";
pub const MDA: &str = "application/x-mda";
pub const IGNORE: &str = "application/x-ignore";

/// Written in place of the (absent) mimetype in the unrecognized-file log.
pub const NULL_MARKER: &str = "<null>";

const HDF5_SIGNATURE: &[u8; 8] = b"\x89HDF\r\n\x1a\n";

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// Result of running one content probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Match,
    NoMatch,
    /// The probe could not run to completion; counts as no match.
    Failed(String),
}

/// A named content test paired with the mimetype it establishes.
pub struct MimeProbe {
    pub name: &'static str,
    pub mimetype: &'static str,
    test: fn(&Path, usize) -> io::Result<bool>,
}

impl MimeProbe {
    pub fn run(&self, path: &Path, sniff_bytes: usize) -> ProbeOutcome {
        match (self.test)(path, sniff_bytes) {
            Ok(true) => ProbeOutcome::Match,
            Ok(false) => ProbeOutcome::NoMatch,
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        }
    }
}

/// Probes in evaluation order. The order is part of the contract: SPEC text
/// is tested before either HDF5 sniff.
pub const PROBE_TABLE: [MimeProbe; 3] = [
    MimeProbe {
        name: "spec_file_with_header",
        mimetype: SPEC_DATA,
        test: spec::is_spec_file_with_header,
    },
    MimeProbe {
        name: "nexus",
        mimetype: HDF5,
        test: is_nexus,
    },
    MimeProbe {
        name: "hdf5",
        mimetype: HDF5,
        test: is_hdf5,
    },
];

/// Read up to `limit` bytes from the start of a file.
pub(crate) fn read_head(path: &Path, limit: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path)?.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// HDF5 superblock signature at offset 0 or at a power-of-two user-block
/// offset (512, 1024, 2048, ...).
fn is_hdf5(path: &Path, _sniff_bytes: usize) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut offset = 0u64;
    while offset + HDF5_SIGNATURE.len() as u64 <= size {
        file.seek(SeekFrom::Start(offset))?;
        let mut sig = [0u8; 8];
        file.read_exact(&mut sig)?;
        if &sig == HDF5_SIGNATURE {
            return Ok(true);
        }
        offset = if offset == 0 { 512 } else { offset * 2 };
    }
    Ok(false)
}

/// HDF5 file whose head mentions the NeXus `NX_class` attribute.
fn is_nexus(path: &Path, sniff_bytes: usize) -> io::Result<bool> {
    let head = read_head(path, sniff_bytes)?;
    Ok(head.starts_with(HDF5_SIGNATURE) && head.windows(8).any(|w| w == b"NX_class"))
}

// ---------------------------------------------------------------------------
// Unrecognized-file log
// ---------------------------------------------------------------------------

static LOG_GUARD: Mutex<()> = Mutex::new(());

/// Append-only record of files whose mimetype stayed undetermined.
#[derive(Debug, Clone)]
pub struct UnrecognizedLog {
    path: PathBuf,
}

impl UnrecognizedLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `<null> <filename>` line.
    ///
    /// Serialized within the process by a mutex and across processes by an
    /// exclusive lock on the log file; each line is written with one call.
    pub fn record(&self, filename: &Path) -> io::Result<()> {
        let _guard = LOG_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let line = format!("{NULL_MARKER} {}\n", filename.display());
        let written = file.write_all(line.as_bytes());
        file.unlock()?;
        written
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MimetypeDetector {
    log: UnrecognizedLog,
    sniff_bytes: usize,
}

impl MimetypeDetector {
    pub fn new(settings: &Settings) -> Self {
        Self {
            log: UnrecognizedLog::new(&settings.unrecognized_log),
            sniff_bytes: settings.sniff_bytes,
        }
    }

    pub fn log(&self) -> &UnrecognizedLog {
        &self.log
    }

    /// Decide the mimetype of `filename`, honoring `known` unless a file
    /// name override applies.
    pub fn detect(&self, filename: &Path, known: Option<&str>) -> String {
        let lower_path = filename.to_string_lossy().to_lowercase();
        let name = filename
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut mimetype = if lower_path.contains("/.log") || name.to_lowercase().contains(".log") {
            Some(TEXT_PLAIN.to_string())
        } else {
            known.map(str::to_string)
        };

        if mimetype.is_none() {
            mimetype = Some(self.probe(filename).to_string());
        }

        if name == "README" {
            mimetype = Some(TEXT_README.to_string());
        }

        match mimetype {
            Some(m) => m,
            None => {
                if let Err(e) = self.log.record(filename) {
                    log::warn!("cannot append to {}: {e}", self.log.path().display());
                }
                TEXT_CSV.to_string()
            }
        }
    }

    /// Run the probe table; `text/csv` when nothing matches.
    fn probe(&self, filename: &Path) -> &'static str {
        for probe in &PROBE_TABLE {
            match probe.run(filename, self.sniff_bytes) {
                ProbeOutcome::Match => {
                    debug!("{}: matched probe {}", filename.display(), probe.name);
                    return probe.mimetype;
                }
                ProbeOutcome::NoMatch => {}
                ProbeOutcome::Failed(reason) => {
                    debug!("{}: probe {} failed: {reason}", filename.display(), probe.name);
                }
            }
        }
        TEXT_CSV
    }
}
