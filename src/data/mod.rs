//! Data layer: the node tree, detection, and the per-format readers.
//!
//! Architecture:
//! ```text
//!   any file
//!       │
//!       ▼
//!   ┌──────────┐
//!   │ mimetype │  overrides → probe table → text/csv
//!   └──────────┘
//!       │
//!       ▼
//!   ┌──────────┐
//!   │  loader  │  mimetype → reader
//!   └──────────┘
//!       │
//!       ├── spec   (SPEC text: headers + scans)
//!       ├── mda    (synApps XDR scans)
//!       ├── image  (band-first pixels + EXIF)
//!       └── ignore (placeholder)
//!       │
//!       ▼
//!   ┌──────────┐
//!   │  model   │  Node = ArrayNode | MappingNode
//!   └──────────┘
//! ```

pub mod exif_tags;
pub mod image;
pub mod loader;
pub mod mda;
pub mod mimetype;
pub mod model;
pub mod spec;
