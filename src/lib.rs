pub mod config;
pub mod data;
pub mod error;

pub use config::Settings;
pub use data::loader::{read_directory, read_file, read_ignore, reader_for};
pub use data::mimetype::MimetypeDetector;
pub use data::model::{ArrayNode, MappingNode, Metadata, MetadataValue, Node};
pub use error::{ReadError, ReadResult};
