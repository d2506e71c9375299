use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use ndarray::ArrayD;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

// ---------------------------------------------------------------------------
// MetadataValue – one JSON-compatible metadata entry
// ---------------------------------------------------------------------------

/// Metadata mapping carried by every node.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A dynamically-typed, JSON-compatible metadata value.
///
/// Source values with no JSON counterpart (byte strings, rationals, errors)
/// are converted by the readers before they get here.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<MetadataValue>),
    Map(Metadata),
}

impl MetadataValue {
    /// Store a float, rendering NaN and infinities as text since JSON has no
    /// literal for them.
    pub fn from_f64(value: f64) -> Self {
        if value.is_finite() {
            MetadataValue::Float(value)
        } else if value.is_nan() {
            MetadataValue::String("NaN".to_string())
        } else if value > 0.0 {
            MetadataValue::String("inf".to_string())
        } else {
            MetadataValue::String("-inf".to_string())
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(v) => Some(*v),
            MetadataValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MetadataValue]> {
        match self {
            MetadataValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Metadata> {
        match self {
            MetadataValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Key path of the first nested value with no JSON representation.
    fn first_non_json(&self, key: &str) -> Option<String> {
        match self {
            MetadataValue::Float(v) if !v.is_finite() => Some(key.to_string()),
            MetadataValue::List(items) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| item.first_non_json(&format!("{key}[{i}]"))),
            MetadataValue::Map(map) => first_non_json(map, Some(key)),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::String(s) => write!(f, "{s}"),
            MetadataValue::Integer(i) => write!(f, "{i}"),
            MetadataValue::Float(v) => write!(f, "{v}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Null => write!(f, "<null>"),
            MetadataValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            MetadataValue::Map(map) => write!(f, "{{{} keys}}", map.len()),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<i32> for MetadataValue {
    fn from(value: i32) -> Self {
        MetadataValue::Integer(i64::from(value))
    }
}

impl From<u32> for MetadataValue {
    fn from(value: u32) -> Self {
        MetadataValue::Integer(i64::from(value))
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        MetadataValue::Integer(value as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::from_f64(value)
    }
}

impl From<f32> for MetadataValue {
    fn from(value: f32) -> Self {
        MetadataValue::from_f64(f64::from(value))
    }
}

impl From<Metadata> for MetadataValue {
    fn from(value: Metadata) -> Self {
        MetadataValue::Map(value)
    }
}

impl<T: Into<MetadataValue>> From<Vec<T>> for MetadataValue {
    fn from(value: Vec<T>) -> Self {
        MetadataValue::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<MetadataValue>> From<Option<T>> for MetadataValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(MetadataValue::Null, Into::into)
    }
}

fn first_non_json(metadata: &Metadata, prefix: Option<&str>) -> Option<String> {
    metadata.iter().find_map(|(key, value)| {
        let path = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        value.first_non_json(&path)
    })
}

/// Replace values without a JSON form by their text rendering.
fn sanitize(metadata: Metadata) -> Metadata {
    fn fix(value: MetadataValue) -> MetadataValue {
        match value {
            MetadataValue::Float(v) => MetadataValue::from_f64(v),
            MetadataValue::List(items) => MetadataValue::List(items.into_iter().map(fix).collect()),
            MetadataValue::Map(map) => MetadataValue::Map(sanitize(map)),
            other => other,
        }
    }
    metadata.into_iter().map(|(k, v)| (k, fix(v))).collect()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rejected node construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConstructionError {
    #[error("duplicate child name: {name}")]
    DuplicateChild { name: String },

    #[error("metadata value at '{key}' has no JSON representation")]
    NonJsonValue { key: String },
}

// ---------------------------------------------------------------------------
// ArrayData – homogeneous N-d numeric payload
// ---------------------------------------------------------------------------

/// Element type of an [`ArrayNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Uint8,
    Uint16,
    Int32,
    Float32,
    Float64,
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::Uint8 => "uint8",
            ElementType::Uint16 => "uint16",
            ElementType::Int32 => "int32",
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// Owned N-dimensional array of one element type.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Uint8(ArrayD<u8>),
    Uint16(ArrayD<u16>),
    Int32(ArrayD<i32>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
}

impl ArrayData {
    pub fn dtype(&self) -> ElementType {
        match self {
            ArrayData::Uint8(_) => ElementType::Uint8,
            ArrayData::Uint16(_) => ElementType::Uint16,
            ArrayData::Int32(_) => ElementType::Int32,
            ArrayData::Float32(_) => ElementType::Float32,
            ArrayData::Float64(_) => ElementType::Float64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            ArrayData::Uint8(a) => a.shape(),
            ArrayData::Uint16(a) => a.shape(),
            ArrayData::Int32(a) => a.shape(),
            ArrayData::Float32(a) => a.shape(),
            ArrayData::Float64(a) => a.shape(),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements widened to `f64`, in row-major order.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            ArrayData::Uint8(a) => a.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::Uint16(a) => a.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::Int32(a) => a.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::Float32(a) => a.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::Float64(a) => a.iter().copied().collect(),
        }
    }
}

impl Serialize for ArrayData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ArrayData::Uint8(a) => serializer.collect_seq(a.iter()),
            ArrayData::Uint16(a) => serializer.collect_seq(a.iter()),
            ArrayData::Int32(a) => serializer.collect_seq(a.iter()),
            // serde_json writes non-finite floats as null
            ArrayData::Float32(a) => serializer.collect_seq(a.iter()),
            ArrayData::Float64(a) => serializer.collect_seq(a.iter()),
        }
    }
}

impl From<ArrayD<u8>> for ArrayData {
    fn from(value: ArrayD<u8>) -> Self {
        ArrayData::Uint8(value)
    }
}

impl From<ArrayD<u16>> for ArrayData {
    fn from(value: ArrayD<u16>) -> Self {
        ArrayData::Uint16(value)
    }
}

impl From<ArrayD<i32>> for ArrayData {
    fn from(value: ArrayD<i32>) -> Self {
        ArrayData::Int32(value)
    }
}

impl From<ArrayD<f32>> for ArrayData {
    fn from(value: ArrayD<f32>) -> Self {
        ArrayData::Float32(value)
    }
}

impl From<ArrayD<f64>> for ArrayData {
    fn from(value: ArrayD<f64>) -> Self {
        ArrayData::Float64(value)
    }
}

impl From<Vec<f64>> for ArrayData {
    fn from(value: Vec<f64>) -> Self {
        ArrayData::Float64(ndarray::Array1::from(value).into_dyn())
    }
}

impl From<Vec<f32>> for ArrayData {
    fn from(value: Vec<f32>) -> Self {
        ArrayData::Float32(ndarray::Array1::from(value).into_dyn())
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Leaf node: one array plus its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayNode {
    data: ArrayData,
    metadata: Metadata,
}

impl ArrayNode {
    pub fn new(data: impl Into<ArrayData>, metadata: Metadata) -> Result<Self, ConstructionError> {
        if let Some(key) = first_non_json(&metadata, None) {
            return Err(ConstructionError::NonJsonValue { key });
        }
        Ok(Self {
            data: data.into(),
            metadata,
        })
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn dtype(&self) -> ElementType {
        self.data.dtype()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Serialize for ArrayNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ArrayNode", 4)?;
        s.serialize_field("dtype", &self.data.dtype())?;
        s.serialize_field("shape", self.data.shape())?;
        s.serialize_field("metadata", &self.metadata)?;
        s.serialize_field("data", &self.data)?;
        s.end()
    }
}

/// Internal node: named children in insertion order plus metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingNode {
    children: Vec<(String, Node)>,
    metadata: Metadata,
}

impl MappingNode {
    pub fn new<I>(children: I, metadata: Metadata) -> Result<Self, ConstructionError>
    where
        I: IntoIterator<Item = (String, Node)>,
    {
        let mut seen = std::collections::BTreeSet::new();
        let mut collected = Vec::new();
        for (name, node) in children {
            if !seen.insert(name.clone()) {
                return Err(ConstructionError::DuplicateChild { name });
            }
            collected.push((name, node));
        }
        if let Some(key) = first_non_json(&metadata, None) {
            return Err(ConstructionError::NonJsonValue { key });
        }
        Ok(Self {
            children: collected,
            metadata,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }

    /// Child names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.children.iter().map(|(n, node)| (n.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

struct Contents<'a>(&'a [(String, Node)]);

impl Serialize for Contents<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(name, node)| (name, node)))
    }
}

impl Serialize for MappingNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("MappingNode", 2)?;
        s.serialize_field("metadata", &self.metadata)?;
        s.serialize_field("contents", &Contents(&self.children))?;
        s.end()
    }
}

/// A tree unit produced by the readers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "structure_family", rename_all = "lowercase")]
pub enum Node {
    Array(ArrayNode),
    Mapping(MappingNode),
}

impl Node {
    pub fn metadata(&self) -> &Metadata {
        match self {
            Node::Array(a) => a.metadata(),
            Node::Mapping(m) => m.metadata(),
        }
    }

    pub fn as_array(&self) -> Option<&ArrayNode> {
        match self {
            Node::Array(a) => Some(a),
            Node::Mapping(_) => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&MappingNode> {
        match self {
            Node::Mapping(m) => Some(m),
            Node::Array(_) => None,
        }
    }

    /// Indented one-line-per-node summary of the tree.
    pub fn structure(&self) -> String {
        let mut out = String::new();
        self.write_structure(None, 0, &mut out);
        out
    }

    fn write_structure(&self, name: Option<&str>, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        let label = name.map(|n| format!("{n} ")).unwrap_or_default();
        match self {
            Node::Array(a) => {
                let _ = writeln!(out, "{indent}{label}<array {} {:?}>", a.dtype(), a.shape());
            }
            Node::Mapping(m) => {
                let _ = writeln!(out, "{indent}{label}<mapping> ({} items)", m.len());
                for (child_name, child) in m.iter() {
                    child.write_structure(Some(child_name), depth + 1, out);
                }
            }
        }
    }
}

impl From<ArrayNode> for Node {
    fn from(value: ArrayNode) -> Self {
        Node::Array(value)
    }
}

impl From<MappingNode> for Node {
    fn from(value: MappingNode) -> Self {
        Node::Mapping(value)
    }
}

// ---------------------------------------------------------------------------
// Construction entry points
// ---------------------------------------------------------------------------

pub fn make_array(
    values: impl Into<ArrayData>,
    metadata: Metadata,
) -> Result<ArrayNode, ConstructionError> {
    ArrayNode::new(values, metadata)
}

pub fn make_mapping<I>(children: I, metadata: Metadata) -> Result<MappingNode, ConstructionError>
where
    I: IntoIterator<Item = (String, Node)>,
{
    MappingNode::new(children, metadata)
}

/// Diagnostic stand-in for content that could not (or should not) be read:
/// a mapping with a single zero-length `ignore` array.
pub fn placeholder(metadata: Metadata) -> MappingNode {
    let mut ignore_md = Metadata::new();
    ignore_md.insert("ignore".into(), "placeholder, ignore".into());
    let ignore = ArrayNode {
        data: ArrayData::from(Vec::<f64>::new()),
        metadata: ignore_md,
    };
    MappingNode {
        children: vec![("ignore".to_string(), Node::Array(ignore))],
        metadata: sanitize(metadata),
    }
}
