#[macro_use]
extern crate serde;
extern crate log;

use bytes::Bytes;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::io::Write;

pub mod catalog;
pub mod database;
pub mod ids;
pub mod query;
pub mod stats;
pub mod storage_trait;
pub mod table;
pub mod testutil;

pub use query::{PredicateOp, Query};

/// How big each page is
pub const PAGE_SIZE: usize = 4096;
/// Longest string value a column may hold.
pub const MAX_VARCHAR_LEN: usize = 1000;
/// Separates columns in flat files and result streams.
pub const COL_DELIM: u8 = b'|';
/// Terminates a row in flat files and result streams.
pub const ROW_DELIM: u8 = b'\n';

/// Custom error type.
#[derive(Debug, Clone, PartialEq)]
pub enum DbError {
    /// IO Errors.
    IOError(String),
    /// Validation errors.
    ValidationError(String),
    /// Execution errors.
    ExecutionError(String),
    /// A plan alternative cannot be built (e.g. no eligible index).
    PlanError(String),
    /// A buffering operator ran out of its fixed budget.
    ResourceError(String),
    /// Socket failures other than the peer closing the stream.
    TransportError(String),
    /// Malformed plans, bad tags, unknown columns.
    ProtocolError(String),
    /// Failures reported by the index store.
    StorageError(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DbError::ValidationError(s) => format!("Validation Error: {}", s),
                DbError::ExecutionError(s) => format!("Execution Error: {}", s),
                DbError::PlanError(s) => format!("Plan Error: {}", s),
                DbError::ResourceError(s) => format!("Resource Error: {}", s),
                DbError::TransportError(s) => format!("Transport Error: {}", s),
                DbError::ProtocolError(s) => format!("Protocol Error: {}", s),
                DbError::StorageError(s) => format!("Storage Error: {}", s),
                DbError::IOError(s) => s.to_string(),
            }
        )
    }
}

// Implement std::convert::From for AppError; from io::Error
impl From<io::Error> for DbError {
    fn from(error: io::Error) -> Self {
        DbError::IOError(error.to_string())
    }
}

impl From<serde_cbor::Error> for DbError {
    fn from(error: serde_cbor::Error) -> Self {
        DbError::ProtocolError(error.to_string())
    }
}

impl From<storage_trait::ErrCode> for DbError {
    fn from(code: storage_trait::ErrCode) -> Self {
        DbError::StorageError(format!("{:?}", code))
    }
}

impl Error for DbError {}

/// Return type for a query result.
pub struct QueryResult {
    result: String,
}

impl QueryResult {
    /// Return a result with string.
    ///
    /// # Arguments
    ///
    /// * `result` - Result to return.
    pub fn new(result: &str) -> Self {
        Self {
            result: result.to_string(),
        }
    }

    /// Get the result.
    pub fn result(&self) -> &str {
        &self.result
    }
}

/// Handle schemas.
#[derive(PartialEq, Clone, Debug)]
pub struct TableSchema {
    /// Attributes of the schema.
    attributes: Vec<Attribute>,
    /// Mapping from attribute name to order in the schema.
    name_map: HashMap<String, usize>,
}

impl Serialize for TableSchema {
    /// Custom serialize to avoid serializing name_map.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.attributes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TableSchema {
    /// Custom deserialize to avoid serializing name_map.
    fn deserialize<D>(deserializer: D) -> Result<TableSchema, D::Error>
    where
        D: Deserializer<'de>,
    {
        let attrs = Vec::deserialize(deserializer)?;
        Ok(TableSchema::new(attrs))
    }
}

impl TableSchema {
    /// Create a new schema.
    ///
    /// # Arguments
    ///
    /// * `attributes` - Attributes of the schema in the order that they are in the schema.
    pub fn new(attributes: Vec<Attribute>) -> Self {
        let mut name_map = HashMap::new();
        for (i, attr) in attributes.iter().enumerate() {
            name_map.insert(attr.name().to_string(), i);
        }
        Self {
            attributes,
            name_map,
        }
    }

    /// Create a new schema with the given names and dtypes.
    ///
    /// # Arguments
    ///
    /// * `names` - Names of the new schema.
    /// * `dtypes` - Dypes of the new schema.
    pub fn from_vecs(names: Vec<&str>, dtypes: Vec<DataType>) -> Self {
        let mut attrs = Vec::new();
        for (name, dtype) in names.iter().zip(dtypes.iter()) {
            attrs.push(Attribute::new(name.to_string(), *dtype));
        }
        TableSchema::new(attrs)
    }

    /// Get the attribute from the given index.
    ///
    /// # Arguments
    ///
    /// * `i` - Index of the attribute to look for.
    pub fn get_attribute(&self, i: usize) -> Option<&Attribute> {
        self.attributes.get(i)
    }

    /// Get the index of the attribute.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the attribute to get the index for.
    pub fn get_field_index(&self, name: &str) -> Option<&usize> {
        self.name_map.get(name)
    }

    /// Check if the attribute name is in the schema.
    pub fn contains(&self, name: &str) -> bool {
        self.name_map.contains_key(name)
    }

    /// Get an iterator of the attributes.
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    /// Returns the length of the schema.
    pub fn size(&self) -> usize {
        self.attributes.len()
    }

    /// Type of the primary key, which is always the first attribute.
    pub fn pkey_type(&self) -> DataType {
        self.attributes
            .first()
            .map(|a| a.dtype)
            .unwrap_or(DataType::Int)
    }
}

/// Handle attributes. Pairs the name with the dtype.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Attribute dtype.
    pub dtype: DataType,
}

impl Attribute {
    /// Create a new attribute with the given name and dtype.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the attribute.
    /// * `dtype` - Dtype of the attribute.
    pub fn new(name: String, dtype: DataType) -> Self {
        Self { name, dtype }
    }

    /// Returns the name of the attribute.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the dtype of the attribute.
    pub fn dtype(&self) -> &DataType {
        &self.dtype
    }

    /// Indexed attributes carry a leading underscore.
    pub fn is_indexed(&self) -> bool {
        self.name.starts_with('_')
    }
}

/// Enumerate the supported dtypes.
#[derive(PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy, Debug)]
pub enum DataType {
    Int,
    String,
}

/// Parses an integer column the way flat files store them.
pub fn parse_int(col: &[u8]) -> Option<i64> {
    std::str::from_utf8(col).ok()?.trim().parse::<i64>().ok()
}

/// A typed scalar. Ordering is only meaningful between values of the same type.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, PartialOrd, Ord, Clone, Hash)]
pub enum Value {
    Int(i64),
    Str(Vec<u8>),
}

impl Value {
    /// Builds a string value, truncated to `MAX_VARCHAR_LEN` bytes.
    pub fn str(s: &str) -> Self {
        let bytes = s.as_bytes();
        let len = bytes.len().min(MAX_VARCHAR_LEN);
        Value::Str(bytes[..len].to_vec())
    }

    /// Reads a value out of a raw column.
    ///
    /// # Arguments
    ///
    /// * `col` - Column bytes as found in a flat file or result line.
    /// * `dtype` - Declared type of the column.
    pub fn from_column(col: &[u8], dtype: DataType) -> Result<Self, DbError> {
        match dtype {
            DataType::Int => parse_int(col).map(Value::Int).ok_or_else(|| {
                DbError::ValidationError(format!(
                    "not an integer: {:?}",
                    String::from_utf8_lossy(col)
                ))
            }),
            DataType::String => {
                if col.len() > MAX_VARCHAR_LEN {
                    Err(DbError::ValidationError(format!(
                        "string of {} bytes exceeds {}",
                        col.len(),
                        MAX_VARCHAR_LEN
                    )))
                } else {
                    Ok(Value::Str(col.to_vec()))
                }
            }
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Value::Int(_) => DataType::Int,
            Value::Str(_) => DataType::String,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Textual form, as written in flat files and on result lines.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Int(i) => i.to_string().into_bytes(),
            Value::Str(s) => s.clone(),
        }
    }

    /// Compares a raw column against this value. Returns `None` when the
    /// column cannot be read with this value's type.
    pub fn cmp_column(&self, col: &[u8]) -> Option<Ordering> {
        match self {
            Value::Int(v) => parse_int(col).map(|c| c.cmp(v)),
            Value::Str(v) => Some(col.cmp(&v[..])),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(x) => write!(f, "{}", x),
            Value::Str(x) => write!(f, "{}", String::from_utf8_lossy(x)),
        }
    }
}

/// Compares two raw columns of the given type. Integers compare numerically,
/// strings byte by byte.
pub fn compare_columns(left: &[u8], right: &[u8], dtype: DataType) -> Option<Ordering> {
    match dtype {
        DataType::Int => Some(parse_int(left)?.cmp(&parse_int(right)?)),
        DataType::String => Some(left.cmp(right)),
    }
}

/// Tuple type. Each column is a view into the buffer that produced it.
#[derive(Debug, Eq, PartialEq, Clone, Default)]
pub struct Tuple {
    columns: Vec<Bytes>,
}

impl Tuple {
    /// Create a new tuple with the given column views.
    pub fn new(columns: Vec<Bytes>) -> Self {
        Self { columns }
    }

    /// Creates a tuple owning the textual form of each value.
    pub fn from_values(values: &[Value]) -> Self {
        Self::new(values.iter().map(|v| Bytes::from(v.to_bytes())).collect())
    }

    /// Splits one line (without its terminator) into at most `num_cols` columns.
    /// The last column takes whatever remains of the line.
    ///
    /// # Arguments
    ///
    /// * `line` - The line; columns are slices of it.
    /// * `num_cols` - Expected arity.
    pub fn parse_line(line: Bytes, num_cols: usize) -> Self {
        let mut columns = Vec::with_capacity(num_cols);
        if num_cols == 0 {
            return Self::new(columns);
        }
        let mut start = 0;
        for (i, b) in line.iter().enumerate() {
            if columns.len() + 1 == num_cols {
                break;
            }
            if *b == COL_DELIM {
                columns.push(line.slice(start..i));
                start = i + 1;
            }
        }
        columns.push(line.slice(start..));
        Self::new(columns)
    }

    /// Get the column at index.
    pub fn get(&self, i: usize) -> Option<&Bytes> {
        self.columns.get(i)
    }

    /// Returns an iterator over the columns.
    pub fn columns(&self) -> impl Iterator<Item = &Bytes> {
        self.columns.iter()
    }

    pub fn push(&mut self, col: Bytes) {
        self.columns.push(col);
    }

    /// Return the arity of the tuple.
    pub fn size(&self) -> usize {
        self.columns.len()
    }

    /// Bytes held by the columns, delimiters excluded.
    pub fn byte_len(&self) -> usize {
        self.columns.iter().map(|c| c.len()).sum()
    }

    /// Writes the tuple as one `|`-joined, newline-terminated line.
    pub fn write_line<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                out.write_all(&[COL_DELIM])?;
            }
            out.write_all(col)?;
        }
        out.write_all(&[ROW_DELIM])
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = String::new();
        for col in &self.columns {
            res.push_str(&String::from_utf8_lossy(col));
            res.push('\t');
        }
        write!(f, "{}", res)
    }
}
