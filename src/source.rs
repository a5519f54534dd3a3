//! In-memory payloads served by the streaming server.
//!
//! A data source is created once at startup, shared read-only between
//! all transfers and dropped at shutdown. Two shapes exist: a raw byte
//! blob read in arbitrary contiguous ranges, and a columnar table read in
//! row-bounded record batches.

use crate::config::{DatasetKind, ServerConfig};
use crate::{Error, Result};
use rand::{Rng, RngCore};
use std::ops::Range;

/// A fixed-size payload that can be read in arbitrary contiguous slices.
pub trait DataSource: Send + Sync {
    /// Total number of bytes in the source.
    fn total_size(&self) -> u64;

    /// Returns the bytes in `[offset, offset + len)`.
    ///
    /// Callers must stay within `total_size()`.
    fn read_range(&self, offset: u64, len: usize) -> &[u8];
}

/// Splits `[0, total_size)` into consecutive ranges of `chunk_size` bytes.
///
/// Every range is exactly `chunk_size` long except the last, which holds
/// the remainder. An empty source yields no ranges and an exact multiple
/// never yields a trailing empty range.
///
/// # Examples
///
/// ```
/// use streamperf::source::chunk_ranges;
///
/// let ranges: Vec<_> = chunk_ranges(10, 4).collect();
/// assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
/// assert_eq!(chunk_ranges(0, 4).count(), 0);
/// ```
///
/// # Panics
///
/// Panics if `chunk_size` is zero.
pub fn chunk_ranges(total_size: u64, chunk_size: usize) -> ChunkRanges {
    assert!(chunk_size > 0, "chunk size must be positive");
    ChunkRanges {
        offset: 0,
        total_size,
        chunk_size: chunk_size as u64,
    }
}

/// Number of chunks `chunk_ranges` yields: `ceil(total_size / chunk_size)`.
pub fn chunk_count(total_size: u64, chunk_size: usize) -> u64 {
    total_size.div_ceil(chunk_size as u64)
}

/// Iterator returned by [`chunk_ranges`].
#[derive(Debug, Clone)]
pub struct ChunkRanges {
    offset: u64,
    total_size: u64,
    chunk_size: u64,
}

impl Iterator for ChunkRanges {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.total_size {
            return None;
        }
        let start = self.offset;
        let end = start.saturating_add(self.chunk_size).min(self.total_size);
        self.offset = end;
        Some(start..end)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total_size - self.offset).div_ceil(self.chunk_size) as usize;
        (remaining, Some(remaining))
    }
}

/// A raw byte payload.
pub struct BlobSource {
    data: Vec<u8>,
}

impl BlobSource {
    /// Wraps existing bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Generates `size` random bytes.
    pub fn random(size: u64) -> Result<Self> {
        let len = usize::try_from(size)
            .map_err(|_| Error::Config(format!("Payload of {} bytes does not fit in memory", size)))?;
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl DataSource for BlobSource {
    fn total_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, offset: u64, len: usize) -> &[u8] {
        let start = offset as usize;
        &self.data[start..start + len]
    }
}

/// Size of the fixed part of an encoded record batch.
pub const BATCH_HEADER_SIZE: usize = 6;

/// Encoded size of a record batch of `rows` rows and `columns` columns,
/// or `None` if it overflows `usize`.
pub fn encoded_batch_len(columns: usize, rows: usize) -> Option<usize> {
    rows.checked_mul(8)?
        .checked_add(1)?
        .checked_mul(columns)?
        .checked_add(BATCH_HEADER_SIZE)
}

const TYPE_FLOAT64: u8 = 0;
const TYPE_INT64: u8 = 1;

/// Values of one table column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Float64(Vec<f64>),
    Int64(Vec<i64>),
}

impl Column {
    fn len(&self) -> usize {
        match self {
            Column::Float64(values) => values.len(),
            Column::Int64(values) => values.len(),
        }
    }

    fn type_tag(&self) -> u8 {
        match self {
            Column::Float64(_) => TYPE_FLOAT64,
            Column::Int64(_) => TYPE_INT64,
        }
    }

    fn encode_rows(&self, rows: Range<usize>, out: &mut Vec<u8>) {
        match self {
            Column::Float64(values) => {
                for value in &values[rows] {
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
            Column::Int64(values) => {
                for value in &values[rows] {
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub column: Column,
}

/// An immutable columnar table with equal-length columns.
#[derive(Debug, Clone)]
pub struct Table {
    fields: Vec<Field>,
    num_rows: usize,
}

impl Table {
    /// Builds a table from columns that all have the same length.
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        let num_rows = fields.first().map(|f| f.column.len()).unwrap_or(0);
        if let Some(bad) = fields.iter().find(|f| f.column.len() != num_rows) {
            return Err(Error::Config(format!(
                "Column {} has {} rows, expected {}",
                bad.name,
                bad.column.len(),
                num_rows
            )));
        }
        if fields.len() > u16::MAX as usize {
            return Err(Error::Config(format!(
                "Table has {} columns, at most {} are supported",
                fields.len(),
                u16::MAX
            )));
        }
        Ok(Self { fields, num_rows })
    }

    /// `cols` float64 columns named `col0..` filled with uniform random values.
    pub fn random(rows: usize, cols: usize) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let fields = (0..cols)
            .map(|i| Field {
                name: format!("col{}", i),
                column: Column::Float64((0..rows).map(|_| rng.gen::<f64>()).collect()),
            })
            .collect();
        Self::new(fields)
    }

    /// A single int64 column `a` holding `0..rows`.
    pub fn sequence(rows: usize) -> Result<Self> {
        Self::new(vec![Field {
            name: "a".to_string(),
            column: Column::Int64((0..rows as i64).collect()),
        }])
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Iterates the table in batches of at most `max_rows` rows.
    ///
    /// # Panics
    ///
    /// Panics if `max_rows` is zero.
    pub fn batches(&self, max_rows: usize) -> impl Iterator<Item = RecordBatch<'_>> + '_ {
        chunk_ranges(self.num_rows as u64, max_rows)
            .map(move |range| self.batch(range.start as usize..range.end as usize))
    }

    /// The batch holding `rows`, which must lie within `num_rows()`.
    pub fn batch(&self, rows: Range<usize>) -> RecordBatch<'_> {
        RecordBatch { table: self, rows }
    }
}

/// A contiguous row range of a [`Table`].
#[derive(Debug, Clone)]
pub struct RecordBatch<'a> {
    table: &'a Table,
    rows: Range<usize>,
}

impl RecordBatch<'_> {
    pub fn row_range(&self) -> Range<usize> {
        self.rows.clone()
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Size of [`RecordBatch::encode`]'s output.
    pub fn encoded_len(&self) -> usize {
        BATCH_HEADER_SIZE + self.table.fields.len() * (1 + self.num_rows() * 8)
    }

    /// Encodes the batch column-major.
    ///
    /// Layout: `rows: u32 BE`, `columns: u16 BE`, then per column a type
    /// tag byte followed by `rows` little-endian 8-byte values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the row count does not fit the
    /// 32-bit header field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let rows = u32::try_from(self.num_rows()).map_err(|_| {
            Error::Config(format!(
                "Record batch of {} rows exceeds the limit of {}",
                self.num_rows(),
                u32::MAX
            ))
        })?;
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&rows.to_be_bytes());
        out.extend_from_slice(&(self.table.fields.len() as u16).to_be_bytes());
        for field in &self.table.fields {
            out.push(field.column.type_tag());
            field.column.encode_rows(self.rows.clone(), &mut out);
        }
        Ok(out)
    }
}

/// Shape of an encoded record batch, as read back by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchShape {
    pub rows: usize,
    pub columns: usize,
}

/// Validates an encoded record batch and returns its shape.
pub fn decode_batch_shape(buf: &[u8]) -> Result<BatchShape> {
    if buf.len() < BATCH_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "Record batch of {} bytes is shorter than its header",
            buf.len()
        )));
    }
    let rows = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let columns = u16::from_be_bytes([buf[4], buf[5]]) as usize;

    let mut offset = BATCH_HEADER_SIZE;
    for col in 0..columns {
        match buf.get(offset) {
            Some(&TYPE_FLOAT64) | Some(&TYPE_INT64) => {}
            Some(tag) => {
                return Err(Error::Protocol(format!(
                    "Column {} has unknown type tag {}",
                    col, tag
                )))
            }
            None => return Err(Error::Protocol(format!("Column {} is missing", col))),
        }
        offset += 1 + rows * 8;
    }
    if offset != buf.len() {
        return Err(Error::Protocol(format!(
            "Record batch is {} bytes, expected {}",
            buf.len(),
            offset
        )));
    }
    Ok(BatchShape { rows, columns })
}

/// The payload a server holds for its whole lifetime.
pub enum Dataset {
    Blob(BlobSource),
    Table(Table),
}

impl Dataset {
    /// Generates the dataset described by the server configuration.
    pub fn generate(config: &ServerConfig) -> Result<Self> {
        match config.dataset {
            DatasetKind::Blob => Ok(Dataset::Blob(BlobSource::random(config.size)?)),
            DatasetKind::Table => Ok(Dataset::Table(Table::random(
                config.table_rows,
                config.table_cols,
            )?)),
        }
    }

    pub fn kind(&self) -> DatasetKind {
        match self {
            Dataset::Blob(_) => DatasetKind::Blob,
            Dataset::Table(_) => DatasetKind::Table,
        }
    }

    /// Ticket the dataset answers to.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Whether a request ticket selects this dataset; no ticket selects it too.
    pub fn matches_ticket(&self, ticket: Option<&str>) -> bool {
        match ticket {
            None => true,
            Some(t) => t.eq_ignore_ascii_case(self.name()),
        }
    }

    /// Human-readable size for logs.
    pub fn describe(&self) -> String {
        match self {
            Dataset::Blob(blob) => format!("blob of {} bytes", blob.total_size()),
            Dataset::Table(table) => format!(
                "table of {} rows x {} columns",
                table.num_rows(),
                table.num_columns()
            ),
        }
    }
}
