//! Table and tablet identity: table ids, key extents, and metadata levels.

use std::fmt;

use crate::codec::{put_bytes, put_opt_bytes, read_bytes_at, read_opt_bytes_at};

/// Id of the root table, which holds the metadata of the metadata table.
pub const ROOT_TABLE_ID: &str = "!r";
/// Id of the metadata table, which holds the metadata of user tables.
pub const METADATA_TABLE_ID: &str = "!m";

/// Identifier of a table. User tables get short printable ids assigned at
/// creation; the root and metadata tables have well-known ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(String);

impl TableId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn root() -> Self {
        Self::new(ROOT_TABLE_ID)
    }

    pub fn metadata() -> Self {
        Self::new(METADATA_TABLE_ID)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_TABLE_ID
    }

    pub fn is_metadata(&self) -> bool {
        self.0 == METADATA_TABLE_ID
    }
}

impl From<&str> for TableId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Row range owned by one tablet: rows in `(prev_end_row, end_row]`.
///
/// `end_row == None` means +inf and `prev_end_row == None` means -inf, so a
/// single-tablet table is `(None, None)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyExtent {
    table_id: TableId,
    end_row: Option<Vec<u8>>,
    prev_end_row: Option<Vec<u8>>,
}

impl KeyExtent {
    pub fn new(
        table_id: TableId,
        end_row: Option<Vec<u8>>,
        prev_end_row: Option<Vec<u8>>,
    ) -> Self {
        Self {
            table_id,
            end_row,
            prev_end_row,
        }
    }

    /// The extent covering all rows of `table_id`.
    pub fn whole_table(table_id: TableId) -> Self {
        Self::new(table_id, None, None)
    }

    /// The root tablet's identity before the root table was split out of the
    /// metadata table. Old write-ahead logs may define the root tablet under
    /// this extent, so recovery matches it as an alias of the root extent.
    pub fn old_root() -> Self {
        Self::whole_table(TableId::metadata())
    }

    pub fn table_id(&self) -> &TableId {
        &self.table_id
    }

    pub fn end_row(&self) -> Option<&[u8]> {
        self.end_row.as_deref()
    }

    pub fn prev_end_row(&self) -> Option<&[u8]> {
        self.prev_end_row.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.table_id.is_root()
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        put_bytes(out, self.table_id.as_str().as_bytes());
        put_opt_bytes(out, self.end_row.as_deref());
        put_opt_bytes(out, self.prev_end_row.as_deref());
    }

    pub(crate) fn decode_from(buf: &[u8], offset: &mut usize) -> anyhow::Result<Self> {
        let table_id = read_bytes_at(buf, offset)?;
        let table_id = String::from_utf8(table_id).map_err(|_| anyhow::anyhow!("table id is not utf-8"))?;
        let end_row = read_opt_bytes_at(buf, offset)?;
        let prev_end_row = read_opt_bytes_at(buf, offset)?;
        Ok(Self::new(TableId::new(table_id), end_row, prev_end_row))
    }
}

impl fmt::Display for KeyExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn row(r: Option<&[u8]>, inf: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match r {
                Some(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
                None => f.write_str(inf),
            }
        }
        write!(f, "{};", self.table_id)?;
        row(self.end_row(), "+inf", f)?;
        f.write_str(";")?;
        row(self.prev_end_row(), "-inf", f)
    }
}

/// Tier of the metadata hierarchy a table belongs to. Full metadata scans,
/// and therefore compaction queue generation tracking, are partitioned by
/// level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataLevel {
    Root,
    Metadata,
    User,
}

impl DataLevel {
    pub const ALL: [DataLevel; 3] = [DataLevel::Root, DataLevel::Metadata, DataLevel::User];

    /// The level of the metadata hierarchy that holds `table_id`'s tablets.
    pub fn of(table_id: &TableId) -> Self {
        if table_id.is_root() {
            DataLevel::Root
        } else if table_id.is_metadata() {
            DataLevel::Metadata
        } else {
            DataLevel::User
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            DataLevel::Root => 0,
            DataLevel::Metadata => 1,
            DataLevel::User => 2,
        }
    }
}

impl fmt::Display for DataLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataLevel::Root => f.write_str("root"),
            DataLevel::Metadata => f.write_str("metadata"),
            DataLevel::User => f.write_str("user"),
        }
    }
}
