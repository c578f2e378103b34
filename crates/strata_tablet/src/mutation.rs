//! The mutation model carried by WAL values and replayed into tablets.

use crate::codec::{put_bytes, put_opt_bytes, put_u32, read_bytes_at, read_opt_bytes_at, read_u32_at};

/// One column-level change within a mutation. `value == None` is a delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnUpdate {
    pub column: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// A batch of column updates applied atomically to one row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    row: Vec<u8>,
    updates: Vec<ColumnUpdate>,
}

impl Mutation {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            updates: Vec::new(),
        }
    }

    pub fn put(&mut self, column: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.updates.push(ColumnUpdate {
            column: column.into(),
            value: Some(value.into()),
        });
    }

    pub fn delete(&mut self, column: impl Into<Vec<u8>>) {
        self.updates.push(ColumnUpdate {
            column: column.into(),
            value: None,
        });
    }

    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn updates(&self) -> &[ColumnUpdate] {
        &self.updates
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        put_bytes(out, &self.row);
        put_u32(out, self.updates.len() as u32);
        for update in &self.updates {
            put_bytes(out, &update.column);
            put_opt_bytes(out, update.value.as_deref());
        }
    }

    pub(crate) fn decode_from(buf: &[u8], offset: &mut usize) -> anyhow::Result<Self> {
        let row = read_bytes_at(buf, offset)?;
        let count = read_u32_at(buf, offset)? as usize;
        let mut updates = Vec::with_capacity(count);
        for _ in 0..count {
            let column = read_bytes_at(buf, offset)?;
            let value = read_opt_bytes_at(buf, offset)?;
            updates.push(ColumnUpdate { column, value });
        }
        Ok(Self { row, updates })
    }
}
