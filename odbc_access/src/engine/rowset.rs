use crate::driver::ColumnDescription;
use crate::protocol::{CType, ColumnBuffer, SqlType};

// Declared sizes above this are treated as unbounded and bound at the floor;
// the remainder of any longer value is streamed with `get_data`.
const MAX_BOUND_WIDTH: usize = 64 * 1024;

/// C type and element length a column is bound with.
pub(crate) fn binding_for(column: &ColumnDescription, floor: usize) -> (CType, usize) {
    let ctype = match column.sql_type {
        SqlType::Bit | SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer => CType::Long,
        SqlType::BigInt => CType::SBigInt,
        SqlType::Real | SqlType::Float | SqlType::Double => CType::Double,
        SqlType::Date => CType::Date,
        SqlType::Timestamp => CType::Timestamp,
        t if t.is_binary() => CType::Binary,
        _ => CType::Char,
    };
    if let Some(width) = ctype.fixed_width() {
        return (ctype, width);
    }

    let declared = match column.sql_type {
        // Sign, decimal point and terminator on top of the precision.
        SqlType::Decimal | SqlType::Numeric => column.column_size + 3,
        t if t.is_long() => 0,
        _ if column.column_size == 0 || column.column_size > MAX_BOUND_WIDTH => 0,
        _ if ctype.is_nul_terminated() => column.column_size + 1,
        _ => column.column_size,
    };
    (ctype, declared.max(floor).max(1))
}

/// The bound buffer block of one result set: one column buffer per result
/// column, each with room for a full rowset.
#[derive(Debug)]
pub(crate) struct Rowset {
    buffers: Vec<ColumnBuffer>,
    capacity: usize,
    rows: usize,
}

impl Rowset {
    pub fn bind(columns: &[ColumnDescription], rowset_size: usize, floor: usize) -> Self {
        let capacity = rowset_size.max(1);
        let buffers = columns
            .iter()
            .map(|c| {
                let (ctype, len) = binding_for(c, floor);
                ColumnBuffer::new(ctype, len, capacity)
            })
            .collect();
        Self {
            buffers,
            capacity,
            rows: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rows filled by the last fetch.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn set_rows(&mut self, rows: usize) {
        self.rows = rows.min(self.capacity);
    }

    pub fn buffer(&self, column: usize) -> Option<&ColumnBuffer> {
        self.buffers.get(column)
    }

    /// Buffers ready to receive a fetch, with stale indicators cleared.
    pub fn prepare_fetch(&mut self) -> &mut [ColumnBuffer] {
        self.rows = 0;
        for b in &mut self.buffers {
            b.clear_indicators();
        }
        &mut self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(sql_type: SqlType, column_size: usize) -> ColumnDescription {
        ColumnDescription {
            name: "c".to_string(),
            sql_type,
            column_size,
            ..ColumnDescription::default()
        }
    }

    #[test]
    fn test_integers_bind_fixed_width() {
        assert_eq!(binding_for(&column(SqlType::Integer, 10), 1024), (CType::Long, 4));
        assert_eq!(binding_for(&column(SqlType::Bit, 1), 1024), (CType::Long, 4));
        assert_eq!(binding_for(&column(SqlType::BigInt, 19), 1024), (CType::SBigInt, 8));
        assert_eq!(binding_for(&column(SqlType::Real, 7), 1024), (CType::Double, 8));
    }

    #[test]
    fn test_character_columns_respect_floor() {
        assert_eq!(binding_for(&column(SqlType::Varchar, 10), 1024), (CType::Char, 1024));
        assert_eq!(binding_for(&column(SqlType::Varchar, 4000), 1024), (CType::Char, 4001));
        assert_eq!(binding_for(&column(SqlType::Varbinary, 4000), 1024), (CType::Binary, 4000));
    }

    #[test]
    fn test_long_and_unbounded_columns_use_floor() {
        assert_eq!(
            binding_for(&column(SqlType::LongVarchar, 2_147_483_647), 1024),
            (CType::Char, 1024)
        );
        assert_eq!(binding_for(&column(SqlType::Varchar, 0), 512), (CType::Char, 512));
        assert_eq!(
            binding_for(&column(SqlType::Varbinary, 1 << 20), 1024),
            (CType::Binary, 1024)
        );
    }

    #[test]
    fn test_decimal_binds_as_text() {
        assert_eq!(binding_for(&column(SqlType::Decimal, 38), 16), (CType::Char, 41));
    }

    #[test]
    fn test_rowset_sizes_every_buffer() {
        let cols = vec![column(SqlType::Integer, 10), column(SqlType::Varchar, 20)];
        let mut rowset = Rowset::bind(&cols, 8, 64);
        assert_eq!(rowset.capacity(), 8);
        assert_eq!(rowset.buffer(1).map(|b| b.capacity()), Some(8));
        assert!(rowset.buffer(2).is_none());
        rowset.set_rows(20);
        assert_eq!(rowset.rows(), 8);
        assert_eq!(rowset.prepare_fetch().len(), 2);
        assert_eq!(rowset.rows(), 0);
    }
}
