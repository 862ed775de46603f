use crate::driver::{ColumnDescription, DiagRecord};
use crate::protocol::{CType, ColumnBuffer, Date, ParamBuffer, SqlType, Timestamp, NULL_DATA};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub(crate) type SqlResult<T> = std::result::Result<T, DiagRecord>;

pub(crate) fn diag(state: &str, message: impl Into<String>) -> DiagRecord {
    DiagRecord::new(state, 0, message)
}

fn out_of_range() -> DiagRecord {
    diag("22003", "Numeric value out of range")
}

fn invalid_cast() -> DiagRecord {
    diag("22018", "Invalid character value for cast specification")
}

fn restricted(ctype: CType) -> DiagRecord {
    diag(
        "07006",
        format!("Restricted data type attribute violation: cannot convert to {:?}", ctype),
    )
}

/// A stored cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(Date),
    Timestamp(Timestamp),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_i64(&self) -> SqlResult<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Double(v) => truncate_f64(*v),
            Value::Text(s) => {
                let s = s.trim();
                if let Ok(v) = s.parse::<i64>() {
                    return Ok(v);
                }
                match s.parse::<f64>() {
                    Ok(v) => truncate_f64(v),
                    Err(_) => Err(invalid_cast()),
                }
            }
            _ => Err(invalid_cast()),
        }
    }

    /// SQL equality; NULL never compares equal.
    pub fn sql_eq(&self, other: &Value) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        self.sort_cmp(other) == Ordering::Equal
    }

    /// Total order used by ORDER BY. NULLs sort first.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Date(a), Value::Timestamp(b)) => Timestamp::from(*a).cmp(b),
            (Value::Timestamp(a), Value::Date(b)) => a.cmp(&Timestamp::from(*b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => a.to_text().cmp(&b.to_text()),
            },
        }
    }

    fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => b.iter().map(|x| format!("{:02X}", x)).collect(),
            Value::Date(d) => d.to_string(),
            Value::Timestamp(t) => t.to_string(),
        }
    }

    /// Type a literal or parameter reports when it appears in a select list.
    pub fn describe(&self, name: &str) -> ColumnDescription {
        let (sql_type, column_size, decimal_digits) = match self {
            Value::Null => (SqlType::Varchar, 1, 0),
            Value::Int(_) => (SqlType::Integer, 10, 0),
            Value::Double(_) => (SqlType::Double, 15, 0),
            Value::Text(s) => (SqlType::Varchar, s.len().max(1), 0),
            Value::Bytes(b) => (SqlType::Varbinary, b.len().max(1), 0),
            Value::Date(_) => (SqlType::Date, 10, 0),
            Value::Timestamp(_) => (SqlType::Timestamp, 29, 9),
        };
        ColumnDescription {
            name: name.to_string(),
            sql_type,
            column_size,
            decimal_digits,
            nullable: Some(self.is_null()),
        }
    }
}

fn truncate_f64(v: f64) -> SqlResult<i64> {
    if !v.is_finite() || v >= 9.223_372_036_854_775_807e18 || v < -9.223_372_036_854_775_808e18 {
        return Err(out_of_range());
    }
    Ok(v.trunc() as i64)
}

/// Declared column of a stored table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub size: usize,
    pub digits: i16,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn description(&self) -> ColumnDescription {
        ColumnDescription {
            name: self.name.clone(),
            sql_type: self.sql_type,
            column_size: self.size,
            decimal_digits: self.digits,
            nullable: Some(self.nullable),
        }
    }

    /// Converts `value` into this column's storage form.
    pub fn coerce(&self, value: Value) -> SqlResult<Value> {
        if value.is_null() {
            if !self.nullable {
                return Err(diag(
                    "23000",
                    format!("Cannot insert NULL into column '{}'", self.name),
                ));
            }
            return Ok(Value::Null);
        }
        match self.sql_type {
            SqlType::Bit => match value.as_i64()? {
                v @ (0 | 1) => Ok(Value::Int(v)),
                _ => Err(out_of_range()),
            },
            SqlType::TinyInt => int_in(value.as_i64()?, 0, 255),
            SqlType::SmallInt => int_in(value.as_i64()?, i16::MIN as i64, i16::MAX as i64),
            SqlType::Integer => int_in(value.as_i64()?, i32::MIN as i64, i32::MAX as i64),
            SqlType::BigInt => Ok(Value::Int(value.as_i64()?)),
            SqlType::Real | SqlType::Float | SqlType::Double => {
                value.as_f64().map(Value::Double).ok_or_else(invalid_cast)
            }
            SqlType::Decimal | SqlType::Numeric => self.coerce_decimal(&value),
            SqlType::Char | SqlType::WChar => {
                let text = self.coerce_text(value)?;
                let width = text.chars().count();
                Ok(Value::Text(if width < self.size {
                    format!("{}{}", text, " ".repeat(self.size - width))
                } else {
                    text
                }))
            }
            SqlType::Varchar | SqlType::WVarchar | SqlType::LongVarchar | SqlType::WLongVarchar => {
                self.coerce_text(value).map(Value::Text)
            }
            SqlType::Binary | SqlType::Varbinary | SqlType::LongVarbinary => {
                let bytes = match value {
                    Value::Bytes(b) => b,
                    Value::Text(s) => s.into_bytes(),
                    _ => return Err(invalid_cast()),
                };
                if !self.sql_type.is_long() && bytes.len() > self.size {
                    return Err(diag("22001", "String or binary data would be truncated"));
                }
                Ok(Value::Bytes(bytes))
            }
            SqlType::Date => match value {
                Value::Date(d) => Ok(Value::Date(d)),
                Value::Timestamp(t) => Ok(Value::Date(t.date())),
                Value::Text(s) => s.parse().map(Value::Date).map_err(|_| invalid_cast()),
                _ => Err(invalid_cast()),
            },
            SqlType::Timestamp => match value {
                Value::Timestamp(t) => Ok(Value::Timestamp(t)),
                Value::Date(d) => Ok(Value::Timestamp(d.into())),
                Value::Text(s) => s.parse().map(Value::Timestamp).map_err(|_| invalid_cast()),
                _ => Err(invalid_cast()),
            },
            SqlType::Time | SqlType::Guid | SqlType::Unknown(_) => Ok(Value::Text(value.to_text())),
        }
    }

    fn coerce_text(&self, value: Value) -> SqlResult<String> {
        let text = match value {
            Value::Text(s) => s,
            Value::Bytes(_) => return Err(invalid_cast()),
            other => other.to_text(),
        };
        if !self.sql_type.is_long() && text.chars().count() > self.size {
            return Err(diag("22001", "String or binary data would be truncated"));
        }
        Ok(text)
    }

    fn coerce_decimal(&self, value: &Value) -> SqlResult<Value> {
        let v = value.as_f64().ok_or_else(invalid_cast)?;
        let scale = self.digits.max(0) as usize;
        let text = format!("{:.*}", scale, v);
        let int_digits = text
            .trim_start_matches('-')
            .split('.')
            .next()
            .map(|p| p.trim_start_matches('0').len())
            .unwrap_or(0);
        if self.size > 0 && int_digits > self.size.saturating_sub(scale) {
            return Err(out_of_range());
        }
        Ok(Value::Text(text))
    }
}

fn int_in(v: i64, lo: i64, hi: i64) -> SqlResult<Value> {
    if v < lo || v > hi {
        return Err(out_of_range());
    }
    Ok(Value::Int(v))
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> SqlResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| diag("42S22", format!("Invalid column name '{}'", name)))
    }
}

/// Every table visible to the driver's connections.
#[derive(Debug, Clone, Default)]
pub struct Database {
    tables: BTreeMap<String, Table>,
}

impl Database {
    pub fn table(&self, name: &str) -> SqlResult<&Table> {
        self.tables
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| missing_table(name))
    }

    pub fn table_mut(&mut self, name: &str) -> SqlResult<&mut Table> {
        self.tables
            .get_mut(&name.to_ascii_lowercase())
            .ok_or_else(|| missing_table(name))
    }

    pub fn create(&mut self, name: &str, columns: Vec<ColumnDef>) -> SqlResult<()> {
        let key = name.to_ascii_lowercase();
        if self.tables.contains_key(&key) {
            return Err(diag(
                "42S01",
                format!("There is already an object named '{}'", name),
            ));
        }
        self.tables.insert(
            key,
            Table {
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn drop_table(&mut self, name: &str, if_exists: bool) -> SqlResult<()> {
        match self.tables.remove(&name.to_ascii_lowercase()) {
            Some(_) => Ok(()),
            None if if_exists => Ok(()),
            None => Err(missing_table(name)),
        }
    }
}

fn missing_table(name: &str) -> DiagRecord {
    diag("42S02", format!("Invalid object name '{}'", name))
}

/// Maps a declared type name (with optional size arguments) to a column.
pub fn column_type(type_name: &str, args: &[usize]) -> SqlResult<(SqlType, usize, i16)> {
    let arg = |i: usize, default: usize| args.get(i).copied().unwrap_or(default);
    let t = match type_name.to_ascii_uppercase().as_str() {
        "BIT" | "BOOLEAN" => (SqlType::Bit, 1, 0),
        "TINYINT" => (SqlType::TinyInt, 3, 0),
        "SMALLINT" => (SqlType::SmallInt, 5, 0),
        "INT" | "INTEGER" => (SqlType::Integer, 10, 0),
        "BIGINT" => (SqlType::BigInt, 19, 0),
        "REAL" => (SqlType::Real, 7, 0),
        "FLOAT" | "DOUBLE" => (SqlType::Double, 15, 0),
        "DECIMAL" | "NUMERIC" => (
            if type_name.eq_ignore_ascii_case("numeric") {
                SqlType::Numeric
            } else {
                SqlType::Decimal
            },
            arg(0, 18),
            arg(1, 0) as i16,
        ),
        "CHAR" => (SqlType::Char, arg(0, 1), 0),
        "VARCHAR" => (SqlType::Varchar, arg(0, 255), 0),
        "NCHAR" => (SqlType::WChar, arg(0, 1), 0),
        "NVARCHAR" => (SqlType::WVarchar, arg(0, 255), 0),
        "TEXT" | "CLOB" => (SqlType::LongVarchar, 2_147_483_647, 0),
        "NTEXT" => (SqlType::WLongVarchar, 1_073_741_823, 0),
        "BINARY" => (SqlType::Binary, arg(0, 1), 0),
        "VARBINARY" => (SqlType::Varbinary, arg(0, 255), 0),
        "BLOB" | "IMAGE" => (SqlType::LongVarbinary, 2_147_483_647, 0),
        "DATE" => (SqlType::Date, 10, 0),
        "TIME" => (SqlType::Time, 8, 0),
        "TIMESTAMP" | "DATETIME" => (SqlType::Timestamp, 26, 6),
        other => {
            return Err(diag(
                "42000",
                format!("Column, parameter, or variable: cannot find data type {}", other),
            ))
        }
    };
    Ok(t)
}

/// Converts `value` into the C representation `ctype`. Character data comes
/// back without its terminator.
pub fn encode(value: &Value, ctype: CType) -> SqlResult<Vec<u8>> {
    let bytes = match ctype {
        CType::Bit => {
            let v = match value {
                Value::Date(_) | Value::Timestamp(_) | Value::Bytes(_) => {
                    return Err(restricted(ctype))
                }
                v => v.as_i64()?,
            };
            match v {
                0 | 1 => vec![v as u8],
                _ => return Err(out_of_range()),
            }
        }
        CType::Short => {
            let v = integer(value, ctype)?;
            i16::try_from(v).map_err(|_| out_of_range())?.to_ne_bytes().to_vec()
        }
        CType::Long => {
            let v = integer(value, ctype)?;
            i32::try_from(v).map_err(|_| out_of_range())?.to_ne_bytes().to_vec()
        }
        CType::SBigInt => integer(value, ctype)?.to_ne_bytes().to_vec(),
        CType::Float => {
            let v = float(value, ctype)?;
            if v.is_finite() && v.abs() > f32::MAX as f64 {
                return Err(out_of_range());
            }
            (v as f32).to_ne_bytes().to_vec()
        }
        CType::Double => float(value, ctype)?.to_ne_bytes().to_vec(),
        CType::Char => value.to_text().into_bytes(),
        CType::Binary => match value {
            Value::Bytes(b) => b.clone(),
            Value::Text(s) => s.clone().into_bytes(),
            _ => return Err(restricted(ctype)),
        },
        CType::Date => match value {
            Value::Date(d) => d.to_bytes().to_vec(),
            Value::Timestamp(t) => t.date().to_bytes().to_vec(),
            Value::Text(s) => s
                .parse::<Date>()
                .map_err(|_| invalid_cast())?
                .to_bytes()
                .to_vec(),
            _ => return Err(restricted(ctype)),
        },
        CType::Timestamp => match value {
            Value::Timestamp(t) => t.to_bytes().to_vec(),
            Value::Date(d) => Timestamp::from(*d).to_bytes().to_vec(),
            Value::Text(s) => s
                .parse::<Timestamp>()
                .map_err(|_| invalid_cast())?
                .to_bytes()
                .to_vec(),
            _ => return Err(restricted(ctype)),
        },
    };
    Ok(bytes)
}

fn integer(value: &Value, ctype: CType) -> SqlResult<i64> {
    match value {
        Value::Date(_) | Value::Timestamp(_) | Value::Bytes(_) => Err(restricted(ctype)),
        v => v.as_i64(),
    }
}

fn float(value: &Value, ctype: CType) -> SqlResult<f64> {
    match value {
        Value::Date(_) | Value::Timestamp(_) | Value::Bytes(_) => Err(restricted(ctype)),
        v => v.as_f64().ok_or_else(invalid_cast),
    }
}

/// Writes `value` into row `row` of a bound column. Returns true when the
/// value did not fit and was truncated.
pub fn fill_cell(column: &mut ColumnBuffer, row: usize, value: &Value) -> SqlResult<bool> {
    if value.is_null() {
        column.set_indicator(row, NULL_DATA);
        return Ok(false);
    }
    let bytes = encode(value, column.ctype())?;
    let capacity = column.payload_len();
    let ctype = column.ctype();
    let n = bytes.len().min(capacity);
    let cell = column.cell_mut(row);
    cell[..n].copy_from_slice(&bytes[..n]);
    if ctype.is_nul_terminated() && n < cell.len() {
        cell[n] = 0;
    }
    column.set_indicator(row, bytes.len() as isize);
    Ok(ctype.is_variable() && bytes.len() > capacity)
}

/// Reads element `row` of a parameter buffer as a stored value.
pub fn decode_param(param: &ParamBuffer, row: usize) -> Value {
    if param.is_null(row) || !param.direction().reads_input() {
        return Value::Null;
    }
    let bytes = param.value_bytes(row);
    let fixed = |n: usize| -> Option<Vec<u8>> { bytes.get(..n).map(|b| b.to_vec()) };
    let decoded = match param.ctype() {
        CType::Bit => bytes.first().map(|b| Value::Int(i64::from(*b))),
        CType::Short => fixed(2).map(|b| Value::Int(i16::from_ne_bytes([b[0], b[1]]) as i64)),
        CType::Long => {
            fixed(4).map(|b| Value::Int(i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as i64))
        }
        CType::SBigInt => fixed(8).map(|b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&b);
            Value::Int(i64::from_ne_bytes(raw))
        }),
        CType::Float => fixed(4)
            .map(|b| Value::Double(f32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f64)),
        CType::Double => fixed(8).map(|b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&b);
            Value::Double(f64::from_ne_bytes(raw))
        }),
        CType::Char => Some(Value::Text(String::from_utf8_lossy(bytes).into_owned())),
        CType::Binary => Some(Value::Bytes(bytes.to_vec())),
        CType::Date => Date::from_bytes(bytes).map(Value::Date),
        CType::Timestamp => Timestamp::from_bytes(bytes).map(Value::Timestamp),
    };
    decoded.unwrap_or(Value::Null)
}

/// Writes an output value back into element 0 of `param`.
pub fn write_param(param: &mut ParamBuffer, value: &Value) -> SqlResult<()> {
    if value.is_null() {
        param.set_indicator(0, NULL_DATA);
        return Ok(());
    }
    let bytes = encode(value, param.ctype())?;
    let nul = param.ctype().is_nul_terminated();
    let capacity = if nul {
        param.element_len().saturating_sub(1)
    } else {
        param.element_len()
    };
    let n = bytes.len().min(capacity);
    let element = param.element_mut(0);
    element[..n].copy_from_slice(&bytes[..n]);
    if nul && n < element.len() {
        element[n] = 0;
    }
    param.set_indicator(0, bytes.len() as isize);
    Ok(())
}
