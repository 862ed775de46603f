//! Conversion of bound cells and parameter buffers into Rust values.

use crate::driver::SqlReturn;
use crate::error::{OdbcError, Result};
use crate::handles::HandleGuard;
use crate::protocol::{CType, Date, Timestamp, NO_TOTAL, NULL_DATA};

/// A non-null cell decoded from its bound C representation.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Integer(i64),
    Double(f64),
    Text(String),
    Binary(Vec<u8>),
    Date(Date),
    Timestamp(Timestamp),
}

impl CellValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Double(_) => "floating point",
            Self::Text(_) => "character",
            Self::Binary(_) => "binary",
            Self::Date(_) => "date",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

fn ne_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| OdbcError::InternalError(format!("cell shorter than {} bytes", N)))
}

/// Decodes the payload of one cell bound as `ctype`.
pub(crate) fn decode(ctype: CType, bytes: &[u8]) -> Result<CellValue> {
    let value = match ctype {
        CType::Bit => CellValue::Integer(i64::from(bytes.first().copied().unwrap_or(0))),
        CType::Short => CellValue::Integer(i16::from_ne_bytes(ne_array(bytes)?).into()),
        CType::Long => CellValue::Integer(i32::from_ne_bytes(ne_array(bytes)?).into()),
        CType::SBigInt => CellValue::Integer(i64::from_ne_bytes(ne_array(bytes)?)),
        CType::Float => CellValue::Double(f32::from_ne_bytes(ne_array(bytes)?).into()),
        CType::Double => CellValue::Double(f64::from_ne_bytes(ne_array(bytes)?)),
        CType::Char => CellValue::Text(match String::from_utf8(bytes.to_vec()) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }),
        CType::Binary => CellValue::Binary(bytes.to_vec()),
        CType::Date => CellValue::Date(
            Date::from_bytes(bytes)
                .ok_or_else(|| OdbcError::InternalError("malformed date cell".to_string()))?,
        ),
        CType::Timestamp => CellValue::Timestamp(
            Timestamp::from_bytes(bytes)
                .ok_or_else(|| OdbcError::InternalError("malformed timestamp cell".to_string()))?,
        ),
    };
    Ok(value)
}

/// Reads column `col` of rowset row `row` in full through repeated
/// `get_data` calls. `None` when the driver reports NULL.
pub(crate) fn read_long(
    guard: &HandleGuard,
    col: u16,
    row: usize,
    ctype: CType,
    chunk: usize,
) -> Result<Option<Vec<u8>>> {
    let driver = guard.driver();
    guard.check(driver.set_position(guard.raw(), row), "position cursor")?;

    let mut buf = vec![0u8; chunk.max(2)];
    let capacity = if ctype.is_nul_terminated() {
        buf.len() - 1
    } else {
        buf.len()
    };
    let mut out = Vec::new();
    loop {
        let mut indicator = 0isize;
        let rc = driver.get_data(guard.raw(), col, ctype, &mut buf, &mut indicator);
        match guard.check(rc, "read column data")? {
            SqlReturn::NoData => break,
            rc => {
                if indicator == NULL_DATA {
                    return Ok(None);
                }
                let n = if indicator == NO_TOTAL || indicator as usize > capacity {
                    capacity
                } else {
                    indicator as usize
                };
                out.extend_from_slice(&buf[..n]);
                if rc == SqlReturn::Success {
                    break;
                }
            }
        }
    }
    Ok(Some(out))
}

/// Types a cell can be extracted as.
///
/// Conversions never clamp: a value outside the target's range is
/// [`OdbcError::TypeIncompatible`].
pub trait FromCell: Sized {
    const TARGET: &'static str;

    fn from_cell(value: CellValue) -> Result<Self>;
}

fn incompatible<T: FromCell>(value: &CellValue) -> OdbcError {
    OdbcError::TypeIncompatible(format!(
        "cannot convert {} value to {}",
        value.kind(),
        T::TARGET
    ))
}

fn out_of_range<T: FromCell>(shown: impl std::fmt::Display) -> OdbcError {
    OdbcError::TypeIncompatible(format!("value {} out of range for {}", shown, T::TARGET))
}

fn double_to_i64(v: f64) -> Option<i64> {
    let t = v.trunc();
    // i64::MAX is not representable as f64; the bound is exclusive.
    if v.is_finite() && t >= i64::MIN as f64 && t < i64::MAX as f64 {
        Some(t as i64)
    } else {
        None
    }
}

impl FromCell for CellValue {
    const TARGET: &'static str = "cell value";

    fn from_cell(value: CellValue) -> Result<Self> {
        Ok(value)
    }
}

impl FromCell for i64 {
    const TARGET: &'static str = "i64";

    fn from_cell(value: CellValue) -> Result<Self> {
        match &value {
            CellValue::Integer(v) => Ok(*v),
            CellValue::Double(v) => double_to_i64(*v).ok_or_else(|| out_of_range::<Self>(v)),
            CellValue::Text(s) => {
                let s = s.trim();
                if let Ok(v) = s.parse::<i64>() {
                    return Ok(v);
                }
                match s.parse::<f64>() {
                    Ok(v) => double_to_i64(v).ok_or_else(|| out_of_range::<Self>(s)),
                    Err(_) => Err(incompatible::<Self>(&value)),
                }
            }
            _ => Err(incompatible::<Self>(&value)),
        }
    }
}

macro_rules! narrow_integer {
    ($($t:ty),*) => {$(
        impl FromCell for $t {
            const TARGET: &'static str = stringify!($t);

            fn from_cell(value: CellValue) -> Result<Self> {
                let wide = i64::from_cell(value).map_err(|e| match e {
                    OdbcError::TypeIncompatible(msg) => {
                        OdbcError::TypeIncompatible(msg.replace("i64", stringify!($t)))
                    }
                    other => other,
                })?;
                <$t>::try_from(wide).map_err(|_| out_of_range::<Self>(wide))
            }
        }
    )*};
}

narrow_integer!(i16, i32);

impl FromCell for f64 {
    const TARGET: &'static str = "f64";

    fn from_cell(value: CellValue) -> Result<Self> {
        match &value {
            CellValue::Integer(v) => Ok(*v as f64),
            CellValue::Double(v) => Ok(*v),
            CellValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| incompatible::<Self>(&value)),
            _ => Err(incompatible::<Self>(&value)),
        }
    }
}

impl FromCell for f32 {
    const TARGET: &'static str = "f32";

    fn from_cell(value: CellValue) -> Result<Self> {
        let kind = value.kind();
        let wide = f64::from_cell(value).map_err(|_| {
            OdbcError::TypeIncompatible(format!("cannot convert {} value to f32", kind))
        })?;
        if wide.is_finite() && wide.abs() > f32::MAX as f64 {
            return Err(out_of_range::<Self>(wide));
        }
        Ok(wide as f32)
    }
}

impl FromCell for bool {
    const TARGET: &'static str = "bool";

    fn from_cell(value: CellValue) -> Result<Self> {
        match &value {
            CellValue::Integer(0) => Ok(false),
            CellValue::Integer(1) => Ok(true),
            CellValue::Integer(v) => Err(out_of_range::<Self>(v)),
            CellValue::Double(v) if *v == 0.0 => Ok(false),
            CellValue::Double(v) if *v == 1.0 => Ok(true),
            CellValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "0" | "false" => Ok(false),
                "1" | "true" => Ok(true),
                _ => Err(incompatible::<Self>(&value)),
            },
            _ => Err(incompatible::<Self>(&value)),
        }
    }
}

impl FromCell for String {
    const TARGET: &'static str = "String";

    fn from_cell(value: CellValue) -> Result<Self> {
        match value {
            CellValue::Text(s) => Ok(s),
            CellValue::Integer(v) => Ok(v.to_string()),
            CellValue::Double(v) => Ok(v.to_string()),
            CellValue::Date(d) => Ok(d.to_string()),
            CellValue::Timestamp(t) => Ok(t.to_string()),
            CellValue::Binary(b) => String::from_utf8(b).map_err(|_| {
                OdbcError::TypeIncompatible("binary value is not valid UTF-8".to_string())
            }),
        }
    }
}

impl FromCell for Vec<u8> {
    const TARGET: &'static str = "Vec<u8>";

    fn from_cell(value: CellValue) -> Result<Self> {
        match value {
            CellValue::Binary(b) => Ok(b),
            CellValue::Text(s) => Ok(s.into_bytes()),
            other => Err(incompatible::<Self>(&other)),
        }
    }
}

impl FromCell for Date {
    const TARGET: &'static str = "Date";

    fn from_cell(value: CellValue) -> Result<Self> {
        match &value {
            CellValue::Date(d) => Ok(*d),
            CellValue::Timestamp(t) => Ok(t.date()),
            CellValue::Text(s) => s.trim().parse(),
            _ => Err(incompatible::<Self>(&value)),
        }
    }
}

impl FromCell for Timestamp {
    const TARGET: &'static str = "Timestamp";

    fn from_cell(value: CellValue) -> Result<Self> {
        match &value {
            CellValue::Timestamp(t) => Ok(*t),
            CellValue::Date(d) => Ok(Timestamp::from(*d)),
            CellValue::Text(s) => s.trim().parse(),
            _ => Err(incompatible::<Self>(&value)),
        }
    }
}
