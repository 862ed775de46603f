use crate::error::{OdbcError, Result};
use std::fmt;
use std::str::FromStr;

/// SQL data type of a column or parameter as reported by the driver.
///
/// Codes follow the ODBC 3.x `SQL_*` constants, so drivers can map their
/// native codes with [`SqlType::from_code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SqlType {
    Char,
    Varchar,
    LongVarchar,
    WChar,
    WVarchar,
    WLongVarchar,
    Decimal,
    Numeric,
    Bit,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Float,
    Double,
    Binary,
    Varbinary,
    LongVarbinary,
    Date,
    Time,
    Timestamp,
    Guid,
    Unknown(i16),
}

impl SqlType {
    pub fn from_code(code: i16) -> Self {
        match code {
            1 => Self::Char,
            12 => Self::Varchar,
            -1 => Self::LongVarchar,
            -8 => Self::WChar,
            -9 => Self::WVarchar,
            -10 => Self::WLongVarchar,
            3 => Self::Decimal,
            2 => Self::Numeric,
            -7 => Self::Bit,
            -6 => Self::TinyInt,
            5 => Self::SmallInt,
            4 => Self::Integer,
            -5 => Self::BigInt,
            7 => Self::Real,
            6 => Self::Float,
            8 => Self::Double,
            -2 => Self::Binary,
            -3 => Self::Varbinary,
            -4 => Self::LongVarbinary,
            9 | 91 => Self::Date,
            10 | 92 => Self::Time,
            11 | 93 => Self::Timestamp,
            -11 => Self::Guid,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> i16 {
        match self {
            Self::Char => 1,
            Self::Varchar => 12,
            Self::LongVarchar => -1,
            Self::WChar => -8,
            Self::WVarchar => -9,
            Self::WLongVarchar => -10,
            Self::Decimal => 3,
            Self::Numeric => 2,
            Self::Bit => -7,
            Self::TinyInt => -6,
            Self::SmallInt => 5,
            Self::Integer => 4,
            Self::BigInt => -5,
            Self::Real => 7,
            Self::Float => 6,
            Self::Double => 8,
            Self::Binary => -2,
            Self::Varbinary => -3,
            Self::LongVarbinary => -4,
            Self::Date => 91,
            Self::Time => 92,
            Self::Timestamp => 93,
            Self::Guid => -11,
            Self::Unknown(code) => code,
        }
    }

    /// Variable-length types whose declared size does not bound the value.
    pub fn is_long(self) -> bool {
        matches!(
            self,
            Self::LongVarchar | Self::WLongVarchar | Self::LongVarbinary
        )
    }

    pub fn is_character(self) -> bool {
        matches!(
            self,
            Self::Char
                | Self::Varchar
                | Self::LongVarchar
                | Self::WChar
                | Self::WVarchar
                | Self::WLongVarchar
        )
    }

    pub fn is_binary(self) -> bool {
        matches!(self, Self::Binary | Self::Varbinary | Self::LongVarbinary)
    }
}

/// C buffer layout the driver converts column or parameter data into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CType {
    Bit,
    Short,
    Long,
    SBigInt,
    Float,
    Double,
    Char,
    Binary,
    Date,
    Timestamp,
}

impl CType {
    /// Width of one element, `None` for variable-length buffers.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Bit => Some(1),
            Self::Short => Some(2),
            Self::Long => Some(4),
            Self::SBigInt => Some(8),
            Self::Float => Some(4),
            Self::Double => Some(8),
            Self::Date => Some(DATE_WIDTH),
            Self::Timestamp => Some(TIMESTAMP_WIDTH),
            Self::Char | Self::Binary => None,
        }
    }

    /// Character buffers reserve one trailing byte for the NUL terminator.
    pub fn is_nul_terminated(self) -> bool {
        self == Self::Char
    }

    pub fn is_variable(self) -> bool {
        self.fixed_width().is_none()
    }
}

pub(crate) const DATE_WIDTH: usize = 6;
pub(crate) const TIMESTAMP_WIDTH: usize = 16;

/// Calendar date laid out like `SQL_DATE_STRUCT`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date {
    pub year: i16,
    pub month: u16,
    pub day: u16,
}

impl Date {
    pub fn new(year: i16, month: u16, day: u16) -> Self {
        Self { year, month, day }
    }

    pub fn to_bytes(self) -> [u8; DATE_WIDTH] {
        let mut out = [0u8; DATE_WIDTH];
        out[0..2].copy_from_slice(&self.year.to_ne_bytes());
        out[2..4].copy_from_slice(&self.month.to_ne_bytes());
        out[4..6].copy_from_slice(&self.day.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DATE_WIDTH {
            return None;
        }
        Some(Self {
            year: i16::from_ne_bytes([bytes[0], bytes[1]]),
            month: u16::from_ne_bytes([bytes[2], bytes[3]]),
            day: u16::from_ne_bytes([bytes[4], bytes[5]]),
        })
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl FromStr for Date {
    type Err = OdbcError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || OdbcError::TypeIncompatible(format!("'{}' is not a date", s));
        let mut parts = s.trim().splitn(3, '-');
        let year = parts
            .next()
            .and_then(|p| p.parse::<i16>().ok())
            .ok_or_else(invalid)?;
        let month = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .filter(|m| (1..=12).contains(m))
            .ok_or_else(invalid)?;
        let day = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .filter(|d| (1..=31).contains(d))
            .ok_or_else(invalid)?;
        Ok(Self { year, month, day })
    }
}

/// Date and time laid out like `SQL_TIMESTAMP_STRUCT`; `fraction` is in
/// nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub year: i16,
    pub month: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub fraction: u32,
}

impl Timestamp {
    pub fn new(year: i16, month: u16, day: u16, hour: u16, minute: u16, second: u16) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
            fraction: 0,
        }
    }

    pub fn date(&self) -> Date {
        Date::new(self.year, self.month, self.day)
    }

    pub fn to_bytes(self) -> [u8; TIMESTAMP_WIDTH] {
        let mut out = [0u8; TIMESTAMP_WIDTH];
        out[0..2].copy_from_slice(&self.year.to_ne_bytes());
        out[2..4].copy_from_slice(&self.month.to_ne_bytes());
        out[4..6].copy_from_slice(&self.day.to_ne_bytes());
        out[6..8].copy_from_slice(&self.hour.to_ne_bytes());
        out[8..10].copy_from_slice(&self.minute.to_ne_bytes());
        out[10..12].copy_from_slice(&self.second.to_ne_bytes());
        out[12..16].copy_from_slice(&self.fraction.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TIMESTAMP_WIDTH {
            return None;
        }
        let u16_at = |i: usize| u16::from_ne_bytes([bytes[i], bytes[i + 1]]);
        Some(Self {
            year: i16::from_ne_bytes([bytes[0], bytes[1]]),
            month: u16_at(2),
            day: u16_at(4),
            hour: u16_at(6),
            minute: u16_at(8),
            second: u16_at(10),
            fraction: u32::from_ne_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }
}

impl From<Date> for Timestamp {
    fn from(d: Date) -> Self {
        Timestamp::new(d.year, d.month, d.day, 0, 0, 0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )?;
        if self.fraction != 0 {
            write!(f, ".{:09}", self.fraction)?;
        }
        Ok(())
    }
}

impl FromStr for Timestamp {
    type Err = OdbcError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || OdbcError::TypeIncompatible(format!("'{}' is not a timestamp", s));
        let s = s.trim();
        let (date_part, time_part) = match s.split_once(|c| c == ' ' || c == 'T') {
            Some((d, t)) => (d, Some(t)),
            None => (s, None),
        };
        let date: Date = date_part.parse()?;
        let mut ts = Timestamp::from(date);
        let Some(time_part) = time_part else {
            return Ok(ts);
        };

        let (hms, fraction) = match time_part.split_once('.') {
            Some((hms, frac)) => (hms, Some(frac)),
            None => (time_part, None),
        };
        let mut fields = hms.split(':').map(|p| p.parse::<u16>().ok());
        ts.hour = fields.next().flatten().filter(|h| *h < 24).ok_or_else(invalid)?;
        ts.minute = fields.next().flatten().filter(|m| *m < 60).ok_or_else(invalid)?;
        ts.second = fields
            .next()
            .unwrap_or(Some(0))
            .filter(|s| *s < 62)
            .ok_or_else(invalid)?;
        if let Some(frac) = fraction {
            if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            let padded = format!("{:0<9}", frac);
            ts.fraction = padded.parse::<u32>().map_err(|_| invalid())?;
        }
        Ok(ts)
    }
}
