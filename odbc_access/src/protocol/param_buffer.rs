use super::column_buffer::NULL_DATA;
use super::types::{CType, Date, SqlType, Timestamp};
use crate::error::{OdbcError, Result};

/// Direction of a bound parameter. Anything other than `Input` asks the
/// driver to write a value back after execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    Return,
}

impl ParamDirection {
    pub fn reads_input(self) -> bool {
        matches!(self, Self::Input | Self::InputOutput)
    }

    pub fn writes_back(self) -> bool {
        !matches!(self, Self::Input)
    }
}

/// A Rust type that can be copied into a parameter buffer.
pub trait Parameter {
    const C_TYPE: CType;
    const SQL_TYPE: SqlType;

    /// Bytes this value occupies in the buffer (excluding any terminator).
    fn width(&self) -> usize;

    /// Writes the value into `out`, which is at least `width()` bytes long.
    fn write_to(&self, out: &mut [u8]);

    /// Column size reported to the driver for a buffer of `stride` bytes.
    fn column_size(stride: usize) -> usize {
        stride
    }

    fn decimal_digits() -> i16 {
        0
    }
}

macro_rules! fixed_parameter {
    ($t:ty, $ctype:expr, $sql:expr, $size:expr) => {
        impl Parameter for $t {
            const C_TYPE: CType = $ctype;
            const SQL_TYPE: SqlType = $sql;

            fn width(&self) -> usize {
                std::mem::size_of::<$t>()
            }

            fn write_to(&self, out: &mut [u8]) {
                out[..std::mem::size_of::<$t>()].copy_from_slice(&self.to_ne_bytes());
            }

            fn column_size(_stride: usize) -> usize {
                $size
            }
        }
    };
}

fixed_parameter!(i16, CType::Short, SqlType::SmallInt, 5);
fixed_parameter!(i32, CType::Long, SqlType::Integer, 10);
fixed_parameter!(i64, CType::SBigInt, SqlType::BigInt, 19);
fixed_parameter!(f32, CType::Float, SqlType::Real, 7);
fixed_parameter!(f64, CType::Double, SqlType::Double, 15);

impl Parameter for bool {
    const C_TYPE: CType = CType::Bit;
    const SQL_TYPE: SqlType = SqlType::Bit;

    fn width(&self) -> usize {
        1
    }

    fn write_to(&self, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }

    fn column_size(_stride: usize) -> usize {
        1
    }
}

impl Parameter for Date {
    const C_TYPE: CType = CType::Date;
    const SQL_TYPE: SqlType = SqlType::Date;

    fn width(&self) -> usize {
        super::types::DATE_WIDTH
    }

    fn write_to(&self, out: &mut [u8]) {
        out[..super::types::DATE_WIDTH].copy_from_slice(&self.to_bytes());
    }

    fn column_size(_stride: usize) -> usize {
        10
    }
}

impl Parameter for Timestamp {
    const C_TYPE: CType = CType::Timestamp;
    const SQL_TYPE: SqlType = SqlType::Timestamp;

    fn width(&self) -> usize {
        super::types::TIMESTAMP_WIDTH
    }

    fn write_to(&self, out: &mut [u8]) {
        out[..super::types::TIMESTAMP_WIDTH].copy_from_slice(&self.to_bytes());
    }

    fn column_size(_stride: usize) -> usize {
        29
    }

    fn decimal_digits() -> i16 {
        9
    }
}

impl Parameter for str {
    const C_TYPE: CType = CType::Char;
    const SQL_TYPE: SqlType = SqlType::Varchar;

    fn width(&self) -> usize {
        self.len()
    }

    fn write_to(&self, out: &mut [u8]) {
        out[..self.len()].copy_from_slice(self.as_bytes());
    }

    fn column_size(stride: usize) -> usize {
        stride.saturating_sub(1).max(1)
    }
}

impl Parameter for String {
    const C_TYPE: CType = CType::Char;
    const SQL_TYPE: SqlType = SqlType::Varchar;

    fn width(&self) -> usize {
        self.as_str().width()
    }

    fn write_to(&self, out: &mut [u8]) {
        self.as_str().write_to(out)
    }

    fn column_size(stride: usize) -> usize {
        str::column_size(stride)
    }
}

impl Parameter for [u8] {
    const C_TYPE: CType = CType::Binary;
    const SQL_TYPE: SqlType = SqlType::Varbinary;

    fn width(&self) -> usize {
        self.len()
    }

    fn write_to(&self, out: &mut [u8]) {
        out[..self.len()].copy_from_slice(self);
    }
}

impl Parameter for Vec<u8> {
    const C_TYPE: CType = CType::Binary;
    const SQL_TYPE: SqlType = SqlType::Varbinary;

    fn width(&self) -> usize {
        self.len()
    }

    fn write_to(&self, out: &mut [u8]) {
        self.as_slice().write_to(out)
    }
}

impl<T: Parameter + ?Sized> Parameter for &T {
    const C_TYPE: CType = T::C_TYPE;
    const SQL_TYPE: SqlType = T::SQL_TYPE;

    fn width(&self) -> usize {
        (**self).width()
    }

    fn write_to(&self, out: &mut [u8]) {
        (**self).write_to(out)
    }

    fn column_size(stride: usize) -> usize {
        T::column_size(stride)
    }

    fn decimal_digits() -> i16 {
        T::decimal_digits()
    }
}

/// Fixed-layout descriptor of one bound parameter marker.
///
/// `count` elements of `element_len` bytes, stored contiguously, plus one
/// indicator per element. Indicators carry the byte length of variable-size
/// elements or [`NULL_DATA`]; a null indicator wins over buffer contents.
#[derive(Debug, Clone)]
pub struct ParamBuffer {
    index: u16,
    direction: ParamDirection,
    ctype: CType,
    sql_type: SqlType,
    column_size: usize,
    decimal_digits: i16,
    element_len: usize,
    data: Vec<u8>,
    indicators: Vec<isize>,
}

impl ParamBuffer {
    /// Copies `values` into a new buffer for parameter `index` (0-based).
    ///
    /// `nulls`, when given, must have one flag per value.
    pub fn from_values<T: Parameter>(
        index: u16,
        values: &[T],
        nulls: Option<&[bool]>,
        direction: ParamDirection,
    ) -> Result<Self> {
        if values.is_empty() {
            return Err(OdbcError::Programming(format!(
                "parameter {} bound with no values",
                index
            )));
        }
        if let Some(nulls) = nulls {
            if nulls.len() != values.len() {
                return Err(OdbcError::Programming(format!(
                    "parameter {}: {} null flags for {} values",
                    index,
                    nulls.len(),
                    values.len()
                )));
            }
        }

        let widest = values.iter().map(Parameter::width).max().unwrap_or(0);
        let element_len = match T::C_TYPE.fixed_width() {
            Some(w) => w,
            None if T::C_TYPE.is_nul_terminated() => widest + 1,
            None => widest.max(1),
        };

        let mut buffer = Self::with_layout(
            index,
            direction,
            T::C_TYPE,
            T::SQL_TYPE,
            element_len,
            values.len(),
        );
        buffer.column_size = T::column_size(element_len);
        buffer.decimal_digits = T::decimal_digits();

        for (i, value) in values.iter().enumerate() {
            if nulls.map(|n| n[i]).unwrap_or(false) {
                buffer.indicators[i] = NULL_DATA;
                continue;
            }
            value.write_to(buffer.element_mut(i));
            buffer.indicators[i] = value.width() as isize;
        }
        Ok(buffer)
    }

    /// A buffer of `count` null elements, typed as a character parameter.
    pub fn nulls(index: u16, count: usize) -> Self {
        let mut buffer = Self::with_layout(
            index,
            ParamDirection::Input,
            CType::Char,
            SqlType::Varchar,
            1,
            count.max(1),
        );
        buffer.column_size = 1;
        buffer.indicators.iter_mut().for_each(|i| *i = NULL_DATA);
        buffer
    }

    /// An output slot able to hold `capacity` bytes of a `T` value.
    pub fn output<T: Parameter + ?Sized>(
        index: u16,
        direction: ParamDirection,
        capacity: usize,
    ) -> Self {
        let element_len = match T::C_TYPE.fixed_width() {
            Some(w) => w,
            None if T::C_TYPE.is_nul_terminated() => capacity.max(1) + 1,
            None => capacity.max(1),
        };
        let mut buffer =
            Self::with_layout(index, direction, T::C_TYPE, T::SQL_TYPE, element_len, 1);
        buffer.column_size = T::column_size(element_len);
        buffer.decimal_digits = T::decimal_digits();
        buffer.indicators[0] = NULL_DATA;
        buffer
    }

    fn with_layout(
        index: u16,
        direction: ParamDirection,
        ctype: CType,
        sql_type: SqlType,
        element_len: usize,
        count: usize,
    ) -> Self {
        Self {
            index,
            direction,
            ctype,
            sql_type,
            column_size: element_len,
            decimal_digits: 0,
            element_len,
            data: vec![0u8; element_len * count],
            indicators: vec![0; count],
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn direction(&self) -> ParamDirection {
        self.direction
    }

    pub fn ctype(&self) -> CType {
        self.ctype
    }

    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    pub fn column_size(&self) -> usize {
        self.column_size
    }

    pub fn decimal_digits(&self) -> i16 {
        self.decimal_digits
    }

    /// Stride between consecutive elements.
    pub fn element_len(&self) -> usize {
        self.element_len
    }

    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }

    pub fn element(&self, i: usize) -> &[u8] {
        let start = i * self.element_len;
        &self.data[start..start + self.element_len]
    }

    pub fn element_mut(&mut self, i: usize) -> &mut [u8] {
        let start = i * self.element_len;
        &mut self.data[start..start + self.element_len]
    }

    pub fn indicator(&self, i: usize) -> isize {
        self.indicators[i]
    }

    pub fn set_indicator(&mut self, i: usize, value: isize) {
        self.indicators[i] = value;
    }

    pub fn is_null(&self, i: usize) -> bool {
        self.indicators[i] == NULL_DATA
    }

    /// Value bytes of element `i` as bounded by its indicator.
    pub fn value_bytes(&self, i: usize) -> &[u8] {
        let element = self.element(i);
        if self.ctype.fixed_width().is_some() {
            return element;
        }
        let capacity = if self.ctype.is_nul_terminated() {
            self.element_len - 1
        } else {
            self.element_len
        };
        let len = usize::try_from(self.indicators[i]).unwrap_or(0).min(capacity);
        &element[..len]
    }

    pub(crate) fn data_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    pub(crate) fn indicators_mut_ptr(&mut self) -> *mut isize {
        self.indicators.as_mut_ptr()
    }
}
