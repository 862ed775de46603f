use super::types::CType;

/// Indicator value marking a NULL cell.
pub const NULL_DATA: isize = -1;
/// Indicator value for "length unknown, more data available".
pub const NO_TOTAL: isize = -4;

/// A contiguous, fixed-stride buffer bound to one result column.
///
/// Holds `capacity` elements of `element_len` bytes each plus one
/// length/null indicator per element. The driver writes directly into it on
/// fetch; the layout never changes after construction.
#[derive(Debug, Clone)]
pub struct ColumnBuffer {
    ctype: CType,
    element_len: usize,
    data: Vec<u8>,
    indicators: Vec<isize>,
}

impl ColumnBuffer {
    pub fn new(ctype: CType, element_len: usize, capacity: usize) -> Self {
        let element_len = ctype.fixed_width().unwrap_or(element_len.max(1));
        let capacity = capacity.max(1);
        Self {
            ctype,
            element_len,
            data: vec![0u8; element_len * capacity],
            indicators: vec![0; capacity],
        }
    }

    pub fn ctype(&self) -> CType {
        self.ctype
    }

    pub fn element_len(&self) -> usize {
        self.element_len
    }

    /// Number of rows the buffer holds.
    pub fn capacity(&self) -> usize {
        self.indicators.len()
    }

    pub fn cell(&self, row: usize) -> &[u8] {
        let start = row * self.element_len;
        &self.data[start..start + self.element_len]
    }

    pub fn cell_mut(&mut self, row: usize) -> &mut [u8] {
        let start = row * self.element_len;
        &mut self.data[start..start + self.element_len]
    }

    pub fn indicator(&self, row: usize) -> isize {
        self.indicators[row]
    }

    pub fn set_indicator(&mut self, row: usize, value: isize) {
        self.indicators[row] = value;
    }

    pub fn is_null(&self, row: usize) -> bool {
        self.indicators[row] == NULL_DATA
    }

    /// Bytes of usable payload per element (excludes the NUL terminator slot).
    pub fn payload_len(&self) -> usize {
        if self.ctype.is_nul_terminated() {
            self.element_len.saturating_sub(1)
        } else {
            self.element_len
        }
    }

    /// True when the driver reported more data than the element could hold.
    pub fn is_truncated(&self, row: usize) -> bool {
        if !self.ctype.is_variable() {
            return false;
        }
        let ind = self.indicators[row];
        ind == NO_TOTAL || (ind > 0 && ind as usize > self.payload_len())
    }

    /// Payload bytes stored for `row`, clipped to what fits in the element.
    pub fn value_bytes(&self, row: usize) -> &[u8] {
        let cell = self.cell(row);
        if !self.ctype.is_variable() {
            return cell;
        }
        let ind = self.indicators[row];
        let len = if ind < 0 {
            self.payload_len()
        } else {
            (ind as usize).min(self.payload_len())
        };
        &cell[..len]
    }

    /// Resets every indicator before a fetch so stale rows never look valid.
    pub fn clear_indicators(&mut self) {
        self.indicators.iter_mut().for_each(|i| *i = 0);
    }

    pub(crate) fn data_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    pub(crate) fn indicators_mut_ptr(&mut self) -> *mut isize {
        self.indicators.as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_ignores_requested_length() {
        let buf = ColumnBuffer::new(CType::Long, 100, 3);
        assert_eq!(buf.element_len(), 4);
        assert_eq!(buf.capacity(), 3);
    }

    #[test]
    fn test_char_payload_excludes_terminator() {
        let mut buf = ColumnBuffer::new(CType::Char, 8, 2);
        buf.cell_mut(1)[..5].copy_from_slice(b"hello");
        buf.set_indicator(1, 5);
        assert_eq!(buf.value_bytes(1), b"hello");
        assert!(!buf.is_truncated(1));

        buf.set_indicator(1, 20);
        assert!(buf.is_truncated(1));
        assert_eq!(buf.value_bytes(1).len(), 7);
    }

    #[test]
    fn test_null_and_no_total_indicators() {
        let mut buf = ColumnBuffer::new(CType::Binary, 4, 1);
        buf.set_indicator(0, NULL_DATA);
        assert!(buf.is_null(0));
        buf.set_indicator(0, NO_TOTAL);
        assert!(buf.is_truncated(0));
        buf.clear_indicators();
        assert_eq!(buf.indicator(0), 0);
    }
}
