pub mod column_buffer;
pub mod param_buffer;
pub mod types;

pub use column_buffer::{ColumnBuffer, NO_TOTAL, NULL_DATA};
pub use param_buffer::{ParamBuffer, ParamDirection, Parameter};
pub use types::{CType, Date, SqlType, Timestamp};
