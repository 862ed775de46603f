pub mod logging;

pub use logging::{mask_connection_string, StructuredLogger};
