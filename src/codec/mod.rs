//! Row Codec
//!
//! Typed header metadata and column-type tags for one log stream, the stream
//! identity derived from them, and the reference row layout that renderers
//! must follow.

mod log_id;
mod row;
mod schema;
mod types;

pub use log_id::LogId;
pub use row::{RowDecoder, RowEncoder, RowRenderer, Value};
pub use schema::Schema;
pub use types::{ColumnType, TypeTag};
