pub mod args;
pub mod envelope;
pub mod error;
pub mod fields;

pub use args::{IdArg, coerce_scalar, parse_ids, strip_quotes};
pub use envelope::{Effect, Envelope};
pub use error::{ErrorCode, ToolFailure};
pub use fields::{BOOK_FIELDS, FieldAliases, STUDENT_FIELDS, header_key};
