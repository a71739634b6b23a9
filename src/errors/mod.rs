mod tail_error;

pub use tail_error::{TailError, TailErrorKind};
