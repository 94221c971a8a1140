pub mod backoff;
pub mod parse;
pub mod random;
