//! Batch CLI surface: payment requests in, final outcomes out.

pub mod csv;
