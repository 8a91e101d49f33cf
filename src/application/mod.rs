//! Application-level error mapping shared by the binary and HTTP surfaces.

pub mod error;
