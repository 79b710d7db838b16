//! Utility functions for timestamps and hashing.

pub mod hashing;
pub mod timestamps;

pub use hashing::{hash_file, sha256_hex, FileDigest};
pub use timestamps::{iso_timestamp, warc_timestamp};
