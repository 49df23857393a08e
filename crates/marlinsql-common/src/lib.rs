//! Common types and error handling for MarlinSQL (T-SQL over a remote record store).

#![warn(rustdoc::broken_intra_doc_links)]

pub mod error;
pub mod metadata;
pub mod result;
pub mod types;

pub use error::{Error, ErrorPayload, Result};
pub use result::{ColumnInfo, QueryResult, RowBatch};
pub use types::{QueryValue, Row};
