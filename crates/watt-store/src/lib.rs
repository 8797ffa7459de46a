//! Embedded persistence for readings and rollups
//!
//! The daemon owns its SQLite file outright: the schema is created on
//! startup and writes happen in one transaction per poll cycle, so readers
//! can never observe a cycle with its readings committed but its rollups
//! missing.

pub mod client;
pub mod queries;
pub mod schema;

pub use client::*;
pub use schema::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unexpected row data: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
