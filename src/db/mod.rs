//! Database module: models, schema, and the token store.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows
//! - `schema.rs`: SQL DDL for initializing the database (SQLite-first)
//! - `store.rs`: the `TokenStore` interface the request path calls through

pub mod models;
pub mod schema;
pub mod store;

pub use models::{ApiKey, DonatedToken, TokenStatus, TokenVisibility, User};
pub use schema::SQLITE_INIT;
pub use store::{SqliteStore, TokenStore, connect};
