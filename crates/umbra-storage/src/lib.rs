//! Umbra Storage - SQLite persistence for the relay cookie jar.
//!
//! Cookies are stored keyed by `(domain, path, name)` of the real
//! destination, never by the relay's own origin. [`Database`] implements
//! [`umbra_core::CookieStore`], so the async jar in `umbra-proxy` can run over
//! it directly.
//!
//! # Example
//!
//! ```no_run
//! use umbra_core::cookie::{CookieMutation, CookieStore, StoredCookie};
//! use umbra_storage::Database;
//!
//! let db = Database::in_memory().unwrap();
//! db.apply(&[CookieMutation::Upsert(StoredCookie {
//!     domain: "example.com".into(),
//!     path: "/".into(),
//!     name: "id".into(),
//!     value: "42".into(),
//!     expires_at: None,
//!     secure: false,
//!     http_only: false,
//!     same_site: "Lax".into(),
//!     host_only: true,
//! })])
//! .unwrap();
//! ```

mod connection;
mod database;
pub mod error;
pub mod repository;
mod schema;

pub use database::Database;
pub use error::{Result, StorageError};
