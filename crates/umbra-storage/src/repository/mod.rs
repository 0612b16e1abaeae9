//! Database repositories for each table.

pub mod cookies;

pub use cookies::CookieRepo;
