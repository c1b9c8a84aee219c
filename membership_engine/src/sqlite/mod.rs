//! SQLite database module for the membership engine.
mod sqlite_impl;

pub mod db;
pub use sqlite_impl::SqliteDatabase;
