//! Durable state for the broker: sessions, jobs, stream events, and
//! executor-side conversation ids, all in one SQLite database.

mod sqlite;

pub use sqlite::{JobSnapshot, SqliteStore};
