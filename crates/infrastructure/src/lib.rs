pub mod database;

pub use database::{DatabaseManager, SqliteTaskRepository};
