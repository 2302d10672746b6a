//! Database Module - Lokale Persistenz
//!
//! - Anrufliste (SQLite)

mod history;

pub use history::{
    CallHistoryDatabase, CallHistoryRecord, CallHistoryStore, DatabaseError, RecordId,
    TIMESTAMP_FORMAT,
};
