mod storage;

pub use storage::SqliteHistory;
