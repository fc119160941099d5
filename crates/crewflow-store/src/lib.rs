pub mod knowledge;
pub mod notices;

pub use knowledge::SqliteKnowledgeBase;
pub use notices::{SqliteNoticeBoard, StoredNotice};

use crewflow_core::error::CrewflowError;

pub(crate) fn db_err(e: impl std::fmt::Display) -> CrewflowError {
    CrewflowError::Database(e.to_string())
}

/// Create the parent directory of a database file.
pub(crate) fn ensure_parent(path: &std::path::Path) -> crewflow_core::error::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CrewflowError::Database(format!("Failed to create db directory: {}", e)))?;
    }
    Ok(())
}
