// src/database/models.rs
use chrono::{DateTime, Utc};

/// Identity of a freshly inserted typed row
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredRecord {
    pub id: i64,
    /// Server clock at insertion
    pub recorded_at: DateTime<Utc>,
}
