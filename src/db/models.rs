use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::pipeline::types::{AspectRatio, PlacementMode, VariantCount};

#[derive(Debug, Clone, FromRow)]
pub struct LastRequestRow {
    pub user_id: i64,
    pub payload: String,
}

/// The most recent finished request of a user, enough to run it again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastRequest {
    /// Telegram file id of the uploaded product photo.
    pub source_file_id: String,
    pub placement: PlacementMode,
    pub aspect: AspectRatio,
    pub style: String,
    pub variants: VariantCount,
    #[serde(default)]
    pub result_file_ids: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LastRequestUpsert {
    pub user_id: i64,
    pub request: LastRequest,
}
