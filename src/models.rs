use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// Always Postgres backed now
pub type Id = i64;

/// Lifecycle stage of a post with respect to the automated authenticity review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "moderation_status", rename_all = "lowercase")]
pub enum ModerationStatus {
    Pending,
    Approved,
    Rejected,
    Error,
}

impl ModerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationStatus::Pending => "pending",
            ModerationStatus::Approved => "approved",
            ModerationStatus::Rejected => "rejected",
            ModerationStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "media_kind", rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Post {
    pub id: Id,
    pub owner_id: String,
    pub content: Option<String>,
    pub is_private: bool,
    pub status: ModerationStatus,
    /// Share of image media judged AI-generated, in (0, 100]. NULL while
    /// pending or in error, and in place of an exact zero.
    pub ai_percentage: Option<f64>,
    pub like_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewPost {
    pub content: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

/// Owner edit. Moderation fields are deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdatePost {
    pub content: Option<String>,
    pub is_private: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Media {
    pub id: Id,
    pub post_id: Id,
    pub storage_path: String,
    pub media_type: MediaKind,
    pub display_order: i32,
    pub is_ai: Option<bool>,
    pub ai_percentage: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewMedia {
    pub post_id: Id,
    pub storage_path: String,
    pub media_type: MediaKind,
    pub display_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Notification {
    pub id: Id,
    pub recipient_id: String,
    pub actor_id: Option<String>,
    pub post_id: Option<Id>,
    pub kind: String,
    pub body: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewNotification {
    pub recipient_id: String,
    pub actor_id: Option<String>,
    pub post_id: Option<Id>,
    pub kind: String,
    pub body: Option<String>,
}

/// Read-only projection of a post's moderation state.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModerationSnapshot {
    pub post_id: Id,
    pub status: ModerationStatus,
    pub ai_percentage: Option<f64>,
    pub media: Vec<MediaVerdict>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MediaVerdict {
    pub media_id: Id,
    pub is_ai: Option<bool>,
    pub ai_percentage: Option<f64>,
}
