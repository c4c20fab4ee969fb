use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn create_post(&self, owner_id: &str, new: NewPost) -> RepoResult<Post>;
    async fn get_post(&self, id: Id) -> RepoResult<Post>;
    /// Feed / profile listing. `owner` filters to one author; `viewer` widens
    /// visibility to that subject's own non-approved and private posts.
    async fn list_posts(&self, viewer: Option<&str>, owner: Option<&str>) -> RepoResult<Vec<Post>>;
    /// Unfiltered listing for the admin surface.
    async fn list_all_posts(&self) -> RepoResult<Vec<Post>>;
    async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post>;
    async fn delete_post(&self, id: Id) -> RepoResult<()>;
    /// Aggregator commit: status + post-level percentage in one write.
    async fn set_post_moderation(
        &self,
        id: Id,
        status: ModerationStatus,
        ai_percentage: Option<f64>,
    ) -> RepoResult<()>;
    /// Returns false when the like already existed (idempotent).
    async fn add_like(&self, post_id: Id, user_id: &str) -> RepoResult<bool>;
    async fn remove_like(&self, post_id: Id, user_id: &str) -> RepoResult<bool>;
    async fn has_liked(&self, post_id: Id, user_id: &str) -> RepoResult<bool>;
}

#[async_trait]
pub trait MediaRepo: Send + Sync {
    async fn add_media(&self, new: NewMedia) -> RepoResult<Media>;
    async fn get_media(&self, id: Id) -> RepoResult<Media>;
    async fn list_media(&self, post_id: Id) -> RepoResult<Vec<Media>>;
    /// Image rows only; video media never participates in moderation.
    async fn list_images(&self, post_id: Id) -> RepoResult<Vec<Media>>;
    async fn delete_media(&self, id: Id) -> RepoResult<()>;
    async fn set_media_verdict(
        &self,
        id: Id,
        is_ai: bool,
        ai_percentage: Option<f64>,
    ) -> RepoResult<()>;
}

#[async_trait]
pub trait NotificationRepo: Send + Sync {
    async fn insert_notification(&self, new: NewNotification) -> RepoResult<Notification>;
    async fn list_notifications(
        &self,
        recipient: &str,
        unread_only: bool,
    ) -> RepoResult<Vec<Notification>>;
    async fn mark_read(&self, id: Id, recipient: &str) -> RepoResult<Notification>;
    async fn mark_all_read(&self, recipient: &str) -> RepoResult<()>;
    async fn unread_count(&self, recipient: &str) -> RepoResult<i64>;
}

pub trait Repo: PostRepo + MediaRepo + NotificationRepo {}

impl<T> Repo for T where T: PostRepo + MediaRepo + NotificationRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    #[derive(Default)]
    struct State {
        posts: HashMap<Id, Post>,
        media: HashMap<Id, Media>,
        likes: HashSet<(Id, String)>,
        notifications: HashMap<Id, Notification>,
        next_id: Id,
    }

    /// Memory-backed repository used by tests and local development.
    #[derive(Clone, Default)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
    }

    impl InMemRepo {
        pub fn new() -> Self {
            Self::default()
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn create_post(&self, owner_id: &str, new: NewPost) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            let id = Self::next_id(&mut s);
            let post = Post {
                id,
                owner_id: owner_id.to_string(),
                content: new.content,
                is_private: new.is_private,
                status: ModerationStatus::Pending,
                ai_percentage: None,
                like_count: 0,
                created_at: Utc::now(),
            };
            s.posts.insert(id, post.clone());
            Ok(post)
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let s = self.state.read().unwrap();
            s.posts.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn list_posts(
            &self,
            viewer: Option<&str>,
            owner: Option<&str>,
        ) -> RepoResult<Vec<Post>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .posts
                .values()
                .filter(|p| owner.map_or(true, |o| p.owner_id == o))
                .filter(|p| {
                    let is_own = viewer.map_or(false, |u| p.owner_id == u);
                    is_own || (p.status == ModerationStatus::Approved && !p.is_private)
                })
                .cloned()
                .collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(v)
        }

        async fn list_all_posts(&self) -> RepoResult<Vec<Post>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s.posts.values().cloned().collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(v)
        }

        async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            let post = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(content) = upd.content {
                post.content = Some(content);
            }
            if let Some(is_private) = upd.is_private {
                post.is_private = is_private;
            }
            Ok(post.clone())
        }

        async fn delete_post(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.posts.remove(&id).ok_or(RepoError::NotFound)?;
            s.media.retain(|_, m| m.post_id != id);
            s.likes.retain(|(p, _)| *p != id);
            Ok(())
        }

        async fn set_post_moderation(
            &self,
            id: Id,
            status: ModerationStatus,
            ai_percentage: Option<f64>,
        ) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let post = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            post.status = status;
            post.ai_percentage = ai_percentage;
            Ok(())
        }

        async fn add_like(&self, post_id: Id, user_id: &str) -> RepoResult<bool> {
            let mut s = self.state.write().unwrap();
            if !s.posts.contains_key(&post_id) {
                return Err(RepoError::NotFound);
            }
            if !s.likes.insert((post_id, user_id.to_string())) {
                return Ok(false);
            }
            s.posts.get_mut(&post_id).unwrap().like_count += 1;
            Ok(true)
        }

        async fn remove_like(&self, post_id: Id, user_id: &str) -> RepoResult<bool> {
            let mut s = self.state.write().unwrap();
            if !s.posts.contains_key(&post_id) {
                return Err(RepoError::NotFound);
            }
            if !s.likes.remove(&(post_id, user_id.to_string())) {
                return Ok(false);
            }
            let post = s.posts.get_mut(&post_id).unwrap();
            post.like_count = (post.like_count - 1).max(0);
            Ok(true)
        }

        async fn has_liked(&self, post_id: Id, user_id: &str) -> RepoResult<bool> {
            let s = self.state.read().unwrap();
            Ok(s.likes.contains(&(post_id, user_id.to_string())))
        }
    }

    #[async_trait]
    impl MediaRepo for InMemRepo {
        async fn add_media(&self, new: NewMedia) -> RepoResult<Media> {
            let mut s = self.state.write().unwrap();
            if !s.posts.contains_key(&new.post_id) {
                return Err(RepoError::NotFound);
            }
            let id = Self::next_id(&mut s);
            let media = Media {
                id,
                post_id: new.post_id,
                storage_path: new.storage_path,
                media_type: new.media_type,
                display_order: new.display_order,
                is_ai: None,
                ai_percentage: None,
            };
            s.media.insert(id, media.clone());
            Ok(media)
        }

        async fn get_media(&self, id: Id) -> RepoResult<Media> {
            let s = self.state.read().unwrap();
            s.media.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn list_media(&self, post_id: Id) -> RepoResult<Vec<Media>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .media
                .values()
                .filter(|m| m.post_id == post_id)
                .cloned()
                .collect();
            v.sort_by_key(|m| m.display_order);
            Ok(v)
        }

        async fn list_images(&self, post_id: Id) -> RepoResult<Vec<Media>> {
            let mut v = self.list_media(post_id).await?;
            v.retain(|m| m.media_type == MediaKind::Image);
            Ok(v)
        }

        async fn delete_media(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.media.remove(&id).ok_or(RepoError::NotFound)?;
            Ok(())
        }

        async fn set_media_verdict(
            &self,
            id: Id,
            is_ai: bool,
            ai_percentage: Option<f64>,
        ) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let media = s.media.get_mut(&id).ok_or(RepoError::NotFound)?;
            media.is_ai = Some(is_ai);
            if ai_percentage.is_some() {
                media.ai_percentage = ai_percentage;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NotificationRepo for InMemRepo {
        async fn insert_notification(&self, new: NewNotification) -> RepoResult<Notification> {
            let mut s = self.state.write().unwrap();
            let id = Self::next_id(&mut s);
            let notification = Notification {
                id,
                recipient_id: new.recipient_id,
                actor_id: new.actor_id,
                post_id: new.post_id,
                kind: new.kind,
                body: new.body,
                is_read: false,
                created_at: Utc::now(),
            };
            s.notifications.insert(id, notification.clone());
            Ok(notification)
        }

        async fn list_notifications(
            &self,
            recipient: &str,
            unread_only: bool,
        ) -> RepoResult<Vec<Notification>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .notifications
                .values()
                .filter(|n| n.recipient_id == recipient)
                .filter(|n| !unread_only || !n.is_read)
                .cloned()
                .collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(v)
        }

        async fn mark_read(&self, id: Id, recipient: &str) -> RepoResult<Notification> {
            let mut s = self.state.write().unwrap();
            let n = s.notifications.get_mut(&id).ok_or(RepoError::NotFound)?;
            if n.recipient_id != recipient {
                return Err(RepoError::NotFound);
            }
            n.is_read = true;
            Ok(n.clone())
        }

        async fn mark_all_read(&self, recipient: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            for n in s.notifications.values_mut() {
                if n.recipient_id == recipient {
                    n.is_read = true;
                }
            }
            Ok(())
        }

        async fn unread_count(&self, recipient: &str) -> RepoResult<i64> {
            let s = self.state.read().unwrap();
            Ok(s.notifications
                .values()
                .filter(|n| n.recipient_id == recipient && !n.is_read)
                .count() as i64)
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::{Pool, Postgres};

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    }

    fn internal(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            other => RepoError::Internal(other.to_string()),
        }
    }

    const POST_COLS: &str =
        "id, owner_id, content, is_private, status, ai_percentage, like_count, created_at";
    const MEDIA_COLS: &str =
        "id, post_id, storage_path, media_type, display_order, is_ai, ai_percentage";
    const NOTIF_COLS: &str =
        "id, recipient_id, actor_id, post_id, kind, body, is_read, created_at";

    #[async_trait]
    impl PostRepo for PgRepo {
        async fn create_post(&self, owner_id: &str, new: NewPost) -> RepoResult<Post> {
            let sql = format!(
                "INSERT INTO posts (owner_id, content, is_private, status) \
                 VALUES ($1, $2, $3, 'pending') RETURNING {POST_COLS}"
            );
            sqlx::query_as::<_, Post>(&sql)
                .bind(owner_id)
                .bind(&new.content)
                .bind(new.is_private)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let sql = format!("SELECT {POST_COLS} FROM posts WHERE id = $1");
            sqlx::query_as::<_, Post>(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?
                .ok_or(RepoError::NotFound)
        }

        async fn list_posts(
            &self,
            viewer: Option<&str>,
            owner: Option<&str>,
        ) -> RepoResult<Vec<Post>> {
            let sql = format!(
                "SELECT {POST_COLS} FROM posts \
                 WHERE ($2::text IS NULL OR owner_id = $2) \
                   AND (owner_id = COALESCE($1, '') \
                        OR (status = 'approved' AND NOT is_private)) \
                 ORDER BY created_at DESC"
            );
            sqlx::query_as::<_, Post>(&sql)
                .bind(viewer)
                .bind(owner)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)
        }

        async fn list_all_posts(&self) -> RepoResult<Vec<Post>> {
            let sql = format!("SELECT {POST_COLS} FROM posts ORDER BY created_at DESC");
            sqlx::query_as::<_, Post>(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)
        }

        async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
            let sql = format!(
                "UPDATE posts SET content = COALESCE($2, content), \
                 is_private = COALESCE($3, is_private) \
                 WHERE id = $1 RETURNING {POST_COLS}"
            );
            sqlx::query_as::<_, Post>(&sql)
                .bind(id)
                .bind(&upd.content)
                .bind(upd.is_private)
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?
                .ok_or(RepoError::NotFound)
        }

        async fn delete_post(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM posts WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        async fn set_post_moderation(
            &self,
            id: Id,
            status: ModerationStatus,
            ai_percentage: Option<f64>,
        ) -> RepoResult<()> {
            let res = sqlx::query("UPDATE posts SET status = $2, ai_percentage = $3 WHERE id = $1")
                .bind(id)
                .bind(status)
                .bind(ai_percentage)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        async fn add_like(&self, post_id: Id, user_id: &str) -> RepoResult<bool> {
            let res = sqlx::query(
                "INSERT INTO post_likes (post_id, user_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(post_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Ok(false);
            }
            sqlx::query("UPDATE posts SET like_count = like_count + 1 WHERE id = $1")
                .bind(post_id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            Ok(true)
        }

        async fn remove_like(&self, post_id: Id, user_id: &str) -> RepoResult<bool> {
            let res = sqlx::query("DELETE FROM post_likes WHERE post_id = $1 AND user_id = $2")
                .bind(post_id)
                .bind(user_id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Ok(false);
            }
            sqlx::query(
                "UPDATE posts SET like_count = GREATEST(like_count - 1, 0) WHERE id = $1",
            )
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            Ok(true)
        }

        async fn has_liked(&self, post_id: Id, user_id: &str) -> RepoResult<bool> {
            let row: Option<(Id,)> = sqlx::query_as(
                "SELECT post_id FROM post_likes WHERE post_id = $1 AND user_id = $2",
            )
            .bind(post_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
            Ok(row.is_some())
        }
    }

    #[async_trait]
    impl MediaRepo for PgRepo {
        async fn add_media(&self, new: NewMedia) -> RepoResult<Media> {
            let sql = format!(
                "INSERT INTO post_media (post_id, storage_path, media_type, display_order) \
                 VALUES ($1, $2, $3, $4) RETURNING {MEDIA_COLS}"
            );
            sqlx::query_as::<_, Media>(&sql)
                .bind(new.post_id)
                .bind(&new.storage_path)
                .bind(new.media_type)
                .bind(new.display_order)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)
        }

        async fn get_media(&self, id: Id) -> RepoResult<Media> {
            let sql = format!("SELECT {MEDIA_COLS} FROM post_media WHERE id = $1");
            sqlx::query_as::<_, Media>(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?
                .ok_or(RepoError::NotFound)
        }

        async fn list_media(&self, post_id: Id) -> RepoResult<Vec<Media>> {
            let sql = format!(
                "SELECT {MEDIA_COLS} FROM post_media WHERE post_id = $1 ORDER BY display_order"
            );
            sqlx::query_as::<_, Media>(&sql)
                .bind(post_id)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)
        }

        async fn list_images(&self, post_id: Id) -> RepoResult<Vec<Media>> {
            let sql = format!(
                "SELECT {MEDIA_COLS} FROM post_media \
                 WHERE post_id = $1 AND media_type = 'image' ORDER BY display_order"
            );
            sqlx::query_as::<_, Media>(&sql)
                .bind(post_id)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)
        }

        async fn delete_media(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM post_media WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        async fn set_media_verdict(
            &self,
            id: Id,
            is_ai: bool,
            ai_percentage: Option<f64>,
        ) -> RepoResult<()> {
            let res = sqlx::query(
                "UPDATE post_media SET is_ai = $2, \
                 ai_percentage = COALESCE($3, ai_percentage) WHERE id = $1",
            )
            .bind(id)
            .bind(is_ai)
            .bind(ai_percentage)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NotificationRepo for PgRepo {
        async fn insert_notification(&self, new: NewNotification) -> RepoResult<Notification> {
            let sql = format!(
                "INSERT INTO notifications (recipient_id, actor_id, post_id, kind, body) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING {NOTIF_COLS}"
            );
            sqlx::query_as::<_, Notification>(&sql)
                .bind(&new.recipient_id)
                .bind(&new.actor_id)
                .bind(new.post_id)
                .bind(&new.kind)
                .bind(&new.body)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)
        }

        async fn list_notifications(
            &self,
            recipient: &str,
            unread_only: bool,
        ) -> RepoResult<Vec<Notification>> {
            let sql = format!(
                "SELECT {NOTIF_COLS} FROM notifications \
                 WHERE recipient_id = $1 AND (NOT $2 OR NOT is_read) \
                 ORDER BY created_at DESC, id DESC"
            );
            sqlx::query_as::<_, Notification>(&sql)
                .bind(recipient)
                .bind(unread_only)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)
        }

        async fn mark_read(&self, id: Id, recipient: &str) -> RepoResult<Notification> {
            let sql = format!(
                "UPDATE notifications SET is_read = TRUE \
                 WHERE id = $1 AND recipient_id = $2 RETURNING {NOTIF_COLS}"
            );
            sqlx::query_as::<_, Notification>(&sql)
                .bind(id)
                .bind(recipient)
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?
                .ok_or(RepoError::NotFound)
        }

        async fn mark_all_read(&self, recipient: &str) -> RepoResult<()> {
            sqlx::query(
                "UPDATE notifications SET is_read = TRUE \
                 WHERE recipient_id = $1 AND NOT is_read",
            )
            .bind(recipient)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            Ok(())
        }

        async fn unread_count(&self, recipient: &str) -> RepoResult<i64> {
            let row: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM notifications WHERE recipient_id = $1 AND NOT is_read",
            )
            .bind(recipient)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)?;
            Ok(row.0)
        }
    }
}
