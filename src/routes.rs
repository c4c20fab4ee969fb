use std::sync::Arc;

use actix_web::{web, HttpResponse};
use actix_multipart::Multipart;
use futures_util::TryStreamExt as _;

use crate::auth::Auth;
use crate::error::ApiError;
use crate::models::*;
use crate::repo::Repo;
use crate::storage::MediaStore;
use crate::worker::ModerationQueue;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/posts")
                    .route(web::get().to(list_posts))
                    .route(web::post().to(create_post)),
            )
            .service(
                web::resource("/posts/{id}")
                    .route(web::get().to(get_post))
                    .route(web::patch().to(update_post))
                    .route(web::delete().to(delete_post)),
            )
            .service(
                web::resource("/posts/{id}/like")
                    .route(web::post().to(like_post))
                    .route(web::delete().to(unlike_post)),
            )
            .service(
                web::resource("/posts/{id}/media")
                    .route(web::get().to(list_media))
                    .route(web::post().to(upload_media)),
            )
            .service(
                web::resource("/posts/{id}/media/link").route(web::post().to(link_media)),
            )
            .service(
                web::resource("/posts/{id}/media/{media_id}")
                    .route(web::delete().to(delete_media)),
            )
            .service(
                web::resource("/posts/{id}/moderation")
                    .route(web::get().to(moderation_snapshot)),
            )
            .service(
                web::resource("/notifications").route(web::get().to(list_notifications)),
            )
            .service(
                web::resource("/notifications/{id}/read")
                    .route(web::patch().to(mark_notification_read)),
            )
            .service(
                web::resource("/notifications/mark-all-read")
                    .route(web::post().to(mark_all_notifications_read)),
            )
            .service(
                web::resource("/notifications/unread-count")
                    .route(web::get().to(unread_notification_count)),
            )
            // Admin endpoints
            .service(web::resource("/admin/posts").route(web::get().to(admin_list_posts)))
            .service(
                web::resource("/admin/posts/{id}").route(web::delete().to(admin_delete_post)),
            )
            .service(
                web::resource("/admin/posts/{id}/remoderate")
                    .route(web::post().to(admin_remoderate_post)),
            ),
    );
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub media_store: Arc<dyn MediaStore>,
    pub queue: ModerationQueue,
}

fn can_view(post: &Post, viewer: Option<&Auth>) -> Result<(), ApiError> {
    let is_owner = viewer.map_or(false, |a| a.user_id() == post.owner_id);
    if post.is_private && !is_owner {
        return Err(ApiError::Forbidden);
    }
    // Only the owner sees posts that are not (yet) published.
    if post.status != ModerationStatus::Approved && !is_owner {
        return Err(ApiError::NotFound);
    }
    Ok(())
}

#[utoipa::path(
    post,
    path = "/api/v1/posts",
    request_body = NewPost,
    responses(
        (status = 201, description = "Post created pending moderation", body = Post),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn create_post(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewPost>,
) -> Result<HttpResponse, ApiError> {
    let post = data.repo.create_post(auth.user_id(), payload.into_inner()).await?;
    data.queue.enqueue_moderation(post.id);
    Ok(HttpResponse::Created().json(post))
}

#[derive(serde::Deserialize)]
pub struct ListPostsQuery {
    pub owner_id: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/posts",
    params(("owner_id" = Option<String>, Query, description = "Filter to one author")),
    responses((status = 200, description = "Visible posts, newest first", body = [Post]))
)]
pub async fn list_posts(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    query: web::Query<ListPostsQuery>,
) -> Result<HttpResponse, ApiError> {
    let viewer = auth.as_ref().map(|a| a.user_id().to_string());
    let posts = data
        .repo
        .list_posts(viewer.as_deref(), query.owner_id.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(posts))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post", body = Post),
        (status = 404, description = "Post not found or not visible")
    )
)]
pub async fn get_post(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let post = data.repo.get_post(path.into_inner()).await?;
    can_view(&post, auth.as_ref())?;
    Ok(HttpResponse::Ok().json(post))
}

#[utoipa::path(
    patch,
    path = "/api/v1/posts/{id}",
    request_body = UpdatePost,
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post updated", body = Post),
        (status = 403, description = "Not the post owner")
    )
)]
pub async fn update_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdatePost>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let post = data.repo.get_post(id).await?;
    if post.owner_id != auth.user_id() {
        return Err(ApiError::Forbidden);
    }
    // Owner edits never touch status or ai_percentage.
    let updated = data.repo.update_post(id, payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(updated))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 204, description = "Post deleted"),
        (status = 403, description = "Not the post owner")
    )
)]
pub async fn delete_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let post = data.repo.get_post(id).await?;
    if post.owner_id != auth.user_id() {
        return Err(ApiError::Forbidden);
    }
    let media = data.repo.list_media(id).await?;
    data.repo.delete_post(id).await?;
    for m in media {
        let _ = data.media_store.delete(&m.storage_path).await;
    }
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/like",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Like recorded"),
        (status = 400, description = "Post is not approved")
    )
)]
pub async fn like_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let post = data.repo.get_post(id).await?;
    // Likes only exist on published posts.
    if post.status != ModerationStatus::Approved {
        return Err(ApiError::BadRequest);
    }
    let newly_liked = data.repo.add_like(id, auth.user_id()).await?;
    if newly_liked && post.owner_id != auth.user_id() {
        data.repo
            .insert_notification(NewNotification {
                recipient_id: post.owner_id.clone(),
                actor_id: Some(auth.user_id().to_string()),
                post_id: Some(id),
                kind: "like".into(),
                body: Some("liked your post".into()),
            })
            .await?;
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({ "liked": true })))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}/like",
    params(("id" = Id, Path, description = "Post id")),
    responses((status = 200, description = "Like removed"))
)]
pub async fn unlike_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    data.repo.get_post(id).await?;
    data.repo.remove_like(id, auth.user_id()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "liked": false })))
}

const MEDIA_SIZE_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

const ALLOWED_MIME: &[&str] = &[
    "image/png", "image/jpeg", "image/gif", "image/webp",
    "video/mp4", "video/webm"
];

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        _ => "bin",
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/media",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 201, description = "Media stored and attached", body = Media),
        (status = 415, description = "Unsupported media type"),
        (status = 413, description = "Payload too large")
    )
)]
pub async fn upload_media(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    use actix_web::http::StatusCode;
    let post_id = path.into_inner();
    let post = data.repo.get_post(post_id).await?;
    if post.owner_id != auth.user_id() {
        return Err(ApiError::Forbidden);
    }

    let mut bytes: Vec<u8> = Vec::new();
    while let Some(field) = payload.try_next().await.map_err(|e| {
        log::error!("multipart error: {e}");
        ApiError::Internal
    })? {
        if let Some(name) = field.content_disposition().get_name() {
            if name != "file" { continue; }
        } else { continue; }
        let mut field_stream = field;
        while let Some(chunk) = field_stream.try_next().await.map_err(|e| {
            log::error!("stream read error: {e}");
            ApiError::Internal
        })? {
            if bytes.len() + chunk.len() > MEDIA_SIZE_LIMIT {
                return Ok(HttpResponse::build(StatusCode::PAYLOAD_TOO_LARGE).finish());
            }
            bytes.extend_from_slice(&chunk);
        }
        // Infer MIME from content, never from the filename
        let mime = infer::get(&bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        if !ALLOWED_MIME.contains(&mime.as_str()) {
            return Ok(HttpResponse::UnsupportedMediaType().finish());
        }
        let media_type = if mime.starts_with("image") {
            MediaKind::Image
        } else {
            MediaKind::Video
        };
        let storage_path = format!(
            "{post_id}/{}.{}",
            uuid::Uuid::new_v4(),
            extension_for(&mime)
        );
        data.media_store
            .upload(&storage_path, &mime, &bytes)
            .await
            .map_err(|e| {
                log::error!("media_store upload error: {e}");
                ApiError::Internal
            })?;
        let display_order = data
            .repo
            .list_media(post_id)
            .await?
            .iter()
            .map(|m| m.display_order)
            .max()
            .map_or(0, |o| o + 1);
        let media = data
            .repo
            .add_media(NewMedia {
                post_id,
                storage_path,
                media_type,
                display_order,
            })
            .await?;
        if media_type == MediaKind::Image {
            data.queue.enqueue_moderation(post_id);
        }
        return Ok(HttpResponse::Created().json(media));
    }
    Ok(HttpResponse::BadRequest().finish())
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct LinkMediaRequest {
    pub storage_path: String,
    pub media_type: MediaKind,
    pub display_order: i32,
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/media/link",
    request_body = LinkMediaRequest,
    params(("id" = Id, Path, description = "Post id")),
    responses((status = 201, description = "Already-uploaded object attached", body = Media))
)]
pub async fn link_media(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<LinkMediaRequest>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    let post = data.repo.get_post(post_id).await?;
    if post.owner_id != auth.user_id() {
        return Err(ApiError::Forbidden);
    }
    let req = payload.into_inner();
    let media = data
        .repo
        .add_media(NewMedia {
            post_id,
            storage_path: req.storage_path,
            media_type: req.media_type,
            display_order: req.display_order,
        })
        .await?;
    if media.media_type == MediaKind::Image {
        data.queue.enqueue_moderation(post_id);
    }
    Ok(HttpResponse::Created().json(media))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}/media",
    params(("id" = Id, Path, description = "Post id")),
    responses((status = 200, description = "Media rows in display order", body = [Media]))
)]
pub async fn list_media(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    let post = data.repo.get_post(post_id).await?;
    can_view(&post, auth.as_ref())?;
    let media = data.repo.list_media(post_id).await?;
    Ok(HttpResponse::Ok().json(media))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}/media/{media_id}",
    params(
        ("id" = Id, Path, description = "Post id"),
        ("media_id" = Id, Path, description = "Media id")
    ),
    responses((status = 204, description = "Media deleted"))
)]
pub async fn delete_media(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    let (post_id, media_id) = path.into_inner();
    let post = data.repo.get_post(post_id).await?;
    if post.owner_id != auth.user_id() {
        return Err(ApiError::Forbidden);
    }
    let media = data.repo.get_media(media_id).await?;
    if media.post_id != post_id {
        return Err(ApiError::NotFound);
    }
    let _ = data.media_store.delete(&media.storage_path).await;
    data.repo.delete_media(media_id).await?;
    // Removing an image changes the aggregate; re-run the review.
    if media.media_type == MediaKind::Image {
        data.queue.enqueue_moderation(post_id);
    }
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}/moderation",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Moderation snapshot", body = ModerationSnapshot),
        (status = 403, description = "Snapshot of an unpublished post is owner-only")
    )
)]
pub async fn moderation_snapshot(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    let post = data.repo.get_post(post_id).await?;
    if post.status != ModerationStatus::Approved {
        let is_owner = auth.as_ref().map_or(false, |a| a.user_id() == post.owner_id);
        if !is_owner {
            return Err(ApiError::Forbidden);
        }
    }
    let snapshot = data.queue.service().snapshot(post_id).await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

#[derive(serde::Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread_only: bool,
}

#[utoipa::path(
    get,
    path = "/api/v1/notifications",
    params(("unread_only" = Option<bool>, Query, description = "Only unread rows")),
    responses((status = 200, description = "Notifications, newest first", body = [Notification]))
)]
pub async fn list_notifications(
    auth: Auth,
    data: web::Data<AppState>,
    query: web::Query<NotificationQuery>,
) -> Result<HttpResponse, ApiError> {
    let notifications = data
        .repo
        .list_notifications(auth.user_id(), query.unread_only)
        .await?;
    Ok(HttpResponse::Ok().json(notifications))
}

#[utoipa::path(
    patch,
    path = "/api/v1/notifications/{id}/read",
    params(("id" = Id, Path, description = "Notification id")),
    responses((status = 200, description = "Notification marked read", body = Notification))
)]
pub async fn mark_notification_read(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let n = data.repo.mark_read(path.into_inner(), auth.user_id()).await?;
    Ok(HttpResponse::Ok().json(n))
}

pub async fn mark_all_notifications_read(
    auth: Auth,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    data.repo.mark_all_read(auth.user_id()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "All notifications marked as read" })))
}

pub async fn unread_notification_count(
    auth: Auth,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let count = data.repo.unread_count(auth.user_id()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "count": count })))
}

// ---------------- Admin handlers -----------------------
macro_rules! ensure_admin { ($auth:expr) => { if !$auth.is_admin() { return Err(ApiError::Forbidden); } }; }

pub async fn admin_list_posts(
    auth: Auth,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let posts = data.repo.list_all_posts().await?;
    Ok(HttpResponse::Ok().json(posts))
}

pub async fn admin_delete_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let id = path.into_inner();
    let media = data.repo.list_media(id).await.unwrap_or_default();
    data.repo.delete_post(id).await?;
    for m in media {
        let _ = data.media_store.delete(&m.storage_path).await;
    }
    Ok(HttpResponse::NoContent().finish())
}

/// Manual re-entry into the review pipeline, e.g. for posts stuck in `error`.
pub async fn admin_remoderate_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let id = path.into_inner();
    data.repo.get_post(id).await?;
    data.queue.enqueue_moderation(id);
    Ok(HttpResponse::Accepted().json(serde_json::json!({ "status": "queued" })))
}
