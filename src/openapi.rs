use crate::models::{
    Media, MediaKind, MediaVerdict, ModerationSnapshot, ModerationStatus, NewMedia,
    NewNotification, NewPost, Notification, Post, UpdatePost,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::create_post,
        crate::routes::list_posts,
        crate::routes::get_post,
        crate::routes::update_post,
        crate::routes::delete_post,
        crate::routes::like_post,
        crate::routes::unlike_post,
        crate::routes::upload_media,
        crate::routes::link_media,
        crate::routes::list_media,
        crate::routes::delete_media,
        crate::routes::moderation_snapshot,
        crate::routes::list_notifications,
        crate::routes::mark_notification_read,
    ),
    components(schemas(
        Post, NewPost, UpdatePost, Media, NewMedia, MediaKind,
        ModerationStatus, ModerationSnapshot, MediaVerdict,
        Notification, NewNotification,
        crate::routes::LinkMediaRequest
    )),
    tags(
        (name = "posts", description = "Post operations"),
        (name = "media", description = "Media attachment operations"),
        (name = "moderation", description = "Authenticity review state"),
        (name = "notifications", description = "Notification read model"),
    )
)]
pub struct ApiDoc;
