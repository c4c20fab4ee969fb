#![cfg(feature = "inmem-store")]

use clearfeed::models::{MediaKind, ModerationStatus, NewMedia, NewNotification, NewPost, UpdatePost};
use clearfeed::repo::inmem::InMemRepo;
use clearfeed::repo::RepoError;
// Bring trait method namespaces into scope so calls on InMemRepo resolve.
use clearfeed::repo::{MediaRepo, NotificationRepo, PostRepo};

/// Helper that returns a fresh, empty repository for every test run.
fn repo() -> InMemRepo {
    InMemRepo::new()
}

#[tokio::test]
async fn posts_are_created_pending_and_edits_leave_moderation_alone() {
    let r = repo();

    let p = r
        .create_post("alice", NewPost { content: Some("first".into()), is_private: false })
        .await
        .unwrap();
    assert_eq!(p.status, ModerationStatus::Pending);
    assert_eq!(p.ai_percentage, None);
    assert_eq!(p.like_count, 0);

    // the aggregator commits status + percentage in one write
    r.set_post_moderation(p.id, ModerationStatus::Rejected, Some(87.5))
        .await
        .unwrap();

    // an owner edit must not disturb either field
    let edited = r
        .update_post(p.id, UpdatePost { content: Some("second".into()), is_private: Some(true) })
        .await
        .unwrap();
    assert_eq!(edited.content.as_deref(), Some("second"));
    assert!(edited.is_private);
    assert_eq!(edited.status, ModerationStatus::Rejected);
    assert_eq!(edited.ai_percentage, Some(87.5));

    // unknown post → not found
    let err = r.get_post(9999).await.unwrap_err();
    assert!(matches!(err, RepoError::NotFound));
}

#[tokio::test]
async fn feed_visibility_rules() {
    let r = repo();

    let public_ok = r
        .create_post("alice", NewPost { content: None, is_private: false })
        .await
        .unwrap();
    r.set_post_moderation(public_ok.id, ModerationStatus::Approved, None)
        .await
        .unwrap();
    let private_ok = r
        .create_post("alice", NewPost { content: None, is_private: true })
        .await
        .unwrap();
    r.set_post_moderation(private_ok.id, ModerationStatus::Approved, None)
        .await
        .unwrap();
    let pending = r
        .create_post("alice", NewPost { content: None, is_private: false })
        .await
        .unwrap();

    // guest feed: only the approved public post
    let feed = r.list_posts(None, None).await.unwrap();
    assert_eq!(feed.iter().map(|p| p.id).collect::<Vec<_>>(), vec![public_ok.id]);

    // owner feed: everything of their own
    let own = r.list_posts(Some("alice"), Some("alice")).await.unwrap();
    assert_eq!(own.len(), 3);

    // stranger looking at alice's profile: approved public only
    let profile = r.list_posts(Some("bob"), Some("alice")).await.unwrap();
    assert_eq!(profile.iter().map(|p| p.id).collect::<Vec<_>>(), vec![public_ok.id]);

    let _ = pending;
}

#[tokio::test]
async fn likes_are_idempotent_and_counted() {
    let r = repo();
    let p = r
        .create_post("alice", NewPost { content: None, is_private: false })
        .await
        .unwrap();

    assert!(r.add_like(p.id, "bob").await.unwrap());
    assert!(!r.add_like(p.id, "bob").await.unwrap()); // duplicate
    assert!(r.add_like(p.id, "carol").await.unwrap());
    assert_eq!(r.get_post(p.id).await.unwrap().like_count, 2);
    assert!(r.has_liked(p.id, "bob").await.unwrap());

    assert!(r.remove_like(p.id, "bob").await.unwrap());
    assert!(!r.remove_like(p.id, "bob").await.unwrap()); // already gone
    assert_eq!(r.get_post(p.id).await.unwrap().like_count, 1);
    assert!(!r.has_liked(p.id, "bob").await.unwrap());
}

#[tokio::test]
async fn media_flow_and_image_filter() {
    let r = repo();
    let p = r
        .create_post("alice", NewPost { content: None, is_private: false })
        .await
        .unwrap();

    let img = r
        .add_media(NewMedia {
            post_id: p.id,
            storage_path: "p/one.png".into(),
            media_type: MediaKind::Image,
            display_order: 1,
        })
        .await
        .unwrap();
    let vid = r
        .add_media(NewMedia {
            post_id: p.id,
            storage_path: "p/clip.mp4".into(),
            media_type: MediaKind::Video,
            display_order: 0,
        })
        .await
        .unwrap();

    // ordered by display_order
    let all = r.list_media(p.id).await.unwrap();
    assert_eq!(all.iter().map(|m| m.id).collect::<Vec<_>>(), vec![vid.id, img.id]);

    // moderation only ever sees the image
    let images = r.list_images(p.id).await.unwrap();
    assert_eq!(images.iter().map(|m| m.id).collect::<Vec<_>>(), vec![img.id]);

    r.set_media_verdict(img.id, true, Some(95.0)).await.unwrap();
    let img = r.get_media(img.id).await.unwrap();
    assert_eq!(img.is_ai, Some(true));
    assert_eq!(img.ai_percentage, Some(95.0));

    // attaching to a missing post fails
    let err = r
        .add_media(NewMedia {
            post_id: 424242,
            storage_path: "x".into(),
            media_type: MediaKind::Image,
            display_order: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::NotFound));

    r.delete_media(vid.id).await.unwrap();
    assert_eq!(r.list_media(p.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn notification_read_state() {
    let r = repo();

    for i in 0..3 {
        r.insert_notification(NewNotification {
            recipient_id: "alice".into(),
            actor_id: None,
            post_id: None,
            kind: "post_approved".into(),
            body: Some(format!("note {i}")),
        })
        .await
        .unwrap();
    }
    r.insert_notification(NewNotification {
        recipient_id: "bob".into(),
        actor_id: Some("alice".into()),
        post_id: None,
        kind: "like".into(),
        body: Some("liked your post".into()),
    })
    .await
    .unwrap();

    assert_eq!(r.unread_count("alice").await.unwrap(), 3);
    assert_eq!(r.unread_count("bob").await.unwrap(), 1);

    let first = r.list_notifications("alice", true).await.unwrap();
    assert_eq!(first.len(), 3);

    // marking someone else's notification fails
    let err = r.mark_read(first[0].id, "bob").await.unwrap_err();
    assert!(matches!(err, RepoError::NotFound));

    let read = r.mark_read(first[0].id, "alice").await.unwrap();
    assert!(read.is_read);
    assert_eq!(r.unread_count("alice").await.unwrap(), 2);
    assert_eq!(r.list_notifications("alice", true).await.unwrap().len(), 2);

    r.mark_all_read("alice").await.unwrap();
    assert_eq!(r.unread_count("alice").await.unwrap(), 0);
    // bob's stays untouched
    assert_eq!(r.unread_count("bob").await.unwrap(), 1);
}
