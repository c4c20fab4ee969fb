#![cfg(feature = "inmem-store")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clearfeed::detector::{ClassifyError, ImageClassifier, Label, Verdict};
use clearfeed::models::{Id, MediaKind, ModerationStatus, NewMedia, NewNotification, NewPost, Post, UpdatePost};
use clearfeed::moderation::{ModerationConfig, ModerationService};
use clearfeed::repo::inmem::InMemRepo;
use clearfeed::repo::{
    MediaRepo, NotificationRepo, PostRepo, RepoError, RepoResult,
};
use clearfeed::storage::{MediaStore, MediaStoreError};

// ---------------- test doubles ----------------

/// Deterministic classifier driven by the first byte of the payload.
struct ScriptedClassifier;

impl ImageClassifier for ScriptedClassifier {
    fn classify(&self, bytes: &[u8]) -> Result<Verdict, ClassifyError> {
        match bytes.first() {
            Some(b'a') => Ok(Verdict { label: Label::Ai, confidence: 0.95 }),
            // "ai" but below the decision threshold
            Some(b'w') => Ok(Verdict { label: Label::Ai, confidence: 0.65 }),
            Some(b'r') => Ok(Verdict { label: Label::Real, confidence: 0.9 }),
            Some(b's') => {
                std::thread::sleep(Duration::from_millis(300));
                Ok(Verdict { label: Label::Real, confidence: 0.9 })
            }
            _ => Err(ClassifyError::Decode("unreadable".into())),
        }
    }
}

#[derive(Default)]
struct MockMediaStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockMediaStore {
    fn put(&self, path: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
    }
}

#[async_trait]
impl MediaStore for MockMediaStore {
    async fn upload(&self, path: &str, _mime: &str, bytes: &[u8]) -> Result<(), MediaStoreError> {
        self.put(path, bytes);
        Ok(())
    }
    async fn download(&self, path: &str) -> Result<Vec<u8>, MediaStoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or(MediaStoreError::NotFound)
    }
    async fn delete(&self, path: &str) -> Result<(), MediaStoreError> {
        self.objects.lock().unwrap().remove(path);
        Ok(())
    }
}

fn test_config() -> ModerationConfig {
    ModerationConfig {
        decision_threshold: 0.7,
        reject_percent: 80.0,
        per_image_timeout: Duration::from_millis(100),
    }
}

fn setup() -> (InMemRepo, Arc<MockMediaStore>, ModerationService) {
    let repo = InMemRepo::new();
    let store = Arc::new(MockMediaStore::default());
    let service = ModerationService::new(
        Arc::new(repo.clone()),
        store.clone(),
        Arc::new(ScriptedClassifier),
        test_config(),
    );
    (repo, store, service)
}

async fn make_post(repo: &InMemRepo) -> Id {
    repo.create_post("alice", NewPost { content: Some("hello".into()), is_private: false })
        .await
        .unwrap()
        .id
}

/// Attach one image whose payload drives the scripted classifier.
async fn attach_image(repo: &InMemRepo, store: &MockMediaStore, post_id: Id, order: i32, payload: &[u8]) -> Id {
    let path = format!("{post_id}/img-{order}.png");
    store.put(&path, payload);
    repo.add_media(NewMedia {
        post_id,
        storage_path: path,
        media_type: MediaKind::Image,
        display_order: order,
    })
    .await
    .unwrap()
    .id
}

async fn run_fresh(service: &ModerationService, post_id: Id) {
    let token = service.begin_job(post_id);
    service.run(post_id, token).await;
}

// ---------------- state machine ----------------

#[tokio::test]
async fn empty_media_approves_with_null_percentage() {
    let (repo, _store, service) = setup();
    let post_id = make_post(&repo).await;

    run_fresh(&service, post_id).await;

    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Approved);
    assert_eq!(post.ai_percentage, None);

    let notes = repo.list_notifications("alice", false).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, "post_approved");
    assert_eq!(notes[0].body.as_deref(), Some("Your post has been approved"));
}

#[tokio::test]
async fn all_real_images_store_null_instead_of_zero() {
    let (repo, store, service) = setup();
    let post_id = make_post(&repo).await;
    for i in 0..3 {
        attach_image(&repo, &store, post_id, i, b"real").await;
    }

    run_fresh(&service, post_id).await;

    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Approved);
    // internally 0%, persisted as NULL
    assert_eq!(post.ai_percentage, None);

    for m in repo.list_images(post_id).await.unwrap() {
        assert_eq!(m.is_ai, Some(false));
        let pct = m.ai_percentage.unwrap();
        assert!((pct - 90.0).abs() < 1e-3);
    }
}

#[tokio::test]
async fn all_ai_images_reject_with_exact_percentage() {
    let (repo, store, service) = setup();
    let post_id = make_post(&repo).await;
    for i in 0..5 {
        attach_image(&repo, &store, post_id, i, b"ai").await;
    }

    run_fresh(&service, post_id).await;

    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Rejected);
    assert_eq!(post.ai_percentage, Some(100.0));

    let notes = repo.list_notifications("alice", false).await.unwrap();
    assert_eq!(notes[0].kind, "post_rejected");
    assert!(notes[0].body.as_deref().unwrap().contains("100.0%"));
}

#[tokio::test]
async fn exactly_eighty_percent_is_still_approved() {
    let (repo, store, service) = setup();
    let post_id = make_post(&repo).await;
    for i in 0..4 {
        attach_image(&repo, &store, post_id, i, b"ai").await;
    }
    attach_image(&repo, &store, post_id, 4, b"real").await;

    run_fresh(&service, post_id).await;

    // 4/5 == 80% exactly: rejection requires strictly more
    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Approved);
    assert_eq!(post.ai_percentage, Some(80.0));
}

#[tokio::test]
async fn low_confidence_ai_prediction_counts_as_real() {
    let (repo, store, service) = setup();
    let post_id = make_post(&repo).await;
    let media_id = attach_image(&repo, &store, post_id, 0, b"weak-ai").await;

    run_fresh(&service, post_id).await;

    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Approved);
    assert_eq!(post.ai_percentage, None);

    let media = repo.get_media(media_id).await.unwrap();
    assert_eq!(media.is_ai, Some(false));
    assert!((media.ai_percentage.unwrap() - 65.0).abs() < 1e-3);
}

#[tokio::test]
async fn failed_download_stays_in_denominator() {
    let (repo, store, service) = setup();
    let post_id = make_post(&repo).await;
    attach_image(&repo, &store, post_id, 0, b"ai").await;
    attach_image(&repo, &store, post_id, 1, b"ai").await;
    // row exists but the object does not: download fails, image is skipped
    let missing = repo
        .add_media(NewMedia {
            post_id,
            storage_path: format!("{post_id}/gone.png"),
            media_type: MediaKind::Image,
            display_order: 2,
        })
        .await
        .unwrap()
        .id;

    run_fresh(&service, post_id).await;

    // 2 AI of 3 total (not of 2): 66.7% <= 80 -> approved. A shrunken
    // denominator would have rejected at 100%.
    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Approved);
    let pct = post.ai_percentage.unwrap();
    assert!((pct - 200.0 / 3.0).abs() < 1e-9);

    let media = repo.get_media(missing).await.unwrap();
    assert_eq!(media.is_ai, None);
    assert_eq!(media.ai_percentage, None);
}

#[tokio::test]
async fn one_failing_download_does_not_abort_the_job() {
    let (repo, store, service) = setup();
    let post_id = make_post(&repo).await;
    attach_image(&repo, &store, post_id, 0, b"real").await;
    attach_image(&repo, &store, post_id, 1, b"real").await;
    repo.add_media(NewMedia {
        post_id,
        storage_path: format!("{post_id}/gone.png"),
        media_type: MediaKind::Image,
        display_order: 2,
    })
    .await
    .unwrap();

    run_fresh(&service, post_id).await;

    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Approved);
    assert_eq!(post.ai_percentage, None);
}

#[tokio::test]
async fn corrupt_image_falls_back_instead_of_rejecting() {
    let (repo, store, service) = setup();
    let post_id = make_post(&repo).await;
    attach_image(&repo, &store, post_id, 0, b"ai").await;
    let corrupt = attach_image(&repo, &store, post_id, 1, b"\x00garbage").await;

    run_fresh(&service, post_id).await;

    // fallback is non-AI: 1/2 = 50% -> approved
    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Approved);
    assert_eq!(post.ai_percentage, Some(50.0));

    let media = repo.get_media(corrupt).await.unwrap();
    assert_eq!(media.is_ai, Some(false));
    assert!((media.ai_percentage.unwrap() - 0.01).abs() < 1e-9);
}

#[tokio::test]
async fn video_media_never_influences_the_verdict() {
    let (repo, store, service) = setup();
    let post_id = make_post(&repo).await;
    // an AI-looking video payload must be ignored entirely
    let path = format!("{post_id}/clip.mp4");
    store.put(&path, b"ai");
    repo.add_media(NewMedia {
        post_id,
        storage_path: path,
        media_type: MediaKind::Video,
        display_order: 0,
    })
    .await
    .unwrap();

    run_fresh(&service, post_id).await;

    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Approved);
    assert_eq!(post.ai_percentage, None);
}

#[tokio::test]
async fn slow_image_times_out_and_only_it_is_skipped() {
    let (repo, store, service) = setup();
    let post_id = make_post(&repo).await;
    let slow = attach_image(&repo, &store, post_id, 0, b"slow").await;
    attach_image(&repo, &store, post_id, 1, b"ai").await;

    run_fresh(&service, post_id).await;

    // 1 AI of 2 total, the slow image skipped without a verdict
    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Approved);
    assert_eq!(post.ai_percentage, Some(50.0));
    assert_eq!(repo.get_media(slow).await.unwrap().is_ai, None);
}

#[tokio::test]
async fn rerun_on_unchanged_media_is_idempotent() {
    let (repo, store, service) = setup();
    let post_id = make_post(&repo).await;
    attach_image(&repo, &store, post_id, 0, b"ai").await;
    attach_image(&repo, &store, post_id, 1, b"real").await;

    run_fresh(&service, post_id).await;
    let first = repo.get_post(post_id).await.unwrap();

    run_fresh(&service, post_id).await;
    let second = repo.get_post(post_id).await.unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(first.ai_percentage, second.ai_percentage);
}

#[tokio::test]
async fn stale_job_drops_its_commit() {
    let (repo, store, service) = setup();
    let post_id = make_post(&repo).await;
    attach_image(&repo, &store, post_id, 0, b"real").await;

    let stale = service.begin_job(post_id);
    let current = service.begin_job(post_id);

    service.run(post_id, stale).await;
    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Pending);
    assert!(repo.list_notifications("alice", false).await.unwrap().is_empty());

    service.run(post_id, current).await;
    let post = repo.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Approved);
}

// ---------------- systemic failure ----------------

/// Delegating repo whose notification insert can be forced to fail,
/// simulating the storage collaborator becoming unreachable mid-job.
#[derive(Clone)]
struct FlakyRepo {
    inner: InMemRepo,
    fail_notifications: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl PostRepo for FlakyRepo {
    async fn create_post(&self, owner_id: &str, new: NewPost) -> RepoResult<Post> {
        self.inner.create_post(owner_id, new).await
    }
    async fn get_post(&self, id: Id) -> RepoResult<Post> {
        self.inner.get_post(id).await
    }
    async fn list_posts(&self, viewer: Option<&str>, owner: Option<&str>) -> RepoResult<Vec<Post>> {
        self.inner.list_posts(viewer, owner).await
    }
    async fn list_all_posts(&self) -> RepoResult<Vec<Post>> {
        self.inner.list_all_posts().await
    }
    async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
        self.inner.update_post(id, upd).await
    }
    async fn delete_post(&self, id: Id) -> RepoResult<()> {
        self.inner.delete_post(id).await
    }
    async fn set_post_moderation(
        &self,
        id: Id,
        status: ModerationStatus,
        ai_percentage: Option<f64>,
    ) -> RepoResult<()> {
        self.inner.set_post_moderation(id, status, ai_percentage).await
    }
    async fn add_like(&self, post_id: Id, user_id: &str) -> RepoResult<bool> {
        self.inner.add_like(post_id, user_id).await
    }
    async fn remove_like(&self, post_id: Id, user_id: &str) -> RepoResult<bool> {
        self.inner.remove_like(post_id, user_id).await
    }
    async fn has_liked(&self, post_id: Id, user_id: &str) -> RepoResult<bool> {
        self.inner.has_liked(post_id, user_id).await
    }
}

#[async_trait]
impl MediaRepo for FlakyRepo {
    async fn add_media(&self, new: NewMedia) -> RepoResult<clearfeed::models::Media> {
        self.inner.add_media(new).await
    }
    async fn get_media(&self, id: Id) -> RepoResult<clearfeed::models::Media> {
        self.inner.get_media(id).await
    }
    async fn list_media(&self, post_id: Id) -> RepoResult<Vec<clearfeed::models::Media>> {
        self.inner.list_media(post_id).await
    }
    async fn list_images(&self, post_id: Id) -> RepoResult<Vec<clearfeed::models::Media>> {
        self.inner.list_images(post_id).await
    }
    async fn delete_media(&self, id: Id) -> RepoResult<()> {
        self.inner.delete_media(id).await
    }
    async fn set_media_verdict(&self, id: Id, is_ai: bool, ai_percentage: Option<f64>) -> RepoResult<()> {
        self.inner.set_media_verdict(id, is_ai, ai_percentage).await
    }
}

#[async_trait]
impl NotificationRepo for FlakyRepo {
    async fn insert_notification(
        &self,
        new: NewNotification,
    ) -> RepoResult<clearfeed::models::Notification> {
        if self.fail_notifications.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RepoError::Internal("notifications unreachable".into()));
        }
        self.inner.insert_notification(new).await
    }
    async fn list_notifications(
        &self,
        recipient: &str,
        unread_only: bool,
    ) -> RepoResult<Vec<clearfeed::models::Notification>> {
        self.inner.list_notifications(recipient, unread_only).await
    }
    async fn mark_read(&self, id: Id, recipient: &str) -> RepoResult<clearfeed::models::Notification> {
        self.inner.mark_read(id, recipient).await
    }
    async fn mark_all_read(&self, recipient: &str) -> RepoResult<()> {
        self.inner.mark_all_read(recipient).await
    }
    async fn unread_count(&self, recipient: &str) -> RepoResult<i64> {
        self.inner.unread_count(recipient).await
    }
}

#[tokio::test]
async fn systemic_failure_parks_the_post_in_error() {
    let inner = InMemRepo::new();
    let flaky = FlakyRepo {
        inner: inner.clone(),
        fail_notifications: Arc::new(std::sync::atomic::AtomicBool::new(true)),
    };
    let store = Arc::new(MockMediaStore::default());
    let service = ModerationService::new(
        Arc::new(flaky.clone()),
        store.clone(),
        Arc::new(ScriptedClassifier),
        test_config(),
    );

    let post_id = make_post(&inner).await;
    attach_image(&inner, &store, post_id, 0, b"real").await;

    run_fresh(&service, post_id).await;

    let post = inner.get_post(post_id).await.unwrap();
    assert_eq!(post.status, ModerationStatus::Error);
    assert_eq!(post.ai_percentage, None);
    assert!(inner.list_notifications("alice", false).await.unwrap().is_empty());
}
