use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::detector::{ImageClassifier, Label};
use crate::models::{
    Id, Media, MediaVerdict, ModerationSnapshot, ModerationStatus, NewNotification, Post,
};
use crate::repo::{Repo, RepoError, RepoResult};
use crate::storage::MediaStore;

/// Smallest stored percentage; the storage convention forbids an exact zero.
const FLOOR_EPSILON: f64 = 0.01;

#[derive(Clone, Debug)]
pub struct ModerationConfig {
    /// Raw-confidence threshold an "ai" prediction must clear to count.
    pub decision_threshold: f32,
    /// A post is rejected when its AI percentage strictly exceeds this.
    pub reject_percent: f64,
    /// Budget for download + classification of a single image.
    pub per_image_timeout: Duration,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            decision_threshold: 0.7,
            reject_percent: 80.0,
            per_image_timeout: Duration::from_secs(30),
        }
    }
}

impl ModerationConfig {
    pub fn from_env() -> Self {
        fn f32_env(name: &str, default: f32) -> f32 {
            std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }
        fn f64_env(name: &str, default: f64) -> f64 {
            std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }
        fn secs_env(name: &str, default: u64) -> Duration {
            Duration::from_secs(std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default))
        }
        Self {
            decision_threshold: f32_env("MODERATION_DECISION_THRESHOLD", 0.7),
            reject_percent: f64_env("MODERATION_REJECT_PERCENT", 80.0),
            per_image_timeout: secs_env("MODERATION_IMAGE_TIMEOUT_SECS", 30),
        }
    }
}

/// Normalized per-image record persisted to the media row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageScore {
    pub confidence_percent: f64,
    pub is_ai: bool,
    pub label: &'static str,
}

impl ImageScore {
    fn fallback() -> Self {
        Self {
            confidence_percent: FLOOR_EPSILON,
            is_ai: false,
            label: "unknown",
        }
    }
}

/// Converts one classifier verdict into a storable record. Classification
/// failures degrade to a safe non-AI fallback; one corrupt image must not
/// reject the whole post.
pub struct ModerationScorer {
    classifier: Arc<dyn ImageClassifier>,
    decision_threshold: f32,
}

impl ModerationScorer {
    pub fn new(classifier: Arc<dyn ImageClassifier>, decision_threshold: f32) -> Self {
        Self { classifier, decision_threshold }
    }

    pub async fn score(&self, bytes: Vec<u8>) -> ImageScore {
        let classifier = self.classifier.clone();
        let result =
            tokio::task::spawn_blocking(move || classifier.classify(&bytes)).await;
        match result {
            Ok(Ok(verdict)) => ImageScore {
                confidence_percent: (verdict.confidence as f64 * 100.0).max(FLOOR_EPSILON),
                is_ai: verdict.label == Label::Ai
                    && verdict.confidence >= self.decision_threshold,
                label: verdict.label.as_str(),
            },
            Ok(Err(e)) => {
                warn!("classification failed, using fallback verdict: {e}");
                ImageScore::fallback()
            }
            Err(e) => {
                error!("classifier task panicked: {e}");
                ImageScore::fallback()
            }
        }
    }
}

/// Failure outside the per-image loop; aborts the whole run.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("repository: {0}")]
    Repo(#[from] RepoError),
}

/// Post-level aggregation: scores every image of a post, persists per-image
/// verdicts, transitions the post status and notifies the owner.
pub struct ModerationService {
    repo: Arc<dyn Repo>,
    store: Arc<dyn MediaStore>,
    scorer: ModerationScorer,
    cfg: ModerationConfig,
    generations: DashMap<Id, u64>,
}

impl ModerationService {
    pub fn new(
        repo: Arc<dyn Repo>,
        store: Arc<dyn MediaStore>,
        classifier: Arc<dyn ImageClassifier>,
        cfg: ModerationConfig,
    ) -> Self {
        let scorer = ModerationScorer::new(classifier, cfg.decision_threshold);
        Self {
            repo,
            store,
            scorer,
            cfg,
            generations: DashMap::new(),
        }
    }

    /// Registers a fresh job for the post and returns its token. A later
    /// token supersedes every earlier one at commit time.
    pub fn begin_job(&self, post_id: Id) -> u64 {
        let mut entry = self.generations.entry(post_id).or_insert(0);
        *entry += 1;
        *entry
    }

    fn is_current(&self, post_id: Id, token: u64) -> bool {
        self.generations.get(&post_id).map_or(false, |g| *g == token)
    }

    /// One full aggregation run. Never panics and never returns an error;
    /// systemic failures park the post in `error`.
    pub async fn run(&self, post_id: Id, token: u64) {
        metrics::increment_counter!("moderation_jobs_total");
        if let Err(e) = self.aggregate(post_id, token).await {
            metrics::increment_counter!("moderation_jobs_failed_total");
            error!(post_id, "moderation job failed: {e}");
            if self.is_current(post_id, token) {
                if let Err(e2) = self
                    .repo
                    .set_post_moderation(post_id, ModerationStatus::Error, None)
                    .await
                {
                    error!(post_id, "could not mark post as errored: {e2}");
                }
            }
        }
    }

    async fn aggregate(&self, post_id: Id, token: u64) -> Result<(), JobError> {
        let post = self.repo.get_post(post_id).await?;
        let images = self.repo.list_images(post_id).await?;

        if images.is_empty() {
            self.commit(&post, ModerationStatus::Approved, None, token).await?;
            return Ok(());
        }

        // Failed images stay in the denominator; they just never count as AI.
        let total = images.len();
        let mut ai_count = 0usize;
        for media in &images {
            match tokio::time::timeout(self.cfg.per_image_timeout, self.score_one(media)).await {
                Ok(Some(score)) if score.is_ai => ai_count += 1,
                Ok(Some(_)) => {}
                Ok(None) => {
                    metrics::increment_counter!("moderation_images_skipped_total");
                }
                Err(_) => {
                    metrics::increment_counter!("moderation_images_skipped_total");
                    warn!(post_id, media_id = media.id, "image scoring timed out, skipping");
                }
            }
        }

        let ai_percentage = 100.0 * ai_count as f64 / total as f64;
        let status = if ai_percentage > self.cfg.reject_percent {
            ModerationStatus::Rejected
        } else {
            ModerationStatus::Approved
        };
        let stored = (ai_percentage > 0.0).then_some(ai_percentage);
        self.commit(&post, status, stored, token).await?;
        Ok(())
    }

    /// Download + score + persist one image. `None` means the image was
    /// skipped; the caller decides what that does to the aggregate.
    async fn score_one(&self, media: &Media) -> Option<ImageScore> {
        let bytes = match self.store.download(&media.storage_path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(
                    media_id = media.id,
                    path = %media.storage_path,
                    "media download failed, skipping image: {e}"
                );
                return None;
            }
        };
        let score = self.scorer.score(bytes).await;
        let percent = (score.confidence_percent > 0.0).then_some(score.confidence_percent);
        if let Err(e) = self.repo.set_media_verdict(media.id, score.is_ai, percent).await {
            warn!(media_id = media.id, "could not persist media verdict, skipping image: {e}");
            return None;
        }
        Some(score)
    }

    async fn commit(
        &self,
        post: &Post,
        status: ModerationStatus,
        ai_percentage: Option<f64>,
        token: u64,
    ) -> Result<(), JobError> {
        if !self.is_current(post.id, token) {
            metrics::increment_counter!("moderation_jobs_superseded_total");
            info!(post_id = post.id, "job superseded by a newer trigger, dropping commit");
            return Ok(());
        }
        self.repo
            .set_post_moderation(post.id, status, ai_percentage)
            .await?;
        if status == ModerationStatus::Rejected {
            metrics::increment_counter!("moderation_posts_rejected_total");
        }

        let body = match (status, ai_percentage) {
            (ModerationStatus::Rejected, pct) => format!(
                "Your post was rejected due to high AI content: {:.1}%",
                pct.unwrap_or(0.0)
            ),
            (_, Some(pct)) => {
                format!("Your post has been approved! AI detection score: {pct:.1}%")
            }
            (_, None) => "Your post has been approved".to_string(),
        };
        self.repo
            .insert_notification(NewNotification {
                recipient_id: post.owner_id.clone(),
                actor_id: None,
                post_id: Some(post.id),
                kind: format!("post_{}", status.as_str()),
                body: Some(body),
            })
            .await?;
        Ok(())
    }

    /// Read-only projection for the HTTP layer.
    pub async fn snapshot(&self, post_id: Id) -> RepoResult<ModerationSnapshot> {
        let post = self.repo.get_post(post_id).await?;
        let media = self.repo.list_media(post_id).await?;
        Ok(ModerationSnapshot {
            post_id,
            status: post.status,
            ai_percentage: post.ai_percentage,
            media: media
                .into_iter()
                .map(|m| MediaVerdict {
                    media_id: m.id,
                    is_ai: m.is_ai,
                    ai_percentage: m.ai_percentage,
                })
                .collect(),
        })
    }
}
