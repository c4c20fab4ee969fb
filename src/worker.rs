use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info};

use crate::models::Id;
use crate::moderation::ModerationService;

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Job {
    post_id: Id,
    token: u64,
}

/// Fire-and-forget entry point for moderation work. Enqueueing never blocks
/// the request path; jobs run detached on a bounded pool.
#[derive(Clone)]
pub struct ModerationQueue {
    tx: mpsc::Sender<Job>,
    service: Arc<ModerationService>,
}

impl ModerationQueue {
    /// Spawns the dispatcher and `workers` concurrent job slots.
    pub fn spawn(service: Arc<ModerationService>, workers: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_CAPACITY);
        let pool = Arc::new(Semaphore::new(workers.max(1)));
        let dispatcher_service = service.clone();
        tokio::spawn(async move {
            info!(workers, "moderation worker pool started");
            while let Some(job) = rx.recv().await {
                let permit = match pool.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break, // semaphore closed, shutting down
                };
                let service = dispatcher_service.clone();
                tokio::spawn(async move {
                    service.run(job.post_id, job.token).await;
                    drop(permit);
                });
            }
            info!("moderation worker pool stopped");
        });
        Self { tx, service }
    }

    /// Queues one aggregation run for the post. Called after every mutation
    /// of the post's image set.
    pub fn enqueue_moderation(&self, post_id: Id) {
        let token = self.service.begin_job(post_id);
        match self.tx.try_send(Job { post_id, token }) {
            Ok(()) => {
                metrics::increment_counter!("moderation_jobs_enqueued_total");
            }
            Err(e) => {
                // Post stays pending; an admin remoderate can recover it.
                metrics::increment_counter!("moderation_enqueue_dropped_total");
                error!(post_id, "failed to enqueue moderation job: {e}");
            }
        }
    }

    pub fn service(&self) -> &ModerationService {
        &self.service
    }

    /// Worker count bounded by the machine's compute so inference cannot
    /// starve unrelated work.
    pub fn default_workers() -> usize {
        std::env::var("MODERATION_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(2)
            })
    }
}
