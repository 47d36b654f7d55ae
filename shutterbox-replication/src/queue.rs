use async_trait::async_trait;
use shutterbox::{Result, ShutterboxError};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;

/// A unit of periodic work. The ticket ties the job to the schedule that
/// queued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Replicate { attempt: u32, ticket: u64 },
    Reap { ticket: u64 },
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job);
}

#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JobQueue { sender: tx }, rx)
    }

    /// Queue `job` to run after `delay`. Returns immediately; a delayed job
    /// waits on its own timer task. Must be called inside a tokio runtime.
    pub fn enqueue(&self, job: Job, delay: Duration) -> Result<()> {
        if self.sender.is_closed() {
            return Err(ShutterboxError::QueueClosed);
        }
        if delay.is_zero() {
            return self
                .sender
                .send(job)
                .map_err(|_| ShutterboxError::QueueClosed);
        }

        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(job).is_err() {
                tracing::debug!("dropping {:?}: dispatcher stopped", job);
            }
        });
        Ok(())
    }
}

/// Consume jobs one at a time until the queue closes or the handler is
/// dropped. Sequential handling is what keeps a single consumer per job.
pub async fn run_dispatcher<H: JobHandler>(
    mut rx: mpsc::UnboundedReceiver<Job>,
    handler: Weak<H>,
) {
    while let Some(job) = rx.recv().await {
        let Some(handler) = handler.upgrade() else {
            tracing::debug!("dispatcher stopping: handler dropped");
            break;
        };
        handler.handle(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(Job, tokio::time::Instant)>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: Job) {
            self.seen
                .lock()
                .unwrap()
                .push((job, tokio::time::Instant::now()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_jobs_fire_in_due_order() {
        let (queue, rx) = JobQueue::new();
        let recorder = Arc::new(Recorder::default());
        tokio::spawn(run_dispatcher(rx, Arc::downgrade(&recorder)));
        let start = tokio::time::Instant::now();

        queue.enqueue(Job::Reap { ticket: 2 }, Duration::from_secs(10)).unwrap();
        queue
            .enqueue(Job::Replicate { attempt: 0, ticket: 1 }, Duration::from_secs(2))
            .unwrap();
        queue.enqueue(Job::Replicate { attempt: 0, ticket: 3 }, Duration::ZERO).unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;

        let seen = recorder.seen.lock().unwrap().clone();
        let jobs: Vec<Job> = seen.iter().map(|(j, _)| *j).collect();
        assert_eq!(
            jobs,
            vec![
                Job::Replicate { attempt: 0, ticket: 3 },
                Job::Replicate { attempt: 0, ticket: 1 },
                Job::Reap { ticket: 2 },
            ]
        );
        let second = seen[1].1 - start;
        let third = seen[2].1 - start;
        assert!(second >= Duration::from_secs(2) && second < Duration::from_secs(3));
        assert!(third >= Duration::from_secs(10) && third < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_enqueue_after_receiver_dropped() {
        let (queue, rx) = JobQueue::new();
        drop(rx);
        assert!(matches!(
            queue.enqueue(Job::Reap { ticket: 1 }, Duration::ZERO),
            Err(ShutterboxError::QueueClosed)
        ));
    }
}
