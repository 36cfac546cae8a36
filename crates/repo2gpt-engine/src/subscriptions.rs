//! Fan-out of a job's event log to any number of observers.
//!
//! A subscription replays the durable backlog past the caller's offset, then
//! follows the store's live feed. Live events are deduplicated against the
//! last delivered id, and any gap (a lagged receiver, or an event that raced
//! the backlog read) is filled from the store, so delivery is in order with
//! nothing missing.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use repo2gpt_core::events::JobEvent;
use repo2gpt_core::ids::JobId;
use repo2gpt_store::{JobStore, StoreError};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// One item delivered to a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionItem {
    Event(JobEvent),
    /// Keep-alive; not part of the log and carries no id.
    Heartbeat,
}

pub type EventStream = Pin<Box<dyn Stream<Item = SubscriptionItem> + Send>>;

enum Wake {
    Live(Result<JobEvent, RecvError>),
    Tick,
}

pub struct SubscriptionManager {
    store: Arc<JobStore>,
    heartbeat: Duration,
}

impl SubscriptionManager {
    pub fn new(store: Arc<JobStore>, heartbeat: Duration) -> Self {
        Self { store, heartbeat }
    }

    /// Events with id > `after`, for polling clients.
    pub fn poll(&self, job_id: &JobId, after: u64) -> Result<Vec<JobEvent>, StoreError> {
        self.store.events_after(job_id, after)
    }

    /// Stream every event with id > `after`, then live events, ending after
    /// the terminal status event. Fails up front for an unknown job.
    pub fn subscribe(&self, job_id: JobId, after: u64) -> Result<EventStream, StoreError> {
        self.store.get_job(&job_id)?;
        // Subscribe before reading the backlog so nothing falls between the two.
        let mut live = self.store.subscribe();
        let store = Arc::clone(&self.store);
        let heartbeat = self.heartbeat;

        let stream = async_stream::stream! {
            let mut last = after;
            let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut batch = match store.events_after(&job_id, last) {
                Ok(events) => events,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "backlog read failed");
                    return;
                }
            };
            let mut closing = false;

            loop {
                for event in batch.drain(..) {
                    if event.id <= last {
                        continue;
                    }
                    last = event.id;
                    let terminal = event.is_terminal();
                    yield SubscriptionItem::Event(event);
                    if terminal {
                        debug!(job_id = %job_id, last, "subscription complete");
                        return;
                    }
                }
                if closing {
                    return;
                }
                // Backlog exhausted on a job that already finished.
                if last == after && store.get_job(&job_id).is_ok_and(|j| j.status.is_terminal()) {
                    return;
                }

                let wake = tokio::select! {
                    received = live.recv() => Wake::Live(received),
                    _ = ticker.tick() => Wake::Tick,
                };
                match wake {
                    Wake::Tick => {
                        yield SubscriptionItem::Heartbeat;
                        continue;
                    }
                    Wake::Live(Ok(event)) => {
                        if event.job_id != job_id || event.id <= last {
                            continue;
                        }
                        if event.id == last + 1 {
                            batch.push(event);
                            continue;
                        }
                    }
                    Wake::Live(Err(RecvError::Lagged(skipped))) => {
                        debug!(job_id = %job_id, skipped, "subscriber lagged, replaying from store");
                    }
                    Wake::Live(Err(RecvError::Closed)) => closing = true,
                }
                // Gap, lag or shutdown: the store has everything committed so far.
                match store.events_after(&job_id, last) {
                    Ok(events) => batch = events,
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "event replay failed");
                        return;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo2gpt_core::events::{EventDraft, EventKind};
    use repo2gpt_core::job::{JobRequest, JobStatus};
    use repo2gpt_core::source::SourceSpec;

    fn store(capacity: usize) -> Arc<JobStore> {
        Arc::new(JobStore::in_memory(capacity).unwrap())
    }

    fn request() -> JobRequest {
        JobRequest::new(SourceSpec::Git {
            url: "https://example.com/r.git".into(),
            reference: None,
        })
    }

    fn ids(items: &[SubscriptionItem]) -> Vec<u64> {
        items
            .iter()
            .filter_map(|i| match i {
                SubscriptionItem::Event(e) => Some(e.id),
                SubscriptionItem::Heartbeat => None,
            })
            .collect()
    }

    /// Claim the job, append `progress` events and fail it.
    fn drive(store: &JobStore, id: &JobId, progress: u8) {
        store.claim_next_pending().unwrap().unwrap();
        for i in 0..progress {
            store
                .append_event(id, EventDraft::progress("fetch", i, format!("step {i}")))
                .unwrap();
        }
        store.fail_job(id, "boom").unwrap();
    }

    #[tokio::test]
    async fn backlog_then_live_then_end() {
        let store = store(64);
        let job = store.create_job(request()).unwrap();
        let manager = SubscriptionManager::new(Arc::clone(&store), Duration::from_secs(60));

        let mut stream = manager.subscribe(job.id.clone(), 0).unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, SubscriptionItem::Event(ref e) if e.kind == EventKind::Status));

        let writer = Arc::clone(&store);
        let id = job.id.clone();
        tokio::spawn(async move { drive(&writer, &id, 3) });

        let rest: Vec<_> = stream.collect().await;
        assert_eq!(ids(&rest), vec![2, 3, 4, 5, 6]);
        let SubscriptionItem::Event(last) = rest.last().unwrap() else {
            panic!("stream ended on a heartbeat");
        };
        assert_eq!(last.status(), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn reconnect_from_last_id_has_no_gap_or_duplicate() {
        let store = store(64);
        let job = store.create_job(request()).unwrap();
        drive(&store, &job.id, 4);
        let manager = SubscriptionManager::new(Arc::clone(&store), Duration::from_secs(60));

        let full: Vec<_> = manager.subscribe(job.id.clone(), 0).unwrap().collect().await;

        let partial: Vec<_> = manager
            .subscribe(job.id.clone(), 0)
            .unwrap()
            .take(3)
            .collect()
            .await;
        let resume_from = *ids(&partial).last().unwrap();
        let resumed: Vec<_> = manager
            .subscribe(job.id.clone(), resume_from)
            .unwrap()
            .collect()
            .await;

        let mut stitched = ids(&partial);
        stitched.extend(ids(&resumed));
        assert_eq!(stitched, ids(&full));
    }

    #[tokio::test]
    async fn lagged_receiver_replays_from_store() {
        let store = store(2);
        let job = store.create_job(request()).unwrap();
        let manager = SubscriptionManager::new(Arc::clone(&store), Duration::from_secs(60));

        let mut stream = manager.subscribe(job.id.clone(), 0).unwrap();
        assert!(stream.next().await.is_some());
        drive(&store, &job.id, 20);

        let rest: Vec<_> = stream.collect().await;
        assert_eq!(ids(&rest), (2..=23).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn idle_subscription_gets_heartbeats() {
        let store = store(8);
        let job = store.create_job(request()).unwrap();
        let manager = SubscriptionManager::new(Arc::clone(&store), Duration::from_millis(20));

        let items: Vec<_> = manager
            .subscribe(job.id.clone(), 0)
            .unwrap()
            .take(3)
            .collect()
            .await;
        assert_eq!(ids(&items), vec![1]);
        assert_eq!(items[1], SubscriptionItem::Heartbeat);
        assert_eq!(items[2], SubscriptionItem::Heartbeat);
    }

    #[tokio::test]
    async fn finished_job_past_terminal_offset_ends_immediately() {
        let store = store(8);
        let job = store.create_job(request()).unwrap();
        drive(&store, &job.id, 0);
        let manager = SubscriptionManager::new(Arc::clone(&store), Duration::from_secs(60));

        let items: Vec<_> = manager.subscribe(job.id.clone(), 3).unwrap().collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn other_jobs_are_filtered_out() {
        let store = store(64);
        let mine = store.create_job(request()).unwrap();
        let manager = SubscriptionManager::new(Arc::clone(&store), Duration::from_secs(60));
        let stream = manager.subscribe(mine.id.clone(), 0).unwrap();

        let other = store.create_job(request()).unwrap();
        // Jobs are claimed oldest first, so drive them in order.
        drive(&store, &mine.id, 1);
        store.claim_next_pending().unwrap().unwrap();
        store.fail_job(&other.id, "x").unwrap();

        let items: Vec<_> = stream.collect().await;
        assert!(items.iter().all(|i| matches!(i, SubscriptionItem::Event(e) if e.job_id == mine.id)));
        assert_eq!(ids(&items), vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_job_is_rejected() {
        let manager = SubscriptionManager::new(store(8), Duration::from_secs(1));
        assert!(matches!(
            manager.subscribe(JobId::new(), 0),
            Err(StoreError::NotFound(_))
        ));
    }
}
