//! Bridges the engine's synchronous `EventSink::persist` call (invoked
//! directly from a pipeline worker thread, never from an async context) to
//! the async SQLite writes in `database.rs`, via a dedicated background
//! thread owning its own current-thread runtime -- the same "one runtime
//! per concern" idiom `vision-core` uses for its alarm router worker and
//! per-source MJPEG servers.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use tracing::{error, warn};
use vision_common::types::Event;
use vision_core::EventSink;

use crate::database::Database;

pub struct DbEventSink {
    tx: Option<Sender<Event>>,
    worker: Option<JoinHandle<()>>,
}

impl DbEventSink {
    pub fn new(db: Database) -> Self {
        let (tx, rx) = mpsc::channel::<Event>();
        let worker = std::thread::Builder::new()
            .name("vision-event-sink".to_string())
            .spawn(move || run_worker(db, rx))
            .expect("failed to spawn event sink worker thread");

        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }
}

impl EventSink for DbEventSink {
    fn persist(&self, event: &Event) {
        if let Some(tx) = &self.tx {
            if tx.send(event.clone()).is_err() {
                warn!(event_id = %event.id, "event sink worker gone, dropping event");
            }
        }
    }
}

fn run_worker(db: Database, rx: Receiver<Event>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "event sink failed to start its runtime");
            return;
        }
    };

    while let Ok(event) = rx.recv() {
        if let Err(e) = runtime.block_on(db.insert_event(&event, None)) {
            error!(event_id = %event.id, error = %e, "failed to persist event");
        }
    }
}

impl Drop for DbEventSink {
    /// Drop the sender first so the worker's `rx.recv()` loop observes the
    /// channel close and exits before we join it.
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vision_common::types::Severity;

    #[tokio::test]
    async fn persisted_event_is_observable_through_the_database() {
        let db = Database::new("sqlite::memory:").await.expect("open");
        db.run_migrations().await.expect("migrate");

        // the sink owns its own Database handle so the writer thread never
        // contends with this test's async runtime for the connection.
        let sink_db = Database::new("sqlite::memory:").await.expect("open");
        sink_db.run_migrations().await.expect("migrate");
        let sink = DbEventSink::new(sink_db.clone());

        let event = Event {
            id: uuid::Uuid::new_v4(),
            source_id: "cam-1".into(),
            event_type: "intrusion".into(),
            severity: Severity::Warning,
            timestamp: Utc::now(),
            bbox: None,
            local_track_id: None,
            global_track_id: None,
            metadata: serde_json::json!({}),
        };
        sink.persist(&event);
        drop(sink);

        let events = sink_db.list_events(Some("cam-1"), 10).await.expect("list");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id.to_string());
    }
}
