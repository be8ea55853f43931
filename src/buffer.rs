//! Bounded write-behind buffer for event indexing. One background task
//! drains a channel and writes accumulated rows as bulk batches, either when
//! the batch-size threshold is hit or when the flush interval elapses.
//!
//! Delivery is at-most-once: a failed batch is logged and dropped, and
//! `shutdown` abandons whatever is still queued. Callers that need the
//! stronger guarantee index synchronously instead.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error};

use crate::error::{Result, StoreError};
use crate::kv::{KeyValueStore, Row, Table};

#[derive(Debug, Clone)]
pub struct EventBufferConfig {
    /// Channel capacity; senders wait once it fills.
    pub capacity: usize,
    /// Rows per bulk write before an early flush.
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for EventBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            batch_size: 100,
            flush_interval: Duration::from_millis(250),
        }
    }
}

enum BufferCommand {
    Write(Vec<u8>, Row),
    Flush(oneshot::Sender<()>),
}

pub struct EventBuffer {
    tx: mpsc::Sender<BufferCommand>,
    task: JoinHandle<()>,
}

impl EventBuffer {
    /// Spawn the drain task. Must be called from within a tokio runtime.
    pub fn start(store: Arc<dyn KeyValueStore>, config: EventBufferConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let task = tokio::spawn(drain(store, rx, config));
        Self { tx, task }
    }

    /// Queue one event row write, waiting if the buffer is full.
    pub async fn enqueue(&self, row_key: Vec<u8>, columns: Row) -> Result<()> {
        self.tx
            .send(BufferCommand::Write(row_key, columns))
            .await
            .map_err(|_| StoreError::BufferClosed)
    }

    /// Write out everything queued so far and wait for it to land.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(BufferCommand::Flush(done_tx))
            .await
            .map_err(|_| StoreError::BufferClosed)?;
        done_rx.await.map_err(|_| StoreError::BufferClosed)
    }

    /// Stop the drain task immediately, dropping unflushed writes.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn drain(
    store: Arc<dyn KeyValueStore>,
    mut rx: mpsc::Receiver<BufferCommand>,
    config: EventBufferConfig,
) {
    let batch_size = config.batch_size.max(1);
    let mut pending: Vec<(Vec<u8>, Row)> = Vec::with_capacity(batch_size);
    let mut ticker = time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(BufferCommand::Write(key, columns)) => {
                    pending.push((key, columns));
                    if pending.len() >= batch_size {
                        flush_pending(store.as_ref(), &mut pending);
                    }
                }
                Some(BufferCommand::Flush(done)) => {
                    flush_pending(store.as_ref(), &mut pending);
                    let _ = done.send(());
                }
                None => {
                    // All senders gone; drain what is left and stop.
                    flush_pending(store.as_ref(), &mut pending);
                    break;
                }
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    flush_pending(store.as_ref(), &mut pending);
                }
            }
        }
    }
    debug!("event buffer drain task stopped");
}

fn flush_pending(store: &dyn KeyValueStore, pending: &mut Vec<(Vec<u8>, Row)>) {
    if pending.is_empty() {
        return;
    }
    let rows = std::mem::take(pending);
    let count = rows.len() as u64;
    match store.put_batch(Table::Events, rows) {
        Ok(()) => {
            counter!("fleetstore_event_buffer_flushes_total", "status" => "ok").increment(1);
            counter!("fleetstore_event_buffer_events_total").increment(count);
        }
        Err(err) => {
            error!(error = %err, events = count, "event buffer flush failed, batch dropped");
            counter!("fleetstore_event_buffer_flushes_total", "status" => "err").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn event_row(name: &str) -> Row {
        Row::from([(name.to_string(), vec![0x01])])
    }

    #[tokio::test]
    async fn flush_makes_queued_writes_visible() {
        let store = Arc::new(MemoryStore::new());
        let buffer = EventBuffer::start(store.clone(), EventBufferConfig::default());

        buffer.enqueue(b"row-a".to_vec(), event_row("q1")).await.unwrap();
        buffer.enqueue(b"row-a".to_vec(), event_row("q2")).await.unwrap();
        buffer.flush().await.unwrap();

        let row = store.get(Table::Events, b"row-a").unwrap().unwrap();
        assert!(row.contains_key("q1"));
        assert!(row.contains_key("q2"));
    }

    #[tokio::test]
    async fn batch_threshold_flushes_without_explicit_flush() {
        let store = Arc::new(MemoryStore::new());
        let config = EventBufferConfig {
            batch_size: 2,
            flush_interval: Duration::from_secs(3600),
            ..EventBufferConfig::default()
        };
        let buffer = EventBuffer::start(store.clone(), config);

        buffer.enqueue(b"row-b".to_vec(), event_row("q1")).await.unwrap();
        buffer.enqueue(b"row-b".to_vec(), event_row("q2")).await.unwrap();
        // A follow-up flush of an already-drained queue is a cheap way to
        // wait for the threshold write to complete.
        buffer.flush().await.unwrap();

        assert!(store.get(Table::Events, b"row-b").unwrap().is_some());
    }
}
