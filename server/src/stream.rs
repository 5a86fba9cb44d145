//! Streaming Multiplexer
//!
//! One bounded frame queue per streaming task. Producers are the per-node
//! protocol readers (via each task's driver); the consumer is the HTTP
//! server-sent stream handler draining frames in arrival order. Frames
//! within one subtask keep worker send order; interleaving across subtasks
//! is arbitrary.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use iris_common::protocol::StreamFrame;

struct StreamInner {
    queue: VecDeque<StreamFrame>,
    closed: bool,
    /// Exactly one Error/Aborted marker per stream.
    terminal_emitted: bool,
    closed_at: Option<Instant>,
}

/// Bounded FIFO of stream frames for one task.
pub struct TaskStream {
    task_id: Uuid,
    capacity: usize,
    inner: Mutex<StreamInner>,
    notify: Notify,
}

impl TaskStream {
    fn new(task_id: Uuid, capacity: usize) -> Self {
        Self {
            task_id,
            capacity,
            inner: Mutex::new(StreamInner {
                queue: VecDeque::new(),
                closed: false,
                terminal_emitted: false,
                closed_at: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a frame.
    ///
    /// At capacity, the oldest non-terminal chunk of the slowest subtask
    /// (the one with the most buffered chunks) is dropped and a `Dropped`
    /// marker injected in its place. Terminal chunks and markers are never
    /// dropped and are always admitted.
    pub fn push(&self, frame: StreamFrame) {
        let mut inner = self.inner.lock().expect("stream lock");
        if inner.closed {
            debug!(task_id = %self.task_id, "Frame after close discarded");
            return;
        }

        let droppable = matches!(frame, StreamFrame::Chunk { is_terminal: false, .. });
        if droppable && inner.queue.len() >= self.capacity {
            Self::drop_oldest_of_slowest(&mut inner.queue);
            warn!(task_id = %self.task_id, "Stream queue overflow, dropped oldest chunk");
        }

        inner.queue.push_back(frame);
        drop(inner);
        self.notify.notify_one();
    }

    /// Remove the oldest non-terminal chunk belonging to the subtask with
    /// the most buffered chunks, replacing it with a `Dropped` marker
    /// (unless one is already adjacent for that subtask).
    fn drop_oldest_of_slowest(queue: &mut VecDeque<StreamFrame>) {
        let mut counts: std::collections::HashMap<u32, usize> = std::collections::HashMap::new();
        for frame in queue.iter() {
            if let StreamFrame::Chunk { subtask_index, is_terminal: false, .. } = frame {
                *counts.entry(*subtask_index).or_default() += 1;
            }
        }

        let Some((&slowest, _)) = counts.iter().max_by_key(|(idx, count)| (**count, **idx)) else {
            return; // only terminals/markers buffered; admit over capacity
        };

        let Some(pos) = queue.iter().position(
            |f| matches!(f, StreamFrame::Chunk { subtask_index, is_terminal: false, .. } if *subtask_index == slowest),
        ) else {
            return;
        };

        let marker = StreamFrame::Dropped { subtask_index: slowest };
        let already_marked = pos > 0 && queue.get(pos - 1) == Some(&marker);
        queue.remove(pos);
        if !already_marked {
            queue.insert(pos, marker);
        }
    }

    /// Next frame, waiting if the queue is empty. Returns `None` once the
    /// stream is closed and drained.
    pub async fn next(&self) -> Option<StreamFrame> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("stream lock");
                if let Some(frame) = inner.queue.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close after every subtask delivered its terminal frame. No marker
    /// is added; the per-subtask terminals already ended the stream.
    pub fn close(&self) {
        self.close_inner(None);
    }

    /// Close on terminal task failure, emitting a single `Error` marker.
    pub fn close_error(&self, reason: &str) {
        self.close_inner(Some(StreamFrame::Error { reason: reason.to_string() }));
    }

    /// Close on cancellation or consumer loss, emitting `Aborted`.
    pub fn close_aborted(&self) {
        self.close_inner(Some(StreamFrame::Aborted));
    }

    fn close_inner(&self, marker: Option<StreamFrame>) {
        let mut inner = self.inner.lock().expect("stream lock");
        if inner.closed {
            return;
        }
        if let Some(marker) = marker {
            if !inner.terminal_emitted {
                inner.terminal_emitted = true;
                inner.queue.push_back(marker);
            }
        }
        inner.closed = true;
        inner.closed_at = Some(Instant::now());
        drop(inner);
        self.notify.notify_one();
    }

    /// Whether the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("stream lock").closed
    }

    fn closed_for(&self) -> Option<Duration> {
        self.inner.lock().expect("stream lock").closed_at.map(|t| t.elapsed())
    }
}

/// Owner of every live [`TaskStream`].
pub struct StreamRegistry {
    streams: DashMap<Uuid, Arc<TaskStream>>,
    capacity: usize,
}

impl StreamRegistry {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { streams: DashMap::new(), capacity }
    }

    /// Allocate the stream for a streaming task.
    #[must_use]
    pub fn create(&self, task_id: Uuid) -> Arc<TaskStream> {
        let stream = Arc::new(TaskStream::new(task_id, self.capacity));
        self.streams.insert(task_id, stream.clone());
        stream
    }

    #[must_use]
    pub fn get(&self, task_id: Uuid) -> Option<Arc<TaskStream>> {
        self.streams.get(&task_id).map(|s| s.clone())
    }

    /// Drop a stream once its consumer has drained it.
    pub fn remove(&self, task_id: Uuid) {
        self.streams.remove(&task_id);
    }

    /// Close every stream (shutdown path).
    pub fn close_all(&self) {
        for entry in &self.streams {
            entry.value().close_aborted();
        }
    }

    /// Remove closed streams nobody drained within the grace period.
    fn sweep_stale(&self, grace: Duration) {
        self.streams
            .retain(|_, stream| stream.closed_for().is_none_or(|age| age < grace));
    }
}

/// Spawn the stale-stream sweeper.
pub fn spawn_stream_sweeper(
    registry: Arc<StreamRegistry>,
    sweep_interval: Duration,
    grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            registry.sweep_stale(grace);
        }
    })
}
