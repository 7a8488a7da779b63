// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resumable streams.
//!
//! At most one stream is active per instance. Chunks are buffered in memory
//! and written in batches; a client that reconnects while a stream is active
//! is offered a resume and, once it acknowledges, receives every chunk so far
//! (persisted or still buffered) in index order before any new live chunk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tether_protocol::{ServerFrame, StreamChunk};
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::config::InstanceConfig;
use crate::connection::Connection;
use crate::error::CoreError;
use crate::instance::Instance;
use crate::persistence::{ChunkRecord, Persistence, StreamRecord, StreamStatus};

/// Pointer to the active stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveStream {
    pub stream_id: String,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}

/// Chunks to replay to an acknowledging connection.
#[derive(Debug, Clone)]
pub struct Replay {
    pub request_id: String,
    pub chunks: Vec<ChunkRecord>,
    /// The stream finished before the replay was taken.
    pub done: bool,
}

#[derive(Default)]
struct TrackerState {
    active: Option<ActiveStream>,
    next_index: i64,
    buffer: Vec<ChunkRecord>,
    /// connection id → stream id offered for resumption
    pending: HashMap<String, String>,
}

/// Buffered, persisted stream bookkeeping for one instance.
pub struct StreamTracker {
    persistence: Arc<dyn Persistence>,
    flush_batch: usize,
    max_buffer: usize,
    stale_after: Duration,
    cleanup_interval: Duration,
    retention: Duration,
    state: Mutex<TrackerState>,
    // Held while the buffer is written out; a flush requested while another
    // one is in progress is a no-op.
    flush_guard: tokio::sync::Mutex<()>,
    last_cleanup: Mutex<Option<Instant>>,
}

impl StreamTracker {
    pub fn new(persistence: Arc<dyn Persistence>, config: &InstanceConfig) -> Self {
        Self {
            persistence,
            flush_batch: config.stream_flush_batch.max(1),
            max_buffer: config.stream_max_buffer.max(1),
            stale_after: config.stream_stale_after,
            cleanup_interval: config.stream_cleanup_interval,
            retention: config.stream_retention,
            state: Mutex::new(TrackerState::default()),
            flush_guard: tokio::sync::Mutex::new(()),
            last_cleanup: Mutex::new(None),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn is_stale(&self, created_at: DateTime<Utc>) -> bool {
        let age = Utc::now() - created_at;
        age.to_std().map(|a| a > self.stale_after).unwrap_or(false)
    }

    /// Rehydrate the active pointer and the next chunk index from storage.
    pub async fn restore(&self) -> Result<(), CoreError> {
        let Some(stream) = self.persistence.active_stream().await? else {
            return Ok(());
        };

        if self.is_stale(stream.created_at) {
            info!(stream_id = %stream.id, "Discarding stale stream on restore");
            return self.persistence.delete_stream(&stream.id).await;
        }

        let chunks = self.persistence.stream_chunks(&stream.id).await?;
        let next_index = chunks.last().map(|c| c.chunk_index + 1).unwrap_or(0);

        debug!(stream_id = %stream.id, next_index, "Restored active stream");
        self.with_state(|st| {
            st.active = Some(ActiveStream {
                stream_id: stream.id,
                request_id: stream.request_id,
                created_at: stream.created_at,
            });
            st.next_index = next_index;
        });
        Ok(())
    }

    pub fn active(&self) -> Option<ActiveStream> {
        self.with_state(|st| st.active.clone())
    }

    /// Begin a new stream for `request_id`. A stream that is still active is
    /// closed as failed first.
    pub async fn start(&self, request_id: &str) -> Result<ActiveStream, CoreError> {
        if let Some(previous) = self.finish(StreamStatus::Error).await? {
            warn!(stream_id = %previous.stream_id, "Superseding unfinished stream");
        }

        let now = Utc::now();
        let stream = ActiveStream {
            stream_id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            created_at: now,
        };
        self.persistence
            .insert_stream(&StreamRecord {
                id: stream.stream_id.clone(),
                request_id: stream.request_id.clone(),
                status: StreamStatus::Streaming,
                created_at: now,
                completed_at: None,
            })
            .await?;

        self.with_state(|st| {
            st.active = Some(stream.clone());
            st.next_index = 0;
        });
        Ok(stream)
    }

    /// Buffer a chunk of the active stream. Returns the stream and the chunk,
    /// plus whether the buffer has reached a flush threshold.
    fn append(&self, body: String) -> Option<(ActiveStream, ChunkRecord, bool)> {
        self.with_state(|st| {
            let active = st.active.clone()?;
            let chunk = ChunkRecord {
                id: uuid::Uuid::new_v4().to_string(),
                stream_id: active.stream_id.clone(),
                body,
                chunk_index: st.next_index,
                created_at: Utc::now(),
            };
            st.next_index += 1;
            st.buffer.push(chunk.clone());
            // The hard cap matters when earlier flushes were skipped or failed.
            let len = st.buffer.len();
            let should_flush = len >= self.flush_batch || len >= self.max_buffer;
            Some((active, chunk, should_flush))
        })
    }

    /// Flush unless a flush is already in progress.
    pub async fn try_flush(&self) -> Result<(), CoreError> {
        let Ok(_guard) = self.flush_guard.try_lock() else {
            debug!("Stream flush already in progress");
            return Ok(());
        };
        self.flush_buffer().await
    }

    /// Flush, waiting for an in-progress flush to finish first.
    pub async fn flush(&self) -> Result<(), CoreError> {
        let _guard = self.flush_guard.lock().await;
        self.flush_buffer().await
    }

    // Caller holds `flush_guard`.
    async fn flush_buffer(&self) -> Result<(), CoreError> {
        let chunks = self.with_state(|st| std::mem::take(&mut st.buffer));
        if chunks.is_empty() {
            return Ok(());
        }

        match self.persistence.insert_chunks(&chunks).await {
            Ok(()) => {
                debug!(count = chunks.len(), "Flushed stream chunks");
                Ok(())
            }
            Err(e) => {
                // Put the batch back in front of anything appended meanwhile.
                self.with_state(|st| {
                    let newer = std::mem::take(&mut st.buffer);
                    st.buffer = chunks;
                    st.buffer.extend(newer);
                });
                Err(e)
            }
        }
    }

    /// Flush and close the active stream. Returns the closed stream, or
    /// `None` if no stream was active.
    pub async fn finish(&self, status: StreamStatus) -> Result<Option<ActiveStream>, CoreError> {
        let guard = self.flush_guard.lock().await;
        self.flush_buffer().await?;

        let Some(active) = self.with_state(|st| st.active.take()) else {
            return Ok(None);
        };
        self.persistence
            .finish_stream(&active.stream_id, status, Utc::now())
            .await?;
        drop(guard);

        self.maybe_cleanup().await;
        Ok(Some(active))
    }

    async fn maybe_cleanup(&self) {
        let due = match self.last_cleanup.lock() {
            Ok(mut last) => {
                let due = last.is_none_or(|at| at.elapsed() >= self.cleanup_interval);
                if due {
                    *last = Some(Instant::now());
                }
                due
            }
            Err(_) => false,
        };
        if !due {
            return;
        }

        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        match self
            .persistence
            .delete_finished_streams(Utc::now() - retention)
            .await
        {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed expired streams"),
            Err(e) => warn!(error = %e, "Stream cleanup failed"),
        }
    }

    /// Offer the active stream to a connection. Returns the request id to
    /// announce, or `None` if nothing is resumable. A stale stream is
    /// discarded instead.
    pub async fn offer(&self, connection_id: &str) -> Result<Option<String>, CoreError> {
        let Some(active) = self.active() else {
            return Ok(None);
        };

        if self.is_stale(active.created_at) {
            info!(stream_id = %active.stream_id, "Discarding stale stream");
            self.with_state(|st| {
                if st.active.as_ref() == Some(&active) {
                    st.active = None;
                    st.buffer.retain(|c| c.stream_id != active.stream_id);
                }
                st.pending.retain(|_, id| *id != active.stream_id);
            });
            self.persistence.delete_stream(&active.stream_id).await?;
            return Ok(None);
        }

        self.with_state(|st| {
            st.pending
                .insert(connection_id.to_string(), active.stream_id.clone())
        });
        Ok(Some(active.request_id))
    }

    pub fn is_pending(&self, connection_id: &str) -> bool {
        self.with_state(|st| st.pending.contains_key(connection_id))
    }

    /// Connections offered a resume of `stream_id` that have not
    /// acknowledged yet. Offers of other streams do not count.
    pub fn pending_connections(&self, stream_id: &str) -> Vec<String> {
        self.with_state(|st| {
            st.pending
                .iter()
                .filter(|(_, pending)| pending.as_str() == stream_id)
                .map(|(connection_id, _)| connection_id.clone())
                .collect()
        })
    }

    pub fn forget(&self, connection_id: &str) {
        self.with_state(|st| st.pending.remove(connection_id));
    }

    /// Take the replay for an acknowledged offer. The connection stops being
    /// pending in the same step, so every later chunk reaches it live.
    pub async fn replay(
        &self,
        connection_id: &str,
        request_id: &str,
    ) -> Result<Option<Replay>, CoreError> {
        let Some(stream_id) = self.with_state(|st| st.pending.get(connection_id).cloned()) else {
            debug!(connection_id, request_id, "Resume ack without a pending offer");
            return Ok(None);
        };

        let Some(stream) = self.persistence.get_stream(&stream_id).await? else {
            self.forget(connection_id);
            return Ok(None);
        };
        if stream.request_id != request_id {
            debug!(connection_id, request_id, "Resume ack for a different stream");
            return Ok(None);
        }

        let _guard = self.flush_guard.lock().await;
        if let Err(e) = self.flush_buffer().await {
            warn!(stream_id = %stream_id, error = %e, "Flush before replay failed");
        }
        let mut chunks = self.persistence.stream_chunks(&stream_id).await?;

        let replay = self.with_state(|st| {
            let persisted = chunks.last().map(|c| c.chunk_index).unwrap_or(-1);
            chunks.extend(
                st.buffer
                    .iter()
                    .filter(|c| c.stream_id == stream_id && c.chunk_index > persisted)
                    .cloned(),
            );
            st.pending.remove(connection_id);
            let done = st
                .active
                .as_ref()
                .is_none_or(|a| a.stream_id != stream_id);
            Replay {
                request_id: stream.request_id.clone(),
                chunks,
                done,
            }
        });
        Ok(Some(replay))
    }
}

// ============================================================================
// Instance operations
// ============================================================================

impl<A: Agent> Instance<A> {
    /// Start a resumable stream tied to `request_id`.
    pub async fn start_stream(&self, request_id: &str) -> Result<ActiveStream, CoreError> {
        let stream = self.streams.start(request_id).await?;
        info!(instance = %self.name(), stream_id = %stream.stream_id, request_id, "Stream started");
        Ok(stream)
    }

    /// Append a chunk to the active stream and deliver it live to every
    /// connection that is not waiting on a resume. Returns false if no stream
    /// is active.
    pub async fn push_stream_chunk(&self, body: impl Into<String>) -> Result<bool, CoreError> {
        let Some((active, chunk, should_flush)) = self.streams.append(body.into()) else {
            debug!(instance = %self.name(), "Dropping chunk without an active stream");
            return Ok(false);
        };

        self.broadcast_stream_frame(
            &active.stream_id,
            StreamChunk::body(active.request_id, chunk.body),
        );
        if should_flush {
            self.streams.try_flush().await?;
        }
        Ok(true)
    }

    /// Complete the active stream.
    pub async fn complete_stream(&self) -> Result<(), CoreError> {
        if let Some(stream) = self.streams.finish(StreamStatus::Completed).await? {
            self.broadcast_stream_frame(
                &stream.stream_id,
                StreamChunk::finished(stream.request_id, None),
            );
        }
        Ok(())
    }

    /// Fail the active stream with `message`.
    pub async fn fail_stream(&self, message: impl Into<String>) -> Result<(), CoreError> {
        if let Some(stream) = self.streams.finish(StreamStatus::Error).await? {
            self.broadcast_stream_frame(
                &stream.stream_id,
                StreamChunk::finished(stream.request_id, Some(message.into())),
            );
        }
        Ok(())
    }

    pub fn active_stream(&self) -> Option<ActiveStream> {
        self.streams.active()
    }

    /// Write buffered chunks of the active stream now.
    pub async fn flush_stream(&self) -> Result<(), CoreError> {
        self.streams.flush().await
    }

    fn broadcast_stream_frame(&self, stream_id: &str, chunk: StreamChunk) {
        let pending = self.streams.pending_connections(stream_id);
        let exclude: Vec<&str> = pending.iter().map(String::as_str).collect();
        self.connections
            .broadcast(&ServerFrame::StreamChunk(chunk), &exclude);
    }

    /// Announce the active stream to a newly attached connection.
    pub(crate) async fn offer_stream_resume(&self, connection: &Arc<Connection>) {
        match self.streams.offer(connection.id()).await {
            Ok(Some(request_id)) => {
                connection.send(ServerFrame::StreamResuming { id: request_id });
            }
            Ok(None) => {}
            Err(e) => warn!(connection_id = %connection.id(), error = %e, "Stream resume offer failed"),
        }
    }

    /// Replay an acknowledged stream to `connection`.
    pub(crate) async fn replay_stream(&self, connection: &Arc<Connection>, request_id: &str) {
        let replay = match self.streams.replay(connection.id(), request_id).await {
            Ok(Some(replay)) => replay,
            Ok(None) => return,
            Err(e) => {
                warn!(connection_id = %connection.id(), error = %e, "Stream replay failed");
                return;
            }
        };

        debug!(
            connection_id = %connection.id(),
            chunks = replay.chunks.len(),
            done = replay.done,
            "Replaying stream"
        );
        for chunk in replay.chunks {
            connection.send(ServerFrame::StreamChunk(
                StreamChunk::body(replay.request_id.clone(), chunk.body).replayed(),
            ));
        }
        if replay.done {
            connection.send(ServerFrame::StreamChunk(
                StreamChunk::finished(replay.request_id, None).replayed(),
            ));
        }
    }
}
