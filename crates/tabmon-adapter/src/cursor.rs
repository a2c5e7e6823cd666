//! Pagination state machine shared by every adapter.
//!
//! A [`Cursor`] walks `Unopened -> Enumerated -> Buffered -> Released`:
//! the first fetch enumerates, later fetches drain the buffer and pull the
//! next batch with the continuation token whenever the buffer runs dry.
//! Closing a cursor before the backend reported end-of-sequence releases
//! the server-side enumeration exactly once. Dropping it with an
//! enumeration open hands the token to [`Paginated::release_detached`].
//!
//! Backends without native pagination implement only
//! [`Paginated::enumerate`] and return every row with no token.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tabmon_common::row::Row;

/// One response from a paginated backend.
#[derive(Debug, Default)]
pub struct Batch {
    pub rows: Vec<Row>,
    /// Continuation token; `None` once the backend signalled end of sequence.
    pub token: Option<String>,
}

impl Batch {
    /// A final batch with no continuation.
    pub fn last(rows: Vec<Row>) -> Self {
        Self { rows, token: None }
    }

    pub fn more(rows: Vec<Row>, token: impl Into<String>) -> Self {
        Self {
            rows,
            token: Some(token.into()),
        }
    }
}

/// The enumerate/pull/release protocol of a backend query.
#[async_trait]
pub trait Paginated: Send + Sync {
    /// Issues the initial query.
    async fn enumerate(&self) -> Result<Batch>;

    /// Requests the batch following `token`.
    async fn pull(&self, _token: &str) -> Result<Batch> {
        Ok(Batch::default())
    }

    /// Frees the server-side enumeration identified by `token`.
    async fn release(&self, _token: &str) -> Result<()> {
        Ok(())
    }

    /// Schedules a release without waiting for it. Called when a cursor is
    /// dropped with an enumeration still open, e.g. because the caller's
    /// timeout cancelled a pull. Must not block.
    fn release_detached(&self, _token: String) {}
}

#[derive(Debug)]
enum State {
    Unopened,
    Buffered {
        rows: VecDeque<Row>,
        token: Option<String>,
    },
    Released,
}

/// A forward-only cursor over a [`Paginated`] query.
pub struct Cursor<'a, P: Paginated + ?Sized> {
    source: &'a P,
    state: State,
}

impl<'a, P: Paginated + ?Sized> Cursor<'a, P> {
    pub fn new(source: &'a P) -> Self {
        Self {
            source,
            state: State::Unopened,
        }
    }

    /// Whether the cursor is released or has nothing left to read.
    pub fn is_exhausted(&self) -> bool {
        match &self.state {
            State::Unopened => false,
            State::Buffered { rows, token } => rows.is_empty() && token.is_none(),
            State::Released => true,
        }
    }

    pub async fn fetch_one(&mut self) -> Result<Option<Row>> {
        loop {
            match &mut self.state {
                State::Released => return Ok(None),
                State::Unopened => {
                    let batch = self.source.enumerate().await?;
                    self.state = State::Buffered {
                        rows: batch.rows.into(),
                        token: batch.token,
                    };
                }
                State::Buffered { rows, token } => {
                    if let Some(row) = rows.pop_front() {
                        return Ok(Some(row));
                    }
                    let Some(current) = token.clone() else {
                        self.state = State::Released;
                        return Ok(None);
                    };
                    match self.source.pull(&current).await {
                        Ok(batch) => {
                            *rows = batch.rows.into();
                            *token = batch.token;
                        }
                        Err(e) => {
                            self.release_token(&current).await;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    pub async fn fetch_many(&mut self, limit: usize) -> Result<Vec<Row>> {
        let mut out = Vec::with_capacity(limit.min(1024));
        while out.len() < limit {
            match self.fetch_one().await? {
                Some(row) => out.push(row),
                None => break,
            }
        }
        Ok(out)
    }

    /// Reads every remaining row, in backend order.
    pub async fn fetch_all(&mut self) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        while let Some(row) = self.fetch_one().await? {
            out.push(row);
        }
        Ok(out)
    }

    /// Closes the cursor. Sends a release for an outstanding continuation
    /// token; a no-op when the cursor is already exhausted or released.
    pub async fn close(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Released);
        if let State::Buffered {
            token: Some(token), ..
        } = state
        {
            self.release_token(&token).await;
        }
    }

    async fn release_token(&mut self, token: &str) {
        self.state = State::Released;
        if let Err(e) = self.source.release(token).await {
            tracing::warn!(error = %e, "Failed to release enumeration context");
        }
    }
}

impl<P: Paginated + ?Sized> Drop for Cursor<'_, P> {
    fn drop(&mut self) {
        if let State::Buffered {
            token: Some(token), ..
        } = std::mem::replace(&mut self.state, State::Released)
        {
            tracing::debug!("Cursor dropped with an open enumeration, releasing in background");
            self.source.release_detached(token);
        }
    }
}
