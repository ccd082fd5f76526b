//! Lazy query results
//!
//! A [`ResultStream`] holds no rows. Every `next()` sends a pull request to
//! the connection worker that owns the cursor and waits for exactly one
//! reply, so at most one row is in flight per stream.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::engine::{DatabaseHandle, Request};
use crate::error::{StorageError, StorageResult};
use crate::value::Row;

enum State {
    Open,
    Finished,
    Failed(StorageError),
}

/// Single-use, finite sequence of rows produced by a query
///
/// After the end or the first error, every further `next()` returns the
/// same terminal value. Dropping an unfinished stream lets the connection
/// serve the requests queued behind it.
pub struct ResultStream {
    handle: DatabaseHandle,
    id: u64,
    mailbox: mpsc::UnboundedSender<Request>,
    state: State,
    pending: Option<oneshot::Receiver<StorageResult<Option<Row>>>>,
    error_yielded: bool,
}

impl ResultStream {
    pub(crate) fn new(
        handle: DatabaseHandle,
        id: u64,
        mailbox: mpsc::UnboundedSender<Request>,
    ) -> Self {
        Self {
            handle,
            id,
            mailbox,
            state: State::Open,
            pending: None,
            error_yielded: false,
        }
    }

    /// Handle of the connection producing the rows
    pub fn handle(&self) -> DatabaseHandle {
        self.handle
    }

    /// Whether the stream has reached its end or an error
    pub fn is_finished(&self) -> bool {
        !matches!(self.state, State::Open)
    }

    /// Pull the next row; `Ok(None)` marks the end
    ///
    /// A stream whose connection went away, because the handle was closed or
    /// the worker backend was terminated, fails with
    /// [`StorageError::StreamAborted`]. The query's own reply has already
    /// been consumed by then, so `TransportClosed` is only ever reported by
    /// the backend calls themselves.
    pub async fn next(&mut self) -> StorageResult<Option<Row>> {
        poll_fn(|cx| self.poll_pull(cx)).await
    }

    /// Drain the remaining rows
    pub async fn collect_rows(mut self) -> StorageResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    fn poll_pull(&mut self, cx: &mut Context<'_>) -> Poll<StorageResult<Option<Row>>> {
        match &self.state {
            State::Open => {}
            State::Finished => return Poll::Ready(Ok(None)),
            State::Failed(error) => return Poll::Ready(Err(error.clone())),
        }

        if self.pending.is_none() {
            let (reply, response) = oneshot::channel();
            let request = Request::Pull {
                stream: self.id,
                reply,
            };
            if self.mailbox.send(request).is_err() {
                return Poll::Ready(self.settle(Err(StorageError::StreamAborted)));
            }
            self.pending = Some(response);
        }

        let Some(response) = self.pending.as_mut() else {
            return Poll::Pending;
        };
        let outcome = ready!(Pin::new(response).poll(cx));
        self.pending = None;

        // The worker dropped the pull without answering: the handle closed.
        let item = outcome.unwrap_or(Err(StorageError::StreamAborted));
        Poll::Ready(self.settle(item))
    }

    /// Record terminal outcomes so they can be replayed
    fn settle(&mut self, item: StorageResult<Option<Row>>) -> StorageResult<Option<Row>> {
        match &item {
            Ok(Some(_)) => {}
            Ok(None) => self.state = State::Finished,
            Err(error) => self.state = State::Failed(error.clone()),
        }
        item
    }
}

impl Stream for ResultStream {
    type Item = StorageResult<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        // As a `Stream` the error is yielded once, then the stream ends.
        if this.error_yielded {
            return Poll::Ready(None);
        }
        match ready!(this.poll_pull(cx)) {
            Ok(Some(row)) => Poll::Ready(Some(Ok(row))),
            Ok(None) => Poll::Ready(None),
            Err(error) => {
                this.error_yielded = true;
                Poll::Ready(Some(Err(error)))
            }
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        if matches!(self.state, State::Open) {
            let _ = self.mailbox.send(Request::Release { stream: self.id });
        }
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("handle", &self.handle)
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
