//! Connection worker
//!
//! One thread per open handle owns the `rusqlite::Connection` and drains a
//! FIFO mailbox. While a query stream is open the worker only steps its
//! cursor in answer to `Pull` requests from the stream; any other request
//! for the handle waits in a deferred queue until the stream finishes or is
//! released. A query arriving in that window is compiled and answered with
//! its own stream right away, but is only stepped once its turn comes.
//! `Close` preempts an open stream.
//!
//! Mutations reported by the update hook are buffered and handed to the
//! change sink only once the connection is back in autocommit mode, so a
//! subscriber never observes a change that could still roll back. Events of
//! a statement that failed and was undone are dropped from the buffer.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use rusqlite::{Batch, Connection, Rows};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::sql::{check_first, column_names, decode_row, keeps_partial_changes, ParamCursor};
use super::{ChangeSink, DatabaseHandle, Reply};
use crate::error::{StorageError, StorageResult};
use crate::event::{ChangeEvent, ChangeKind};
use crate::stream::ResultStream;
use crate::value::{Row, Value};

/// Reply channel for a single pulled row
pub(crate) type PullReply = oneshot::Sender<StorageResult<Option<Row>>>;

/// Work items accepted by a connection worker
pub(crate) enum Request {
    Execute {
        sql: String,
        params: Option<Vec<Value>>,
        reply: Reply<()>,
    },
    ExecuteBatch {
        sql: String,
        reply: Reply<()>,
    },
    Query {
        sql: String,
        params: Option<Vec<Value>>,
        reply: Reply<ResultStream>,
    },
    SetSink {
        sink: ChangeSink,
        reply: Reply<()>,
    },
    /// Step an open stream by one row
    Pull { stream: u64, reply: PullReply },
    /// The consumer dropped an unfinished stream
    Release { stream: u64 },
    Close {
        reply: Reply<()>,
    },
    /// The host went away
    Shutdown,
}

impl Request {
    /// Answer the request with an error without executing it
    pub(crate) fn reject(self, error: StorageError) {
        match self {
            Request::Execute { reply, .. }
            | Request::ExecuteBatch { reply, .. }
            | Request::SetSink { reply, .. }
            | Request::Close { reply } => {
                let _ = reply.send(Err(error));
            }
            Request::Query { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Request::Pull { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Request::Release { .. } | Request::Shutdown => {}
        }
    }
}

/// Host-side handle to a running connection worker
///
/// Dropping it asks the worker to shut down.
pub(crate) struct ConnectionActor {
    mailbox: mpsc::UnboundedSender<Request>,
    path: Option<PathBuf>,
}

impl ConnectionActor {
    /// Move the connection onto its own worker thread
    pub fn spawn(
        handle: DatabaseHandle,
        conn: Connection,
        path: Option<PathBuf>,
    ) -> StorageResult<Self> {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let worker = Worker::new(handle, conn, Inbox::new(handle, inbox, mailbox.downgrade()));

        thread::Builder::new()
            .name(format!("sqlport-{}", handle))
            .spawn(move || worker.run())
            .map_err(|e| StorageError::Engine(format!("failed to start connection worker: {}", e)))?;

        Ok(Self { mailbox, path })
    }

    /// Queue a request; hands it back if the worker has exited
    pub fn send(&self, request: Request) -> Result<(), Request> {
        self.mailbox.send(request).map_err(|e| e.0)
    }

    /// Resolved file path, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for ConnectionActor {
    fn drop(&mut self) {
        let _ = self.mailbox.send(Request::Shutdown);
    }
}

/// Outcome of waiting for the consumer of an open stream
enum Wait {
    Pull(PullReply),
    Released,
    Close(Reply<()>),
    Shutdown,
}

/// How the worker proceeds after a stream ended
enum Flow {
    Continue,
    Close(Reply<()>),
    Shutdown,
}

/// Work picked up by the worker, in issuance order
enum Job {
    Request(Request),
    /// A query already answered with a stream, waiting for its turn
    Stream {
        id: u64,
        sql: String,
        params: Option<Vec<Value>>,
    },
}

/// The worker's mailbox plus work held back by an open stream
struct Inbox {
    handle: DatabaseHandle,
    receiver: mpsc::UnboundedReceiver<Request>,
    myself: mpsc::WeakUnboundedSender<Request>,
    deferred: VecDeque<Job>,
    /// Pulls on queued streams, answered once the stream starts
    parked: HashMap<u64, PullReply>,
    next_stream: u64,
}

impl Inbox {
    fn new(
        handle: DatabaseHandle,
        receiver: mpsc::UnboundedReceiver<Request>,
        myself: mpsc::WeakUnboundedSender<Request>,
    ) -> Self {
        Self {
            handle,
            receiver,
            myself,
            deferred: VecDeque::new(),
            parked: HashMap::new(),
            next_stream: 0,
        }
    }

    /// Next job in issuance order
    fn next(&mut self) -> Option<Job> {
        match self.deferred.pop_front() {
            Some(job) => Some(job),
            None => self.receiver.blocking_recv().map(Job::Request),
        }
    }

    fn allocate(&mut self) -> u64 {
        self.next_stream += 1;
        self.next_stream
    }

    /// Consumer side of a stream
    fn stream(&self, id: u64) -> StorageResult<ResultStream> {
        let mailbox = self.myself.upgrade().ok_or(StorageError::StreamAborted)?;
        Ok(ResultStream::new(self.handle, id, mailbox))
    }

    fn is_queued(&self, stream: u64) -> bool {
        self.deferred
            .iter()
            .any(|job| matches!(job, Job::Stream { id, .. } if *id == stream))
    }

    /// Forget a queued stream whose consumer let go before it started
    fn forget(&mut self, stream: u64) {
        self.deferred
            .retain(|job| !matches!(job, Job::Stream { id, .. } if *id == stream));
        self.parked.remove(&stream);
    }

    /// Answer a query that arrived while another stream is open
    ///
    /// The first statement is checked against the schema as it is now. With
    /// other work queued ahead, that work could still change the outcome, so
    /// a failure then surfaces through the stream instead of the reply.
    fn admit(
        &mut self,
        conn: &Connection,
        sql: String,
        params: Option<Vec<Value>>,
        reply: Reply<ResultStream>,
    ) {
        if self.deferred.is_empty() {
            if let Err(e) = check_first(conn, &sql, params.clone()) {
                let _ = reply.send(Err(e));
                return;
            }
        }

        let id = self.allocate();
        let stream = match self.stream(id) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        debug!(handle = %self.handle, stream = id, "queued query behind open stream");
        self.deferred.push_back(Job::Stream { id, sql, params });
        // A caller that gave up drops the stream, which queues a release.
        let _ = reply.send(Ok(stream));
    }

    /// Block until the stream's consumer asks for a row or lets go
    fn wait_for_pull(&mut self, conn: &Connection, stream: u64) -> Wait {
        if let Some(reply) = self.parked.remove(&stream) {
            return Wait::Pull(reply);
        }

        loop {
            let Some(request) = self.receiver.blocking_recv() else {
                return Wait::Shutdown;
            };
            match request {
                Request::Pull { stream: id, reply } if id == stream => return Wait::Pull(reply),
                Request::Pull { stream: id, reply } if self.is_queued(id) => {
                    self.parked.insert(id, reply);
                }
                Request::Pull { reply, .. } => {
                    let _ = reply.send(Err(StorageError::StreamAborted));
                }
                Request::Release { stream: id } if id == stream => return Wait::Released,
                Request::Release { stream: id } => self.forget(id),
                Request::Close { reply } => return Wait::Close(reply),
                Request::Shutdown => return Wait::Shutdown,
                Request::Query { sql, params, reply } => self.admit(conn, sql, params, reply),
                other => self.deferred.push_back(Job::Request(other)),
            }
        }
    }
}

/// Committed-change buffer between the update hook and the sink
struct ChangeFeed {
    pending: Arc<Mutex<Vec<ChangeEvent>>>,
    sink: Option<ChangeSink>,
}

impl ChangeFeed {
    /// Install the engine hooks feeding this buffer
    fn install(conn: &Connection) -> Self {
        let pending = Arc::new(Mutex::new(Vec::new()));

        let buffer = Arc::clone(&pending);
        conn.update_hook(Some(
            move |action, db_name: &str, table_name: &str, row_id| {
                if let Some(kind) = ChangeKind::from_action(action) {
                    lock(&buffer).push(ChangeEvent::from_hook(kind, db_name, table_name, row_id));
                }
            },
        ));

        let discarded = Arc::clone(&pending);
        conn.rollback_hook(Some(move || lock(&discarded).clear()));

        Self {
            pending,
            sink: None,
        }
    }

    /// Position to roll the buffer back to if the next statement fails
    fn mark(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Drop the events of a statement the engine undid
    ///
    /// A failing statement is rolled back on its own without invoking the
    /// rollback hook, unless it was declared `OR FAIL`.
    fn undo(&self, mark: usize, stmt_keeps_changes: bool) {
        if !stmt_keeps_changes {
            lock(&self.pending).truncate(mark);
        }
    }

    /// Forward buffered events if nothing is left uncommitted
    fn flush(&mut self, conn: &Connection) {
        if !conn.is_autocommit() {
            return;
        }

        let events = std::mem::take(&mut *lock(&self.pending));
        let Some(sink) = &self.sink else {
            return;
        };
        for event in events {
            if sink.send(event).is_err() {
                debug!("change sink closed, dropping registration");
                self.sink = None;
                return;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Worker {
    handle: DatabaseHandle,
    conn: Connection,
    inbox: Inbox,
    feed: ChangeFeed,
}

impl Worker {
    fn new(handle: DatabaseHandle, conn: Connection, inbox: Inbox) -> Self {
        let feed = ChangeFeed::install(&conn);
        Self {
            handle,
            conn,
            inbox,
            feed,
        }
    }

    fn run(mut self) {
        debug!(handle = %self.handle, "connection worker started");

        while let Some(job) = self.inbox.next() {
            let flow = match job {
                Job::Stream { id, sql, params } => self.stream_query(id, &sql, params, None),
                Job::Request(Request::Query { sql, params, reply }) => {
                    let id = self.inbox.allocate();
                    self.stream_query(id, &sql, params, Some(reply))
                }
                Job::Request(Request::Close { reply }) => Flow::Close(reply),
                Job::Request(Request::Shutdown) => Flow::Shutdown,
                Job::Request(other) => {
                    self.handle_simple(other);
                    Flow::Continue
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::Close(reply) => {
                    self.drain_before_close();
                    self.close(reply);
                    return;
                }
                Flow::Shutdown => break,
            }
        }

        debug!(handle = %self.handle, "connection worker stopped");
    }

    /// Requests that never hold the connection past their own reply
    fn handle_simple(&mut self, request: Request) {
        match request {
            Request::Execute { sql, params, reply } => {
                let result = execute(&self.conn, &mut self.feed, &sql, params);
                self.feed.flush(&self.conn);
                let _ = reply.send(result);
            }
            Request::ExecuteBatch { sql, reply } => {
                let result = execute(&self.conn, &mut self.feed, &sql, None);
                self.feed.flush(&self.conn);
                let _ = reply.send(result);
            }
            Request::SetSink { sink, reply } => {
                self.feed.sink = Some(sink);
                let _ = reply.send(Ok(()));
            }
            // A stream that already finished or was aborted.
            Request::Pull { reply, .. } => {
                let _ = reply.send(Err(StorageError::StreamAborted));
            }
            Request::Release { .. } | Request::Shutdown => {}
            Request::Query { reply, .. } => {
                let _ = reply.send(Err(StorageError::StreamAborted));
            }
            Request::Close { reply } => {
                let _ = reply.send(Err(StorageError::UnknownHandle(self.handle)));
            }
        }
    }

    /// Run requests queued behind an aborted stream before closing
    ///
    /// Streams still waiting for their turn are abandoned; their consumers
    /// see `StreamAborted`.
    fn drain_before_close(&mut self) {
        while let Some(job) = self.inbox.deferred.pop_front() {
            match job {
                Job::Request(request) => self.handle_simple(request),
                Job::Stream { id, .. } => {
                    debug!(handle = %self.handle, stream = id, "abandoned queued stream");
                }
            }
        }
        self.inbox.parked.clear();
    }

    fn close(self, reply: Reply<()>) {
        let Worker {
            handle,
            conn,
            mut feed,
            ..
        } = self;

        feed.flush(&conn);
        // Closes the sink, so dispatch of this handle ends with this event.
        drop(feed);
        let result = conn.close().map_err(|(_, e)| StorageError::from(e));
        if let Err(e) = &result {
            warn!(%handle, "error while closing database: {}", e);
        } else {
            debug!(%handle, "database closed");
        }
        let _ = reply.send(result);
    }

    /// Feed a query's rows to its stream, one per pull
    ///
    /// `reply` is `None` for a stream that was handed out while it was
    /// queued; errors before the first row then go through the stream.
    fn stream_query(
        &mut self,
        id: u64,
        sql: &str,
        params: Option<Vec<Value>>,
        mut reply: Option<Reply<ResultStream>>,
    ) -> Flow {
        let conn = &self.conn;
        let inbox = &mut self.inbox;
        let feed = &mut self.feed;

        let mut batch = Batch::new(conn, sql);
        let mut params = ParamCursor::new(params);
        let mut waiting: Option<PullReply> = None;

        loop {
            let prepared = batch.next().map_err(StorageError::from).and_then(|stmt| {
                let Some(mut stmt) = stmt else {
                    return Ok(None);
                };
                params.bind(&mut stmt)?;
                Ok(Some(stmt))
            });
            let mut stmt = match prepared {
                Ok(Some(stmt)) => stmt,
                Ok(None) => break,
                Err(e) => {
                    return match reply.take() {
                        Some(reply) => {
                            let _ = reply.send(Err(e));
                            Flow::Continue
                        }
                        None => finish_stream(inbox, conn, id, waiting, Err(e)),
                    };
                }
            };

            if let Some(reply) = reply.take() {
                let _ = reply.send(inbox.stream(id));
            }

            let columns = column_names(&stmt);
            let keeps_changes = keeps_partial_changes(&stmt);
            let mark = feed.mark();
            let mut rows = stmt.raw_query();
            loop {
                let pull = match waiting.take() {
                    Some(pull) => pull,
                    None => match inbox.wait_for_pull(conn, id) {
                        Wait::Pull(pull) => pull,
                        Wait::Released => {
                            drop(rows);
                            feed.flush(conn);
                            return Flow::Continue;
                        }
                        Wait::Close(close) => return Flow::Close(close),
                        Wait::Shutdown => return Flow::Shutdown,
                    },
                };

                match rows.next() {
                    Ok(Some(row)) => {
                        let decoded = decode_row(row, &columns);
                        let failed = decoded.is_err();
                        let _ = pull.send(decoded.map(Some));
                        if failed {
                            drop(rows);
                            feed.flush(conn);
                            return Flow::Continue;
                        }
                    }
                    Ok(None) => {
                        waiting = Some(pull);
                        break;
                    }
                    Err(e) => {
                        drop(rows);
                        feed.undo(mark, keeps_changes);
                        feed.flush(conn);
                        let _ = pull.send(Err(e.into()));
                        return Flow::Continue;
                    }
                }
            }

            drop(rows);
            feed.flush(conn);
        }

        if let Err(e) = params.finish() {
            return match reply.take() {
                Some(reply) => {
                    let _ = reply.send(Err(e));
                    Flow::Continue
                }
                None => finish_stream(inbox, conn, id, waiting, Err(e)),
            };
        }
        // Text without any statement still gets an (empty) stream.
        if let Some(reply) = reply.take() {
            let _ = reply.send(inbox.stream(id));
        }

        finish_stream(inbox, conn, id, waiting, Ok(None))
    }
}

/// Deliver a terminal item to the stream's next pull
fn finish_stream(
    inbox: &mut Inbox,
    conn: &Connection,
    stream: u64,
    waiting: Option<PullReply>,
    item: StorageResult<Option<Row>>,
) -> Flow {
    let pull = match waiting {
        Some(pull) => pull,
        None => match inbox.wait_for_pull(conn, stream) {
            Wait::Pull(pull) => pull,
            Wait::Released => return Flow::Continue,
            Wait::Close(reply) => return Flow::Close(reply),
            Wait::Shutdown => return Flow::Shutdown,
        },
    };
    let _ = pull.send(item);
    Flow::Continue
}

/// Run statements to completion, discarding rows
///
/// Committed changes are flushed after every statement, so a later failure
/// cannot take them back out of the buffer.
fn execute(
    conn: &Connection,
    feed: &mut ChangeFeed,
    sql: &str,
    params: Option<Vec<Value>>,
) -> StorageResult<()> {
    let mut batch = Batch::new(conn, sql);
    let mut params = ParamCursor::new(params);

    while let Some(mut stmt) = batch.next()? {
        params.bind(&mut stmt)?;

        let keeps_changes = keeps_partial_changes(&stmt);
        let mark = feed.mark();
        let mut rows = stmt.raw_query();
        let stepped = step_to_end(&mut rows);
        drop(rows);
        if let Err(e) = stepped {
            feed.undo(mark, keeps_changes);
            return Err(e.into());
        }
        feed.flush(conn);
    }

    params.finish()
}

fn step_to_end(rows: &mut Rows<'_>) -> rusqlite::Result<()> {
    while rows.next()?.is_some() {}
    Ok(())
}
