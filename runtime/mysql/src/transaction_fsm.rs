// Copyright 2022 SphereEx Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::HashMap, fmt};

use conn_pool::Context;
use futures::future::BoxFuture;
use keel_error::error::{Error, ErrorKind};
use tracing::{debug, error, warn};

use crate::{
    backend_conn::{BackendConn, QueryResult},
    metrics::SessionMetricsCollector,
    session::SessionInner,
};

/// Session transaction state: the triple (autocommit, in_trans, prepared).
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum TransState {
    // autocommit=1, no transaction
    TransIdleState,
    // autocommit=1, explicit transaction
    TransStartState,
    // autocommit=0, no statement run since the last commit
    TransNoAutoCommitState,
    // autocommit=0, inside a transaction
    TransNoAutoCommitStartState,
    TransPrepareState,
    TransStartPrepareState,
    TransNoAutoCommitPrepareState,
    TransNoAutoCommitStartPrepareState,
}

impl Default for TransState {
    fn default() -> Self {
        TransState::TransIdleState
    }
}

impl TransState {
    pub const ALL: [TransState; 8] = [
        TransState::TransIdleState,
        TransState::TransStartState,
        TransState::TransNoAutoCommitState,
        TransState::TransNoAutoCommitStartState,
        TransState::TransPrepareState,
        TransState::TransStartPrepareState,
        TransState::TransNoAutoCommitPrepareState,
        TransState::TransNoAutoCommitStartPrepareState,
    ];

    pub fn from_parts(autocommit: bool, in_trans: bool, prepared: bool) -> TransState {
        match (autocommit, in_trans, prepared) {
            (true, false, false) => TransState::TransIdleState,
            (true, true, false) => TransState::TransStartState,
            (false, false, false) => TransState::TransNoAutoCommitState,
            (false, true, false) => TransState::TransNoAutoCommitStartState,
            (true, false, true) => TransState::TransPrepareState,
            (true, true, true) => TransState::TransStartPrepareState,
            (false, false, true) => TransState::TransNoAutoCommitPrepareState,
            (false, true, true) => TransState::TransNoAutoCommitStartPrepareState,
        }
    }

    pub fn autocommit(self) -> bool {
        matches!(
            self,
            TransState::TransIdleState
                | TransState::TransStartState
                | TransState::TransPrepareState
                | TransState::TransStartPrepareState
        )
    }

    pub fn in_trans(self) -> bool {
        matches!(
            self,
            TransState::TransStartState
                | TransState::TransNoAutoCommitStartState
                | TransState::TransStartPrepareState
                | TransState::TransNoAutoCommitStartPrepareState
        )
    }

    pub fn prepared(self) -> bool {
        matches!(
            self,
            TransState::TransPrepareState
                | TransState::TransStartPrepareState
                | TransState::TransNoAutoCommitPrepareState
                | TransState::TransNoAutoCommitStartPrepareState
        )
    }

    pub fn with_prepared(self, prepared: bool) -> TransState {
        TransState::from_parts(self.autocommit(), self.in_trans(), prepared)
    }

    /// Whether a session in this state must hold a backend connection.
    pub fn holds_conn(self) -> bool {
        !self.autocommit() || self.in_trans() || self.prepared()
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum TransEventName {
    QueryEvent,
    BeginEvent,
    CommitRollbackEvent,
    DisableAutoCommitEvent,
    EnableAutoCommitEvent,
    StmtPrepareEvent,
    StmtCloseEvent,
}

impl TransEventName {
    pub const ALL: [TransEventName; 7] = [
        TransEventName::QueryEvent,
        TransEventName::BeginEvent,
        TransEventName::CommitRollbackEvent,
        TransEventName::DisableAutoCommitEvent,
        TransEventName::EnableAutoCommitEvent,
        TransEventName::StmtPrepareEvent,
        TransEventName::StmtCloseEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransEventName::QueryEvent => "QueryEvent",
            TransEventName::BeginEvent => "BeginEvent",
            TransEventName::CommitRollbackEvent => "CommitRollbackEvent",
            TransEventName::DisableAutoCommitEvent => "DisableAutoCommitEvent",
            TransEventName::EnableAutoCommitEvent => "EnableAutoCommitEvent",
            TransEventName::StmtPrepareEvent => "StmtPrepareEvent",
            TransEventName::StmtCloseEvent => "StmtCloseEvent",
        }
    }
}

impl fmt::Display for TransEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to the session's connection once the state has moved.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnAction {
    Keep,
    // pool it if the new state no longer needs it
    Release,
    Discard,
}

pub enum EventInput<'a> {
    None,
    Query { db: &'a str, sql: &'a str },
    // true for COMMIT, false for ROLLBACK
    Commit(bool),
}

pub struct HandlerOutput {
    pub action: ConnAction,
    pub result: Result<Option<QueryResult>, Error>,
}

impl HandlerOutput {
    fn ok(action: ConnAction, res: Option<QueryResult>) -> HandlerOutput {
        HandlerOutput { action, result: Ok(res) }
    }

    fn err(action: ConnAction, err: Error) -> HandlerOutput {
        HandlerOutput { action, result: Err(err) }
    }
}

pub type TransHandler =
    for<'a> fn(&'a mut SessionInner, &'a Context, EventInput<'a>) -> BoxFuture<'a, HandlerOutput>;

pub struct TransEntry {
    pub target: TransState,
    pub forced: bool,
    pub handler: TransHandler,
}

/// The immutable (state, event) -> (handler, target, forced) table. Built
/// once and shared by every session through an `Arc`.
pub struct TransTable {
    entries: HashMap<(TransState, TransEventName), TransEntry>,
    metrics_collector: SessionMetricsCollector,
}

impl Default for TransTable {
    fn default() -> Self {
        TransTable::new()
    }
}

impl TransTable {
    /// Builds the full table: the four (autocommit, in_trans) states, their
    /// prepared mirrors and the prepare/close events of both groups.
    pub fn new() -> TransTable {
        use TransEventName::*;
        use TransState::*;

        let mut table = TransTable { entries: HashMap::new(), metrics_collector: SessionMetricsCollector::new() };

        let base: [(TransState, TransEventName, TransState, bool, TransHandler); 20] = [
            (TransIdleState, QueryEvent, TransIdleState, false, query),
            (TransIdleState, BeginEvent, TransStartState, false, begin),
            (TransIdleState, DisableAutoCommitEvent, TransNoAutoCommitState, false, disable_autocommit),
            (TransIdleState, EnableAutoCommitEvent, TransIdleState, false, noop),
            (TransIdleState, CommitRollbackEvent, TransIdleState, false, noop),
            (TransNoAutoCommitState, QueryEvent, TransNoAutoCommitState, false, query),
            (TransNoAutoCommitState, BeginEvent, TransNoAutoCommitStartState, false, begin),
            (TransNoAutoCommitState, DisableAutoCommitEvent, TransNoAutoCommitState, false, noop),
            (TransNoAutoCommitState, CommitRollbackEvent, TransNoAutoCommitState, false, noop),
            (TransNoAutoCommitState, EnableAutoCommitEvent, TransIdleState, true, enable_autocommit_release),
            (TransNoAutoCommitStartState, QueryEvent, TransNoAutoCommitStartState, false, query),
            (TransNoAutoCommitStartState, BeginEvent, TransNoAutoCommitStartState, false, noop),
            (TransNoAutoCommitStartState, DisableAutoCommitEvent, TransNoAutoCommitStartState, false, noop),
            (TransNoAutoCommitStartState, CommitRollbackEvent, TransNoAutoCommitState, true, commit_keep),
            (TransNoAutoCommitStartState, EnableAutoCommitEvent, TransStartState, false, enable_autocommit_keep),
            (TransStartState, QueryEvent, TransStartState, false, query),
            (TransStartState, BeginEvent, TransStartState, false, noop),
            (TransStartState, EnableAutoCommitEvent, TransStartState, false, noop),
            (TransStartState, DisableAutoCommitEvent, TransNoAutoCommitStartState, false, disable_autocommit),
            (TransStartState, CommitRollbackEvent, TransIdleState, true, commit_release),
        ];

        for (state, event, target, forced, handler) in base {
            table.register(state, event, target, forced, handler);
            table.register(state.with_prepared(true), event, target.with_prepared(true), forced, handler);
        }

        for state in TransState::ALL {
            if state.prepared() {
                table.register(state, StmtPrepareEvent, state, false, noop);
                table.register(state, StmtCloseEvent, state.with_prepared(false), true, stmt_close);
            } else {
                table.register(state, StmtPrepareEvent, state.with_prepared(true), false, stmt_prepare);
                table.register(state, StmtCloseEvent, state, false, noop);
            }
        }

        table
    }

    /// Register one transition, panics on a duplicate (state, event).
    pub fn register(
        &mut self,
        state: TransState,
        event: TransEventName,
        target: TransState,
        forced: bool,
        handler: TransHandler,
    ) {
        if self.entries.insert((state, event), TransEntry { target, forced, handler }).is_some() {
            panic!("duplicate transition registered for {:?} on {:?}", state, event);
        }
    }

    pub fn get(&self, state: TransState, event: TransEventName) -> Option<&TransEntry> {
        self.entries.get(&(state, event))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `event` against the session: call the handler, move the state and
    /// settle the connection. The handler's result is returned unmodified.
    pub async fn dispatch(
        &self,
        sess: &mut SessionInner,
        ctx: &Context,
        event: TransEventName,
        input: EventInput<'_>,
    ) -> Result<Option<QueryResult>, Error> {
        let from = sess.state;
        let entry = match self.get(from, event) {
            Some(entry) => entry,
            None => {
                error!(namespace = %sess.provider.name(), state = ?from, event = %event, "missing transition");
                return Err(Error::new(ErrorKind::Internal(format!(
                    "no transition for {:?} on {}",
                    from, event
                ))));
            }
        };

        let HandlerOutput { action, result } = (entry.handler)(sess, ctx, input).await;

        let to = if entry.forced || result.is_ok() { entry.target } else { from };
        sess.state = to;
        debug!(
            namespace = %sess.provider.name(),
            event = %event,
            from = ?from,
            to = ?to,
            action = ?action,
            ok = result.is_ok(),
            "transition"
        );

        self.settle(sess, action).await;
        self.metrics_collector.set_session_event_total(
            sess.provider.name(),
            event.as_str(),
            result.is_ok(),
        );

        result
    }

    async fn settle(&self, sess: &mut SessionInner, action: ConnAction) {
        match action {
            ConnAction::Keep | ConnAction::Release => {
                if sess.state.holds_conn() {
                    return;
                }
                if let Some(conn) = sess.conn.take() {
                    if conn.is_autocommit() && !conn.in_trans() {
                        conn.put_back();
                    } else {
                        warn!(
                            namespace = %sess.provider.name(),
                            autocommit = conn.is_autocommit(),
                            in_trans = conn.in_trans(),
                            "connection has session state left, closing instead of pooling"
                        );
                        self.discard(sess, conn).await;
                    }
                }
            }

            ConnAction::Discard => {
                if let Some(conn) = sess.conn.take() {
                    self.discard(sess, conn).await;
                }
                if sess.state.holds_conn() {
                    warn!(
                        namespace = %sess.provider.name(),
                        state = ?sess.state,
                        "backend connection lost, session reset to initial state"
                    );
                    // the client still believes autocommit is off
                    sess.autocommit_lost = !sess.state.autocommit();
                    sess.state = TransState::default();
                    sess.open_stmts = 0;
                }
            }
        }
    }

    async fn discard(&self, sess: &SessionInner, conn: Box<dyn BackendConn>) {
        self.metrics_collector.set_backend_conn_discard_total(sess.provider.name());
        if let Err(e) = conn.error_close().await {
            debug!(namespace = %sess.provider.name(), error = %e, "close discarded connection");
        }
    }

    pub fn metrics_collector(&self) -> SessionMetricsCollector {
        self.metrics_collector
    }
}

// A freshly acquired connection in an unknown state, or one that failed at
// the connection level, is never reused.
fn failure_action(fresh: bool, err: &Error) -> ConnAction {
    if fresh || err.is_conn_broken() {
        ConnAction::Discard
    } else {
        ConnAction::Keep
    }
}

fn noop<'a>(
    _sess: &'a mut SessionInner,
    _ctx: &'a Context,
    _input: EventInput<'a>,
) -> BoxFuture<'a, HandlerOutput> {
    Box::pin(async { HandlerOutput::ok(ConnAction::Keep, None) })
}

fn query<'a>(
    sess: &'a mut SessionInner,
    ctx: &'a Context,
    input: EventInput<'a>,
) -> BoxFuture<'a, HandlerOutput> {
    Box::pin(async move {
        let (db, sql) = match input {
            EventInput::Query { db, sql } => (db, sql),
            _ => {
                return HandlerOutput::err(
                    ConnAction::Keep,
                    Error::new(ErrorKind::Internal("query event without sql".to_string())),
                )
            }
        };

        let conn = match sess.ensure_conn(ctx).await {
            Ok((conn, _)) => conn,
            Err(e) => return HandlerOutput::err(ConnAction::Keep, e),
        };

        let res = match conn.use_db(db).await {
            Ok(()) => conn.execute(sql).await,
            Err(e) => Err(e),
        };

        match res {
            Ok(res) => HandlerOutput::ok(ConnAction::Release, Some(res)),
            Err(e) if e.is_conn_broken() => HandlerOutput::err(ConnAction::Discard, e),
            Err(e) => HandlerOutput::err(ConnAction::Release, e),
        }
    })
}

fn begin<'a>(
    sess: &'a mut SessionInner,
    ctx: &'a Context,
    _input: EventInput<'a>,
) -> BoxFuture<'a, HandlerOutput> {
    Box::pin(async move {
        let (conn, fresh) = match sess.ensure_conn(ctx).await {
            Ok(acquired) => acquired,
            Err(e) => return HandlerOutput::err(ConnAction::Keep, e),
        };

        match conn.begin().await {
            Ok(()) => HandlerOutput::ok(ConnAction::Keep, None),
            Err(e) => HandlerOutput::err(failure_action(fresh, &e), e),
        }
    })
}

fn disable_autocommit<'a>(
    sess: &'a mut SessionInner,
    ctx: &'a Context,
    _input: EventInput<'a>,
) -> BoxFuture<'a, HandlerOutput> {
    Box::pin(async move {
        let (conn, fresh) = match sess.ensure_conn(ctx).await {
            Ok(acquired) => acquired,
            Err(e) => return HandlerOutput::err(ConnAction::Keep, e),
        };

        match conn.set_autocommit(false).await {
            Ok(()) => HandlerOutput::ok(ConnAction::Keep, None),
            Err(e) => HandlerOutput::err(failure_action(fresh, &e), e),
        }
    })
}

// autocommit=0 -> 1 outside a transaction, the connection goes back to the pool.
fn enable_autocommit_release<'a>(
    sess: &'a mut SessionInner,
    ctx: &'a Context,
    _input: EventInput<'a>,
) -> BoxFuture<'a, HandlerOutput> {
    Box::pin(async move {
        let conn = match sess.ensure_conn(ctx).await {
            Ok((conn, _)) => conn,
            Err(e) => return HandlerOutput::err(ConnAction::Discard, e),
        };

        match conn.set_autocommit(true).await {
            Ok(()) => HandlerOutput::ok(ConnAction::Release, None),
            Err(e) => HandlerOutput::err(ConnAction::Discard, e),
        }
    })
}

// autocommit=0 -> 1 inside a transaction, the connection stays pinned.
fn enable_autocommit_keep<'a>(
    sess: &'a mut SessionInner,
    ctx: &'a Context,
    _input: EventInput<'a>,
) -> BoxFuture<'a, HandlerOutput> {
    Box::pin(async move {
        let (conn, fresh) = match sess.ensure_conn(ctx).await {
            Ok(acquired) => acquired,
            Err(e) => return HandlerOutput::err(ConnAction::Keep, e),
        };

        match conn.set_autocommit(true).await {
            Ok(()) => HandlerOutput::ok(ConnAction::Keep, None),
            Err(e) => HandlerOutput::err(failure_action(fresh, &e), e),
        }
    })
}

async fn finish_trans(conn: &mut Box<dyn BackendConn>, commit: bool) -> Result<(), Error> {
    if commit {
        conn.commit().await
    } else {
        conn.rollback().await
    }
}

// Ends a transaction started with autocommit=1, the connection returns to the
// pool on success and is always closed on failure.
fn commit_release<'a>(
    sess: &'a mut SessionInner,
    ctx: &'a Context,
    input: EventInput<'a>,
) -> BoxFuture<'a, HandlerOutput> {
    Box::pin(async move {
        let commit = matches!(input, EventInput::Commit(true));
        let conn = match sess.ensure_conn(ctx).await {
            Ok((conn, _)) => conn,
            Err(e) => return HandlerOutput::err(ConnAction::Discard, e),
        };

        match finish_trans(conn, commit).await {
            Ok(()) => HandlerOutput::ok(ConnAction::Release, None),
            Err(e) => {
                if commit {
                    if let Err(rollback_err) = conn.rollback().await {
                        debug!(error = %rollback_err, "rollback after failed commit");
                    }
                }
                HandlerOutput::err(ConnAction::Discard, e)
            }
        }
    })
}

// Ends a transaction under autocommit=0, the connection stays pinned unless
// it can no longer be trusted.
fn commit_keep<'a>(
    sess: &'a mut SessionInner,
    ctx: &'a Context,
    input: EventInput<'a>,
) -> BoxFuture<'a, HandlerOutput> {
    Box::pin(async move {
        let commit = matches!(input, EventInput::Commit(true));
        let conn = match sess.ensure_conn(ctx).await {
            Ok((conn, _)) => conn,
            Err(e) => return HandlerOutput::err(ConnAction::Discard, e),
        };

        match finish_trans(conn, commit).await {
            Ok(()) => HandlerOutput::ok(ConnAction::Keep, None),
            Err(e) if e.is_conn_broken() => HandlerOutput::err(ConnAction::Discard, e),
            Err(e) if !commit => HandlerOutput::err(ConnAction::Discard, e),
            Err(e) => match conn.rollback().await {
                Ok(()) => HandlerOutput::err(ConnAction::Keep, e),
                Err(_) => HandlerOutput::err(ConnAction::Discard, e),
            },
        }
    })
}

fn stmt_prepare<'a>(
    sess: &'a mut SessionInner,
    ctx: &'a Context,
    _input: EventInput<'a>,
) -> BoxFuture<'a, HandlerOutput> {
    Box::pin(async move {
        match sess.ensure_conn(ctx).await {
            Ok(_) => HandlerOutput::ok(ConnAction::Keep, None),
            Err(e) => HandlerOutput::err(ConnAction::Keep, e),
        }
    })
}

fn stmt_close<'a>(
    _sess: &'a mut SessionInner,
    _ctx: &'a Context,
    _input: EventInput<'a>,
) -> BoxFuture<'a, HandlerOutput> {
    Box::pin(async { HandlerOutput::ok(ConnAction::Release, None) })
}
