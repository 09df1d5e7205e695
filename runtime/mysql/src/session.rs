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

use std::{sync::Arc, time::Instant};

use conn_pool::Context;
use keel_error::error::{Error, ErrorKind};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{
    backend_conn::{BackendConn, ConnProvider, QueryResult},
    metrics::SessionMetricsCollector,
    transaction_fsm::{EventInput, TransEventName, TransState, TransTable},
};

/// Everything a session owns, guarded by the manager's lock.
pub struct SessionInner {
    pub(crate) state: TransState,
    pub(crate) conn: Option<Box<dyn BackendConn>>,
    pub(crate) provider: Arc<dyn ConnProvider>,
    pub(crate) open_stmts: usize,
    // set when a lost connection took autocommit=0 with it
    pub(crate) autocommit_lost: bool,
    metrics_collector: SessionMetricsCollector,
    closed: bool,
}

impl SessionInner {
    pub(crate) fn new(
        provider: Arc<dyn ConnProvider>,
        metrics_collector: SessionMetricsCollector,
    ) -> SessionInner {
        SessionInner {
            state: TransState::default(),
            conn: None,
            provider,
            open_stmts: 0,
            autocommit_lost: false,
            metrics_collector,
            closed: false,
        }
    }

    // Returns the held connection, acquiring one first if needed. The flag is
    // true when the connection was just acquired.
    pub(crate) async fn ensure_conn(
        &mut self,
        ctx: &Context,
    ) -> Result<(&mut Box<dyn BackendConn>, bool), Error> {
        let fresh = self.conn.is_none();
        if fresh {
            let now = Instant::now();
            let conn = self.provider.get_pooled_conn(ctx).await?;
            self.metrics_collector.set_backend_conn_acquire_duration(
                self.provider.name(),
                now.elapsed().as_secs_f64(),
            );
            self.conn = Some(conn);
        }

        match self.conn.as_mut() {
            Some(conn) => Ok((conn, fresh)),
            None => Err(Error::new(ErrorKind::Internal("session lost its connection".to_string()))),
        }
    }
}

/// Per client session view of the backend: tracks autocommit, transaction
/// and prepared statement state and pins a pooled connection while any of
/// them requires it.
pub struct SessionConnectionManager {
    table: Arc<TransTable>,
    inner: Mutex<SessionInner>,
}

impl SessionConnectionManager {
    pub fn new(table: Arc<TransTable>, provider: Arc<dyn ConnProvider>) -> SessionConnectionManager {
        let inner = SessionInner::new(provider, table.metrics_collector());
        SessionConnectionManager { table, inner: Mutex::new(inner) }
    }

    async fn lock(&self) -> Result<MutexGuard<'_, SessionInner>, Error> {
        let sess = self.inner.lock().await;
        if sess.closed {
            return Err(Error::new(ErrorKind::SessionClosed));
        }
        Ok(sess)
    }

    // Statements are refused until the client sets autocommit again, so
    // nothing is committed behind its back.
    async fn lock_for_statement(&self) -> Result<MutexGuard<'_, SessionInner>, Error> {
        let sess = self.lock().await?;
        if sess.autocommit_lost {
            return Err(Error::new(ErrorKind::AutocommitLost));
        }
        Ok(sess)
    }

    pub async fn state(&self) -> TransState {
        self.inner.lock().await.state
    }

    pub async fn has_conn(&self) -> bool {
        self.inner.lock().await.conn.is_some()
    }

    pub async fn open_stmts(&self) -> usize {
        self.inner.lock().await.open_stmts
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Run `sql` against `db`, on the held connection or a pooled one.
    pub async fn query(&self, ctx: &Context, db: &str, sql: &str) -> Result<QueryResult, Error> {
        let mut sess = self.lock_for_statement().await?;
        let res = self
            .table
            .dispatch(&mut sess, ctx, TransEventName::QueryEvent, EventInput::Query { db, sql })
            .await?;
        Ok(res.unwrap_or_default())
    }

    pub async fn set_autocommit(&self, ctx: &Context, on: bool) -> Result<(), Error> {
        let event = if on {
            TransEventName::EnableAutoCommitEvent
        } else {
            TransEventName::DisableAutoCommitEvent
        };
        let mut sess = self.lock().await?;
        self.table.dispatch(&mut sess, ctx, event, EventInput::None).await?;
        sess.autocommit_lost = false;
        Ok(())
    }

    pub async fn begin(&self, ctx: &Context) -> Result<(), Error> {
        let mut sess = self.lock_for_statement().await?;
        self.table
            .dispatch(&mut sess, ctx, TransEventName::BeginEvent, EventInput::None)
            .await
            .map(|_| ())
    }

    // commit when `commit` is true, rollback otherwise
    pub async fn commit_or_rollback(&self, ctx: &Context, commit: bool) -> Result<(), Error> {
        let mut sess = self.lock_for_statement().await?;
        self.table
            .dispatch(&mut sess, ctx, TransEventName::CommitRollbackEvent, EventInput::Commit(commit))
            .await
            .map(|_| ())
    }

    /// Account for a newly prepared statement, pinning a connection for it.
    pub async fn open_prepared(&self, ctx: &Context) -> Result<(), Error> {
        let mut sess = self.lock_for_statement().await?;
        self.table
            .dispatch(&mut sess, ctx, TransEventName::StmtPrepareEvent, EventInput::None)
            .await?;
        sess.open_stmts += 1;
        Ok(())
    }

    /// Account for a closed statement. Closing the last one unpins the
    /// connection unless the session still needs it.
    pub async fn close_prepared(&self, ctx: &Context) -> Result<(), Error> {
        let mut sess = self.lock().await?;
        if sess.open_stmts == 0 {
            debug!(namespace = %sess.provider.name(), "close_prepared without open statements");
            return Ok(());
        }

        sess.open_stmts -= 1;
        if sess.open_stmts > 0 {
            return Ok(());
        }
        self.table
            .dispatch(&mut sess, ctx, TransEventName::StmtCloseEvent, EventInput::None)
            .await
            .map(|_| ())
    }

    /// End the session. A connection with pending work is closed, a clean one
    /// goes back to the pool. Later calls fail with `SessionClosed`.
    pub async fn close(&self) -> Result<(), Error> {
        let mut sess = self.inner.lock().await;
        if sess.closed {
            return Ok(());
        }
        sess.closed = true;

        let state = sess.state;
        let pending = state.in_trans() || state.prepared() || sess.open_stmts > 0;
        let conn = sess.conn.take();
        sess.state = TransState::default();
        sess.open_stmts = 0;
        sess.autocommit_lost = false;

        let mut conn = match conn {
            Some(conn) => conn,
            None => return Ok(()),
        };

        if pending || conn.in_trans() {
            debug!(namespace = %sess.provider.name(), state = ?state, "close session with pending work");
            return conn.error_close().await;
        }

        if !state.autocommit() {
            if let Err(e) = conn.set_autocommit(true).await {
                warn!(namespace = %sess.provider.name(), error = %e, "restore autocommit on close");
                if let Err(close_err) = conn.error_close().await {
                    debug!(namespace = %sess.provider.name(), error = %close_err, "close connection");
                }
                return Err(e);
            }
        }

        if conn.is_autocommit() && !conn.in_trans() {
            conn.put_back();
            Ok(())
        } else {
            conn.error_close().await
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{Fail, MockProvider};

    fn manager(provider: &Arc<MockProvider>) -> SessionConnectionManager {
        let provider: Arc<dyn ConnProvider> = provider.clone();
        SessionConnectionManager::new(Arc::new(TransTable::new()), provider)
    }

    async fn assert_invariant(mgr: &SessionConnectionManager) {
        let sess = mgr.inner.lock().await;
        assert_eq!(sess.conn.is_some(), sess.state.holds_conn(), "state {:?}", sess.state);
    }

    #[tokio::test]
    async fn test_query_in_autocommit_releases() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        let res = mgr.query(&ctx, "db1", "SELECT 1").await.unwrap();
        assert_eq!(res.affected_rows, 1);
        assert_eq!(
            provider.take_log(),
            vec!["acquire", "use_db:db1", "execute:SELECT 1", "put_back"]
        );
        assert_eq!(mgr.state().await, TransState::TransIdleState);
        assert!(!mgr.has_conn().await);
    }

    #[tokio::test]
    async fn test_query_sql_error_keeps_conn_healthy() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        provider.fail("execute", Fail::Sql);

        let err = mgr.query(&Context::new(), "db1", "INSERT").await.unwrap_err();
        assert!(!err.is_conn_broken());
        assert_eq!(provider.count("put_back"), 1);
        assert_eq!(provider.count("error_close"), 0);
    }

    #[tokio::test]
    async fn test_query_broken_conn_discards() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        provider.fail("use_db", Fail::Broken);

        let err = mgr.query(&Context::new(), "db1", "SELECT 1").await.unwrap_err();
        assert!(err.is_conn_broken());
        assert_eq!(provider.take_log(), vec!["acquire", "use_db:db1", "error_close"]);
    }

    #[tokio::test]
    async fn test_scenario_begin_query_commit() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.begin(&ctx).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransStartState);
        assert!(mgr.has_conn().await);

        mgr.query(&ctx, "db1", "SELECT 1").await.unwrap();
        assert!(mgr.has_conn().await);

        mgr.commit_or_rollback(&ctx, true).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransIdleState);
        assert!(!mgr.has_conn().await);

        assert_eq!(
            provider.take_log(),
            vec!["acquire", "begin", "use_db:db1", "execute:SELECT 1", "commit", "put_back"]
        );
    }

    #[tokio::test]
    async fn test_scenario_disable_autocommit_acquire_fails() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        provider.fail_acquire(true);

        let err = mgr.set_autocommit(&Context::new(), false).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Pool(conn_pool::PoolError::Timeout)));
        assert_eq!(mgr.state().await, TransState::TransIdleState);
        assert!(!mgr.has_conn().await);
        assert_eq!(provider.take_log(), vec!["acquire"]);
    }

    #[tokio::test]
    async fn test_scenario_commit_failure_in_autocommit_trans() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.begin(&ctx).await.unwrap();
        provider.fail("commit", Fail::Sql);

        let err = mgr.commit_or_rollback(&ctx, true).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
        assert_eq!(mgr.state().await, TransState::TransIdleState);
        assert!(!mgr.has_conn().await);
        assert_eq!(
            provider.take_log(),
            vec!["acquire", "begin", "commit", "rollback", "error_close"]
        );
    }

    #[tokio::test]
    async fn test_begin_is_idempotent() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.begin(&ctx).await.unwrap();
        mgr.begin(&ctx).await.unwrap();
        assert_eq!(provider.count("acquire"), 1);
        assert_eq!(provider.count("begin"), 1);
    }

    #[tokio::test]
    async fn test_begin_failure_closes_fresh_conn() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        provider.fail("begin", Fail::Sql);

        mgr.begin(&Context::new()).await.unwrap_err();
        assert_eq!(mgr.state().await, TransState::TransIdleState);
        assert_eq!(provider.take_log(), vec!["acquire", "begin", "error_close"]);
    }

    #[tokio::test]
    async fn test_autocommit_off_round_trip() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.set_autocommit(&ctx, false).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransNoAutoCommitState);
        mgr.begin(&ctx).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransNoAutoCommitStartState);
        mgr.commit_or_rollback(&ctx, false).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransNoAutoCommitState);
        assert!(mgr.has_conn().await);

        mgr.set_autocommit(&ctx, true).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransIdleState);
        assert_eq!(
            provider.take_log(),
            vec![
                "acquire",
                "set_autocommit:false",
                "begin",
                "rollback",
                "set_autocommit:true",
                "put_back"
            ]
        );
    }

    #[tokio::test]
    async fn test_enable_autocommit_failure_is_forced() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.set_autocommit(&ctx, false).await.unwrap();
        provider.fail("set_autocommit", Fail::Sql);
        mgr.set_autocommit(&ctx, true).await.unwrap_err();

        assert_eq!(mgr.state().await, TransState::TransIdleState);
        assert!(!mgr.has_conn().await);
        assert_eq!(provider.count("error_close"), 1);
    }

    #[tokio::test]
    async fn test_manual_commit_failure_rolls_back_and_keeps() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.set_autocommit(&ctx, false).await.unwrap();
        mgr.begin(&ctx).await.unwrap();
        provider.fail("commit", Fail::Sql);

        mgr.commit_or_rollback(&ctx, true).await.unwrap_err();
        assert_eq!(mgr.state().await, TransState::TransNoAutoCommitState);
        assert!(mgr.has_conn().await);
        assert_eq!(provider.count("rollback"), 1);
        assert_eq!(provider.count("error_close"), 0);
    }

    #[tokio::test]
    async fn test_lost_conn_in_manual_mode_refuses_statements() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.set_autocommit(&ctx, false).await.unwrap();
        provider.fail("execute", Fail::Broken);
        let err = mgr.query(&ctx, "db1", "INSERT INTO t VALUES (1)").await.unwrap_err();
        assert!(err.is_conn_broken());

        assert_eq!(mgr.state().await, TransState::TransIdleState);
        assert!(!mgr.has_conn().await);
        assert_eq!(provider.count("error_close"), 1);

        provider.clear_fails();
        provider.take_log();
        let err = mgr.query(&ctx, "db1", "INSERT INTO t VALUES (2)").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AutocommitLost));
        let err = mgr.begin(&ctx).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AutocommitLost));
        let err = mgr.open_prepared(&ctx).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AutocommitLost));
        assert!(provider.take_log().is_empty());

        mgr.set_autocommit(&ctx, false).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransNoAutoCommitState);
        mgr.query(&ctx, "db1", "INSERT INTO t VALUES (2)").await.unwrap();
        assert!(mgr.has_conn().await);
        assert_eq!(mgr.state().await, TransState::TransNoAutoCommitState);
    }

    #[tokio::test]
    async fn test_enable_autocommit_after_lost_conn() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.set_autocommit(&ctx, false).await.unwrap();
        provider.fail("execute", Fail::Broken);
        mgr.query(&ctx, "db1", "SELECT 1").await.unwrap_err();
        provider.clear_fails();

        mgr.set_autocommit(&ctx, true).await.unwrap();
        mgr.query(&ctx, "db1", "SELECT 1").await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransIdleState);
        assert!(!mgr.has_conn().await);
        assert_eq!(provider.count("put_back"), 1);
    }

    #[tokio::test]
    async fn test_query_opening_trans_is_not_pooled() {
        let provider = MockProvider::new();
        let a = manager(&provider);
        let b = manager(&provider);
        let ctx = Context::new();

        a.query(&ctx, "", "START TRANSACTION").await.unwrap();
        assert!(!a.has_conn().await);
        assert_eq!(provider.count("error_close"), 1);
        assert_eq!(provider.idle(), 0);

        b.query(&ctx, "db1", "INSERT INTO t VALUES (1)").await.unwrap();
        let last = provider.executions().pop().unwrap();
        assert_eq!(last.sql, "INSERT INTO t VALUES (1)");
        assert!(!last.in_trans);
        assert_eq!(provider.idle(), 1);
    }

    #[tokio::test]
    async fn test_schema_is_selected_on_reused_conn() {
        let provider = MockProvider::new();
        let a = manager(&provider);
        let b = manager(&provider);
        let ctx = Context::new();

        a.query(&ctx, "db1", "USE db2").await.unwrap();
        assert_eq!(provider.idle(), 1);

        b.query(&ctx, "db1", "SELECT 1").await.unwrap();
        assert_eq!(provider.count("use_db:db1"), 2);
        let last = provider.executions().pop().unwrap();
        assert_eq!(last.sql, "SELECT 1");
        assert_eq!(last.db.as_deref(), Some("db1"));
    }

    #[tokio::test]
    async fn test_prepared_pinning() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.open_prepared(&ctx).await.unwrap();
        mgr.open_prepared(&ctx).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransPrepareState);
        assert_eq!(mgr.open_stmts().await, 2);
        assert_eq!(provider.count("acquire"), 1);

        mgr.query(&ctx, "db1", "SELECT 1").await.unwrap();
        assert!(mgr.has_conn().await);

        mgr.close_prepared(&ctx).await.unwrap();
        assert!(mgr.has_conn().await);
        mgr.close_prepared(&ctx).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransIdleState);
        assert!(!mgr.has_conn().await);
        assert_eq!(provider.count("put_back"), 1);

        // extra close is ignored
        mgr.close_prepared(&ctx).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransIdleState);
    }

    #[tokio::test]
    async fn test_prepared_close_inside_trans_keeps_conn() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.open_prepared(&ctx).await.unwrap();
        mgr.begin(&ctx).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransStartPrepareState);

        mgr.close_prepared(&ctx).await.unwrap();
        assert_eq!(mgr.state().await, TransState::TransStartState);
        assert!(mgr.has_conn().await);

        mgr.commit_or_rollback(&ctx, true).await.unwrap();
        assert!(!mgr.has_conn().await);
        assert_eq!(provider.count("acquire"), 1);
    }

    #[tokio::test]
    async fn test_close_puts_back_clean_conn() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.set_autocommit(&ctx, false).await.unwrap();
        mgr.close().await.unwrap();
        assert_eq!(
            provider.take_log(),
            vec!["acquire", "set_autocommit:false", "set_autocommit:true", "put_back"]
        );

        let err = mgr.query(&ctx, "db1", "SELECT 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::SessionClosed));

        mgr.close().await.unwrap();
        assert!(provider.take_log().is_empty());
    }

    #[tokio::test]
    async fn test_close_with_open_trans_discards() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);

        mgr.begin(&Context::new()).await.unwrap();
        mgr.close().await.unwrap();
        assert_eq!(provider.count("error_close"), 1);
        assert_eq!(provider.count("put_back"), 0);
        assert_eq!(provider.live(), 0);
        assert!(mgr.is_closed().await);
    }

    #[tokio::test]
    async fn test_close_restore_autocommit_failure_discards() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);

        mgr.set_autocommit(&Context::new(), false).await.unwrap();
        provider.fail("set_autocommit", Fail::Broken);
        let err = mgr.close().await.unwrap_err();
        assert!(err.is_conn_broken());
        assert_eq!(provider.count("error_close"), 1);
        assert_eq!(provider.live(), 0);
        assert!(mgr.is_closed().await);
    }

    #[tokio::test]
    async fn test_close_with_open_server_trans_discards() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);
        let ctx = Context::new();

        mgr.set_autocommit(&ctx, false).await.unwrap();
        mgr.query(&ctx, "db1", "UPDATE t SET a = 1").await.unwrap();
        mgr.close().await.unwrap();

        assert_eq!(provider.count("set_autocommit:true"), 0);
        assert_eq!(provider.count("error_close"), 1);
        assert_eq!(provider.count("put_back"), 0);
        assert_eq!(provider.live(), 0);
    }

    #[tokio::test]
    async fn test_close_reports_error_close_failure() {
        let provider = MockProvider::new();
        let mgr = manager(&provider);

        mgr.begin(&Context::new()).await.unwrap();
        provider.fail("error_close", Fail::Broken);
        assert!(mgr.close().await.is_err());
        assert_eq!(provider.live(), 0);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Query,
        Begin,
        Commit,
        Rollback,
        AutoCommitOff,
        AutoCommitOn,
        Prepare,
        ClosePrepared,
    }

    const OPS: [Op; 8] = [
        Op::Query,
        Op::Begin,
        Op::Commit,
        Op::Rollback,
        Op::AutoCommitOff,
        Op::AutoCommitOn,
        Op::Prepare,
        Op::ClosePrepared,
    ];

    async fn apply(mgr: &SessionConnectionManager, op: Op) {
        let ctx = Context::new();
        let _ = match op {
            Op::Query => mgr.query(&ctx, "db1", "SELECT 1").await.map(|_| ()),
            Op::Begin => mgr.begin(&ctx).await,
            Op::Commit => mgr.commit_or_rollback(&ctx, true).await,
            Op::Rollback => mgr.commit_or_rollback(&ctx, false).await,
            Op::AutoCommitOff => mgr.set_autocommit(&ctx, false).await,
            Op::AutoCommitOn => mgr.set_autocommit(&ctx, true).await,
            Op::Prepare => mgr.open_prepared(&ctx).await,
            Op::ClosePrepared => mgr.close_prepared(&ctx).await,
        };
    }

    #[tokio::test]
    async fn test_conn_held_iff_needed_for_all_sequences() {
        let fails = [None, Some(("execute", Fail::Broken)), Some(("commit", Fail::Sql))];
        for fail in fails {
            for a in OPS {
                for b in OPS {
                    for c in OPS {
                        let provider = MockProvider::new();
                        if let Some((op, kind)) = fail {
                            provider.fail(op, kind);
                        }
                        let mgr = manager(&provider);
                        for op in [a, b, c] {
                            apply(&mgr, op).await;
                            assert_invariant(&mgr).await;
                        }
                        mgr.close().await.unwrap();
                        assert_eq!(provider.live(), 0, "leak after {:?} {:?} {:?}", a, b, c);
                    }
                }
            }
        }
    }
}
