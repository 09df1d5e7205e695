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

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use conn_pool::{Context, PoolError};
use keel_error::error::Error;
use mysql_protocol::err::ProtocolError;
use parking_lot::Mutex;

use crate::backend_conn::{BackendConn, ConnProvider, QueryResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fail {
    // ERR packet, connection still usable
    Sql,
    // lost connection
    Broken,
}

impl Fail {
    fn error(self) -> Error {
        match self {
            Fail::Sql => Error::from(ProtocolError::Server {
                code: 1062,
                state: "23000".to_string(),
                message: "Duplicate entry '1' for key 'PRIMARY'".to_string(),
            }),
            Fail::Broken => Error::from(ProtocolError::UnexpectedEof),
        }
    }
}

// Server side session state of a mock connection, kept across pooling.
#[derive(Debug, Clone)]
struct ConnState {
    autocommit: bool,
    in_trans: bool,
    db: Option<String>,
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState { autocommit: true, in_trans: false, db: None }
    }
}

/// A statement as the mock server ran it.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub sql: String,
    pub db: Option<String>,
    pub in_trans: bool,
}

#[derive(Debug, Default, Clone)]
struct Shared {
    log: Arc<Mutex<Vec<String>>>,
    fails: Arc<Mutex<HashMap<&'static str, Fail>>>,
    fail_acquire: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
    idle: Arc<Mutex<Vec<ConnState>>>,
    executions: Arc<Mutex<Vec<Execution>>>,
}

/// Records every backend call in a shared log. Connections put back are
/// handed out again with their server state.
#[derive(Default)]
pub struct MockProvider {
    shared: Shared,
}

impl MockProvider {
    pub fn new() -> Arc<MockProvider> {
        Arc::new(MockProvider::default())
    }

    pub fn fail(&self, op: &'static str, fail: Fail) {
        self.shared.fails.lock().insert(op, fail);
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.shared.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn clear_fails(&self) {
        self.shared.fails.lock().clear();
        self.fail_acquire(false);
    }

    pub fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.shared.log.lock())
    }

    pub fn count(&self, entry: &str) -> usize {
        self.shared.log.lock().iter().filter(|x| x.as_str() == entry).count()
    }

    // connections handed out and not yet settled
    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.shared.idle.lock().len()
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.shared.executions.lock().clone()
    }
}

#[async_trait]
impl ConnProvider for MockProvider {
    async fn get_pooled_conn(&self, _ctx: &Context) -> Result<Box<dyn BackendConn>, Error> {
        self.shared.log.lock().push("acquire".to_string());
        if self.shared.fail_acquire.load(Ordering::SeqCst) {
            return Err(PoolError::Timeout.into());
        }
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        let state = self.shared.idle.lock().pop().unwrap_or_default();
        Ok(Box::new(MockConn { shared: self.shared.clone(), state }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[derive(Debug)]
pub struct MockConn {
    shared: Shared,
    state: ConnState,
}

impl MockConn {
    fn call(&self, op: &'static str, entry: String) -> Result<(), Error> {
        self.shared.log.lock().push(entry);
        match self.shared.fails.lock().get(op) {
            Some(fail) => Err(fail.error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackendConn for MockConn {
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, Error> {
        self.call("execute", format!("execute:{}", sql))?;
        self.shared.executions.lock().push(Execution {
            sql: sql.to_string(),
            db: self.state.db.clone(),
            in_trans: self.state.in_trans,
        });

        let sql = sql.trim();
        let upper = sql.to_ascii_uppercase();
        if upper.starts_with("USE ") {
            self.state.db = Some(sql[4..].trim().to_string());
        } else if upper.starts_with("START TRANSACTION") || upper == "BEGIN" {
            self.state.in_trans = true;
        } else if upper == "COMMIT" || upper == "ROLLBACK" {
            self.state.in_trans = false;
        } else if !self.state.autocommit {
            self.state.in_trans = true;
        }
        Ok(QueryResult { affected_rows: 1, ..Default::default() })
    }

    async fn begin(&mut self) -> Result<(), Error> {
        self.call("begin", "begin".to_string())?;
        self.state.in_trans = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), Error> {
        self.call("commit", "commit".to_string())?;
        self.state.in_trans = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        self.call("rollback", "rollback".to_string())?;
        self.state.in_trans = false;
        Ok(())
    }

    async fn set_autocommit(&mut self, on: bool) -> Result<(), Error> {
        self.call("set_autocommit", format!("set_autocommit:{}", on))?;
        // enabling autocommit commits the open transaction
        if on {
            self.state.in_trans = false;
        }
        self.state.autocommit = on;
        Ok(())
    }

    fn is_autocommit(&self) -> bool {
        self.state.autocommit
    }

    fn in_trans(&self) -> bool {
        self.state.in_trans
    }

    async fn use_db(&mut self, db: &str) -> Result<(), Error> {
        self.call("use_db", format!("use_db:{}", db))?;
        if !db.is_empty() {
            self.state.db = Some(db.to_string());
        }
        Ok(())
    }

    fn put_back(self: Box<Self>) {
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
        self.shared.log.lock().push("put_back".to_string());
        self.shared.idle.lock().push(self.state.clone());
    }

    async fn error_close(self: Box<Self>) -> Result<(), Error> {
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
        self.call("error_close", "error_close".to_string())
    }
}
