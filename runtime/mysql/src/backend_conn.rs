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

use std::fmt::Debug;

use async_trait::async_trait;
use conn_pool::{Context, PoolConn};
use keel_error::error::Error;
pub use mysql_protocol::client::resultset::QueryResult;
use mysql_protocol::client::conn::ClientConn;

/// A pooled backend connection as the session layer sees it. Every
/// connection ends with exactly one of `put_back` or `error_close`.
#[async_trait]
pub trait BackendConn: Send + Sync + Debug {
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, Error>;

    async fn begin(&mut self) -> Result<(), Error>;

    async fn commit(&mut self) -> Result<(), Error>;

    async fn rollback(&mut self) -> Result<(), Error>;

    async fn set_autocommit(&mut self, on: bool) -> Result<(), Error>;

    fn is_autocommit(&self) -> bool;

    // Whether the server reports an open transaction on this connection.
    fn in_trans(&self) -> bool;

    async fn use_db(&mut self, db: &str) -> Result<(), Error>;

    // Return a healthy connection to its pool.
    fn put_back(self: Box<Self>);

    // Destroy the connection.
    async fn error_close(self: Box<Self>) -> Result<(), Error>;
}

/// Where a session gets its connections from.
#[async_trait]
pub trait ConnProvider: Send + Sync {
    async fn get_pooled_conn(&self, ctx: &Context) -> Result<Box<dyn BackendConn>, Error>;

    fn name(&self) -> &str;
}

#[async_trait]
impl BackendConn for PoolConn<ClientConn> {
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, Error> {
        Ok(self.query(sql).await?)
    }

    async fn begin(&mut self) -> Result<(), Error> {
        Ok(ClientConn::begin(self).await?)
    }

    async fn commit(&mut self) -> Result<(), Error> {
        Ok(ClientConn::commit(self).await?)
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        Ok(ClientConn::rollback(self).await?)
    }

    async fn set_autocommit(&mut self, on: bool) -> Result<(), Error> {
        Ok(ClientConn::set_autocommit(self, on).await?)
    }

    fn is_autocommit(&self) -> bool {
        ClientConn::is_autocommit(self)
    }

    fn in_trans(&self) -> bool {
        ClientConn::in_trans(self)
    }

    async fn use_db(&mut self, db: &str) -> Result<(), Error> {
        Ok(ClientConn::use_db(self, db).await?)
    }

    fn put_back(self: Box<Self>) {
        PoolConn::put_back(*self)
    }

    async fn error_close(self: Box<Self>) -> Result<(), Error> {
        Ok(PoolConn::error_close(*self).await?)
    }
}
