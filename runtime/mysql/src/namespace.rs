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

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use conn_pool::{Context, PoolStats};
use endpoint::endpoint::Endpoint;
use keel_error::error::Error;
use mysql_protocol::client::conn::ClientConn;
use proxy::{
    backend::{Backend, ConnFactory},
    proxy::NamespaceConfig,
};
use tokio::task::JoinHandle;
use tracing::info;

use crate::backend_conn::{BackendConn, ConnProvider};

pub fn client_conn_factory() -> ConnFactory<ClientConn> {
    Arc::new(|endpoint: &Endpoint| {
        ClientConn::with_opts(endpoint.user.clone(), endpoint.password.clone(), endpoint.addr.clone())
            .with_db(endpoint.db.clone())
    })
}

/// A tenant scoped unit: a name and the backend instances it routes to.
pub struct Namespace {
    name: String,
    backend: Arc<Backend<ClientConn>>,
    acquire_timeout: Option<Duration>,
    idle_check_interval: Option<Duration>,
}

impl Namespace {
    pub fn new(name: &str, backend: Arc<Backend<ClientConn>>) -> Namespace {
        Namespace { name: name.to_string(), backend, acquire_timeout: None, idle_check_interval: None }
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Namespace {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_check_interval(mut self, interval: Option<Duration>) -> Namespace {
        self.idle_check_interval = interval;
        self
    }

    pub fn from_config(config: &NamespaceConfig, endpoints: Vec<Endpoint>) -> Namespace {
        let backend = Backend::new(&config.name, config.balance_type, client_conn_factory())
            .with_pool_size(config.pool_size)
            .with_idle_timeout(config.idle_timeout())
            .with_endpoints(endpoints);

        Namespace::new(&config.name, Arc::new(backend))
            .with_acquire_timeout(config.acquire_timeout())
            .with_idle_check_interval(config.idle_check_interval())
    }

    pub fn backend(&self) -> &Arc<Backend<ClientConn>> {
        &self.backend
    }

    /// Start the idle reaper when an interval is configured.
    pub fn start_idle_check(&self) -> Option<JoinHandle<()>> {
        self.idle_check_interval.map(|interval| self.backend.start_idle_check(interval))
    }

    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        self.backend.stats()
    }

    pub async fn close(&self) {
        self.backend.close().await;
        info!(namespace = %self.name, "namespace closed");
    }
}

#[async_trait]
impl ConnProvider for Namespace {
    async fn get_pooled_conn(&self, ctx: &Context) -> Result<Box<dyn BackendConn>, Error> {
        let conn = match (self.acquire_timeout, ctx.deadline()) {
            (Some(timeout), None) => {
                self.backend.get_conn(&ctx.clone().with_timeout(timeout)).await?
            }
            _ => self.backend.get_conn(ctx).await?,
        };
        let conn: Box<dyn BackendConn> = Box::new(conn);
        Ok(conn)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
