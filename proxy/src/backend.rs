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

use conn_pool::{ConnAttr, ConnLike, Context, Pool, PoolConn, PoolError, PoolStats};
use dashmap::DashMap;
use endpoint::endpoint::Endpoint;
use keel_error::error::{Error, ErrorKind};
use loadbalance::balance::{AlgorithmName, Balance, BalanceType, LoadBalance};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Builds the connection template a pool clones connections from.
pub type ConnFactory<T> = Arc<dyn Fn(&Endpoint) -> T + Send + Sync>;

/// All backend instances of one namespace, one `Pool` per instance address.
pub struct Backend<T: ConnLike + ConnAttr> {
    name: String,
    balance: Mutex<BalanceType>,
    pools: DashMap<String, Pool<T>>,
    factory: ConnFactory<T>,
    pool_size: usize,
    idle_timeout: Option<Duration>,
    closed: CancellationToken,
}

impl<T: ConnLike + ConnAttr> Backend<T> {
    pub fn new(name: &str, algorithm: AlgorithmName, factory: ConnFactory<T>) -> Backend<T> {
        Backend {
            name: name.to_string(),
            balance: Mutex::new(Balance::build_balance(algorithm)),
            pools: DashMap::new(),
            factory,
            pool_size: 64,
            idle_timeout: None,
            closed: CancellationToken::new(),
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Backend<T> {
        self.pool_size = pool_size;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Backend<T> {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_endpoints(self, endpoints: Vec<Endpoint>) -> Backend<T> {
        for endpoint in endpoints {
            self.add_instance(endpoint);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Register an instance. Returns false when one with the same name exists.
    pub fn add_instance(&self, endpoint: Endpoint) -> bool {
        let mut balance = self.balance.lock();
        if balance.item_exists(&endpoint) {
            return false;
        }

        if !self.pools.contains_key(&endpoint.addr) {
            let template = (self.factory)(&endpoint);
            self.pools.insert(
                endpoint.addr.clone(),
                Pool::new(template, self.pool_size, self.idle_timeout),
            );
        }

        info!(namespace = %self.name, instance = %endpoint.name, addr = %endpoint.addr, "add backend instance");
        balance.add(endpoint);
        true
    }

    /// Deregister an instance and close its pool. Connections currently
    /// checked out are closed when they come back.
    pub async fn remove_instance(&self, name: &str) -> bool {
        let removed = {
            let mut balance = self.balance.lock();
            let endpoint = match balance.remove_item(name) {
                Some(endpoint) => endpoint,
                None => return false,
            };
            // another instance may share the address
            if balance.get_all().iter().any(|x| x.addr == endpoint.addr) {
                None
            } else {
                self.pools.remove(&endpoint.addr).map(|(_, pool)| pool)
            }
        };

        if let Some(pool) = removed {
            pool.close().await;
        }
        info!(namespace = %self.name, instance = %name, "remove backend instance");
        true
    }

    pub fn instances(&self) -> Vec<Endpoint> {
        self.balance.lock().get_all().to_vec()
    }

    /// Pick an instance, then wait for a connection from its pool.
    pub async fn get_conn(&self, ctx: &Context) -> Result<PoolConn<T>, Error> {
        if self.is_closed() {
            return Err(PoolError::Closed.into());
        }

        let endpoint = self
            .balance
            .lock()
            .next()
            .ok_or_else(|| Error::new(ErrorKind::NoInstance(self.name.clone())))?;

        let pool = match self.pools.get(&endpoint.addr) {
            Some(pool) => pool.value().clone(),
            None => return Err(Error::new(ErrorKind::NoInstance(self.name.clone()))),
        };

        debug!(namespace = %self.name, instance = %endpoint.name, "get backend connection");
        Ok(pool.get(ctx).await?)
    }

    fn pools(&self) -> Vec<Pool<T>> {
        self.pools.iter().map(|pool| pool.value().clone()).collect()
    }

    pub async fn reap_idle(&self) -> usize {
        let mut reaped = 0;
        for pool in self.pools() {
            reaped += pool.reap_idle().await;
        }
        reaped
    }

    /// Spawn a task that reaps expired idle connections every `interval`
    /// until the backend is closed.
    pub fn start_idle_check(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = backend.closed.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = backend.reap_idle().await;
                        debug!(namespace = %backend.name, reaped, "idle check");
                    }
                }
            }
            debug!(namespace = %backend.name, "idle check stopped");
        })
    }

    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        self.pools.iter().map(|pool| (pool.key().clone(), pool.value().stats())).collect()
    }

    pub async fn close(&self) {
        self.closed.cancel();
        for pool in self.pools() {
            pool.close().await;
        }
        info!(namespace = %self.name, "backend closed");
    }
}
