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


#![warn(unused_must_use)]

use std::{str::FromStr, sync::Arc};

use config::config::{KeelConfig, KeelConfigBuilder};
use conn_pool::Context;
use keel_error::error::Error;
use prometheus::{Encoder, Registry, TextEncoder};
use runtime_mysql::{
    metrics::register_metrics, namespace::Namespace, session::SessionConnectionManager,
    transaction_fsm::TransTable,
};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error, info, warn, Level};

fn main() {
    let config = match KeelConfigBuilder::new().load_config() {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt().init();
            error!("load config failed: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(Level::from_str(config.admin.log_level.as_str()).ok())
        .init();

    info!("keel {}", env!("CARGO_PKG_VERSION"));

    let registry = Registry::new_custom(Some("keel".to_string()), None);
    let registry = match registry {
        Ok(registry) => registry,
        Err(e) => {
            error!("create metrics registry failed: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = register_metrics(&registry) {
        warn!("register metrics failed: {}", e);
    }

    build_runtime().block_on(run(config, registry));
}

async fn run(config: KeelConfig, registry: Registry) {
    let table = Arc::new(TransTable::new());

    let mut namespaces = Vec::with_capacity(config.namespace.len());
    let mut reapers = vec![];
    for ns in config.namespace.iter() {
        let namespace = Arc::new(Namespace::from_config(ns, config.endpoints(ns)));
        if let Some(handle) = namespace.start_idle_check() {
            reapers.push(handle);
        }
        info!(namespace = %ns.name, nodes = ns.nodes.len(), "namespace ready");
        namespaces.push((ns.name.clone(), namespace));
    }

    for (name, namespace) in namespaces.iter() {
        let session = SessionConnectionManager::new(table.clone(), namespace.clone());
        match check_backend(&session).await {
            Ok(()) => info!(namespace = %name, "backend check ok"),
            Err(e) => warn!(namespace = %name, "backend check failed: {}", e),
        }
        if let Err(e) = session.close().await {
            warn!(namespace = %name, "close check session failed: {}", e);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("listen for shutdown signal failed: {:?}", e);
    }

    info!("shutting down");
    for (name, namespace) in namespaces.iter() {
        for (addr, stats) in namespace.stats() {
            debug!(namespace = %name, addr = %addr, "{:?}", stats);
        }
        namespace.close().await;
    }
    for reaper in reapers {
        reaper.abort();
    }

    let mut buf = vec![];
    if TextEncoder::new().encode(&registry.gather(), &mut buf).is_ok() {
        debug!("{}", String::from_utf8_lossy(&buf));
    }
}

async fn check_backend(session: &SessionConnectionManager) -> Result<(), Error> {
    let res = session.query(&Context::new(), "", "SELECT 1").await?;
    debug!("backend check returned {} rows", res.rows.len());
    Ok(())
}

/// build runtime, build Tokio runtime
pub fn build_runtime() -> Runtime {
    let num_cpus = num_cpus::get();
    match num_cpus {
        0 | 1 => {
            info!("keel running on current thread");
            Builder::new_current_thread()
                .thread_name("keel")
                .enable_all()
                .build()
                .expect("failed to build runtime")
        }
        num_cpus => {
            info!("keel running on multi thread");
            Builder::new_multi_thread()
                .thread_name("keel")
                .worker_threads(num_cpus)
                .max_blocking_threads(num_cpus)
                .enable_all()
                .build()
                .expect("failed to build runtime")
        }
    }
}
