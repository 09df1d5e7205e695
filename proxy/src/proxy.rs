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

use std::time::Duration;

use endpoint::endpoint::Endpoint;
use loadbalance::balance::AlgorithmName;
use serde::{Deserialize, Serialize};

/// A namespace groups backend nodes behind one load balancer and one pool
/// per node.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(default = "default_balance_type")]
    pub balance_type: AlgorithmName,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    // seconds, 0 keeps idle connections forever
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    // milliseconds, 0 waits until canceled
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,
    // seconds, 0 disables the idle reaper
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval: u64,
}

impl NamespaceConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero(Duration::from_secs(self.idle_timeout))
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        non_zero(Duration::from_millis(self.acquire_timeout))
    }

    pub fn idle_check_interval(&self) -> Option<Duration> {
        non_zero(Duration::from_secs(self.idle_check_interval))
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MySQLNodes {
    pub node: Option<Vec<MySQLNode>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MySQLNode {
    pub name: String,
    #[serde(default)]
    pub db: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_mysql_node_host")]
    pub host: String,
    #[serde(default = "default_mysql_node_port")]
    pub port: u32,
    #[serde(default = "default_mysql_node_weight")]
    pub weight: i64,
}

impl From<&MySQLNode> for Endpoint {
    fn from(node: &MySQLNode) -> Self {
        Endpoint {
            name: node.name.clone(),
            addr: format!("{}:{}", node.host, node.port),
            db: node.db.clone(),
            user: node.user.clone(),
            password: node.password.clone(),
            weight: node.weight,
        }
    }
}

fn default_balance_type() -> AlgorithmName {
    AlgorithmName::Random
}

fn default_pool_size() -> usize {
    64
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_acquire_timeout() -> u64 {
    5000
}

fn default_idle_check_interval() -> u64 {
    60
}

fn default_mysql_node_host() -> String {
    "127.0.0.1".into()
}

fn default_mysql_node_port() -> u32 {
    3306
}

fn default_mysql_node_weight() -> i64 {
    1
}
