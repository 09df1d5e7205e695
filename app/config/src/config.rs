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

use std::{collections::HashSet, env, ffi::OsString, fs::File, io::prelude::*};

use clap::{Arg, Command};
use endpoint::endpoint::Endpoint;
use proxy::proxy::{MySQLNode, MySQLNodes, NamespaceConfig};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::env_const::*;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Default, Clone)]
pub struct KeelConfigBuilder {
    pub _config_path: String,
    pub _log_level: String,
}

impl KeelConfigBuilder {
    pub fn new() -> Self {
        KeelConfigBuilder::default()
    }

    pub fn build_from_cmd(self) -> Self {
        self.build_from_args(env::args_os())
    }

    pub fn build_from_args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Command::new("keel")
            .about("MySQL proxy core")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .help("Config path")
                    .takes_value(true),
            )
            .arg(
                Arg::new("loglevel")
                    .long("log-level")
                    .help("Log level")
                    .takes_value(true),
            )
            .get_matches_from(args);

        if let Some(path) = matches.value_of("config") {
            self._config_path = path.to_string();
        }
        if let Some(loglevel) = matches.value_of("loglevel") {
            self._log_level = loglevel.to_string();
        }
        self
    }

    pub fn build_from_env(mut self) -> Self {
        self._config_path = env::var(ENV_KEEL_CONFIG).unwrap_or_default();
        self._log_level = env::var(ENV_KEEL_LOG_LEVEL).unwrap_or_default();
        self
    }

    pub fn build_from_file(&self, path: &str) -> Result<KeelConfig, ConfigError> {
        let mut file =
            File::open(path).map_err(|e| ConfigError::Io { path: path.to_string(), source: e })?;

        let mut config_str = String::new();
        file.read_to_string(&mut config_str)
            .map_err(|e| ConfigError::Io { path: path.to_string(), source: e })?;
        KeelConfig::from_toml(&config_str)
    }

    /// Command line beats environment, environment beats the file.
    pub fn load_config(self) -> Result<KeelConfig, ConfigError> {
        let cmd_builder = KeelConfigBuilder::default().build_from_cmd();
        let env_builder = KeelConfigBuilder::default().build_from_env();
        self.merge(cmd_builder, env_builder)
    }

    fn merge(
        self,
        cmd_builder: KeelConfigBuilder,
        env_builder: KeelConfigBuilder,
    ) -> Result<KeelConfig, ConfigError> {
        let config_path = [cmd_builder._config_path.as_str(), env_builder._config_path.as_str()]
            .into_iter()
            .find(|x| !x.is_empty())
            .unwrap_or(DEFAULT_LOCAL_CONFIG)
            .to_string();

        let mut config = self.build_from_file(&config_path)?;

        if !env_builder._log_level.is_empty() {
            config.admin.log_level = env_builder._log_level;
        }
        if !cmd_builder._log_level.is_empty() {
            config.admin.log_level = cmd_builder._log_level;
        }

        trace!("configs: {:#?}", config);
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admin {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Admin {
    fn default() -> Self {
        Admin { log_level: default_log_level() }
    }
}

fn default_log_level() -> String {
    DEFAULT_KEEL_LOG_LEVEL.into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KeelConfig {
    #[serde(default)]
    pub admin: Admin,
    #[serde(default)]
    pub namespace: Vec<NamespaceConfig>,
    pub mysql: Option<MySQLNodes>,
}

impl KeelConfig {
    pub fn new() -> Self {
        KeelConfig::default()
    }

    pub fn from_toml(s: &str) -> Result<KeelConfig, ConfigError> {
        let config: KeelConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn get_admin(&self) -> &Admin {
        &self.admin
    }

    pub fn get_mysql(&self) -> &[MySQLNode] {
        match self.mysql.as_ref().and_then(|x| x.node.as_ref()) {
            Some(nodes) => nodes.as_slice(),
            None => &[],
        }
    }

    /// Endpoints of the nodes a namespace routes to, in declaration order.
    pub fn endpoints(&self, ns: &NamespaceConfig) -> Vec<Endpoint> {
        ns.nodes
            .iter()
            .filter_map(|name| self.get_mysql().iter().find(|node| &node.name == name))
            .map(Endpoint::from)
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for ns in &self.namespace {
            if !names.insert(ns.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate namespace {}", ns.name)));
            }
            if ns.pool_size == 0 {
                return Err(ConfigError::Invalid(format!("namespace {} has pool_size 0", ns.name)));
            }
            for node in &ns.nodes {
                if !self.get_mysql().iter().any(|x| &x.name == node) {
                    return Err(ConfigError::Invalid(format!(
                        "namespace {} refers to unknown node {}",
                        ns.name, node
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CONFIG: &str = r#"
        [admin]
        log_level = "DEBUG"

        [[namespace]]
        name = "ns1"
        balance_type = "roundrobin"
        nodes = ["mysql-1", "mysql-0"]
        pool_size = 8

        [[mysql.node]]
        name = "mysql-0"
        user = "root"
        password = "root"
        db = "test"

        [[mysql.node]]
        name = "mysql-1"
        host = "10.0.0.2"
        port = 3307
        user = "root"
        weight = 3
    "#;

    #[test]
    fn test_parse_config() {
        let config = KeelConfig::from_toml(CONFIG).unwrap();
        assert_eq!(config.get_admin().log_level, "DEBUG");
        assert_eq!(config.namespace[0].pool_size, 8);
        assert_eq!(config.namespace[0].idle_timeout, 3600);

        let endpoints = config.endpoints(&config.namespace[0]);
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].addr, "10.0.0.2:3307");
        assert_eq!(endpoints[0].weight, 3);
        assert_eq!(endpoints[1].addr, "127.0.0.1:3306");
        assert_eq!(endpoints[1].db, "test");
    }

    #[test]
    fn test_unknown_node_is_invalid() {
        let err = KeelConfig::from_toml(
            r#"
            [[namespace]]
            name = "ns1"
            nodes = ["missing"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(KeelConfig::from_toml("[[namespace]"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_merge_precedence() {
        let path = env::temp_dir().join(format!("keel-config-{}.toml", std::process::id()));
        File::create(&path).unwrap().write_all(CONFIG.as_bytes()).unwrap();
        let path = path.to_string_lossy().to_string();

        let cmd = KeelConfigBuilder::new().build_from_args(["keel", "-c", path.as_str()]);
        let env = KeelConfigBuilder { _config_path: "/nonexistent".into(), _log_level: "WARN".into() };
        let config = KeelConfigBuilder::new().merge(cmd, env).unwrap();
        assert_eq!(config.admin.log_level, "WARN");

        let cmd = KeelConfigBuilder::new()
            .build_from_args(["keel", "-c", path.as_str(), "--log-level", "ERROR"]);
        let config = KeelConfigBuilder::new().merge(cmd, KeelConfigBuilder::new()).unwrap();
        assert_eq!(config.admin.log_level, "ERROR");

        let missing = KeelConfigBuilder { _config_path: "/nonexistent".into(), _log_level: "".into() };
        let err = KeelConfigBuilder::new().merge(KeelConfigBuilder::new(), missing).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));

        let _ = std::fs::remove_file(&path);
    }
}
