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

use serde::{Deserialize, Serialize};

/// A backend database instance as seen by the load balancer and the pools.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    // host:port
    pub addr: String,
    pub db: String,
    pub user: String,
    pub password: String,
    pub weight: i64,
}

impl Endpoint {
    pub fn new(name: &str, addr: &str) -> Endpoint {
        Endpoint { name: name.to_string(), addr: addr.to_string(), weight: 1, ..Default::default() }
    }

    pub fn with_weight(mut self, weight: i64) -> Endpoint {
        self.weight = weight;
        self
    }

    pub fn with_auth(mut self, user: &str, password: &str) -> Endpoint {
        self.user = user.to_string();
        self.password = password.to_string();
        self
    }

    pub fn with_db(mut self, db: &str) -> Endpoint {
        self.db = db.to_string();
        self
    }
}
