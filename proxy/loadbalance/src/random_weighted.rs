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

use chrono::prelude::*;
use endpoint::endpoint::Endpoint;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::balance::LoadBalance;

/// Weighted random selection. An instance with a weight of zero or less is
/// never picked, unless no instance carries a positive weight: then every
/// instance is equally likely.
pub struct RandomWeighted {
    pub items: Vec<Endpoint>,
    pub sum_of_weights: i64,
    pub r: StdRng,
}

impl Default for RandomWeighted {
    fn default() -> RandomWeighted {
        RandomWeighted {
            items: vec![],
            sum_of_weights: 0,
            r: StdRng::seed_from_u64(Utc::now().timestamp_subsec_nanos().into()),
        }
    }
}

impl LoadBalance for RandomWeighted {
    // next: get next endpoint
    fn next(&mut self) -> Option<Endpoint> {
        if self.items.is_empty() {
            return None;
        }

        if self.sum_of_weights <= 0 {
            let idx = self.r.gen_range(0..self.items.len());
            return self.items.get(idx).cloned();
        }

        let mut random_weight = self.r.gen_range(0..self.sum_of_weights) + 1;
        for i in &self.items {
            random_weight -= i.weight.max(0);
            if random_weight <= 0 {
                return Some(i.clone());
            }
        }
        self.items.last().cloned()
    }

    // add: add endpoint
    fn add(&mut self, endpoint: Endpoint) {
        if !self.item_exists(&endpoint) {
            self.sum_of_weights += endpoint.weight.max(0);
            self.items.push(endpoint);
        }
    }

    // item_exists: endpoint exists
    fn item_exists(&self, endpoint: &Endpoint) -> bool {
        self.items.iter().any(|x| x.name == endpoint.name)
    }

    // get_all: get all endpoint
    fn get_all(&self) -> &[Endpoint] {
        &self.items
    }

    // remove_item: remove item
    fn remove_item(&mut self, name: &str) -> Option<Endpoint> {
        let index = self.items.iter().position(|x| x.name == name)?;
        let endpoint = self.items.remove(index);
        self.sum_of_weights -= endpoint.weight.max(0);
        Some(endpoint)
    }

    // remove_all: remove all item
    fn remove_all(&mut self) {
        self.items = vec![];
        self.sum_of_weights = 0;
        self.r = StdRng::seed_from_u64(Utc::now().timestamp_subsec_nanos().into());
    }
}
