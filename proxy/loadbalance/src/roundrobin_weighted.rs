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

use endpoint::endpoint::Endpoint;

use crate::balance::LoadBalance;

/// Smooth weighted round robin: every pick adds each item's weight to its
/// current weight, the largest wins and is lowered by the total.
///
/// An instance with a weight of zero or less is never picked, unless no
/// instance carries a positive weight: then all of them take turns.
#[derive(Default)]
pub struct RoundRobinWeighted {
    pub items: Vec<Endpoint>,
    current: Vec<i64>,
}

impl LoadBalance for RoundRobinWeighted {
    fn add(&mut self, endpoint: Endpoint) {
        if self.item_exists(&endpoint) {
            return;
        }
        self.items.push(endpoint);
        self.current.push(0);
    }

    fn next(&mut self) -> Option<Endpoint> {
        if self.items.is_empty() {
            return None;
        }

        let unweighted = self.items.iter().all(|x| x.weight <= 0);
        let mut total = 0;
        let mut best = None;
        for (i, item) in self.items.iter().enumerate() {
            let weight = if unweighted { 1 } else { item.weight.max(0) };
            if weight == 0 {
                continue;
            }
            self.current[i] += weight;
            total += weight;
            match best {
                Some(b) if self.current[b] >= self.current[i] => {}
                _ => best = Some(i),
            }
        }

        let best = best?;

        self.current[best] -= total;
        self.items.get(best).cloned()
    }

    fn item_exists(&self, endpoint: &Endpoint) -> bool {
        self.items.iter().any(|x| x.name == endpoint.name)
    }

    fn get_all(&self) -> &[Endpoint] {
        &self.items
    }

    fn remove_item(&mut self, name: &str) -> Option<Endpoint> {
        let index = self.items.iter().position(|x| x.name == name)?;
        self.current.remove(index);
        Some(self.items.remove(index))
    }

    fn remove_all(&mut self) {
        self.items = vec![];
        self.current = vec![];
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_smooth_sequence() {
        let mut balance = RoundRobinWeighted::default();
        balance.add(Endpoint::new("a", "a:3306").with_weight(5));
        balance.add(Endpoint::new("b", "b:3306").with_weight(1));
        balance.add(Endpoint::new("c", "c:3306").with_weight(1));

        let seq: Vec<String> = (0..7).map(|_| balance.next().unwrap().name).collect();
        assert_eq!(seq, vec!["a", "a", "b", "a", "c", "a", "a"]);
    }

    #[test]
    fn test_equal_weights_alternate() {
        let mut balance = RoundRobinWeighted::default();
        balance.add(Endpoint::new("a", "a:3306"));
        balance.add(Endpoint::new("b", "b:3306"));

        let seq: Vec<String> = (0..4).map(|_| balance.next().unwrap().name).collect();
        assert_eq!(seq, vec!["a", "b", "a", "b"]);

        balance.remove_item("a");
        assert_eq!(balance.next().unwrap().name, "b");
    }

    #[test]
    fn test_zero_weight_never_picked() {
        let mut balance = RoundRobinWeighted::default();
        balance.add(Endpoint::new("a", "a:3306").with_weight(2));
        balance.add(Endpoint::new("off", "o:3306").with_weight(0));
        balance.add(Endpoint::new("b", "b:3306").with_weight(1));

        for _ in 0..30 {
            assert_ne!(balance.next().unwrap().name, "off");
        }
    }

    #[test]
    fn test_zero_weights_take_turns() {
        let mut balance = RoundRobinWeighted::default();
        balance.add(Endpoint::new("a", "a:3306").with_weight(0));
        balance.add(Endpoint::new("b", "b:3306").with_weight(-1));

        let seq: Vec<String> = (0..4).map(|_| balance.next().unwrap().name).collect();
        assert_eq!(seq, vec!["a", "b", "a", "b"]);
    }
}
