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

use once_cell::sync::Lazy;
use prometheus::{opts, HistogramOpts, HistogramVec, IntCounterVec, Registry};

// LABEL_NAME_NAMESPACE refers to the namespace the session belongs to
const LABEL_NAME_NAMESPACE: &str = "namespace";
// LABEL_NAME_EVENT refers to the transaction event dispatched
const LABEL_NAME_EVENT: &str = "event";
// LABEL_NAME_RESULT is either "ok" or "err"
const LABEL_NAME_RESULT: &str = "result";

pub static SESSION_EVENT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!("session_event_total", "The total of dispatched session events"),
        &[LABEL_NAME_NAMESPACE, LABEL_NAME_EVENT, LABEL_NAME_RESULT],
    )
    .expect("Could not create SESSION_EVENT_TOTAL")
});

pub static BACKEND_CONN_DISCARD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!("backend_conn_discard_total", "The total of error closed backend connections"),
        &[LABEL_NAME_NAMESPACE],
    )
    .expect("Could not create BACKEND_CONN_DISCARD_TOTAL")
});

pub static BACKEND_CONN_ACQUIRE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let opt = HistogramOpts::new(
        "backend_conn_acquire_duration",
        "The duration of acquiring a pooled backend connection",
    );
    HistogramVec::new(opt, &[LABEL_NAME_NAMESPACE])
        .expect("Could not create BACKEND_CONN_ACQUIRE_DURATION")
});

#[derive(Clone, Copy, Default)]
pub struct SessionMetricsCollector;

impl SessionMetricsCollector {
    pub fn new() -> Self {
        SessionMetricsCollector {}
    }

    pub fn set_session_event_total(&self, namespace: &str, event: &str, ok: bool) {
        let result = if ok { "ok" } else { "err" };
        SESSION_EVENT_TOTAL.with_label_values(&[namespace, event, result]).inc();
    }

    pub fn set_backend_conn_discard_total(&self, namespace: &str) {
        BACKEND_CONN_DISCARD_TOTAL.with_label_values(&[namespace]).inc();
    }

    pub fn set_backend_conn_acquire_duration(&self, namespace: &str, duration: f64) {
        BACKEND_CONN_ACQUIRE_DURATION.with_label_values(&[namespace]).observe(duration);
    }
}

pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(SESSION_EVENT_TOTAL.clone()))?;
    registry.register(Box::new(BACKEND_CONN_DISCARD_TOTAL.clone()))?;
    registry.register(Box::new(BACKEND_CONN_ACQUIRE_DURATION.clone()))?;
    Ok(())
}
