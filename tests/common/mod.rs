#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use extension_bus::interfaces::diagnostics::{Diagnostic, MemorySink};
use extension_bus::{BusConfig, Channel, Endpoint, LocalRuntime, Result};

/// Records every invocation of a channel handler.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<(Value, String)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> impl Fn(Value, &str, &Channel) -> Result<()> + Send + Sync + 'static {
        let calls = self.calls.clone();
        move |payload: Value, sender_id: &str, _channel: &Channel| {
            calls
                .lock()
                .unwrap()
                .push((payload, sender_id.to_string()));
            Ok(())
        }
    }

    pub fn calls(&self) -> Vec<(Value, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.calls().into_iter().map(|(payload, _)| payload).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub struct Node {
    pub endpoint: Endpoint,
    pub diagnostics: Arc<MemorySink>,
}

impl Node {
    pub fn count(&self, predicate: impl Fn(&Diagnostic) -> bool) -> usize {
        self.diagnostics.count(predicate)
    }
}

pub fn hub(runtime: &LocalRuntime) -> Node {
    hub_with_config(runtime, BusConfig::default())
}

pub fn hub_with_config(runtime: &LocalRuntime, config: BusConfig) -> Node {
    let diagnostics = Arc::new(MemorySink::new());
    let endpoint = Endpoint::with_diagnostics(
        config.hub_id.clone(),
        Arc::new(runtime.extension_page()),
        config,
        diagnostics.clone(),
    );
    Node {
        endpoint,
        diagnostics,
    }
}

pub fn page(runtime: &LocalRuntime, source_id: &str) -> Node {
    let diagnostics = Arc::new(MemorySink::new());
    let endpoint = Endpoint::with_diagnostics(
        source_id,
        Arc::new(runtime.extension_page()),
        BusConfig::default(),
        diagnostics.clone(),
    );
    Node {
        endpoint,
        diagnostics,
    }
}

pub fn tab(runtime: &LocalRuntime, source_id: &str, tab_id: u32, url: &str) -> Node {
    let diagnostics = Arc::new(MemorySink::new());
    let endpoint = Endpoint::with_diagnostics(
        source_id,
        Arc::new(runtime.content_script(tab_id, url)),
        BusConfig::default(),
        diagnostics.clone(),
    );
    Node {
        endpoint,
        diagnostics,
    }
}

/// Polls `ready` until it holds, failing the test after five seconds.
pub async fn wait_until(mut ready: impl FnMut() -> bool) {
    let poll = async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("condition not reached in time");
}

/// Gives spawned tasks a chance to run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
