use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Value};

use crate::contexts::SIDEPANEL;
use crate::domains::message::{
    encode_payload, Acknowledgement, BackgroundFunction, BackgroundFunctionResponse, Envelope, FunctionResult,
    InitPort, PageData, PageLoaded, Payload, SidepanelReady, TabActivated, TabId, TabUpdated,
};
use crate::error::{BusError, Result};
use crate::services::endpoint::Endpoint;

/// A function content scripts may run in the background context.
pub type BackgroundFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

type FunctionTable = Arc<RwLock<HashMap<String, BackgroundFn>>>;

/// The hub: accepts every channel and answers tab-id lookups.
pub struct Background {
    endpoint: Endpoint,
    functions: FunctionTable,
    active_tab: Arc<Mutex<Option<TabActivated>>>,
}

impl Background {
    pub fn start(endpoint: Endpoint) -> Result<Self> {
        let background = Self {
            endpoint,
            functions: Arc::new(RwLock::new(HashMap::new())),
            active_tab: Arc::new(Mutex::new(None)),
        };
        background.register_handlers();
        background.endpoint.listen_for_connections()?;
        background.endpoint.listen_for_one_time_messages()?;
        Ok(background)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn register_function<F>(&self, name: &str, function: F)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), Arc::new(function));
    }

    /// Tells the side panel which tab is now in front.
    pub fn notify_tab_activated(&self, tab_id: TabId, url: &str) -> Result<()> {
        let activated = TabActivated {
            tab_id,
            url: url.to_string(),
        };
        *self
            .active_tab
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(activated.clone());
        self.endpoint.send(SIDEPANEL, &activated, None)
    }

    pub fn notify_tab_updated(&self, tab_id: TabId, url: &str) -> Result<()> {
        let updated = TabUpdated {
            tab_id,
            url: url.to_string(),
        };
        self.endpoint.send(SIDEPANEL, &updated, None)
    }

    fn register_handlers(&self) {
        let endpoint = &self.endpoint;

        endpoint.on::<InitPort, _>(|init, sender_id, channel| {
            tracing::info!(channel = channel.name(), sender_id, source_id = %init.source_id, "context announced itself");
            Ok(())
        });

        // A freshly opened side panel gets the tab it should render right away.
        let active_tab = self.active_tab.clone();
        let source_id = endpoint.source_id().to_string();
        endpoint.on::<SidepanelReady, _>(move |_, _, channel| {
            let active = active_tab
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            if let Some(active) = active {
                let envelope = Envelope::new(TabActivated::KIND, encode_payload(&active)?, &source_id)
                    .addressed(None);
                channel.post(&envelope)?;
            }
            Ok(())
        });

        endpoint.on_one_time::<PageLoaded, _>(|loaded, sender, responder| {
            tracing::info!(tab_id = ?sender.tab_id, url = ?loaded.url, "page loaded");
            if let Some(responder) = responder {
                responder.respond(json!({ "tabId": sender.tab_id }));
            }
            Ok(())
        });

        // Page content is relayed to the side panel as it arrives.
        let weak = endpoint.downgrade();
        endpoint.on_one_time::<PageData, _>(move |data, sender, responder| {
            tracing::info!(tab_id = ?sender.tab_id, "forwarding PAGE_DATA to side panel");
            if let Some(endpoint) = weak.upgrade() {
                endpoint.send(SIDEPANEL, &data, None)?;
            }
            if let Some(responder) = responder {
                responder.respond(json!({ "success": true, "message": "Data received" }));
            }
            Ok(())
        });

        endpoint.on::<Acknowledgement, _>(|ack, sender_id, channel| {
            tracing::debug!(
                sender_id,
                channel = channel.name(),
                original_type = %ack.original_type,
                message = %ack.message,
                "acknowledged"
            );
            Ok(())
        });

        let functions = self.functions.clone();
        let source_id = endpoint.source_id().to_string();
        endpoint.on::<BackgroundFunction, _>(move |BackgroundFunction(call), sender_id, channel| {
            let function = functions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&call.function_name)
                .cloned()
                .ok_or_else(|| {
                    BusError::Handler(format!("unknown background function {}", call.function_name))
                })?;
            let response = function(call.args.as_slice())?;
            let result = BackgroundFunctionResponse(FunctionResult { call, response });
            let envelope = Envelope::new(
                BackgroundFunctionResponse::KIND,
                encode_payload(&result)?,
                &source_id,
            )
            .addressed(Some(sender_id));
            channel.post(&envelope)
        });
    }
}
