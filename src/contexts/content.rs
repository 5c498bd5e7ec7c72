use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::contexts::{tab_channel, GET_THREAD_ID};
use crate::domains::message::{
    encode_payload, Acknowledgement, BackgroundFunctionResponse, ContentScriptFunction,
    ContentScriptFunctionResponse, Envelope, FunctionCall, FunctionResult, InitPort, PageLoaded,
    Payload,
};
use crate::error::Result;
use crate::interfaces::transport::SendOptions;
use crate::services::endpoint::Endpoint;

/// Read access to the page a content script is injected into.
pub trait PageDocument: Send + Sync {
    fn url(&self) -> Option<String>;

    /// Id of the mail thread open in the main pane, if any.
    fn thread_id(&self) -> Option<String>;
}

/// A page whose content never changes.
#[derive(Debug, Clone, Default)]
pub struct StaticPage {
    pub url: Option<String>,
    pub thread_id: Option<String>,
}

impl PageDocument for StaticPage {
    fn url(&self) -> Option<String> {
        self.url.clone()
    }

    fn thread_id(&self) -> Option<String> {
        self.thread_id.clone()
    }
}

/// Runs a named page function. Unknown names yield an empty object.
pub fn run_page_function(page: &dyn PageDocument, call: &FunctionCall) -> Value {
    match call.function_name.as_str() {
        GET_THREAD_ID => json!({ "threadId": page.thread_id() }),
        other => {
            tracing::debug!(function = other, "unknown content script function");
            json!({})
        }
    }
}

/// A content script injected into one tab.
///
/// It learns its tab id from the hub with a `PAGE_LOADED` one-time message
/// and then opens a channel named `<role>-<tabId>`.
pub struct ContentScript {
    endpoint: Endpoint,
    role: String,
    page: Arc<dyn PageDocument>,
    channel_name: Arc<Mutex<String>>,
    last_result: Arc<Mutex<Option<FunctionResult>>>,
}

impl ContentScript {
    pub fn new(endpoint: Endpoint, page: Arc<dyn PageDocument>) -> Result<Self> {
        let role = endpoint.source_id().to_string();
        let script = Self {
            channel_name: Arc::new(Mutex::new(role.clone())),
            last_result: Arc::new(Mutex::new(None)),
            endpoint,
            role,
            page,
        };
        script.register_handlers();
        script.endpoint.listen_for_one_time_messages()?;
        Ok(script)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Name of the channel to the hub; the bare role until the tab id is known.
    pub fn channel_name(&self) -> String {
        self.channel_name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Result of the most recent background function this script ran.
    pub fn last_background_result(&self) -> Option<FunctionResult> {
        self.last_result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Announces the page to the hub and connects once the tab id comes back.
    pub fn page_loaded(&self) -> Result<()> {
        let payload = PageLoaded {
            url: self.page.url(),
        };
        let endpoint = self.endpoint.downgrade();
        let channel_name = self.channel_name.clone();
        let role = self.role.clone();
        let hub_id = self.endpoint.config().hub_id.clone();
        self.endpoint.send_one_time_message(
            PageLoaded::KIND,
            encode_payload(&payload)?,
            Some(&hub_id),
            SendOptions::default(),
            Some(Box::new(move |response: Value| {
                let Some(tab_id) = response
                    .get("tabId")
                    .and_then(Value::as_u64)
                    .and_then(|id| u32::try_from(id).ok())
                else {
                    tracing::warn!(%response, "hub did not report a tab id");
                    return;
                };
                let name = tab_channel(&role, tab_id);
                *channel_name
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = name.clone();
                let Some(endpoint) = endpoint.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(err) = endpoint.connect_to_channel(&name).await {
                        tracing::error!(channel = %name, %err, "content script could not connect");
                    }
                });
            })),
        )
    }

    fn register_handlers(&self) {
        let endpoint = &self.endpoint;

        endpoint.on::<InitPort, _>(|_, sender_id, channel| {
            tracing::info!(sender_id, channel = channel.name(), "content script received INIT_PORT");
            Ok(())
        });

        let page = self.page.clone();
        let source_id = endpoint.source_id().to_string();
        endpoint.on::<ContentScriptFunction, _>(move |ContentScriptFunction(call), sender_id, channel| {
            tracing::info!(function = %call.function_name, "content script function requested");
            let response = run_page_function(page.as_ref(), &call);
            let result = ContentScriptFunctionResponse(FunctionResult { call, response });
            let envelope = Envelope::new(
                ContentScriptFunctionResponse::KIND,
                encode_payload(&result)?,
                &source_id,
            )
            .addressed(Some(sender_id));
            channel.post(&envelope)
        });

        // Background results are kept and acknowledged to the hub.
        let last_result = self.last_result.clone();
        let source_id = endpoint.source_id().to_string();
        endpoint.on::<BackgroundFunctionResponse, _>(move |BackgroundFunctionResponse(result), sender_id, channel| {
            tracing::info!(sender_id, function = %result.call.function_name, "background function returned");
            let ack = Acknowledgement {
                message: format!("{} received", result.call.function_name),
                original_type: BackgroundFunctionResponse::KIND,
                original_data: serde_json::to_value(&result)?,
            };
            *last_result
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(result);
            let envelope = Envelope::new(Acknowledgement::KIND, encode_payload(&ack)?, &source_id)
                .addressed(Some(sender_id));
            channel.post(&envelope)
        });

        let page = self.page.clone();
        endpoint.on_one_time::<ContentScriptFunction, _>(move |ContentScriptFunction(call), _, responder| {
            tracing::info!(function = %call.function_name, "one-time content script function requested");
            let response = run_page_function(page.as_ref(), &call);
            if let Some(responder) = responder {
                responder.respond(response);
            }
            Ok(())
        });
    }
}
