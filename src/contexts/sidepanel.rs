use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use crate::contexts::{is_gmail_inbox, route_for_url, GET_THREAD_ID, SIDEPANEL};
use crate::domains::message::{
    encode_payload, ContentScriptFunction, Envelope, ErrorReport, FunctionCall, InitPort, Payload,
    SidepanelReady, TabActivated, TabId, TabUpdated,
};
use crate::error::Result;
use crate::interfaces::transport::{SendOptions, VisibilitySignal};
use crate::services::endpoint::{Endpoint, WeakEndpoint};
use crate::services::reconnect::{LinkState, ReconnectHandle};

/// What the side panel currently shows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SidePanelState {
    pub route: String,
    pub active_tab: Option<TabId>,
    pub thread_id: Option<String>,
    pub hub: Option<String>,
}

type SharedState = Arc<Mutex<SidePanelState>>;

pub struct SidePanel {
    endpoint: Endpoint,
    state: SharedState,
    reconnect: Option<ReconnectHandle>,
}

impl SidePanel {
    pub fn new(endpoint: Endpoint) -> Self {
        let state = Arc::new(Mutex::new(SidePanelState {
            route: route_for_url("").to_string(),
            ..SidePanelState::default()
        }));
        let panel = Self {
            endpoint,
            state,
            reconnect: None,
        };
        panel.register_handlers();
        panel
    }

    /// Opens the `sidepanel` channel and keeps it open.
    pub fn start(&mut self, visibility: Option<VisibilitySignal>) -> Result<()> {
        if self.reconnect.is_none() {
            self.reconnect = Some(self.endpoint.keep_connected(SIDEPANEL, visibility)?);
        }
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SidePanelState {
        lock(&self.state).clone()
    }

    pub fn link_state(&self) -> LinkState {
        self.reconnect
            .as_ref()
            .map_or(LinkState::Disconnected, ReconnectHandle::state)
    }

    pub fn reconnect_handle(&mut self) -> Option<&mut ReconnectHandle> {
        self.reconnect.as_mut()
    }

    fn register_handlers(&self) {
        let endpoint = &self.endpoint;

        let state = self.state.clone();
        let source_id = endpoint.source_id().to_string();
        endpoint.on::<InitPort, _>(move |init, sender_id, channel| {
            tracing::info!(sender_id, "side panel received INIT_PORT");
            lock(&state).hub = Some(init.source_id.clone());
            let ready = Envelope::new(
                SidepanelReady::KIND,
                encode_payload(&SidepanelReady {})?,
                &source_id,
            )
            .addressed(Some(&init.source_id));
            channel.post(&ready)
        });

        let state = self.state.clone();
        let weak = endpoint.downgrade();
        endpoint.on::<TabActivated, _>(move |activated, _, _| {
            tracing::info!(tab_id = activated.tab_id, url = %activated.url, "tab activated");
            {
                let mut current = lock(&state);
                current.route = route_for_url(&activated.url).to_string();
                current.active_tab = Some(activated.tab_id);
                current.thread_id = None;
            }
            if is_gmail_inbox(&activated.url) {
                request_thread_id(&weak, &state, activated.tab_id)?;
            }
            Ok(())
        });

        let state = self.state.clone();
        let weak = endpoint.downgrade();
        endpoint.on::<TabUpdated, _>(move |updated, _, _| {
            tracing::info!(tab_id = updated.tab_id, url = %updated.url, "tab updated");
            if updated.url.contains("#inbox") {
                request_thread_id(&weak, &state, updated.tab_id)?;
            }
            Ok(())
        });

        endpoint.on::<ErrorReport, _>(|report, sender_id, _| {
            tracing::error!(sender_id, error = %report.error, "error from background");
            Ok(())
        });
    }
}

/// Asks the content script in `tab_id` for the open thread and stores the answer.
fn request_thread_id(weak: &WeakEndpoint, state: &SharedState, tab_id: TabId) -> Result<()> {
    let Some(endpoint) = weak.upgrade() else {
        return Ok(());
    };
    let call = ContentScriptFunction(FunctionCall {
        target_tab_id: Some(tab_id),
        ..FunctionCall::new(GET_THREAD_ID)
    });
    let state = state.clone();
    endpoint.send_message_to_target(
        tab_id,
        ContentScriptFunction::KIND,
        encode_payload(&call)?,
        SendOptions::default(),
        Some(Box::new(move |response: Value| {
            let thread_id = response
                .get("threadId")
                .and_then(Value::as_str)
                .map(str::to_string);
            tracing::debug!(tab_id, ?thread_id, "thread id resolved");
            lock(&state).thread_id = thread_id;
        })),
    )
}

fn lock(state: &SharedState) -> std::sync::MutexGuard<'_, SidePanelState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
