//! Business wiring of the extension's execution contexts.
//!
//! Each context talks to the others only through its [`Endpoint`]; nothing
//! here touches the transport directly.
//!
//! [`Endpoint`]: crate::services::endpoint::Endpoint

use crate::domains::message::TabId;

pub mod background;
pub mod content;
pub mod sidepanel;

pub const BACKGROUND: &str = "background";
pub const SIDEPANEL: &str = "sidepanel";
pub const GMAIL_SCRIPT: &str = "gmail-script";
pub const DRIVE_SCRIPT: &str = "drive-script";

pub const GET_THREAD_ID: &str = "getThreadId";

const GMAIL_ORIGIN: &str = "https://mail.google.com";
const DOCS_ORIGIN: &str = "https://docs.google.com";

/// Channel name a per-tab content script uses, e.g. `gmail-script-7`.
pub fn tab_channel(role: &str, tab_id: TabId) -> String {
    format!("{role}-{tab_id}")
}

/// Side panel view for the page open in the active tab.
pub fn route_for_url(url: &str) -> &'static str {
    if url.starts_with(GMAIL_ORIGIN) {
        "/side-panel/gmail"
    } else if url.starts_with(DOCS_ORIGIN) {
        "/side-panel/docs"
    } else {
        "/side-panel"
    }
}

pub fn is_gmail_inbox(url: &str) -> bool {
    url.starts_with(GMAIL_ORIGIN) && url.contains("#inbox")
}
