use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use extension_bus::contexts::background::Background;
use extension_bus::contexts::content::{ContentScript, StaticPage};
use extension_bus::contexts::sidepanel::SidePanel;
use extension_bus::contexts::{tab_channel, BACKGROUND, GMAIL_SCRIPT, SIDEPANEL};
use extension_bus::error::{BusError, Result};
use extension_bus::interfaces::transport::Visibility;
use extension_bus::{BusConfig, Endpoint, LinkState, LocalRuntime};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "extension-bus")]
#[command(about = "Message routing between browser extension contexts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wire background, side panel and a Gmail content script together in memory.
    Demo {
        #[arg(long, env = "EXTENSION_BUS_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long, default_value_t = 7)]
        tab_id: u32,

        #[arg(long, default_value = "https://mail.google.com/mail/u/0/#inbox")]
        tab_url: String,

        #[arg(long, default_value = "18c2f0a9b7d4e311")]
        thread_id: String,

        /// Close the side panel channel from the hub and show it reconnect.
        #[arg(long, default_value_t = false)]
        drop_sidepanel: bool,
    },
    /// Validate a configuration file and print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Demo {
            config,
            tab_id,
            tab_url,
            thread_id,
            drop_sidepanel,
        } => {
            let config = match config {
                Some(path) => BusConfig::from_file(path)?,
                None => BusConfig::default(),
            };
            init_tracing(&config);
            demo(config, tab_id, &tab_url, &thread_id, drop_sidepanel).await
        }
        Command::CheckConfig { path } => {
            let config = BusConfig::from_file(&path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(config: &BusConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn demo(
    config: BusConfig,
    tab_id: u32,
    tab_url: &str,
    thread_id: &str,
    drop_sidepanel: bool,
) -> Result<()> {
    let runtime = LocalRuntime::new();

    let background = Background::start(Endpoint::new(
        BACKGROUND,
        Arc::new(runtime.extension_page()),
        config.clone(),
    ))?;
    background.register_function("echo", |args: &[Value]| Ok(Value::Array(args.to_vec())));

    let (visibility_tx, visibility_rx) = watch::channel(Visibility::Visible);
    let mut sidepanel = SidePanel::new(Endpoint::new(
        SIDEPANEL,
        Arc::new(runtime.extension_page()),
        config.clone(),
    ));
    sidepanel.start(Some(visibility_rx))?;
    wait_for_link(&mut sidepanel).await?;

    let page = StaticPage {
        url: Some(tab_url.to_string()),
        thread_id: Some(thread_id.to_string()),
    };
    let script = ContentScript::new(
        Endpoint::new(
            GMAIL_SCRIPT,
            Arc::new(runtime.content_script(tab_id, tab_url)),
            config.clone(),
        ),
        Arc::new(page),
    )?;
    script.page_loaded()?;
    let script_channel = tab_channel(GMAIL_SCRIPT, tab_id);
    settle(|| background.endpoint().is_connected(&script_channel)).await?;

    background.notify_tab_activated(tab_id, tab_url)?;
    settle(|| sidepanel.state().thread_id.is_some()).await?;

    if drop_sidepanel {
        tracing::info!("closing the side panel channel from the hub");
        visibility_tx.send_replace(Visibility::Hidden);
        background.endpoint().disconnect(SIDEPANEL);
        settle(|| sidepanel.link_state() == LinkState::Disconnected).await?;
        visibility_tx.send_replace(Visibility::Visible);
        wait_for_link(&mut sidepanel).await?;
        settle(|| background.endpoint().is_connected(SIDEPANEL)).await?;
    }

    let report = serde_json::json!({
        "sidepanel": sidepanel.state(),
        "link": format!("{:?}", sidepanel.link_state()),
        "hubChannels": background.endpoint().channel_names(),
        "contentScriptChannel": script.channel_name(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn wait_for_link(sidepanel: &mut SidePanel) -> Result<()> {
    let Some(handle) = sidepanel.reconnect_handle() else {
        return Err(BusError::Runtime("side panel was not started".to_string()));
    };
    tokio::time::timeout(SETTLE_TIMEOUT, handle.wait_for(LinkState::Connected))
        .await
        .map_err(|_| BusError::Runtime("side panel did not connect".to_string()))?
}

async fn settle(mut ready: impl FnMut() -> bool) -> Result<()> {
    let poll = async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(SETTLE_TIMEOUT, poll)
        .await
        .map_err(|_| BusError::Runtime("demo did not settle in time".to_string()))
}
