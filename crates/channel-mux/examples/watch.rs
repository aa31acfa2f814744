//! Connect to a hub and print traffic for a set of channels.
//!
//! ```sh
//! cargo run -p channel-mux --example watch -- <HUB_URL> <TOKEN> <CHANNEL>...
//! ```
//!
//! Or load hub settings from a YAML file (credentials come from its
//! `token_url`):
//! ```sh
//! HUB_CONFIG=hub.yaml cargo run -p channel-mux --example watch -- <CHANNEL>...
//! ```
//!
//! Frame payloads are printed to stdout (pipe to `jq` for formatting).

use std::path::PathBuf;

use channel_mux::{ConnectionManager, ConnectionState, ManagerConfig, config, static_token};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (manager_config, channels) = match std::env::var("HUB_CONFIG").ok() {
        Some(path) => {
            let settings = config::load(&PathBuf::from(path)).await?;
            (ManagerConfig::from_settings(&settings)?, args)
        }
        None => {
            let url = args
                .first()
                .ok_or("usage: watch <HUB_URL> <TOKEN> <CHANNEL>...")?;
            let token = args
                .get(1)
                .ok_or("usage: watch <HUB_URL> <TOKEN> <CHANNEL>...")?;
            let config = ManagerConfig::new(url::Url::parse(url)?, static_token(token.as_str()));
            (config, args.iter().skip(2).cloned().collect())
        }
    };
    if channels.is_empty() {
        return Err("at least one channel is required".into());
    }

    let manager = ConnectionManager::new(manager_config)?;

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let _status = manager.on_status_change(move |state| {
        eprintln!("[status] {state}");
        if matches!(state, ConnectionState::AuthFailed) {
            let _ = done_tx.send(state);
        }
    });
    let _channels = manager.on_channel_list_change(|channels| {
        eprintln!("[channels] {}", channels.join(", "));
    });

    let mut subscriptions = Vec::new();
    for channel in &channels {
        eprintln!("subscribing to '{channel}' ...");
        subscriptions.push(manager.subscribe(channel.as_str(), |msg| {
            eprintln!(
                "[{}] type={}",
                msg.channel.as_deref().unwrap_or("-"),
                msg.kind
            );
            if let Some(data) = &msg.data {
                println!("{data}");
            }
        }));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => eprintln!("interrupted"),
        Some(state) = done_rx.recv() => eprintln!("stopping: hub is {state}"),
    }

    let info = manager.debug_info();
    eprintln!("{}", serde_json::to_string_pretty(&info)?);
    manager.disconnect();
    Ok(())
}
