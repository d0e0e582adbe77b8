//! chatwire-probe - connects both channels and logs bus traffic
//!
//! Environment:
//! - `CHATWIRE_TOKEN`: session token (required)
//! - `CHATWIRE_WATCH`: comma-separated user ids to follow presence for
//! - `CHATWIRE_SEND_TO` / `CHATWIRE_SEND_TEXT`: send one private message once connected
//! - plus everything [`RealtimeConfig::from_env`] reads

use std::sync::Arc;

use anyhow::{Context, Result};
use chatwire_client::logging::init_tracing;
use chatwire_client::{
    log_info, log_warn, topics, Coordinator, EventBus, Listener, PageVisibility, RealtimeConfig,
    SessionTokens, PRESENCE_DEBOUNCE, TYPING_DEBOUNCE,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = RealtimeConfig::from_env().context("reading CHATWIRE_* configuration")?;
    let token = std::env::var("CHATWIRE_TOKEN").context("CHATWIRE_TOKEN must be set")?;
    let tokens = Arc::new(SessionTokens::new(Some(token)));
    let bus = EventBus::new();
    let visibility = PageVisibility::new();

    let mut listeners = vec![
        Listener::<topics::NewMessage>::new(&bus).subscribe(|msg| {
            log_info!("[{}] {}", msg.sender_id, msg.content);
        }),
        Listener::<topics::TypingStatusChanged>::new(&bus)
            .debounce(TYPING_DEBOUNCE)
            .subscribe(|t| log_info!("{} typing: {}", t.user_id, t.is_typing)),
        Listener::<topics::UserStatusChanged>::new(&bus)
            .debounce(PRESENCE_DEBOUNCE)
            .pause_when_hidden(&visibility)
            .subscribe(|s| log_info!("{} is {:?}", s.user_id, s.status)),
        Listener::<topics::UnreadCountsUpdated>::new(&bus)
            .subscribe(|c| log_info!("{} unread", c.total)),
        Listener::<topics::RetryFailedMessage>::new(&bus)
            .subscribe(|m| log_warn!("Could not deliver to {}: {}", m.recipient_id, m.reason)),
        Listener::<topics::ConnectionStateChanged>::new(&bus).subscribe(|s| {
            log_info!(
                "connected={} connecting={} messages={:?} presence={:?} error={:?}",
                s.connected,
                s.connecting,
                s.messages,
                s.presence,
                s.error
            );
        }),
    ];

    let client = {
        let tokens = tokens.clone();
        Coordinator::builder(config, tokens.clone(), bus.clone())
            .on_session_invalid(move || tokens.clear())
            .build()
            .context("starting realtime client")?
    };

    client.watch_unread_counts()?;
    if let Ok(users) = std::env::var("CHATWIRE_WATCH") {
        for user in users.split(',').map(str::trim).filter(|u| !u.is_empty()) {
            client.watch_presence(user)?;
        }
    }

    if let (Ok(to), Ok(text)) = (
        std::env::var("CHATWIRE_SEND_TO"),
        std::env::var("CHATWIRE_SEND_TEXT"),
    ) {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = parking_lot::Mutex::new(Some(tx));
        listeners.push(
            Listener::<topics::ConnectionStateChanged>::new(&bus)
                .when(|s| s.connected)
                .once()
                .subscribe(move |_| {
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(());
                    }
                }),
        );

        tokio::select! {
            _ = rx => {}
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                log_warn!("Not connected yet, sending over HTTP");
            }
        }
        let delivered = client.send_private_message(&to, &text).await;
        log_info!("Message to {to} handed off: {delivered}");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    client.disconnect();
    drop(listeners);
    Ok(())
}
