// ABOUTME: Slack Socket Mode transport built on slack-morphism
// ABOUTME: Emits a synthetic "connected" event with the workspace directory, then every push event as JSON

use anyhow::{Context, Result};
use async_trait::async_trait;
use luabot_core::event::{InboundEvent, TransportSignal};
use serde_json::{json, Value};
use slack_morphism::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::platform::Transport;

/// State handed to Socket Mode callbacks, which are fn pointers and cannot capture
#[derive(Clone)]
struct SlackBridgeState {
    tx: mpsc::Sender<TransportSignal>,
}

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bridge = {
        let guard = states.read().await;
        guard
            .get_user_state::<SlackBridgeState>()
            .cloned()
            .ok_or("SlackBridgeState not found in user state")?
    };

    let payload = serde_json::to_value(&event.event)?;
    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    if bridge
        .tx
        .send(TransportSignal::Event(InboundEvent::new(event_type, payload)))
        .await
        .is_err()
    {
        tracing::warn!(platform = "slack", "Event receiver dropped");
    }
    Ok(())
}

fn socket_mode_error_handler(
    err: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::error!(platform = "slack", error = %err, "Socket Mode error");
    HttpStatusCode::OK
}

/// `{id, name}` pairs out of a serialized listing
fn id_name_pairs(listing: &Value, field: &str) -> Vec<Value> {
    listing
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let id = item.get("id")?.as_str()?;
                    let name = item.get("name").and_then(Value::as_str).unwrap_or(id);
                    Some(json!({"id": id, "name": name}))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub struct SlackTransport {
    client: Arc<SlackHyperClient>,
    bot_token: SlackApiToken,
    app_token: SlackApiToken,
}

impl SlackTransport {
    pub fn new(token: &str, app_token: &str) -> Result<Self> {
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("Failed to create Slack HTTP connector")?,
        ));
        Ok(Self {
            client,
            bot_token: SlackApiToken::new(SlackApiTokenValue(token.to_string())),
            app_token: SlackApiToken::new(SlackApiTokenValue(app_token.to_string())),
        })
    }

    /// auth.test plus the channel and user directory, shaped as the "connected" payload
    async fn directory(&self) -> Result<Value> {
        let session = self.client.open_session(&self.bot_token);

        let auth = session
            .auth_test()
            .await
            .context("Failed to call Slack auth.test, check the token")?;
        let auth = serde_json::to_value(&auth)?;

        let channels = session
            .conversations_list(&SlackApiConversationsListRequest::new().with_limit(1000))
            .await
            .context("Failed to list Slack channels")?;
        let users = session
            .users_list(&SlackApiUsersListRequest::new())
            .await
            .context("Failed to list Slack users")?;

        Ok(json!({
            "self": {
                "id": auth.get("user_id").cloned().unwrap_or(Value::Null),
                "name": auth.get("user").cloned().unwrap_or(Value::Null),
            },
            "team": auth.get("team").cloned().unwrap_or(Value::Null),
            "channels": id_name_pairs(&serde_json::to_value(&channels)?, "channels"),
            "users": id_name_pairs(&serde_json::to_value(&users)?, "members"),
        }))
    }
}

#[async_trait]
impl Transport for SlackTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportSignal>> {
        let connected = self.directory().await?;
        let (tx, rx) = mpsc::channel(256);
        tx.send(TransportSignal::Event(InboundEvent::new("connected", connected)))
            .await
            .context("Event receiver dropped")?;

        let client = self.client.clone();
        let app_token = self.app_token.clone();
        let bridge = SlackBridgeState { tx: tx.clone() };

        tokio::spawn(async move {
            let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);
            let environment = Arc::new(
                SlackClientEventsListenerEnvironment::new(client.clone())
                    .with_error_handler(socket_mode_error_handler)
                    .with_user_state(bridge),
            );
            let listener = SlackClientSocketModeListener::new(
                &SlackClientSocketModeConfig::new(),
                environment,
                callbacks,
            );

            let reason = match listener.listen_for(&app_token).await {
                Ok(_) => {
                    tracing::info!(platform = "slack", "Socket Mode connected");
                    listener.serve().await;
                    "Socket Mode listener stopped".to_string()
                }
                Err(e) => format!("Failed to start Socket Mode listener: {}", e),
            };
            let _ = tx.send(TransportSignal::Disconnected(reason)).await;
        });

        Ok(rx)
    }

    async fn send(&self, target: &str, message: &str) -> Result<()> {
        let session = self.client.open_session(&self.bot_token);
        let req = SlackApiChatPostMessageRequest::new(
            target.into(),
            SlackMessageContent::new().with_text(message.to_string()),
        );
        session
            .chat_post_message(&req)
            .await
            .context("Failed to send Slack message")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_name_pairs_falls_back_to_id() {
        let listing = json!({"members": [{"id": "U1", "name": "alice"}, {"id": "U2"}, {"name": "orphan"}]});
        assert_eq!(
            id_name_pairs(&listing, "members"),
            vec![json!({"id": "U1", "name": "alice"}), json!({"id": "U2", "name": "U2"})]
        );
    }
}
