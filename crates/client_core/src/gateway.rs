//! Websocket push-event adapter. Turns the gateway's `{op, t, d, s}` frames
//! into a stream of [`GatewayEvent`]s for [`crate::SyncEngine::spawn_event_loop`].

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use shared::protocol::{
    GatewayEvent, GatewayFrame, OP_DISPATCH, OP_HEARTBEAT, OP_HELLO, OP_IDENTIFY, OP_RECONNECT,
};
use tokio::{sync::mpsc, time::Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const GATEWAY_PATH: &str = "/gateway";
const GATEWAY_EVENT_BUFFER: usize = 256;
/// Used until the server's HELLO says otherwise.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(41);

/// What a single gateway frame means to the reader loop.
#[derive(Debug, PartialEq)]
pub enum FrameAction {
    Dispatch { seq: Option<u64>, event: GatewayEvent },
    Hello { heartbeat_interval: Duration },
    Reconnect,
    Ignore,
}

pub fn decode_frame(text: &str) -> Result<FrameAction> {
    let frame: GatewayFrame =
        serde_json::from_str(text).context("gateway frame is not valid JSON")?;
    match frame.op {
        OP_DISPATCH => {
            let (Some(name), Some(data)) = (frame.t, frame.d) else {
                return Ok(FrameAction::Ignore);
            };
            let event = GatewayEvent::decode_dispatch(&name, data)
                .with_context(|| format!("malformed {name} dispatch"))?;
            Ok(event.map_or(FrameAction::Ignore, |event| FrameAction::Dispatch {
                seq: frame.s,
                event,
            }))
        }
        OP_HELLO => {
            let millis = frame
                .d
                .as_ref()
                .and_then(|d| d.get("heartbeat_interval"))
                .and_then(|v| v.as_u64())
                .ok_or_else(|| anyhow!("hello frame without heartbeat_interval"))?;
            Ok(FrameAction::Hello {
                heartbeat_interval: Duration::from_millis(millis.max(1_000)),
            })
        }
        OP_RECONNECT => Ok(FrameAction::Reconnect),
        // Heartbeat acks and anything newer than this client.
        _ => Ok(FrameAction::Ignore),
    }
}

pub fn gateway_url(server_url: &str) -> Result<String> {
    let server_url = server_url.trim_end_matches('/');
    let ws_url = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!("{ws_url}{GATEWAY_PATH}"))
}

/// Connects, identifies with `token` and returns the message-scoped dispatches.
/// The stream ends when the socket closes or the server asks for a reconnect.
pub async fn connect_gateway(
    server_url: &str,
    token: &str,
) -> Result<ReceiverStream<GatewayEvent>> {
    let ws_url = gateway_url(server_url)?;
    let (ws_stream, _) = connect_async(&ws_url)
        .await
        .with_context(|| format!("failed to connect gateway: {ws_url}"))?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let identify = json!({ "op": OP_IDENTIFY, "d": { "token": token } });
    ws_writer
        .send(Message::Text(identify.to_string()))
        .await
        .context("failed to send identify frame")?;
    info!(url = %ws_url, "gateway: identified");

    let (tx, rx) = mpsc::channel(GATEWAY_EVENT_BUFFER);
    tokio::spawn(async move {
        let mut heartbeat_interval = DEFAULT_HEARTBEAT_INTERVAL;
        let mut next_heartbeat = Instant::now() + heartbeat_interval;
        let mut last_seq: Option<u64> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_heartbeat) => {
                    let beat = json!({ "op": OP_HEARTBEAT, "d": last_seq });
                    if let Err(err) = ws_writer.send(Message::Text(beat.to_string())).await {
                        warn!(%err, "gateway: heartbeat send failed");
                        break;
                    }
                    next_heartbeat = Instant::now() + heartbeat_interval;
                }
                msg = ws_reader.next() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        Ok(Message::Text(text)) => match decode_frame(&text) {
                            Ok(FrameAction::Dispatch { seq, event }) => {
                                if seq.is_some() {
                                    last_seq = seq;
                                }
                                if tx.send(event).await.is_err() {
                                    debug!("gateway: event consumer dropped");
                                    break;
                                }
                            }
                            Ok(FrameAction::Hello { heartbeat_interval: interval }) => {
                                heartbeat_interval = interval;
                                next_heartbeat = Instant::now() + heartbeat_interval;
                                debug!(interval_ms = interval.as_millis() as u64, "gateway: hello");
                            }
                            Ok(FrameAction::Reconnect) => {
                                info!("gateway: server requested reconnect");
                                break;
                            }
                            Ok(FrameAction::Ignore) => {}
                            Err(err) => warn!(%err, "gateway: skipping invalid frame"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%err, "gateway: receive failed");
                            break;
                        }
                    }
                }
            }
        }
        info!("gateway: connection closed");
    });

    Ok(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::{ChannelId, MessageId};

    #[test]
    fn converts_http_scheme_to_websocket() {
        assert_eq!(
            gateway_url("https://chat.example.com/").expect("url"),
            "wss://chat.example.com/gateway"
        );
        assert_eq!(
            gateway_url("http://127.0.0.1:8080").expect("url"),
            "ws://127.0.0.1:8080/gateway"
        );
        assert!(gateway_url("ftp://example.com").is_err());
    }

    #[test]
    fn decodes_delete_dispatch_with_sequence() {
        let action = decode_frame(
            r#"{"op":0,"t":"MESSAGE_DELETE","s":42,"d":{"id":"10","channel_id":"7"}}"#,
        )
        .expect("frame");
        let FrameAction::Dispatch { seq, event } = action else {
            panic!("expected a dispatch frame");
        };
        assert_eq!(seq, Some(42));
        assert_eq!(event.channel_id(), &ChannelId::from("7"));
        assert!(matches!(event, GatewayEvent::MessageDelete(ref p) if p.id == MessageId::from("10")));
    }

    #[test]
    fn decodes_channel_pins_update_as_sent_by_the_server() {
        let action =
            decode_frame(r#"{"op":0,"t":"CHANNEL_PINS_UPDATE","s":9,"d":{"channel_id":"77"}}"#)
                .expect("frame");
        let FrameAction::Dispatch { seq, event } = action else {
            panic!("expected a dispatch frame");
        };
        assert_eq!(seq, Some(9));
        assert!(matches!(
            event,
            GatewayEvent::ChannelPinsUpdate(ref p) if p.channel_id == ChannelId::from("77")
        ));
    }

    #[test]
    fn ignores_dispatches_outside_the_message_surface() {
        let action =
            decode_frame(r#"{"op":0,"t":"PRESENCE_UPDATE","s":3,"d":{"user_id":"1"}}"#).expect("frame");
        assert_eq!(action, FrameAction::Ignore);
    }

    #[test]
    fn reads_heartbeat_interval_from_hello() {
        let action = decode_frame(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).expect("frame");
        assert_eq!(
            action,
            FrameAction::Hello {
                heartbeat_interval: Duration::from_millis(41_250)
            }
        );
    }
}
