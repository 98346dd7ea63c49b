use std::{error::Error, time::SystemTime};

use anyhow::{anyhow, Context as _};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

use crate::monitor::MonitorStatus;

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionClientErrorMsgBodyV1 {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorForceCheckAckMsgBodyV1 {
    pub scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatusMsgBodyV1 {
    pub is_monitoring: bool,
    pub ad_playing: bool,
    pub ad_count: u64,
    pub current_speed: Option<f64>,
    pub page_url: Option<String>,
}

impl From<MonitorStatus> for MonitorStatusMsgBodyV1 {
    fn from(status: MonitorStatus) -> Self {
        Self {
            is_monitoring: status.is_monitoring,
            ad_playing: status.ad_playing,
            ad_count: status.ad_count,
            current_speed: status.current_speed,
            page_url: status.page_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "m")]
#[non_exhaustive]
pub enum MessageBody {
    #[serde(rename = "connection::ping/v1")]
    ConnectionPingV1,

    #[serde(rename = "connection::pong/v1")]
    ConnectionPongV1,

    #[serde(rename = "connection::client_error/v1")]
    ConnectionClientErrorV1(ConnectionClientErrorMsgBodyV1),

    #[serde(rename = "monitor::force_check/v1")]
    MonitorForceCheckV1,

    #[serde(rename = "monitor::force_check_ack/v1")]
    MonitorForceCheckAckV1(MonitorForceCheckAckMsgBodyV1),

    #[serde(rename = "monitor::request_status/v1")]
    MonitorRequestStatusV1,

    #[serde(rename = "monitor::status/v1")]
    MonitorStatusV1(MonitorStatusMsgBodyV1),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "t")]
    pub timestamp: u64,

    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Self::new_with_timestamp(body, timestamp())
    }

    pub fn new_with_timestamp(body: MessageBody, timestamp: u64) -> Self {
        Self { body, timestamp }
    }
}

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
enum MessageFormat {
    Json,

    #[default]
    Msgpack,
}

pub struct MessageChannel<S> {
    format: MessageFormat,
    ws: S,
}

impl<S> MessageChannel<S> {
    pub fn new(ws: S) -> Self {
        Self {
            format: MessageFormat::default(),
            ws,
        }
    }
}

impl<S> MessageChannel<S>
where
    S: Sink<tungstenite::Message> + Unpin,
    S::Error: Error + Send + Sync + 'static,
{
    pub async fn send(&mut self, message: Message) -> Result<(), anyhow::Error> {
        log::debug!("Sending message {message:?}");
        let serialized_msg = match self.format {
            MessageFormat::Msgpack => tungstenite::Message::Binary(
                rmp_serde::to_vec(&message).context("Failed to serialize message as MsgPack")?,
            ),
            MessageFormat::Json => tungstenite::Message::Text(
                serde_json::to_string(&message).context("Failed to serialize message as JSON")?,
            ),
        };
        self.ws
            .send(serialized_msg)
            .await
            .map_err(anyhow::Error::from)
    }

    pub async fn close(&mut self) -> Result<(), anyhow::Error> {
        self.ws.close().await?;
        Ok(())
    }
}

impl<S> MessageChannel<S>
where
    S: Stream<Item = tungstenite::Result<tungstenite::Message>> + Unpin,
{
    pub async fn recv(&mut self) -> Option<Result<Message, anyhow::Error>> {
        let msg = match self.ws.next().await? {
            Ok(msg) => msg,
            Err(err) => return Some(Err(anyhow!(err))),
        };
        let deserialized_msg: anyhow::Result<Message> = match msg {
            tungstenite::Message::Binary(data) => {
                self.format = MessageFormat::Msgpack;
                rmp_serde::from_slice(&data).map_err(|err| {
                    anyhow!(err).context("Failed to deserialize binary message as MsgPack")
                })
            }
            tungstenite::Message::Text(data) => {
                self.format = MessageFormat::Json;
                serde_json::from_str(&data).map_err(|err| {
                    anyhow!(err).context("Failed to deserialize text message as JSON")
                })
            }
            tungstenite::Message::Close(frame) => {
                log::debug!("Received close frame: {frame:?}");
                return None;
            }
            _ => return Some(Err(anyhow!("Only binary and text messages are accepted."))),
        };
        log::debug!("Received message {deserialized_msg:?}");
        Some(deserialized_msg)
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn should_send_message() {
        // given
        let mut messages = Vec::new();
        let mut channel = MessageChannel::new(&mut messages);

        // when
        channel
            .send(Message::new_with_timestamp(
                MessageBody::ConnectionPingV1,
                69420,
            ))
            .await
            .unwrap();

        // then
        assert_eq!(messages.len(), 1);
        let tungstenite::Message::Binary(data_recieved) = &messages[0] else {
            panic!("Data received should be binary");
        };
        let obj_received: serde_json::Value = rmp_serde::from_slice(data_recieved).unwrap();

        let obj_expected = json!({
            "t": 69420,
            "m": "connection::ping/v1",
        });
        assert_eq!(obj_received, obj_expected);
    }

    #[tokio::test]
    async fn should_receive_message() {
        // given
        let messages = vec![tungstenite::Result::Ok(tungstenite::Message::binary(
            rmp_serde::to_vec(&json!({
                "t": 42069,
                "m": "monitor::force_check/v1"
            }))
            .unwrap(),
        ))];
        let mut channel = MessageChannel::new(stream::iter(messages));

        // when
        let msg = channel.recv().await.unwrap().unwrap();

        // then
        assert_eq!(
            msg,
            Message::new_with_timestamp(MessageBody::MonitorForceCheckV1, 42069)
        );
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn should_handle_malformed_messages() {
        // given
        let messages = vec![tungstenite::Result::Ok(tungstenite::Message::binary(
            rmp_serde::to_vec(&json!({
                "t": 42069,
                "m": "AcddafsdfSfFdasdsadDDFSFÖDSFD"
            }))
            .unwrap(),
        ))];
        let mut channel = MessageChannel::new(stream::iter(messages));

        // when
        let result = channel.recv().await.unwrap();

        // then
        assert!(result.is_err());
        assert!(channel.recv().await.is_none());
    }

    #[test]
    fn should_flatten_status_body_beside_tag() {
        // given
        let message = Message::new_with_timestamp(
            MessageBody::MonitorStatusV1(MonitorStatusMsgBodyV1 {
                is_monitoring: true,
                ad_playing: false,
                ad_count: 3,
                current_speed: Some(1.5),
                page_url: Some("https://www.youtube.com/watch?v=abc123".to_string()),
            }),
            42069,
        );

        // when
        let serialized = serde_json::to_value(&message).unwrap();

        // then
        assert_eq!(
            serialized,
            json!({
                "t": 42069,
                "m": "monitor::status/v1",
                "is_monitoring": true,
                "ad_playing": false,
                "ad_count": 3,
                "current_speed": 1.5,
                "page_url": "https://www.youtube.com/watch?v=abc123",
            })
        );
    }
}
