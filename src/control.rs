use std::{fmt::Display, sync::Arc};

use anyhow::Context as _;
use log::{debug, error, info};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;

use crate::{
    config::Config,
    messages::{
        ConnectionClientErrorMsgBodyV1, Message, MessageBody, MessageChannel,
        MonitorForceCheckAckMsgBodyV1, MonitorStatusMsgBodyV1,
    },
    monitor::{MonitorRegistry, MonitorStatus, StatusBoard},
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_on: String,
    pub enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_on: "127.0.0.1:8070".to_string(),
            enabled: true,
        }
    }
}

/// WebSocket endpoint for poking the daemon: force a detection pass, ask for
/// the current monitor status.
pub struct ControlListener {
    config: ServerConfig,
    listener: TcpListener,
}

impl ControlListener {
    pub async fn bind(config: Arc<Config>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.server.listen_on)
            .await
            .context("Failed to start TCP server")?;
        Ok(Self {
            listener,
            config: config.server.clone(),
        })
    }

    pub async fn listen(&self, registry: MonitorRegistry, board: StatusBoard) {
        info!("Control server listening on {}...", self.config.listen_on);

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(val) => val,
                Err(err) => {
                    error!("TCP connection failed: {err:?}");
                    continue;
                }
            };
            let registry = registry.clone();
            let board = board.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    Self::handle_connection(addr.to_string(), stream, registry, board).await
                {
                    error!("Error during connection with {addr}: {err:?}");
                }
            });
        }
    }

    async fn handle_connection(
        name: String,
        stream: TcpStream,
        registry: MonitorRegistry,
        board: StatusBoard,
    ) -> anyhow::Result<()> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .context("Failed to accept websocket connection")?;

        serve_connection(ControlConnection::new(name, ws), registry, board).await
    }
}

async fn serve_connection(
    mut conn: ControlConnection,
    registry: MonitorRegistry,
    board: StatusBoard,
) -> anyhow::Result<()> {
    while let Some(msg) = conn.recv().await {
        match msg.body {
            MessageBody::MonitorForceCheckV1 => {
                let scheduled = match registry.force_check().await {
                    Ok(scheduled) => scheduled,
                    Err(err) => {
                        debug!("Force check could not be delivered: {err:?}");
                        false
                    }
                };
                conn.send(Message::new(MessageBody::MonitorForceCheckAckV1(
                    MonitorForceCheckAckMsgBodyV1 { scheduled },
                )))
                .await
                .context("Failed to send force check ack")?;
            }
            MessageBody::MonitorRequestStatusV1 => {
                conn.send(Message::new(status_reply(board.current())))
                    .await
                    .context("Failed to send status message")?;
            }
            _ => conn.send_error("Unsupported message").await,
        }
    }
    Ok(())
}

fn status_reply(status: Option<MonitorStatus>) -> MessageBody {
    let body = match status {
        Some(status) => status.into(),
        None => MonitorStatusMsgBodyV1 {
            is_monitoring: false,
            ad_playing: false,
            ad_count: 0,
            current_speed: None,
            page_url: None,
        },
    };
    MessageBody::MonitorStatusV1(body)
}

struct ControlConnection {
    open: bool,
    name: String,
    channel: MessageChannel<WebSocketStream<TcpStream>>,
}

impl ControlConnection {
    fn new(name: String, ws: WebSocketStream<TcpStream>) -> Self {
        debug!("Creating connection {name}");
        Self {
            open: true,
            name,
            channel: MessageChannel::new(ws),
        }
    }

    async fn send(&mut self, message: Message) -> anyhow::Result<()> {
        self.channel.send(message).await?;
        Ok(())
    }

    async fn send_error(&mut self, message: impl Display) {
        let _ = self
            .send(Message::new(MessageBody::ConnectionClientErrorV1(
                ConnectionClientErrorMsgBodyV1 {
                    message: message.to_string(),
                },
            )))
            .await;
    }

    /// Yields the next protocol message; pings are answered inline and
    /// malformed frames are reported back to the client without ending the
    /// connection.
    async fn recv(&mut self) -> Option<Message> {
        if !self.open {
            return None;
        }
        loop {
            let Some(msg_res) = self.channel.recv().await else {
                self.close_silent().await;
                return None;
            };
            match msg_res {
                Ok(Message {
                    body: MessageBody::ConnectionPingV1,
                    ..
                }) => {
                    if let Err(err) = self.send(Message::new(MessageBody::ConnectionPongV1)).await {
                        error!("Failed to send pong to client {}: {err:?}", self.name);
                    }
                }
                Ok(msg) => return Some(msg),
                Err(err) => {
                    debug!(
                        "Received malformed message from client {}: {err:?}",
                        self.name
                    );
                    self.send_error(err.to_string()).await;
                }
            }
        }
    }

    async fn close_silent(&mut self) {
        self.open = false;
        if let Err(err) = self.channel.close().await {
            error!("Failed to close websocket {}: {err:?}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::monitor::MonitorId;

    use super::*;

    #[test]
    fn should_answer_status_request_without_monitor() {
        // given, when
        let reply = status_reply(None);

        // then
        assert_eq!(
            reply,
            MessageBody::MonitorStatusV1(MonitorStatusMsgBodyV1 {
                is_monitoring: false,
                ad_playing: false,
                ad_count: 0,
                current_speed: None,
                page_url: None,
            })
        );
    }

    #[test]
    fn should_mirror_monitor_status_into_reply() {
        // given
        let status = MonitorStatus {
            id: MonitorId::new(),
            page_url: Some("https://www.youtube.com/watch?v=abc123".to_string()),
            is_monitoring: true,
            ad_playing: true,
            ad_count: 2,
            current_speed: Some(16.0),
        };

        // when
        let reply = status_reply(Some(status));

        // then
        assert_eq!(
            reply,
            MessageBody::MonitorStatusV1(MonitorStatusMsgBodyV1 {
                is_monitoring: true,
                ad_playing: true,
                ad_count: 2,
                current_speed: Some(16.0),
                page_url: Some("https://www.youtube.com/watch?v=abc123".to_string()),
            })
        );
    }
}
