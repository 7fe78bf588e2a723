//! Node web socket client.
//!
//! The first message of a session must be the ready operation. After that a
//! reader task forwards stats to the node and routes player operations to
//! the player bound to their guild. If the stream ends without being asked
//! to, the node is told so it can reconnect.

use futures_util::StreamExt;
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{Result, VoicelinkError};
use crate::event::PlayerEvent;
use crate::model::UserId;
use crate::node::{Node, StatsUpdater};
use crate::op::{OpType, ReadyOp};
use crate::utils::spawn_fut;

const CLIENT_NAME: &str = concat!("voicelink/", env!("CARGO_PKG_VERSION"));

/// Describes the action that must be taken on each [`Stream::process_next`] call.
enum MsgAction {
    /// Text data of the new message to be processed.
    Process(String),
    /// All that's not Message::{Text, Close} is marked as ignored.
    Ignore,
    /// There's no more messages.
    Finalize,
}

/// Wraps a [`WebSocketStream`].
struct Stream(WebSocketStream<MaybeTlsStream<TcpStream>>);

impl Stream {
    /// Returns the next text message content if any.
    async fn process_next(&mut self) -> Result<MsgAction> {
        let message = match self.0.next().await {
            Some(item) => item?,
            None => return Ok(MsgAction::Finalize),
        };

        match message {
            Message::Text(data) => Ok(MsgAction::Process(data)),
            Message::Close(_) => Err(VoicelinkError::NodeConnectionClosed),
            _ => Ok(MsgAction::Ignore),
        }
    }

    /// Closes the connection.
    async fn close(&mut self) -> Result<()> {
        self.0.close(None).await?;
        Ok(())
    }
}

/// Used to communicate with the web socket reader.
struct Alerter {
    tx: oneshot::Sender<()>,
    handler: JoinHandle<()>,
}

impl Alerter {
    /// Notifies the reader to close and waits for it.
    async fn close(self) {
        // The reader may have already finished.
        let _ = self.tx.send(());
        let _ = self.handler.await;
    }
}

pub(crate) struct Socket {
    url: Url,
    bot_id: UserId,
    password: String,
    alerter: Mutex<Option<Alerter>>,
}

impl Socket {
    pub(crate) fn new(url: Url, bot_id: UserId, password: String) -> Self {
        Self {
            url,
            bot_id,
            password,
            alerter: Mutex::new(None),
        }
    }

    fn request(&self, session_id: Option<&str>) -> Result<http::Request<()>> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| VoicelinkError::NodeConnectionFailure(format!("no host in {}", self.url)))?;
        let authority = match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let mut request_builder = http::Request::builder()
            .uri(self.url.as_str())
            // Web Socket base headers as per RFC 6455.
            .header("Host", authority)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Key", tungstenite::handshake::client::generate_key())
            .header("Sec-WebSocket-Version", "13")
            // Node required headers.
            .header("User-Id", self.bot_id.to_string())
            .header("Authorization", self.password.as_str())
            .header("Client-Name", CLIENT_NAME);

        if let Some(id) = session_id {
            request_builder = request_builder.header("Session-Id", id);
        }

        request_builder
            .body(())
            .map_err(|e| VoicelinkError::NodeConnectionFailure(e.to_string()))
    }

    /// Opens a session, replacing the current one if any.
    ///
    /// `session_id` asks the node to resume a previous session.
    pub(crate) async fn connect(&self, node: Node, session_id: Option<&str>) -> Result<ReadyOp> {
        let request = self.request(session_id)?;

        let mut alerter = self.alerter.lock().await;
        if let Some(previous) = alerter.take() {
            previous.close().await;
        }

        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        let mut stream = Stream(stream);

        let raw = match stream.process_next().await? {
            MsgAction::Process(raw) => raw,
            action => {
                if let MsgAction::Ignore = action {
                    let _ = stream.close().await;
                }
                return Err(VoicelinkError::MissingReadyMessage);
            }
        };

        match serde_json::from_str::<OpType>(&raw) {
            Ok(OpType::Ready(ready)) => {
                alerter.replace(listen(stream, node));
                Ok(ready)
            }
            Ok(_) => {
                let _ = stream.close().await;
                Err(VoicelinkError::MissingReadyMessage)
            }
            Err(e) => {
                let _ = stream.close().await;
                Err(e.into())
            }
        }
    }

    /// Closes the session if open.
    pub(crate) async fn close(&self) {
        if let Some(alerter) = self.alerter.lock().await.take() {
            alerter.close().await;
        }
    }
}

/// Spawns the web socket reader loop.
fn listen(mut stream: Stream, node: Node) -> Alerter {
    let (tx, mut rx) = oneshot::channel();

    let handler = tokio::spawn(async move {
        let mut asked_to_close = false;

        loop {
            tokio::select! {
                _ = &mut rx => {
                    asked_to_close = true;
                    if let Err(e) = stream.close().await {
                        debug!("node {} socket closed with error: {e}", node.name());
                    }
                    break
                }
                result = stream.process_next() => {
                    let raw = match result {
                        Ok(MsgAction::Process(raw)) => raw,
                        Ok(MsgAction::Finalize) => break,
                        Ok(MsgAction::Ignore) => continue,
                        Err(e) => {
                            warn!("node {} socket failed: {e}", node.name());
                            break
                        }
                    };

                    let op = match serde_json::from_str::<OpType>(&raw) {
                        Ok(op) => op,
                        Err(e) => {
                            warn!("node {} sent an unexpected message: {e}", node.name());
                            continue
                        }
                    };

                    match op {
                        OpType::Stats(stats) => {
                            node.update_stats(stats, StatsUpdater::WebSocket).await;
                            let cnode = node.clone();
                            spawn_fut(async move { cnode.refresh_latency().await });
                        }
                        OpType::PlayerUpdate(op) => {
                            node.dispatch(op.guild_id, PlayerEvent::State(op.state)).await;
                        }
                        OpType::Event(op) => {
                            node.dispatch(op.guild_id, op.event.into()).await;
                        }
                        OpType::Ready(op) => {
                            debug!("node {} sent a late ready op: {}", node.name(), op.session_id);
                        }
                    }
                }
            }
        }

        if !asked_to_close {
            node.connection_lost();
        }
    });

    Alerter { tx, handler }
}
