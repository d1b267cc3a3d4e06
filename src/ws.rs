//! WebSocket boundary: the framing protocol, a server loop, and a client.
//!
//! Messages in both directions are JSON-encoded tagged unions carrying a
//! caller-chosen `request_id`; a reply echoes the id of the message it
//! answers, which is what lets the client multiplex concurrent calls over
//! one connection. The server side is a thin dispatcher over a
//! [`ServiceCore`]: cache operations answer locally, while object posts,
//! object gets, and calculation status queries proxy to the remote through
//! [`crate::remote`]. The protocol and the dispatch live here so both ends
//! share one message definition.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::codec;
use crate::errors::{labels, Error, ErrorKind, Result};
use crate::identity::Id;
use crate::remote::{self, CalculationStatus, RemoteSession};
use crate::service::ServiceCore;

/// One protocol message: an id plus tagged content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    pub request_id: String,
    pub content: MessageContent,
}

/// The tagged union of everything that travels over the socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageContent {
    /// A client announcing itself after connecting.
    Registration { name: String },
    TestQuery { message: String },
    TestResponse { message: String },
    /// Publishes a value into the server's immutable cache.
    CacheInsert {
        key: String,
        value: serde_json::Value,
    },
    CacheQuery { key: String },
    CacheResponse {
        key: String,
        value: Option<serde_json::Value>,
    },
    /// Posts an object to the remote store and answers with its id.
    ObjectPost {
        session: RemoteSession,
        context_id: String,
        schema: String,
        value: serde_json::Value,
    },
    ObjectPostResponse { object_id: String },
    /// Resolves an object to its current immutable value and fetches it.
    ObjectGet {
        session: RemoteSession,
        context_id: String,
        object_id: String,
    },
    ObjectGetResponse {
        object_id: String,
        value: serde_json::Value,
    },
    CalculationStatusQuery {
        session: RemoteSession,
        context_id: String,
        calculation_id: String,
    },
    CalculationStatusResponse { status: CalculationStatus },
    Error { message: String },
}

pub fn encode_message(message: &WsMessage) -> Result<String> {
    serde_json::to_string(message)
        .map_err(|e| Error::new(ErrorKind::WebSocketError).with_info(labels::INTERNAL_MESSAGE, e))
}

pub fn decode_message(text: &str) -> Result<WsMessage> {
    serde_json::from_str(text)
        .map_err(|e| Error::new(ErrorKind::Parse).with_info(labels::INTERNAL_MESSAGE, e))
}

fn ws_error(error: tokio_tungstenite::tungstenite::Error) -> Error {
    Error::new(ErrorKind::WebSocketError).with_info(labels::INTERNAL_MESSAGE, error)
}

/// Dispatches one incoming message against the service core, returning the
/// reply to send, if any. Object-store and calculation operations run over
/// the core's HTTP pool; their failures come back as `Error` replies
/// rather than tearing down the connection.
pub async fn handle_message(core: &ServiceCore, message: &WsMessage) -> Option<WsMessage> {
    let reply = |content| {
        Some(WsMessage {
            request_id: message.request_id.clone(),
            content,
        })
    };
    match &message.content {
        MessageContent::Registration { name } => {
            tracing::info!(client = %name, "client registered");
            None
        }
        MessageContent::TestQuery { message } => reply(MessageContent::TestResponse {
            message: message.clone(),
        }),
        MessageContent::CacheInsert { key, value } => match codec::json_to_value(value) {
            Ok(value) => {
                let id = Id::from(key.as_str());
                let (_pointer, _created) = core.cache().probe(&id);
                core.cache().publish(&id, value);
                None
            }
            Err(error) => reply(MessageContent::Error {
                message: error.to_string(),
            }),
        },
        MessageContent::CacheQuery { key } => {
            let id = Id::from(key.as_str());
            let data = core.cache().lookup(&id).and_then(|pointer| pointer.data());
            let value = match data {
                Some(data) => match codec::value_to_json(&data) {
                    Ok(json) => Some(json),
                    Err(error) => {
                        return reply(MessageContent::Error {
                            message: error.to_string(),
                        });
                    }
                },
                None => None,
            };
            reply(MessageContent::CacheResponse {
                key: key.clone(),
                value,
            })
        }
        MessageContent::ObjectPost {
            session,
            context_id,
            schema,
            value,
        } => {
            let posted: Result<String> = async {
                let value = codec::json_to_value(value)?;
                remote::post_object(core, session, context_id, schema, &value).await
            }
            .await;
            match posted {
                Ok(object_id) => reply(MessageContent::ObjectPostResponse { object_id }),
                Err(error) => reply(MessageContent::Error {
                    message: error.to_string(),
                }),
            }
        }
        MessageContent::ObjectGet {
            session,
            context_id,
            object_id,
        } => {
            let fetched: Result<serde_json::Value> = async {
                let immutable_id = remote::resolve_object_to_immutable(
                    core, session, context_id, object_id, false,
                )
                .await?;
                let value =
                    remote::retrieve_immutable(core, session, context_id, &immutable_id).await?;
                codec::value_to_json(&value)
            }
            .await;
            match fetched {
                Ok(value) => reply(MessageContent::ObjectGetResponse {
                    object_id: object_id.clone(),
                    value,
                }),
                Err(error) => reply(MessageContent::Error {
                    message: error.to_string(),
                }),
            }
        }
        MessageContent::CalculationStatusQuery {
            session,
            context_id,
            calculation_id,
        } => {
            match remote::get_calculation_status(core, session, context_id, calculation_id).await
            {
                Ok(status) => reply(MessageContent::CalculationStatusResponse { status }),
                Err(error) => reply(MessageContent::Error {
                    message: error.to_string(),
                }),
            }
        }
        MessageContent::TestResponse { .. }
        | MessageContent::CacheResponse { .. }
        | MessageContent::ObjectPostResponse { .. }
        | MessageContent::ObjectGetResponse { .. }
        | MessageContent::CalculationStatusResponse { .. }
        | MessageContent::Error { .. } => reply(MessageContent::Error {
            message: "unexpected message type".to_owned(),
        }),
    }
}

/// Accepts WebSocket connections forever, dispatching each message against
/// the core.
pub async fn serve(listener: TcpListener, core: Arc<ServiceCore>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.map_err(|e| {
            Error::new(ErrorKind::WebSocketError).with_info(labels::SYSTEM_ERROR, e)
        })?;
        let core = core.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, core).await {
                tracing::warn!(%peer, %error, "WebSocket connection ended with an error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, core: Arc<ServiceCore>) -> Result<()> {
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(ws_error)?;
    while let Some(frame) = ws.next().await {
        match frame.map_err(ws_error)? {
            Message::Text(text) => {
                let reply = match decode_message(text.as_str()) {
                    Ok(message) => handle_message(&core, &message).await,
                    Err(error) => Some(WsMessage {
                        request_id: String::new(),
                        content: MessageContent::Error {
                            message: error.to_string(),
                        },
                    }),
                };
                if let Some(reply) = reply {
                    ws.send(Message::Text(encode_message(&reply)?.into()))
                        .await
                        .map_err(ws_error)?;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A client that multiplexes request/response pairs over one connection.
pub struct WsClient {
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    pending: Arc<DashMap<String, tokio::sync::oneshot::Sender<MessageContent>>>,
    next_id: AtomicU64,
    reader: tokio::task::JoinHandle<()>,
}

impl WsClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(ws_error)?;
        let (sink, mut stream) = ws.split();
        let pending: Arc<DashMap<String, tokio::sync::oneshot::Sender<MessageContent>>> =
            Arc::new(DashMap::new());
        let reader = tokio::spawn({
            let pending = pending.clone();
            async move {
                while let Some(Ok(frame)) = stream.next().await {
                    if let Message::Text(text) = frame {
                        match decode_message(text.as_str()) {
                            Ok(message) => match pending.remove(&message.request_id) {
                                Some((_, sender)) => {
                                    let _ = sender.send(message.content);
                                }
                                None => {
                                    tracing::debug!(
                                        request_id = %message.request_id,
                                        "unsolicited server message"
                                    );
                                }
                            },
                            Err(error) => {
                                tracing::warn!(%error, "undecodable server message");
                            }
                        }
                    }
                }
            }
        });
        Ok(Self {
            sink: tokio::sync::Mutex::new(sink),
            pending,
            next_id: AtomicU64::new(0),
            reader,
        })
    }

    fn next_request_id(&self) -> String {
        format!("r{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn send(&self, message: &WsMessage) -> Result<()> {
        let text = encode_message(message)?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(ws_error)
    }

    /// Sends a message without expecting a reply.
    pub async fn notify(&self, content: MessageContent) -> Result<()> {
        self.send(&WsMessage {
            request_id: self.next_request_id(),
            content,
        })
        .await
    }

    /// Sends a message and awaits the reply carrying the same request id.
    pub async fn call(&self, content: MessageContent) -> Result<MessageContent> {
        let request_id = self.next_request_id();
        let (sender, receiver) = tokio::sync::oneshot::channel();
        self.pending.insert(request_id.clone(), sender);
        if let Err(error) = self
            .send(&WsMessage {
                request_id: request_id.clone(),
                content,
            })
            .await
        {
            self.pending.remove(&request_id);
            return Err(error);
        }
        receiver.await.map_err(|_| {
            Error::new(ErrorKind::WebSocketError)
                .with_info(labels::INTERNAL_MESSAGE, "connection closed before the reply")
        })
    }

    pub async fn close(self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        drop(sink);
        self.reader.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::http::{HttpRequest, HttpResponse, MockHttpExchange};
    use crate::value::{Blob, Value};

    #[test]
    fn messages_round_trip_as_tagged_json() {
        let message = WsMessage {
            request_id: "r7".to_owned(),
            content: MessageContent::TestQuery {
                message: "ping".to_owned(),
            },
        };
        let encoded = encode_message(&message).unwrap();
        assert_eq!(
            encoded,
            r#"{"request_id":"r7","content":{"type":"test_query","payload":{"message":"ping"}}}"#
        );
        assert_eq!(decode_message(&encoded).unwrap(), message);

        let decode_failure = decode_message("{\"nope\":1}").unwrap_err();
        assert_eq!(decode_failure.kind(), ErrorKind::Parse);
    }

    #[tokio::test]
    async fn dispatch_answers_queries_and_serves_the_cache() {
        let core = ServiceCore::new(ServiceConfig::default());

        let echo = handle_message(
            &core,
            &WsMessage {
                request_id: "1".to_owned(),
                content: MessageContent::TestQuery {
                    message: "hello".to_owned(),
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(
            echo.content,
            MessageContent::TestResponse {
                message: "hello".to_owned()
            }
        );
        assert_eq!(echo.request_id, "1");

        // Unknown keys answer with an empty response.
        let missing = handle_message(
            &core,
            &WsMessage {
                request_id: "2".to_owned(),
                content: MessageContent::CacheQuery {
                    key: "thing".to_owned(),
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(
            missing.content,
            MessageContent::CacheResponse {
                key: "thing".to_owned(),
                value: None
            }
        );

        // Insert then query.
        assert!(
            handle_message(
                &core,
                &WsMessage {
                    request_id: "3".to_owned(),
                    content: MessageContent::CacheInsert {
                        key: "thing".to_owned(),
                        value: serde_json::json!({"n": 4}),
                    },
                },
            )
            .await
            .is_none()
        );
        let found = handle_message(
            &core,
            &WsMessage {
                request_id: "4".to_owned(),
                content: MessageContent::CacheQuery {
                    key: "thing".to_owned(),
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(
            found.content,
            MessageContent::CacheResponse {
                key: "thing".to_owned(),
                value: Some(serde_json::json!({"n": 4})),
            }
        );
    }

    #[tokio::test]
    async fn remote_operations_dispatch_over_http() {
        let core = ServiceCore::new(ServiceConfig::default());
        let mock = core.enable_http_mocking();
        let payload = Value::from(7i64);
        let encoded = codec::value_to_msgpack(&payload).unwrap();
        mock.set_script(vec![
            MockHttpExchange {
                request: HttpRequest::post(
                    "http://remote.test/api/v1.0/iss/integer?context=ctx1",
                    Blob::from(encoded.clone()),
                )
                .with_header("Content-Type", "application/octet-stream")
                .with_header("Authorization", "Bearer xyz"),
                response: HttpResponse::ok(Blob::from(br#"{"id": "obj1"}"#.to_vec())),
            },
            MockHttpExchange {
                request: HttpRequest::get(
                    "http://remote.test/api/v1.0/iss/obj1/immutable?context=ctx1&ignore_upgrades=false",
                )
                .with_header("Authorization", "Bearer xyz"),
                response: HttpResponse::ok(Blob::from(br#"{"id": "imm1"}"#.to_vec())),
            },
            MockHttpExchange {
                request: HttpRequest::get(
                    "http://remote.test/api/v1.0/iss/immutable/imm1?context=ctx1",
                )
                .with_header("Accept", "application/octet-stream")
                .with_header("Authorization", "Bearer xyz"),
                response: HttpResponse::ok(Blob::from(encoded)),
            },
            MockHttpExchange {
                request: HttpRequest::get(
                    "http://remote.test/api/v1.0/calc/calc1/status?context=ctx1",
                )
                .with_header("Authorization", "Bearer xyz"),
                response: HttpResponse::ok(Blob::from(br#""completed""#.to_vec())),
            },
        ]);
        let session = RemoteSession {
            api_url: "http://remote.test/api/v1.0".to_owned(),
            access_token: "xyz".to_owned(),
        };

        let posted = handle_message(
            &core,
            &WsMessage {
                request_id: "1".to_owned(),
                content: MessageContent::ObjectPost {
                    session: session.clone(),
                    context_id: "ctx1".to_owned(),
                    schema: "integer".to_owned(),
                    value: serde_json::json!(7),
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(
            posted.content,
            MessageContent::ObjectPostResponse {
                object_id: "obj1".to_owned()
            }
        );

        let fetched = handle_message(
            &core,
            &WsMessage {
                request_id: "2".to_owned(),
                content: MessageContent::ObjectGet {
                    session: session.clone(),
                    context_id: "ctx1".to_owned(),
                    object_id: "obj1".to_owned(),
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(
            fetched.content,
            MessageContent::ObjectGetResponse {
                object_id: "obj1".to_owned(),
                value: serde_json::json!(7),
            }
        );

        let status = handle_message(
            &core,
            &WsMessage {
                request_id: "3".to_owned(),
                content: MessageContent::CalculationStatusQuery {
                    session,
                    context_id: "ctx1".to_owned(),
                    calculation_id: "calc1".to_owned(),
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(
            status.content,
            MessageContent::CalculationStatusResponse {
                status: CalculationStatus::Completed
            }
        );
        assert!(mock.is_complete());
        assert!(mock.is_in_order());
    }

    #[tokio::test]
    async fn remote_failures_come_back_as_error_replies() {
        let core = ServiceCore::new(ServiceConfig::default());
        let mock = core.enable_http_mocking();
        // An empty script makes any exchange fail, which the dispatcher
        // must translate into an Error reply.
        mock.set_script(vec![]);
        let reply = handle_message(
            &core,
            &WsMessage {
                request_id: "1".to_owned(),
                content: MessageContent::CalculationStatusQuery {
                    session: RemoteSession {
                        api_url: "http://remote.test/api/v1.0".to_owned(),
                        access_token: "xyz".to_owned(),
                    },
                    context_id: "ctx1".to_owned(),
                    calculation_id: "calc1".to_owned(),
                },
            },
        )
        .await
        .unwrap();
        assert!(matches!(reply.content, MessageContent::Error { .. }));
        assert_eq!(reply.request_id, "1");
    }

    #[tokio::test]
    async fn client_and_server_loop_back() {
        let core = Arc::new(ServiceCore::new(ServiceConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, core));

        let client = WsClient::connect(&format!("ws://{address}")).await.unwrap();
        client
            .notify(MessageContent::Registration {
                name: "loopback test".to_owned(),
            })
            .await
            .unwrap();

        let reply = client
            .call(MessageContent::TestQuery {
                message: "round trip".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            MessageContent::TestResponse {
                message: "round trip".to_owned()
            }
        );

        client
            .notify(MessageContent::CacheInsert {
                key: "k1".to_owned(),
                value: serde_json::json!([1, 2, 3]),
            })
            .await
            .unwrap();
        let reply = client
            .call(MessageContent::CacheQuery {
                key: "k1".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            MessageContent::CacheResponse {
                key: "k1".to_owned(),
                value: Some(serde_json::json!([1, 2, 3])),
            }
        );

        client.close().await.unwrap();
        server.abort();
    }
}
