use coachstream_conversation::{
    BoxFuture, CompletePayload, FallbackClient, FallbackError, LookupError, MessagePayload,
    StreamTransport, TermExplanation, TermLookup, TermRequest, TransportError, UnitStream,
};
use futures::StreamExt;
use reqwest::header::ACCEPT;
use snafu::{ResultExt, ensure};

use crate::config::ApiConfig;
use crate::error::{BuildClientSnafu, HttpError, MissingBaseUrlSnafu};

const STREAM_ACCEPT: &str = "text/event-stream, application/x-ndjson";
const BODY_EXCERPT_LIMIT: usize = 512;

enum PostFailure {
    Request(reqwest::Error),
    Status { status: u16, body: String },
}

/// Coach backend client serving the streaming, fallback and lookup exchanges.
#[derive(Debug, Clone)]
pub struct CoachApiClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl CoachApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, HttpError> {
        ensure!(
            !config.base_url.is_empty(),
            MissingBaseUrlSnafu {
                stage: "build-client"
            }
        );

        // No whole-request timeout here: it would cut long event streams short.
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-client",
            })?;

        Ok(Self { http, config })
    }

    async fn send_checked(
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PostFailure> {
        let response = request.send().await.map_err(PostFailure::Request)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(PostFailure::Status {
            status: status.as_u16(),
            body: body.chars().take(BODY_EXCERPT_LIMIT).collect(),
        })
    }
}

impl StreamTransport for CoachApiClient {
    fn open_stream<'a>(
        &'a self,
        payload: &'a MessagePayload,
    ) -> BoxFuture<'a, Result<UnitStream, TransportError>> {
        Box::pin(async move {
            let url = self.config.stream_url(&payload.conversation_id);
            tracing::debug!(url = %url, "opening event stream");

            let request = self
                .http
                .post(&url)
                .header(ACCEPT, STREAM_ACCEPT)
                .json(payload);
            let response = Self::send_checked(request)
                .await
                .map_err(|failure| match failure {
                    PostFailure::Request(error) => TransportError::OpenStream {
                        stage: "open-stream",
                        message: error.to_string(),
                    },
                    PostFailure::Status { status, body } => TransportError::StreamStatus {
                        stage: "stream-status",
                        status,
                        body,
                    },
                })?;

            // Dropping the body stream aborts the underlying request.
            let units = response.bytes_stream().map(|unit| {
                unit.map(|bytes| bytes.to_vec())
                    .map_err(|error| TransportError::ReadStream {
                        stage: "read-stream",
                        message: error.to_string(),
                    })
            });
            let units: UnitStream = Box::pin(units);
            Ok(units)
        })
    }
}

impl FallbackClient for CoachApiClient {
    fn send_message<'a>(
        &'a self,
        payload: &'a MessagePayload,
    ) -> BoxFuture<'a, Result<CompletePayload, FallbackError>> {
        Box::pin(async move {
            let url = self.config.message_url(&payload.conversation_id);
            tracing::debug!(url = %url, "sending non-streaming message");

            let request = self
                .http
                .post(&url)
                .timeout(self.config.request_timeout)
                .json(payload);
            let response = Self::send_checked(request)
                .await
                .map_err(|failure| match failure {
                    PostFailure::Request(error) => FallbackError::FallbackRequest {
                        stage: "fallback-request",
                        message: error.to_string(),
                    },
                    PostFailure::Status { status, body } => FallbackError::FallbackStatus {
                        stage: "fallback-status",
                        status,
                        body,
                    },
                })?;
            let body = response
                .text()
                .await
                .map_err(|error| FallbackError::FallbackRequest {
                    stage: "fallback-body",
                    message: error.to_string(),
                })?;

            serde_json::from_str(&body).map_err(|error| FallbackError::FallbackResponse {
                stage: "fallback-decode",
                details: error.to_string(),
            })
        })
    }
}

impl TermLookup for CoachApiClient {
    fn explain<'a>(
        &'a self,
        request: &'a TermRequest,
    ) -> BoxFuture<'a, Result<TermExplanation, LookupError>> {
        Box::pin(async move {
            let url = self.config.explain_url(&request.conversation_id);

            let http_request = self
                .http
                .post(&url)
                .timeout(self.config.request_timeout)
                .json(request);
            let response = Self::send_checked(http_request)
                .await
                .map_err(|failure| match failure {
                    PostFailure::Request(error) => LookupError::LookupRequest {
                        stage: "lookup-request",
                        message: error.to_string(),
                    },
                    PostFailure::Status { status, body } => LookupError::LookupStatus {
                        stage: "lookup-status",
                        status,
                        body,
                    },
                })?;
            let body = response
                .text()
                .await
                .map_err(|error| LookupError::LookupRequest {
                    stage: "lookup-body",
                    message: error.to_string(),
                })?;

            serde_json::from_str(&body).map_err(|error| LookupError::LookupResponse {
                stage: "lookup-decode",
                details: error.to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use coachstream_conversation::{ConversationId, Decoded, StreamEvent, decode_units};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    /// Serves exactly one HTTP response and hands back the raw request.
    async fn serve_once(status: &'static str, body: String) -> (ApiConfig, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let address = listener.local_addr().expect("listener address");

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept connection");
            let mut request = Vec::new();
            let mut buffer = [0_u8; 4096];
            loop {
                let read = socket.read(&mut buffer).await.expect("read request");
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
                if request_complete(&request) {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket
                .write_all(response.as_bytes())
                .await
                .expect("write response");
            socket.shutdown().await.expect("shutdown socket");
            String::from_utf8_lossy(&request).into_owned()
        });

        (ApiConfig::new(format!("http://{address}")), handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        body.len() >= length
    }

    fn payload() -> MessagePayload {
        MessagePayload {
            conversation_id: ConversationId::new("c-7"),
            coach_id: "coach-1".to_string(),
            user_id: "user-1".to_string(),
            user_message: "Plan my deload week".to_string(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let error = CoachApiClient::new(ApiConfig::new("   ")).expect_err("empty base url");
        assert!(matches!(error, HttpError::MissingBaseUrl { .. }));
    }

    #[tokio::test]
    async fn event_stream_units_decode_into_events() {
        let body = [
            r#"data: {"type":"chunk","content":"Deload"}"#,
            r#"data: {"type":"complete","aiMessage":{"content":"Deload week ready."}}"#,
            "data: [DONE]",
            "",
        ]
        .join("\n");
        let (config, server) = serve_once("200 OK", body).await;
        let client = CoachApiClient::new(config).expect("client");

        let units = client.open_stream(&payload()).await.expect("open stream");
        let decoded: Vec<Decoded> = decode_units(units).collect().await;

        assert_eq!(
            decoded,
            vec![
                Decoded::Event(StreamEvent::Chunk("Deload".to_string())),
                Decoded::Event(StreamEvent::Complete(CompletePayload::from_content(
                    "Deload week ready."
                ))),
            ]
        );

        let request = server.await.expect("server task");
        assert!(request.starts_with("POST /conversations/c-7/stream "));
        assert!(request.contains(r#""userMessage":"Plan my deload week""#));
        assert!(
            request
                .to_ascii_lowercase()
                .contains("accept: text/event-stream, application/x-ndjson")
        );
    }

    #[tokio::test]
    async fn stream_status_errors_carry_status_and_body() {
        let (config, _server) =
            serve_once("503 Service Unavailable", "overloaded".to_string()).await;
        let client = CoachApiClient::new(config).expect("client");

        let error = match client.open_stream(&payload()).await {
            Ok(_) => panic!("expected a status error"),
            Err(error) => error,
        };
        assert_eq!(
            error,
            TransportError::StreamStatus {
                stage: "stream-status",
                status: 503,
                body: "overloaded".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn fallback_accepts_a_complete_shaped_response() {
        let body = r#"{"type":"complete","aiMessage":{"content":"Full answer"},"conversationSize":4}"#;
        let (config, server) = serve_once("200 OK", body.to_string()).await;
        let client = CoachApiClient::new(config).expect("client");

        let complete = client.send_message(&payload()).await.expect("fallback");
        assert_eq!(complete.content(), "Full answer");
        assert_eq!(complete.conversation_size, Some(4));

        let request = server.await.expect("server task");
        assert!(request.starts_with("POST /conversations/c-7/messages "));
        assert!(!request.to_ascii_lowercase().contains("text/event-stream"));
    }

    #[tokio::test]
    async fn fallback_rejects_unparseable_bodies() {
        let (config, _server) = serve_once("200 OK", "<html>".to_string()).await;
        let client = CoachApiClient::new(config).expect("client");

        let error = client.send_message(&payload()).await.expect_err("bad body");
        assert!(matches!(error, FallbackError::FallbackResponse { .. }));
    }

    #[tokio::test]
    async fn lookup_maps_status_failures() {
        let (config, _server) = serve_once("404 Not Found", "unknown term".to_string()).await;
        let client = CoachApiClient::new(config).expect("client");
        let request = TermRequest {
            term: "RPE".to_string(),
            conversation_id: ConversationId::new("c-7"),
            coach_id: "coach-1".to_string(),
            user_id: "user-1".to_string(),
        };

        let error = client.explain(&request).await.expect_err("lookup fails");
        assert!(matches!(
            error,
            LookupError::LookupStatus { status: 404, ref body, .. } if body == "unknown term"
        ));
    }
}
