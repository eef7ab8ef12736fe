//! Telegram Bot API client.
//!
//! Sends plain-text messages through the `sendMessage` method.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wgkeeper_core::config::BotConfig;

use super::{Notifier, NotifyError};

/// `sendMessage` request body.
#[derive(Debug, Serialize)]
pub struct SendMessage<'a> {
    pub chat_id: i64,
    pub text: &'a str,
    pub disable_web_page_preview: bool,
}

/// Envelope of every Bot API response.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// [`Notifier`] backed by the Telegram Bot API.
#[derive(Debug)]
pub struct TelegramNotifier {
    http: reqwest::Client,
    /// Fully-resolved `sendMessage` URL. Contains the bot token; never log it.
    send_url: String,
}

impl TelegramNotifier {
    /// Build a notifier from the bot section of the configuration.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Config` when no token is set or the HTTP client
    /// cannot be built.
    pub fn from_config(config: &BotConfig) -> Result<Self, NotifyError> {
        let token = config
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| NotifyError::Config("bot token is not set".into()))?;

        // reqwest is built with rustls-no-provider; already installed is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| NotifyError::Config(e.to_string()))?;

        Ok(Self::with_client(http, &config.api_url, token))
    }

    /// Build a notifier around an existing HTTP client.
    pub fn with_client(http: reqwest::Client, api_url: &str, token: &str) -> Self {
        Self {
            http,
            send_url: send_message_url(api_url, token),
        }
    }

    /// Build the request body for one message.
    pub const fn build_message(chat_id: i64, text: &str) -> SendMessage<'_> {
        SendMessage {
            chat_id,
            text,
            disable_web_page_preview: true,
        }
    }

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Request` if the HTTP request fails,
    /// `NotifyError::ApiError` on a non-2xx status, or `NotifyError::Rejected`
    /// when the API reports `ok: false`.
    pub async fn send(&self, message: &SendMessage<'_>) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.send_url)
            .json(message)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            warn!(status = status_code, body = %body, "Bot API returned error");
            return Err(NotifyError::ApiError {
                status: status_code,
                body,
            });
        }

        let envelope: ApiResponse = response
            .json()
            .await
            .map_err(|e| NotifyError::Request(e.without_url().to_string()))?;
        if envelope.ok {
            debug!(chat_id = message.chat_id, "Notification sent");
            Ok(())
        } else {
            Err(NotifyError::Rejected(
                envelope.description.unwrap_or_else(|| "no description".into()),
            ))
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, destination: i64, text: &str) -> Result<(), NotifyError> {
        self.send(&Self::build_message(destination, text)).await
    }
}

fn send_message_url(api_url: &str, token: &str) -> String {
    format!("{}/bot{token}/sendMessage", api_url.trim_end_matches('/'))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(api_url: &str) -> BotConfig {
        BotConfig {
            token: Some("123:abc".into()),
            api_url: api_url.into(),
            request_timeout_secs: 5,
        }
    }

    /// Notifier pointed at a local stub, bypassing any proxy settings.
    fn local_notifier(url: &str) -> TelegramNotifier {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build test HTTP client");
        TelegramNotifier::with_client(http, url, "123:abc")
    }

    /// Serve exactly one HTTP request with a canned response and return the
    /// raw request text.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        body.len() >= length
    }

    #[test]
    fn missing_token_is_a_config_error() {
        let mut cfg = config("https://api.telegram.org");
        cfg.token = None;
        assert!(matches!(
            TelegramNotifier::from_config(&cfg),
            Err(NotifyError::Config(_))
        ));
        cfg.token = Some("  ".into());
        assert!(TelegramNotifier::from_config(&cfg).is_err());
    }

    #[test]
    fn token_config_builds_client() {
        assert!(TelegramNotifier::from_config(&config("https://api.telegram.org")).is_ok());
    }

    #[test]
    fn send_url_strips_trailing_slash() {
        assert_eq!(
            send_message_url("https://api.telegram.org/", "1:x"),
            "https://api.telegram.org/bot1:x/sendMessage"
        );
    }

    #[test]
    fn message_serializes_to_json() {
        let msg = TelegramNotifier::build_message(42, "hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["chat_id"], 42);
        assert_eq!(json["text"], "hello");
        assert_eq!(json["disable_web_page_preview"], true);
    }

    #[tokio::test]
    async fn notify_posts_to_send_message() {
        let (url, server) = serve_once("HTTP/1.1 200 OK", r#"{"ok":true,"result":{}}"#).await;
        let notifier = local_notifier(&url);

        notifier.notify(42, "subscription expired").await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /bot123:abc/sendMessage "));
        assert!(request.contains(r#""chat_id":42"#));
        assert!(request.contains("subscription expired"));
    }

    #[tokio::test]
    async fn non_success_status_is_api_error() {
        let (url, server) = serve_once(
            "HTTP/1.1 403 Forbidden",
            r#"{"ok":false,"description":"Forbidden: bot was blocked by the user"}"#,
        )
        .await;
        let notifier = local_notifier(&url);

        let err = notifier.notify(42, "hi").await.unwrap_err();
        match err {
            NotifyError::ApiError { status, body } => {
                assert_eq!(status, 403);
                assert!(body.contains("blocked"));
            }
            other => panic!("expected ApiError, got {other}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn ok_false_is_rejected() {
        let (url, server) =
            serve_once("HTTP/1.1 200 OK", r#"{"ok":false,"description":"chat not found"}"#).await;
        let notifier = local_notifier(&url);

        let err = notifier.notify(42, "hi").await.unwrap_err();
        assert!(matches!(err, NotifyError::Rejected(ref d) if d == "chat not found"));
        server.await.unwrap();
    }
}
