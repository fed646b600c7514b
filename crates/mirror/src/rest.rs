//! Mirror backed by a Firebase Realtime Database style REST endpoint.
//!
//! Each key is a child of `base_url`; a value is replaced with
//! `PUT {base_url}/{key}.json` carrying a JSON string body.

use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::debug;

use crate::error::MirrorError;
use crate::{MirrorFuture, StateMirror};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Characters left as-is in a path segment or query value.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// REST state mirror.
pub struct RestMirror {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl RestMirror {
    /// Creates a mirror rooted at `base_url`, optionally authenticating
    /// every request with `auth_token`.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, MirrorError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.filter(|t| !t.is_empty()),
        })
    }

    /// URL of the value stored under `key`.
    fn value_url(&self, key: &str) -> String {
        let path = key
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| utf8_percent_encode(s, COMPONENT).to_string())
            .collect::<Vec<_>>()
            .join("/");

        let mut url = format!("{}/{path}.json", self.base_url);
        if let Some(token) = &self.auth_token {
            url.push_str("?auth=");
            url.push_str(&utf8_percent_encode(token, COMPONENT).to_string());
        }
        url
    }
}

impl StateMirror for RestMirror {
    fn set_value(&self, key: &str, value: &str) -> MirrorFuture<'_> {
        let url = self.value_url(key);
        let value = value.to_string();
        Box::pin(async move {
            let resp = self.http.put(&url).json(&value).send().await?;
            let status = resp.status();

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(MirrorError::Api {
                    status: status.as_u16(),
                    body,
                });
            }

            debug!(value = %value, "mirror value stored");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn value_url_without_token() {
        let mirror = RestMirror::new("https://example.firebaseio.com/", None).unwrap();
        assert_eq!(
            mirror.value_url("window_state"),
            "https://example.firebaseio.com/window_state.json"
        );
    }

    #[test]
    fn value_url_encodes_segments_and_token() {
        let mirror =
            RestMirror::new("https://example.firebaseio.com", Some("a b/c".into())).unwrap();
        assert_eq!(
            mirror.value_url("home/living room"),
            "https://example.firebaseio.com/home/living%20room.json?auth=a%20b%2Fc"
        );
    }

    #[test]
    fn empty_token_is_ignored() {
        let mirror = RestMirror::new("http://localhost", Some(String::new())).unwrap();
        assert_eq!(mirror.value_url("link_state"), "http://localhost/link_state.json");
    }

    /// Serves one request with `status` and returns the raw request text.
    async fn serve_once(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nno"
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (base, server)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
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

    #[tokio::test]
    async fn put_sends_json_string() {
        let (base, server) = serve_once("200 OK").await;
        let mirror = RestMirror::new(&base, Some("secret".into())).unwrap();

        mirror.set_value("window_state", "OPEN").await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("PUT /window_state.json?auth=secret HTTP/1.1"));
        assert!(request.ends_with("\"OPEN\""));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (base, server) = serve_once("401 Unauthorized").await;
        let mirror = RestMirror::new(&base, None).unwrap();

        let err = mirror.set_value("link_state", "ready").await.unwrap_err();
        assert!(matches!(err, MirrorError::Api { status: 401, ref body } if body == "no"));
        server.await.unwrap();
    }
}
