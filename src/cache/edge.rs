//! Edge-cache purge collaborator.
//!
//! After a local purge the engine asks the edge tier to drop its copies too.
//! The call is best-effort: callers log failures and move on.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderValue, header};
use reqwest::{Client, Url};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum EdgePurgeError {
    #[error("edge purge request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("edge purge rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid edge api token: {0}")]
    InvalidToken(String),
}

/// Something that can evict content from an edge cache.
#[async_trait]
pub trait EdgePurger: Send + Sync {
    async fn purge_tags(&self, tags: &[String]) -> Result<(), EdgePurgeError>;

    async fn purge_everything(&self) -> Result<(), EdgePurgeError>;
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum PurgeBody<'a> {
    Tags { tags: &'a [String] },
    Everything { purge_everything: bool },
}

/// Posts purge requests as JSON to a CDN purge endpoint.
#[derive(Debug, Clone)]
pub struct HttpEdgePurger {
    client: Client,
    url: Url,
    authorization: Option<HeaderValue>,
}

impl HttpEdgePurger {
    pub fn new(url: Url, api_token: Option<&str>, timeout: Duration) -> Result<Self, EdgePurgeError> {
        let authorization = api_token
            .map(|token| {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| EdgePurgeError::InvalidToken(err.to_string()))?;
                value.set_sensitive(true);
                Ok::<_, EdgePurgeError>(value)
            })
            .transpose()?;

        let client = Client::builder()
            .user_agent(concat!("unicache/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url,
            authorization,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn send(&self, body: PurgeBody<'_>) -> Result<(), EdgePurgeError> {
        let mut request = self.client.post(self.url.clone()).json(&body);
        if let Some(authorization) = &self.authorization {
            request = request.header(header::AUTHORIZATION, authorization.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EdgePurgeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(status = status.as_u16(), "edge purge accepted");
        Ok(())
    }
}

#[async_trait]
impl EdgePurger for HttpEdgePurger {
    #[instrument(skip_all, fields(url = %self.url, tags = tags.len()))]
    async fn purge_tags(&self, tags: &[String]) -> Result<(), EdgePurgeError> {
        self.send(PurgeBody::Tags { tags }).await
    }

    #[instrument(skip_all, fields(url = %self.url))]
    async fn purge_everything(&self) -> Result<(), EdgePurgeError> {
        self.send(PurgeBody::Everything {
            purge_everything: true,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, extract::State, http::HeaderMap, http::StatusCode, routing::post};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;

    type Seen = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn record(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        seen.lock().expect("seen lock").push((auth, body));
        StatusCode::OK
    }

    async fn serve(router: Router) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("test server");
        });
        Url::parse(&format!("http://{addr}/purge")).expect("valid url")
    }

    #[tokio::test]
    async fn posts_tags_with_bearer_token() {
        let seen: Seen = Arc::default();
        let url = serve(Router::new().route("/purge", post(record)).with_state(seen.clone())).await;
        let purger = HttpEdgePurger::new(url, Some("secret"), Duration::from_secs(5))
            .expect("client builds");

        purger
            .purge_tags(&["leaderboard".to_string(), "hackathon:7".to_string()])
            .await
            .expect("purge accepted");
        purger.purge_everything().await.expect("purge accepted");

        let seen = seen.lock().expect("seen lock").clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.as_deref(), Some("Bearer secret"));
        assert_eq!(seen[0].1, json!({"tags": ["leaderboard", "hackathon:7"]}));
        assert_eq!(seen[1].1, json!({"purge_everything": true}));
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let router = Router::new().route(
            "/purge",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let url = serve(router).await;
        let purger = HttpEdgePurger::new(url, None, Duration::from_secs(5)).expect("client builds");

        let err = purger.purge_everything().await.unwrap_err();
        match err {
            EdgePurgeError::Rejected { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn token_with_newline_is_invalid() {
        let url = Url::parse("http://localhost/purge").expect("valid url");
        let err = HttpEdgePurger::new(url, Some("bad\ntoken"), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, EdgePurgeError::InvalidToken(_)));
    }
}
