use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use tracing::debug;
use url::Url;

use crate::config;

use super::provider::{GetMessageInput, Message, ProviderError, SendMessageInput, WebhookProvider};

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// key: webhook-provider-http -> REST client for the webhook delivery broker
#[derive(Clone)]
pub struct HttpWebhookProvider {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpWebhookProvider {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("webhook provider url `{base_url}` cannot be a base"));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(
            config::WEBHOOK_PROVIDER_URL.as_str(),
            config::WEBHOOK_PROVIDER_TOKEN.clone(),
            Duration::from_secs(*config::WEBHOOK_PROVIDER_TIMEOUT_SECS),
        )
    }

    /// Namespace goes in as a single percent-encoded path segment.
    fn messages_url(&self, namespace: &str) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Transport(anyhow!("provider url cannot be a base")))?
            .pop_if_empty()
            .extend(["api", "v1", "namespaces", namespace, "messages"]);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl WebhookProvider for HttpWebhookProvider {
    async fn get_message(&self, input: GetMessageInput) -> Result<Message, ProviderError> {
        let mut url = self.messages_url(&input.namespace)?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Transport(anyhow!("provider url cannot be a base")))?
            .push(&input.event_id.to_string());
        if input.expand_delivery_status {
            url.query_pairs_mut().append_pair("expand", "delivery_status");
        }

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(transport_error)?;
        decode_message(response).await
    }

    async fn send_message(&self, input: SendMessageInput) -> Result<Message, ProviderError> {
        let url = self.messages_url(&input.namespace)?;
        let idempotency_key = input.idempotency_key();
        debug!(
            namespace = %input.namespace,
            event_id = %input.event_id,
            %idempotency_key,
            "sending webhook message"
        );

        let response = self
            .authorize(self.client.post(url))
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(&input)
            .send()
            .await
            .map_err(transport_error)?;
        decode_message(response).await
    }
}

async fn decode_message(response: Response) -> Result<Message, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<Message>()
            .await
            .map_err(|err| ProviderError::Transport(anyhow!("invalid provider response: {err}")));
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    Err(classify_status(status, message, retry_after))
}

/// Maps provider HTTP statuses onto the gateway's error classes.
fn classify_status(
    status: StatusCode,
    message: String,
    retry_after: Option<Duration>,
) -> ProviderError {
    match status.as_u16() {
        404 => ProviderError::NotFound(message),
        425 => ProviderError::MessageNotReady(message),
        400 | 403 | 410 | 422 => ProviderError::Unrecoverable(message),
        429 | 500..=599 => ProviderError::Retryable {
            message,
            retry_after,
        },
        _ => ProviderError::Transport(anyhow!(message)),
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    ProviderError::Retryable {
        message: err.to_string(),
        retry_after: None,
    }
}
