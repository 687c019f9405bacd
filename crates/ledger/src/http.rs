use super::{LedgerClient, LedgerError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// HTTP Basic credentials sent on every ledger service call.
#[derive(Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct HttpLedgerClient {
    pub base_url: String,
    pub notify_url: String,
    auth: BasicAuth,
    http_client: reqwest::Client,
}

impl HttpLedgerClient {
    /// Builds a client for `base_url`. Paid notifications go to `notify_url`
    /// when given, `<base_url>/invoice/paid` otherwise. Every request is
    /// bounded by `timeout`.
    pub fn new(
        base_url: String,
        notify_url: Option<String>,
        auth: BasicAuth,
        timeout: Duration,
    ) -> Result<Arc<Self>, LedgerError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let notify_url = notify_url.unwrap_or_else(|| format!("{}/invoice/paid", base_url));

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Arc::new(Self {
            base_url,
            notify_url,
            auth,
            http_client,
        }))
    }

    async fn post_text(&self, url: &str, body: &str) -> Result<(), LedgerError> {
        let resp = self
            .http_client
            .post(url)
            .basic_auth(&self.auth.username, Some(&self.auth.password))
            .header("Content-Type", "text/plain")
            .body(body.to_string())
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn invoice_count(&self) -> Result<u64, LedgerError> {
        let count_url = format!("{}/invoice/count", self.base_url);

        let resp = self
            .http_client
            .get(&count_url)
            .basic_auth(&self.auth.username, Some(&self.auth.password))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Status { status, body });
        }

        let body = resp.text().await?;
        let count = body
            .trim()
            .parse::<i64>()
            .map_err(|_| LedgerError::InvalidCount(body.clone()))?;

        // The service counts with a signed integer; nothing below zero is meaningful.
        Ok(count.max(0) as u64)
    }

    async fn upload_invoice(&self, bolt11: &str) -> Result<(), LedgerError> {
        let upload_url = format!("{}/invoice", self.base_url);
        self.post_text(&upload_url, bolt11).await?;
        tracing::debug!("Invoice uploaded to ledger service");
        Ok(())
    }

    async fn notify_paid(&self, preimage: &str) -> Result<(), LedgerError> {
        self.post_text(&self.notify_url, preimage).await
    }
}
