//! HTTP implementation of the confirmations endpoint.
//!
//! Requires the `http-client` feature for real requests. Without it every
//! call fails with a transport error.

use super::{
    ConfirmationsEndpoint, EndpointError, PaymentTokenResponse, RedeemPaymentTokensResponse,
    SignedTokensResponse,
};
use crate::confirmation::ConfirmationInfo;
use crate::tokens::UnblindedPaymentToken;
use crate::wallet::WalletInfo;
use adrewards_privacy::BlindedToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Where the confirmations backend lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEndpointConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl HttpEndpointConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

#[cfg_attr(not(feature = "http-client"), allow(dead_code))]
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignTokensRequest<'a> {
    blinded_tokens: &'a [BlindedToken],
}

#[cfg_attr(not(feature = "http-client"), allow(dead_code))]
#[derive(Deserialize)]
struct NonceResponse {
    nonce: String,
}

#[cfg_attr(not(feature = "http-client"), allow(dead_code))]
#[derive(Deserialize)]
struct CaptchaResponse {
    captcha_id: String,
}

/// Confirmations backend over HTTP.
pub struct HttpConfirmationsEndpoint {
    config: HttpEndpointConfig,
    #[cfg(feature = "http-client")]
    client: reqwest::Client,
}

impl HttpConfirmationsEndpoint {
    #[cfg(feature = "http-client")]
    pub fn new(config: HttpEndpointConfig) -> Result<Self, EndpointError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EndpointError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    /// Stub when the `http-client` feature is disabled.
    #[cfg(not(feature = "http-client"))]
    pub fn new(config: HttpEndpointConfig) -> Result<Self, EndpointError> {
        Ok(Self { config })
    }

    pub fn config(&self) -> &HttpEndpointConfig {
        &self.config
    }
}

#[cfg(not(feature = "http-client"))]
fn unavailable<T>() -> Result<T, EndpointError> {
    Err(EndpointError::Transport(
        "HTTP client not compiled - enable the 'http-client' feature".to_string(),
    ))
}

#[cfg(feature = "http-client")]
impl HttpConfirmationsEndpoint {
    /// Join path segments onto the base URL, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url, EndpointError> {
        let mut url = reqwest::Url::parse(&self.config.base_url)
            .map_err(|e| EndpointError::Transport(format!("invalid base URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| EndpointError::Transport("base URL cannot have a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> EndpointError {
        if e.is_timeout() {
            EndpointError::Transport(format!(
                "request timed out after {}s",
                self.config.timeout_secs
            ))
        } else {
            EndpointError::Transport(format!("request failed: {}", e))
        }
    }

    /// Send and read the body, failing on any status outside `expected`.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        expected: &[u16],
    ) -> Result<(u16, String), EndpointError> {
        let response = request.send().await.map_err(|e| self.map_reqwest_error(e))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| EndpointError::Transport(format!("failed to read response: {}", e)))?;

        if expected.contains(&status) {
            return Ok((status, body));
        }
        if status == 401 {
            if let Ok(captcha) = serde_json::from_str::<CaptchaResponse>(&body) {
                return Err(EndpointError::CaptchaRequired {
                    captcha_id: captcha.captcha_id,
                });
            }
        }
        tracing::debug!(status, body = %body, "Unexpected confirmations response");
        Err(EndpointError::Status { status })
    }
}

#[cfg(feature = "http-client")]
fn parse<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, EndpointError> {
    serde_json::from_str(body).map_err(|e| EndpointError::InvalidResponse(e.to_string()))
}

#[cfg(feature = "http-client")]
#[async_trait]
impl ConfirmationsEndpoint for HttpConfirmationsEndpoint {
    async fn request_signed_tokens(
        &self,
        wallet: &WalletInfo,
        blinded: &[BlindedToken],
    ) -> Result<String, EndpointError> {
        let url = self.url(&["v1", "confirmation", "token", &wallet.payment_id])?;
        let body = serde_json::to_vec(&SignTokensRequest {
            blinded_tokens: blinded,
        })
        .map_err(|e| EndpointError::InvalidResponse(format!("unencodable request: {}", e)))?;
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body);
        let (_, body) = self.send(request, &[200, 201]).await?;
        let response: NonceResponse = parse(&body)?;
        if response.nonce.is_empty() {
            return Err(EndpointError::InvalidResponse("missing nonce".to_string()));
        }
        Ok(response.nonce)
    }

    async fn get_signed_tokens(
        &self,
        wallet: &WalletInfo,
        nonce: &str,
    ) -> Result<SignedTokensResponse, EndpointError> {
        let mut url = self.url(&["v1", "confirmation", "token", &wallet.payment_id])?;
        url.query_pairs_mut().append_pair("nonce", nonce);
        let (_, body) = self.send(self.client.get(url), &[200]).await?;
        parse(&body)
    }

    async fn create_confirmation(
        &self,
        confirmation: &ConfirmationInfo,
    ) -> Result<(), EndpointError> {
        let credential = confirmation
            .credential
            .as_deref()
            .ok_or_else(|| EndpointError::InvalidResponse("confirmation has no credential".into()))?;
        let payload = crate::credential::ConfirmationCredential::decode(credential)
            .map(|decoded| decoded.payload)
            .unwrap_or_default();
        let url = self.url(&["v1", "confirmation", &confirmation.id, credential])?;
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(payload);
        // 409 means the confirmation already exists, which is what a retry wants.
        self.send(request, &[200, 201, 409]).await?;
        Ok(())
    }

    async fn fetch_payment_token(
        &self,
        confirmation_id: &str,
    ) -> Result<PaymentTokenResponse, EndpointError> {
        let url = self.url(&["v1", "confirmation", confirmation_id, "paymentToken"])?;
        let (_, body) = self.send(self.client.get(url), &[200]).await?;
        parse(&body)
    }

    async fn redeem_payment_tokens(
        &self,
        wallet: &WalletInfo,
        tokens: &[UnblindedPaymentToken],
    ) -> Result<RedeemPaymentTokensResponse, EndpointError> {
        let request = crate::credential::PaymentRedemptionRequest::new(wallet, tokens)
            .ok_or_else(|| {
                EndpointError::InvalidResponse("payment tokens could not be encoded".into())
            })?;
        let url = self.url(&["v1", "confirmation", "payment", &wallet.payment_id])?;
        let (_, body) = self
            .send(self.client.put(url).json(&request), &[200])
            .await?;
        if body.trim().is_empty() {
            return Ok(RedeemPaymentTokensResponse::default());
        }
        parse(&body)
    }
}

#[cfg(not(feature = "http-client"))]
#[async_trait]
impl ConfirmationsEndpoint for HttpConfirmationsEndpoint {
    async fn request_signed_tokens(
        &self,
        _wallet: &WalletInfo,
        _blinded: &[BlindedToken],
    ) -> Result<String, EndpointError> {
        unavailable()
    }

    async fn get_signed_tokens(
        &self,
        _wallet: &WalletInfo,
        _nonce: &str,
    ) -> Result<SignedTokensResponse, EndpointError> {
        unavailable()
    }

    async fn create_confirmation(
        &self,
        _confirmation: &ConfirmationInfo,
    ) -> Result<(), EndpointError> {
        unavailable()
    }

    async fn fetch_payment_token(
        &self,
        _confirmation_id: &str,
    ) -> Result<PaymentTokenResponse, EndpointError> {
        unavailable()
    }

    async fn redeem_payment_tokens(
        &self,
        _wallet: &WalletInfo,
        _tokens: &[UnblindedPaymentToken],
    ) -> Result<RedeemPaymentTokensResponse, EndpointError> {
        unavailable()
    }
}
