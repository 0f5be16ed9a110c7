//! Ledger gateway REST client.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::codec::decode_hex_payload;
use super::error::{classify_revert, LedgerError};
use super::traits::Ledger;
use super::types::*;
use crate::config::LedgerConfig;

#[derive(Debug, Deserialize)]
struct BlockResponse {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarginResponse {
    initial: String,
    maintenance: String,
    current: String,
}

#[derive(Debug, Deserialize)]
struct OutstandingResponse {
    amount: String,
}

#[derive(Debug, Deserialize)]
struct EstimateResponse {
    gas: u64,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    status: TxStatus,
    block: Option<u64>,
    gas_used: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClosureBody {
    position_id: String,
    counterparty: String,
    sender: String,
    amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    gas_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gas_price: Option<String>,
}

impl ClosureBody {
    fn new(call: &ClosureCall, budget: Option<GasBudget>) -> Self {
        Self {
            position_id: call.position_id.to_string(),
            counterparty: call.counterparty.to_string(),
            sender: call.sender.to_string(),
            amount: call.amount.to_string(),
            gas_limit: budget.map(|b| b.gas_limit),
            gas_price: budget.map(|b| b.gas_price.to_string()),
        }
    }
}

fn parse_amount(field: &str, raw: &str) -> Result<u128, LedgerError> {
    raw.parse()
        .map_err(|_| LedgerError::Schema(format!("{} is not an unsigned integer: {}", field, raw)))
}

/// REST client for the ledger gateway.
pub struct HttpLedgerClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    confirmation_poll: Duration,
    confirmation_timeout: Duration,
}

impl HttpLedgerClient {
    /// Create a new gateway client from configuration.
    pub fn new(config: &LedgerConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = format!(
            "{}/{}",
            config.gateway_url.trim_end_matches('/'),
            urlencoding::encode(&config.network)
        );

        Ok(Self {
            http,
            base_url,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            confirmation_poll: Duration::from_millis(config.confirmation_poll_ms),
            confirmation_timeout: Duration::from_secs(config.confirmation_timeout_secs),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn signed_query(&self) -> String {
        let query = format!("timestamp={}", Self::timestamp());
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    fn position_url(&self, id: &PositionId, counterparty: &Address, leaf: &str) -> String {
        format!("{}/positions/{}/{}/{}", self.base_url, id, counterparty, leaf)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, LedgerError> {
        let response = self.http.get(url).send().await?;
        read_json(response).await
    }

    async fn post_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &ClosureBody,
    ) -> Result<T, LedgerError> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query());
        let response = self
            .http
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .json(body)
            .send()
            .await?;
        read_json(response).await
    }

    fn confirmation(&self, tx_hash: String) -> ConfirmationFuture {
        let http = self.http.clone();
        let url = format!("{}/transactions/{}", self.base_url, tx_hash);
        let poll = self.confirmation_poll;
        let deadline = Instant::now() + self.confirmation_timeout;

        Box::pin(async move {
            loop {
                let response = http.get(&url).send().await?;
                let tx: TransactionResponse = read_json(response).await?;
                match tx.status {
                    TxStatus::Confirmed => {
                        return Ok(ClosureReceipt {
                            tx_hash,
                            block_number: tx.block,
                            gas_used: tx.gas_used,
                        })
                    }
                    TxStatus::Failed => {
                        return Err(classify_revert(
                            tx.error.as_deref().unwrap_or("transaction failed"),
                        ))
                    }
                    TxStatus::Pending => {
                        if Instant::now() >= deadline {
                            return Err(LedgerError::ConfirmationTimeout(tx_hash));
                        }
                        debug!(%tx_hash, "Transaction pending");
                        tokio::time::sleep(poll).await;
                    }
                }
            }
        })
    }
}

/// Decode a gateway response, turning error bodies into classified errors.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, LedgerError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => classify_revert(&err.error),
            Err(_) if status.is_server_error() => {
                LedgerError::Transport(format!("gateway returned {}: {}", status, body))
            }
            Err(_) => LedgerError::Rejected(format!("gateway returned {}: {}", status, body)),
        });
    }

    serde_json::from_str(&body)
        .map_err(|e| LedgerError::Schema(format!("unexpected gateway response: {}", e)))
}

#[async_trait]
impl Ledger for HttpLedgerClient {
    #[instrument(skip(self))]
    async fn block_number(&self) -> Result<u64, LedgerError> {
        let block: BlockResponse = self.get_json(&format!("{}/block", self.base_url)).await?;
        Ok(block.number)
    }

    #[instrument(skip(self))]
    async fn list_active_positions(&self, start: u64, count: u64) -> Result<Vec<u8>, LedgerError> {
        let url = format!("{}/positions?start={}&count={}", self.base_url, start, count);
        let page: PositionsResponse = self.get_json(&url).await?;
        decode_hex_payload(page.data.as_deref())
    }

    #[instrument(skip(self), fields(position = %position_id))]
    async fn margin_levels(
        &self,
        position_id: &PositionId,
        counterparty: &Address,
    ) -> Result<MarginSnapshot, LedgerError> {
        let url = self.position_url(position_id, counterparty, "margin");
        let margin: MarginResponse = self.get_json(&url).await?;
        Ok(MarginSnapshot {
            initial: parse_amount("initial", &margin.initial)?,
            maintenance: parse_amount("maintenance", &margin.maintenance)?,
            current: parse_amount("current", &margin.current)?,
        })
    }

    #[instrument(skip(self), fields(position = %position_id))]
    async fn outstanding_amount(
        &self,
        position_id: &PositionId,
        counterparty: &Address,
    ) -> Result<u128, LedgerError> {
        let url = self.position_url(position_id, counterparty, "outstanding");
        let outstanding: OutstandingResponse = self.get_json(&url).await?;
        parse_amount("amount", &outstanding.amount)
    }

    #[instrument(skip(self, call), fields(position = %call.position_id, amount = call.amount))]
    async fn estimate_closure(&self, call: &ClosureCall) -> Result<u64, LedgerError> {
        let estimate: EstimateResponse = self
            .post_signed("/closures/estimate", &ClosureBody::new(call, None))
            .await?;
        Ok(estimate.gas)
    }

    #[instrument(skip(self, call), fields(position = %call.position_id, amount = call.amount))]
    async fn submit_closure(
        &self,
        call: &ClosureCall,
        budget: GasBudget,
    ) -> Result<PendingSubmission, LedgerError> {
        let submitted: SubmitResponse = self
            .post_signed("/closures", &ClosureBody::new(call, Some(budget)))
            .await?;
        let confirmation = self.confirmation(submitted.tx_hash.clone());
        Ok(PendingSubmission::new(submitted.tx_hash, confirmation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ID: &str = "0xb77ef4d44921f346d48c33902de3bce4a89087aad60c7373394a51092c9824f0";
    const TRADER: &str = "0xdf2db45ed0df076e5d6d302b416a5971ff5ad61f";

    fn client_for(server: &MockServer) -> HttpLedgerClient {
        let config = LedgerConfig {
            gateway_url: server.uri(),
            network: "kovan".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            confirmation_poll_ms: 10,
            confirmation_timeout_secs: 1,
            ..LedgerConfig::default()
        };
        HttpLedgerClient::new(&config).unwrap()
    }

    fn call(amount: u128) -> ClosureCall {
        ClosureCall {
            position_id: ID.parse().unwrap(),
            counterparty: TRADER.parse().unwrap(),
            sender: Address::default(),
            amount,
        }
    }

    #[tokio::test]
    async fn test_block_number() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kovan/block"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"number": 1234})))
            .mount(&server)
            .await;

        assert_eq!(client_for(&server).block_number().await.unwrap(), 1234);
    }

    #[tokio::test]
    async fn test_position_page_null_payload_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kovan/positions"))
            .and(query_param("start", "50"))
            .and(query_param("count", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": null})))
            .mount(&server)
            .await;

        let bytes = client_for(&server).list_active_positions(50, 50).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_margin_levels_parsed_from_strings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/kovan/positions/{}/{}/margin", ID, TRADER)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "initial": "300",
                "maintenance": "150",
                "current": "100"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let margin = client
            .margin_levels(&ID.parse().unwrap(), &TRADER.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(margin, MarginSnapshot::new(300, 150, 100));
    }

    #[tokio::test]
    async fn test_estimate_revert_classified_as_resource_exhaustion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/kovan/closures/estimate"))
            .and(header("X-API-KEY", "key"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "The execution failed due to an exception."
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).estimate_closure(&call(0)).await.unwrap_err();
        assert!(err.is_resource_exhaustion());
    }

    #[tokio::test]
    async fn test_submit_then_confirm() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/kovan/closures"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tx_hash": "0xabc"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/kovan/transactions/0xabc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "confirmed",
                "block": 99,
                "gas_used": 80000
            })))
            .mount(&server)
            .await;

        let budget = GasBudget {
            gas_limit: 120_000,
            gas_price: 5,
        };
        let pending = client_for(&server).submit_closure(&call(500), budget).await.unwrap();
        assert_eq!(pending.tx_hash, "0xabc");

        let receipt = pending.confirmation.await.unwrap();
        assert_eq!(receipt.block_number, Some(99));
        assert_eq!(receipt.gas_used, Some(80_000));
    }

    #[tokio::test]
    async fn test_failed_transaction_out_of_gas() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/kovan/closures"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tx_hash": "0xdef"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/kovan/transactions/0xdef"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "failed",
                "error": "out of gas"
            })))
            .mount(&server)
            .await;

        let budget = GasBudget {
            gas_limit: 21_000,
            gas_price: 5,
        };
        let pending = client_for(&server).submit_closure(&call(0), budget).await.unwrap();
        let err = pending.confirmation.await.unwrap_err();
        assert!(err.is_resource_exhaustion());
    }

    #[tokio::test]
    async fn test_server_error_without_body_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kovan/block"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server).block_number().await.unwrap_err();
        assert!(matches!(err, LedgerError::Transport(_)));
    }
}
