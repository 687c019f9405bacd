use super::{NodeError, NodeInfo, NodeRpc, PaymentEventSource};
use async_trait::async_trait;
use ln_bridge_core::{InvoiceDraft, PaymentEvent};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// `waitanyinvoice` error code for an elapsed `timeout`.
const WAIT_TIMEOUT_CODE: i64 = 904;

/// Core Lightning JSON-RPC client speaking over the node's unix socket.
///
/// Each call opens its own connection, so one hung request never blocks
/// another.
pub struct ClnRpcClient {
    pub socket_path: PathBuf,
    timeout: Duration,
    wait_window: Duration,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    bolt11: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Msat {
    Number(u64),
    Text(String),
}

impl Msat {
    fn value(&self) -> Result<u64, NodeError> {
        match self {
            Msat::Number(n) => Ok(*n),
            Msat::Text(s) => s
                .trim_end_matches("msat")
                .parse()
                .map_err(|_| NodeError::Protocol(format!("bad msat amount {s:?}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PaidInvoice {
    label: String,
    status: String,
    pay_index: Option<u64>,
    payment_preimage: Option<String>,
    amount_received_msat: Option<Msat>,
}

impl ClnRpcClient {
    /// `timeout` bounds ordinary calls; `wait_window` is handed to
    /// `waitanyinvoice` so the feed wakes up periodically even when idle.
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration, wait_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            socket_path: socket_path.into(),
            timeout,
            wait_window,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<T, NodeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = tokio::time::timeout(timeout, self.round_trip(&request))
            .await
            .map_err(|_| NodeError::Timeout)??;

        if let Some(err) = response.error {
            return Err(NodeError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        let result = response
            .result
            .ok_or_else(|| NodeError::Protocol(format!("{method}: response without result")))?;
        serde_json::from_value(result).map_err(|e| NodeError::Protocol(format!("{method}: {e}")))
    }

    async fn round_trip(&self, request: &Value) -> Result<RpcResponse, NodeError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| NodeError::Connect(format!("{}: {e}", self.socket_path.display())))?;

        let payload = serde_json::to_vec(request).map_err(|e| NodeError::Protocol(e.to_string()))?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| NodeError::Connect(e.to_string()))?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| NodeError::Connect(e.to_string()))?;
            if n == 0 {
                return Err(NodeError::Protocol(
                    "connection closed before a full response".to_string(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);

            // Responses are not length prefixed; keep reading until one full
            // JSON object parses.
            let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<RpcResponse>();
            match values.next() {
                Some(Ok(response)) => return Ok(response),
                Some(Err(e)) if e.is_eof() => continue,
                Some(Err(e)) => return Err(NodeError::Protocol(e.to_string())),
                None => continue,
            }
        }
    }
}

#[async_trait]
impl NodeRpc for ClnRpcClient {
    async fn create_invoice(&self, draft: &InvoiceDraft) -> Result<String, NodeError> {
        let params = json!({
            "amount_msat": draft.amount_param(),
            "label": draft.label,
            "description": draft.description,
            "expiry": draft.expiry_param(),
        });
        let invoice: InvoiceResponse = self.call("invoice", params, self.timeout).await?;
        tracing::debug!(label = %draft.label, "Invoice created on node");
        Ok(invoice.bolt11)
    }

    async fn get_info(&self) -> Result<NodeInfo, NodeError> {
        self.call("getinfo", json!({}), self.timeout).await
    }
}

#[async_trait]
impl PaymentEventSource for ClnRpcClient {
    async fn next_payment(&self, after: u64) -> Result<PaymentEvent, NodeError> {
        let params = json!({
            "lastpay_index": after,
            "timeout": self.wait_window.as_secs(),
        });
        let deadline = self.wait_window + self.timeout;

        let paid: PaidInvoice = match self.call("waitanyinvoice", params, deadline).await {
            Err(NodeError::Rpc { code, .. }) if code == WAIT_TIMEOUT_CODE => {
                return Err(NodeError::WaitTimedOut)
            }
            other => other?,
        };

        if paid.status != "paid" {
            return Err(NodeError::Protocol(format!(
                "invoice {} reported with status {}",
                paid.label, paid.status
            )));
        }
        let pay_index = paid
            .pay_index
            .ok_or_else(|| NodeError::Protocol(format!("invoice {} has no pay_index", paid.label)))?;
        // A malformed invoice must not stall the feed at its pay index: a
        // missing preimage is passed on empty and rejected by the consumer,
        // an unreadable amount is recorded as zero.
        let preimage = paid.payment_preimage.unwrap_or_else(|| {
            tracing::warn!(label = %paid.label, pay_index, "Paid invoice without payment_preimage");
            String::new()
        });
        let amount_msat = match paid.amount_received_msat.as_ref().map(Msat::value) {
            Some(Ok(amount)) => amount,
            Some(Err(e)) => {
                tracing::warn!(
                    label = %paid.label,
                    pay_index,
                    error = %e,
                    "Unreadable payment amount, recording 0"
                );
                0
            }
            None => 0,
        };

        Ok(PaymentEvent {
            label: paid.label,
            preimage,
            amount_msat,
            pay_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ln_bridge_core::ExpiryUnit;
    use tempfile::TempDir;
    use tokio::net::UnixListener;
    use tokio::task::JoinHandle;

    /// Serves one request on a fresh socket, replying with `response` split
    /// across two writes, and yields the request as parsed JSON.
    fn serve_once(dir: &TempDir, response: Value) -> (PathBuf, JoinHandle<Value>) {
        let path = dir.path().join("lightning-rpc");
        let listener = UnixListener::bind(&path).unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let request = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if let Ok(v) = serde_json::from_slice::<Value>(&buf) {
                    break v;
                }
            };

            let mut reply = serde_json::to_vec(&response).unwrap();
            reply.extend_from_slice(b"\n\n");
            let (head, tail) = reply.split_at(reply.len() / 2);
            socket.write_all(head).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(tail).await.unwrap();
            request
        });

        (path, handle)
    }

    fn client(path: PathBuf) -> Arc<ClnRpcClient> {
        ClnRpcClient::new(path, Duration::from_secs(5), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn invoice_sends_draft_and_returns_bolt11() {
        let dir = TempDir::new().unwrap();
        let (path, server) = serve_once(
            &dir,
            json!({"jsonrpc": "2.0", "id": 1, "result": {"bolt11": "lnbc200n1test", "payment_hash": "00"}}),
        );

        let draft = InvoiceDraft {
            amount_sat: 20,
            label: "label-1".to_string(),
            description: "pay2.email".to_string(),
            expiry: 9,
            expiry_unit: ExpiryUnit::Days,
        };
        let bolt11 = client(path).create_invoice(&draft).await.unwrap();
        assert_eq!(bolt11, "lnbc200n1test");

        let request = server.await.unwrap();
        assert_eq!(request["method"], "invoice");
        assert_eq!(request["params"]["amount_msat"], "20sat");
        assert_eq!(request["params"]["label"], "label-1");
        assert_eq!(request["params"]["expiry"], "9d");
    }

    #[tokio::test]
    async fn rpc_error_is_surfaced() {
        let dir = TempDir::new().unwrap();
        let (path, _server) = serve_once(
            &dir,
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": 900, "message": "Duplicate label"}}),
        );

        let draft = InvoiceDraft {
            amount_sat: 20,
            label: "dup".to_string(),
            description: "d".to_string(),
            expiry: 60,
            expiry_unit: ExpiryUnit::Seconds,
        };
        let err = client(path).create_invoice(&draft).await.unwrap_err();
        assert!(matches!(err, NodeError::Rpc { code: 900, .. }));
    }

    #[tokio::test]
    async fn waitanyinvoice_maps_paid_invoice() {
        let dir = TempDir::new().unwrap();
        let preimage = "11".repeat(32);
        let (path, server) = serve_once(
            &dir,
            json!({"jsonrpc": "2.0", "id": 1, "result": {
                "label": "inv-7",
                "status": "paid",
                "pay_index": 8,
                "payment_preimage": preimage,
                "amount_received_msat": "20000msat",
            }}),
        );

        let event = client(path).next_payment(7).await.unwrap();
        assert_eq!(event.label, "inv-7");
        assert_eq!(event.pay_index, 8);
        assert_eq!(event.amount_msat, 20_000);
        assert_eq!(event.preimage, "11".repeat(32));

        let request = server.await.unwrap();
        assert_eq!(request["method"], "waitanyinvoice");
        assert_eq!(request["params"]["lastpay_index"], 7);
    }

    #[tokio::test]
    async fn waitanyinvoice_timeout_code_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let (path, _server) = serve_once(
            &dir,
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": 904, "message": "Timed out"}}),
        );

        let err = client(path).next_payment(0).await.unwrap_err();
        assert!(matches!(err, NodeError::WaitTimedOut));
    }

    #[tokio::test]
    async fn malformed_paid_invoice_still_yields_its_pay_index() {
        let dir = TempDir::new().unwrap();
        let (path, _server) = serve_once(
            &dir,
            json!({"jsonrpc": "2.0", "id": 1, "result": {
                "label": "inv-9",
                "status": "paid",
                "pay_index": 9,
                "amount_received_msat": "lots",
            }}),
        );

        let event = client(path).next_payment(8).await.unwrap();
        assert_eq!(event.pay_index, 9);
        assert_eq!(event.amount_msat, 0);
        assert!(event.preimage.is_empty());
    }

    #[tokio::test]
    async fn getinfo_returns_node_identity() {
        let dir = TempDir::new().unwrap();
        let (path, server) = serve_once(
            &dir,
            json!({"jsonrpc": "2.0", "id": 1, "result": {
                "id": "02abc",
                "alias": "bridge-node",
                "blockheight": 840000,
                "num_peers": 3,
            }}),
        );

        let info = client(path).get_info().await.unwrap();
        assert_eq!(info.id, "02abc");
        assert_eq!(info.alias.as_deref(), Some("bridge-node"));
        assert_eq!(info.blockheight, 840_000);
        assert_eq!(server.await.unwrap()["method"], "getinfo");
    }

    #[tokio::test]
    async fn missing_socket_is_connect_error() {
        let dir = TempDir::new().unwrap();
        let err = client(dir.path().join("absent"))
            .next_payment(0)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Connect(_)));
    }
}
