use serde::{Deserialize, Serialize};
use std::fmt;

/// A settled invoice as reported by the node's payment feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub label: String,
    /// Hex encoded 32 byte payment preimage.
    pub preimage: String,
    pub amount_msat: u64,
    /// Monotonic index assigned by the node, used to resume the feed.
    pub pay_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    InFlight,
    Delivered,
    Abandoned,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Delivered | JobState::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::Delivered => "delivered",
            JobState::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an invoice expiry is handed to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryUnit {
    Seconds,
    #[default]
    Days,
}

impl ExpiryUnit {
    pub fn to_seconds(self, value: u64) -> u64 {
        match self {
            ExpiryUnit::Seconds => value,
            ExpiryUnit::Days => value.saturating_mul(24 * 60 * 60),
        }
    }
}

/// Parameters for one invoice that is about to be created on the node and
/// uploaded to the ledger service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceDraft {
    pub amount_sat: u64,
    pub label: String,
    pub description: String,
    pub expiry: u64,
    pub expiry_unit: ExpiryUnit,
}

impl InvoiceDraft {
    /// Amount in the node's `"<n>sat"` notation.
    pub fn amount_param(&self) -> String {
        format!("{}sat", self.amount_sat)
    }

    /// Expiry as the node expects it: a bare number of seconds, or `"<n>d"`.
    pub fn expiry_param(&self) -> serde_json::Value {
        match self.expiry_unit {
            ExpiryUnit::Seconds => serde_json::Value::from(self.expiry),
            ExpiryUnit::Days => serde_json::Value::from(format!("{}d", self.expiry)),
        }
    }

    pub fn expiry_seconds(&self) -> u64 {
        self.expiry_unit.to_seconds(self.expiry)
    }
}
