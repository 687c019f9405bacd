pub mod models;
pub mod parsing;

pub use models::{ExpiryUnit, InvoiceDraft, JobState, PaymentEvent};
