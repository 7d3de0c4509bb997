//! Canned-response client for tests.
//!
//! Mirrors the [`crate::Client`] invoke surface over a fixed op → result
//! mapping, so callers can exercise invocation flow without a transport.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::anomaly::{Anomaly, Outcome};
use crate::client::OpRequest;

pub struct DoubleClient {
    ops: HashMap<String, Value>,
}

impl DoubleClient {
    /// Builds a double serving the given op → canned-result mapping.
    pub fn new(ops: HashMap<String, Value>) -> Self {
        Self { ops }
    }

    pub fn invoke_async(&self, op_request: &OpRequest) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let outcome = match self.ops.get(&op_request.op) {
            Some(result) => Ok(result.clone()),
            None => Err(Anomaly::unsupported_operation()),
        };
        let _ = tx.send(outcome);
        rx
    }

    pub async fn invoke(&self, op_request: &OpRequest) -> Outcome {
        match self.invoke_async(op_request).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Anomaly::unsupported_operation()),
        }
    }
}
