//! Protocol for legacy IOT devices.
//!
//! Requests are the device's native nested JSON (for example
//! `{"system":{"get_sysinfo":{}}}`), sent as-is; the protocol adds nothing
//! but the retry policy. One query at a time per transport.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Error;
use crate::protocol::{DEFAULT_RETRIES, Protocol, RETRY_BACKOFF};
use crate::transport::Transport;

/// Stateless request/response protocol over a single transport.
pub struct IotProtocol {
    transport: Mutex<Box<dyn Transport>>,
    retries: usize,
}

impl IotProtocol {
    /// Wraps a transport with the default retry budget.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(transport),
            retries: DEFAULT_RETRIES,
        }
    }

    /// Overrides the retry budget.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }
}

#[async_trait]
impl Protocol for IotProtocol {
    async fn query(&self, request: Value) -> Result<Value, Error> {
        let request = match request {
            Value::String(raw) => raw,
            other => serde_json::to_string(&other)?,
        };

        let mut transport = self.transport.lock().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match transport.send(&request).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            let exhausted = attempt >= self.retries;
            debug!(attempt, exhausted, error = %err, "query attempt failed");
            match &err {
                Error::Connection(_) if !exhausted => {
                    // Retry immediately; the transport reconnects itself.
                }
                Error::Timeout(_) | Error::Retryable(_) if !exhausted => {
                    transport.reset().await;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                _ => {
                    transport.reset().await;
                    return Err(err);
                }
            }
        }
    }

    async fn close(&self) {
        self.transport.lock().await.close().await;
    }
}
