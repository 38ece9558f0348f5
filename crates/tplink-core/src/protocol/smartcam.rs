//! Protocol for camera-dialect SMART devices.
//!
//! Cameras speak the Smart semantics through renamed wrappers: single
//! requests become `get`/`set`/`do` envelopes keyed by a snake-cased
//! section name, `multipleRequest` passes through unchanged, and child
//! devices behind a hub are reached via `controlChild`.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::{Error, SmartErrorCode};
use crate::protocol::smart::{Dialect, Inner, SmartProtocol, envelope_code, map_code};
use crate::protocol::{Protocol, RETRY_BACKOFF};
use crate::transport::Transport;

/// Method names that use the `do` wrapper despite their `get` prefix.
const FORCE_DO_METHODS: &[&str] = &["getSdCardFormatStatus", "getConnectStatus"];

/// Smart protocol with the camera firmware's request shapes.
pub struct SmartCamProtocol {
    core: SmartProtocol,
}

impl SmartCamProtocol {
    /// Wraps a transport with the camera dialect.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            core: SmartProtocol::with_dialect(transport, Dialect::SmartCam),
        }
    }

    /// Overrides the initial batch size.
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self {
            core: self.core.with_batch_size(batch_size),
        }
    }

    /// Queries a child device behind this hub.
    ///
    /// Each method is wrapped in a `controlChild` envelope and the
    /// `response_data` unwrapped on return. A single child method raises on
    /// error; with several, errors are recorded per method.
    pub async fn query_child(&self, device_id: &str, request: Value) -> Result<Value, Error> {
        let requests = SmartProtocol::normalize(request)?;
        let mut inner = self.core.inner.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.execute_child(&mut inner, device_id, &requests).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let exhausted = attempt >= self.core.retries;
            debug!(attempt, exhausted, error = %err, "child query attempt failed");
            match &err {
                Error::Connection(_) if !exhausted => {}
                Error::Timeout(_) | Error::Retryable(_) if !exhausted => {
                    inner.transport.reset().await;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                _ => {
                    inner.transport.reset().await;
                    return Err(err);
                }
            }
        }
    }

    async fn execute_child(
        &self,
        inner: &mut Inner,
        device_id: &str,
        requests: &[(String, Value)],
    ) -> Result<Value, Error> {
        let raise_on_error = requests.len() == 1;
        let mut results = Map::new();

        for (method, params) in requests {
            let mut request_data = json!({ "method": method });
            if !params.is_null() {
                request_data["params"] = params.clone();
            }
            let body = self.core.wrap(
                "controlChild",
                &json!({
                    "childControl": {
                        "device_id": device_id,
                        "request_data": request_data,
                    }
                }),
            );
            let response = inner.transport.send(&body.to_string()).await?;
            let code = envelope_code(&response);
            if code != 0 {
                if raise_on_error {
                    return Err(map_code(code, Some(method)));
                }
                results.insert(method.clone(), json!({ "error_code": code }));
                continue;
            }

            let child_response = response["result"]["response_data"].clone();
            let code = envelope_code(&child_response);
            if code != 0 {
                if raise_on_error {
                    return Err(map_code(code, Some(method)));
                }
                results.insert(method.clone(), json!({ "error_code": code }));
                continue;
            }
            let result = child_response
                .get("result")
                .cloned()
                .unwrap_or(Value::Null);
            results.insert(method.clone(), result);
        }

        Ok(Value::Object(results))
    }
}

#[async_trait]
impl Protocol for SmartCamProtocol {
    async fn query(&self, request: Value) -> Result<Value, Error> {
        self.core.query(request).await
    }

    async fn close(&self) {
        self.core.close().await;
    }
}

/// Reshapes a single camera request by name convention.
///
/// `getX`/`setX` become `{"method": "get"|"set", "<snake(X)>": params}`;
/// everything else, including the forced-do names, becomes
/// `{"method": "do", "<snake(name)>": params}`.
pub(crate) fn shape_single(method: &str, params: &Value) -> Value {
    let params = if params.is_null() {
        json!({})
    } else {
        params.clone()
    };
    let (wrapper, section) = if has_get_set_shape(method) {
        (&method[..3], snake_name(&method[3..]))
    } else {
        ("do", snake_name(method))
    };
    let mut body = Map::new();
    body.insert("method".into(), Value::String(wrapper.into()));
    body.insert(section, params);
    Value::Object(body)
}

/// Checks a `get` response for its section; missing or empty sections are
/// a device-side failure surfaced as [`SmartErrorCode::InternalUnknown`].
pub(crate) fn validate_section(method: &str, result: &Value) -> Result<(), i64> {
    if !method.starts_with("get") || !has_get_set_shape(method) {
        return Ok(());
    }
    let section = snake_name(&method[3..]);
    match result.get(&section) {
        Some(value) if !value.is_null() => Ok(()),
        _ => Err(SmartErrorCode::InternalUnknown.code()),
    }
}

fn has_get_set_shape(method: &str) -> bool {
    (method.starts_with("get") || method.starts_with("set"))
        && !FORCE_DO_METHODS.contains(&method)
}

/// `DeviceInfo` → `device_info`, `SdCardFormatStatus` → `sd_card_format_status`.
fn snake_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (index, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if index > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
