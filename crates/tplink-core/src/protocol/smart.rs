//! Protocol for SMART devices.
//!
//! Queries are maps of method name to parameters. Multiple methods are
//! packed into `multipleRequest` batches; responses are matched back to
//! their methods, list results are paginated transparently, and errors are
//! attributed per method when more than one is outstanding.
//!
//! Certain firmware answers a malformed batch with a JSON-decode failure.
//! When that happens the batch size is demoted to one for the life of the
//! protocol instance and the query is retried as bare single requests.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use md5::{Digest, Md5};
use rand::RngCore;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, SmartErrorCode};
use crate::protocol::{DEFAULT_RETRIES, Protocol, RETRY_BACKOFF, smartcam};
use crate::transport::Transport;

/// Default number of methods per `multipleRequest`.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Methods that never ride in a batch.
const SINGLE_ONLY_METHODS: &[&str] = &["getConnectStatus", "scanApList"];

/// Which single-request wire shape this protocol speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    /// Plain SMART JSON-RPC.
    Smart,
    /// Camera firmware: `get`/`set`/`do` wrappers around snake-cased
    /// sections.
    SmartCam,
}

pub(crate) struct Inner {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) batch_size: usize,
}

/// JSON-RPC protocol with batching and pagination.
pub struct SmartProtocol {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) terminal_uuid: String,
    pub(crate) retries: usize,
    dialect: Dialect,
}

impl SmartProtocol {
    /// Wraps a transport with the plain SMART dialect.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_dialect(transport, Dialect::Smart)
    }

    pub(crate) fn with_dialect(transport: Box<dyn Transport>, dialect: Dialect) -> Self {
        Self {
            inner: Mutex::new(Inner {
                transport,
                batch_size: DEFAULT_BATCH_SIZE,
            }),
            terminal_uuid: generate_terminal_uuid(),
            retries: DEFAULT_RETRIES,
            dialect,
        }
    }

    /// Overrides the initial batch size.
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        self.inner.try_lock().expect("fresh protocol").batch_size = batch_size.max(1);
        self
    }

    /// Overrides the retry budget.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    /// Splits a query value into `(method, params)` pairs.
    pub(crate) fn normalize(request: Value) -> Result<Vec<(String, Value)>, Error> {
        match request {
            Value::Object(map) if !map.is_empty() => Ok(map.into_iter().collect()),
            Value::String(method) => Ok(vec![(method, Value::Null)]),
            _ => Err(Error::Protocol(
                "smart query must be a non-empty object of methods".into(),
            )),
        }
    }

    pub(crate) async fn execute_query(
        &self,
        inner: &mut Inner,
        requests: &[(String, Value)],
    ) -> Result<Value, Error> {
        let raise_on_error = requests.len() == 1;
        let mut results = Map::new();

        let (singles, batchable): (Vec<_>, Vec<_>) = requests
            .iter()
            .partition(|(method, _)| SINGLE_ONLY_METHODS.contains(&method.as_str()));

        let batch_size = inner.batch_size.max(1);
        for chunk in batchable.chunks(batch_size) {
            if chunk.len() == 1 {
                let (method, params) = chunk[0];
                self.execute_single(inner, method, params, raise_on_error, &mut results)
                    .await?;
            } else {
                self.execute_batch(inner, chunk, raise_on_error, &mut results)
                    .await?;
            }
        }
        for (method, params) in singles {
            self.execute_single(inner, method, params, raise_on_error, &mut results)
                .await?;
        }

        Ok(Value::Object(results))
    }

    async fn execute_batch(
        &self,
        inner: &mut Inner,
        chunk: &[&(String, Value)],
        raise_on_error: bool,
        results: &mut Map<String, Value>,
    ) -> Result<(), Error> {
        let batched: Vec<Value> = chunk
            .iter()
            .map(|(method, params)| {
                let mut entry = json!({ "method": method });
                if !params.is_null() {
                    entry["params"] = params.clone();
                }
                entry
            })
            .collect();
        let envelope = self.wrap("multipleRequest", &json!({ "requests": batched }));

        debug!(methods = chunk.len(), "sending multipleRequest batch");
        let response = inner.transport.send(&envelope.to_string()).await?;

        let code = envelope_code(&response);
        if code != 0 {
            if matches!(
                SmartErrorCode::from_code(code),
                Some(SmartErrorCode::JsonDecodeFail | SmartErrorCode::InternalUnknown)
            ) {
                // Sticky demotion: this instance never batches again.
                inner.batch_size = 1;
                return Err(Error::Retryable(format!(
                    "device failed to decode batch ({code}); demoted to single requests"
                )));
            }
            return Err(map_code(code, None));
        }

        let Some(responses) = response["result"]["responses"].as_array() else {
            return Err(Error::Protocol("batch response has no responses".into()));
        };

        let mut requery: Vec<&(String, Value)> = Vec::new();
        for (index, sub) in responses.iter().enumerate() {
            let Some(method) = sub["method"].as_str() else {
                // Firmware quirk: a sub-response without a method name.
                if let Some(request) = chunk.get(index) {
                    requery.push(request);
                }
                continue;
            };
            let code = envelope_code(sub);
            if code != 0 {
                if raise_on_error {
                    return Err(map_code(code, Some(method)));
                }
                results.insert(method.to_string(), json!({ "error_code": code }));
                continue;
            }
            let params = chunk
                .iter()
                .find(|entry| entry.0 == method)
                .map(|entry| entry.1.clone())
                .unwrap_or(Value::Null);
            let result = sub.get("result").cloned().unwrap_or(Value::Null);
            let result = self.paginate(inner, method, &params, result).await?;
            results.insert(method.to_string(), result);
        }

        for (method, params) in requery {
            debug!(method, "sub-response lacked method name, requerying singly");
            self.execute_single(inner, method, params, raise_on_error, results)
                .await?;
        }
        Ok(())
    }

    async fn execute_single(
        &self,
        inner: &mut Inner,
        method: &str,
        params: &Value,
        raise_on_error: bool,
        results: &mut Map<String, Value>,
    ) -> Result<(), Error> {
        let body = self.single_body(method, params);
        let response = inner.transport.send(&body.to_string()).await?;

        let mut code = envelope_code(&response);
        let mut result = response.get("result").cloned().unwrap_or(Value::Null);
        if code == 0 && self.dialect == Dialect::SmartCam {
            if let Err(section_code) = smartcam::validate_section(method, &result) {
                code = section_code;
            }
        }
        if code != 0 {
            if raise_on_error {
                return Err(map_code(code, Some(method)));
            }
            results.insert(method.to_string(), json!({ "error_code": code }));
            return Ok(());
        }

        result = self.paginate(inner, method, params, result).await?;
        results.insert(method.to_string(), result);
        Ok(())
    }

    /// Follows `start_index`/`sum` list results until complete.
    async fn paginate(
        &self,
        inner: &mut Inner,
        method: &str,
        params: &Value,
        result: Value,
    ) -> Result<Value, Error> {
        let Some(obj) = result.as_object() else {
            return Ok(result);
        };
        if !obj.contains_key("start_index") || !obj.contains_key("sum") {
            return Ok(result);
        }
        let list_keys: Vec<&String> = obj
            .iter()
            .filter(|(_, value)| value.is_array())
            .map(|(key, _)| key)
            .collect();
        let [list_key] = list_keys.as_slice() else {
            return Ok(result);
        };
        let list_key = (*list_key).clone();
        let sum = obj["sum"].as_u64().unwrap_or(0) as usize;

        let mut result = result;
        loop {
            let fetched = result[&list_key].as_array().map(Vec::len).unwrap_or(0);
            if fetched >= sum {
                break;
            }
            debug!(method, fetched, sum, "fetching next page");

            let mut page_params = params.as_object().cloned().unwrap_or_default();
            page_params.insert("start_index".into(), json!(fetched));
            let body = self.single_body(method, &Value::Object(page_params));
            let response = inner.transport.send(&body.to_string()).await?;

            let code = envelope_code(&response);
            if code != 0 {
                return Err(map_code(code, Some(method)));
            }
            let page = response["result"][&list_key].as_array().cloned();
            match (page, result[&list_key].as_array_mut()) {
                (Some(items), Some(assembled)) if !items.is_empty() => {
                    assembled.extend(items);
                }
                // Empty or missing page: stop rather than loop forever.
                _ => break,
            }
        }
        Ok(result)
    }

    fn single_body(&self, method: &str, params: &Value) -> Value {
        match self.dialect {
            Dialect::Smart => self.wrap(method, params),
            Dialect::SmartCam => smartcam::shape_single(method, params),
        }
    }

    /// Standard request envelope: method, params, timestamp, terminal id.
    pub(crate) fn wrap(&self, method: &str, params: &Value) -> Value {
        let mut body = json!({
            "method": method,
            "request_time_milis": now_millis(),
            "terminal_uuid": self.terminal_uuid,
        });
        if !params.is_null() {
            body["params"] = params.clone();
        }
        body
    }
}

#[async_trait]
impl Protocol for SmartProtocol {
    async fn query(&self, request: Value) -> Result<Value, Error> {
        let requests = Self::normalize(request)?;
        let mut inner = self.inner.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.execute_query(&mut inner, &requests).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let exhausted = attempt >= self.retries;
            debug!(attempt, exhausted, error = %err, "query attempt failed");
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

    async fn close(&self) {
        self.inner.lock().await.transport.close().await;
    }
}

pub(crate) fn envelope_code(value: &Value) -> i64 {
    value.get("error_code").and_then(Value::as_i64).unwrap_or(0)
}

pub(crate) fn map_code(code: i64, method: Option<&str>) -> Error {
    match SmartErrorCode::from_code(code) {
        Some(known) => Error::from_error_code(known, method),
        None => Error::Protocol(format!("unknown device error code {code}")),
    }
}

pub(crate) fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn generate_terminal_uuid() -> String {
    let mut seed = [0u8; 16];
    rand::rng().fill_bytes(&mut seed);
    BASE64.encode(Md5::digest(seed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests_support::ScriptedTransport;

    fn protocol(transport: ScriptedTransport) -> SmartProtocol {
        SmartProtocol::new(Box::new(transport))
    }

    #[tokio::test]
    async fn test_single_method_unwrapped() {
        let transport = ScriptedTransport::new(|request: Value| {
            assert_eq!(request["method"], "get_device_info");
            assert!(request["terminal_uuid"].is_string());
            assert!(request["request_time_milis"].is_number());
            json!({"error_code": 0, "result": {"model": "P110"}})
        });
        let response = protocol(transport)
            .query(json!({"get_device_info": null}))
            .await
            .unwrap();
        assert_eq!(response["get_device_info"]["model"], "P110");
    }

    #[tokio::test]
    async fn test_multiple_methods_batched() {
        let transport = ScriptedTransport::new(|request: Value| {
            assert_eq!(request["method"], "multipleRequest");
            let requests = request["params"]["requests"].as_array().unwrap();
            assert_eq!(requests.len(), 2);
            json!({"error_code": 0, "result": {"responses": [
                {"method": "get_device_info", "error_code": 0, "result": {"model": "P110"}},
                {"method": "get_device_usage", "error_code": 0, "result": {"power": 3}},
            ]}})
        });
        let response = protocol(transport)
            .query(json!({"get_device_info": null, "get_device_usage": null}))
            .await
            .unwrap();
        assert_eq!(response["get_device_info"]["model"], "P110");
        assert_eq!(response["get_device_usage"]["power"], 3);
    }

    #[tokio::test]
    async fn test_batch_chunking_respects_batch_size() {
        let transport = ScriptedTransport::new(|request: Value| {
            let requests = request["params"]["requests"].as_array().unwrap();
            assert!(requests.len() <= 2);
            let responses: Vec<Value> = requests
                .iter()
                .map(|r| json!({"method": r["method"], "error_code": 0, "result": {}}))
                .collect();
            json!({"error_code": 0, "result": {"responses": responses}})
        });
        let protocol = SmartProtocol::new(Box::new(transport)).with_batch_size(2);
        let response = protocol
            .query(json!({"m1": null, "m2": null, "m3": null, "m4": null}))
            .await
            .unwrap();
        assert_eq!(response.as_object().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_demotion_is_sticky() {
        // First attempt: batch fails with JSON_DECODE_FAIL_ERROR (-1003).
        // Second attempt: bare singles succeed.
        let transport = ScriptedTransport::new(|request: Value| {
            match request["method"].as_str().unwrap() {
                "multipleRequest" => json!({"error_code": -1003}),
                method => json!({"error_code": 0, "result": {"method": method}}),
            }
        });
        let protocol = protocol(transport);
        let response = protocol
            .query(json!({"get_device_info": null, "get_device_usage": null}))
            .await
            .unwrap();
        assert_eq!(response["get_device_info"]["method"], "get_device_info");
        assert_eq!(protocol.inner.lock().await.batch_size, 1);
    }

    #[tokio::test]
    async fn test_deny_listed_methods_sent_singly() {
        let transport = ScriptedTransport::new(|request: Value| {
            // Never batched, even alongside other methods.
            assert_ne!(request["method"], "multipleRequest");
            json!({"error_code": 0, "result": {}})
        });
        protocol(transport)
            .query(json!({"getConnectStatus": null}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_per_method_error_attribution() {
        let transport = ScriptedTransport::new(|_request: Value| {
            json!({"error_code": 0, "result": {"responses": [
                {"method": "get_device_info", "error_code": 0, "result": {"model": "P110"}},
                {"method": "get_emeter_data", "error_code": -1301},
            ]}})
        });
        let response = protocol(transport)
            .query(json!({"get_device_info": null, "get_emeter_data": null}))
            .await
            .unwrap();
        assert_eq!(response["get_device_info"]["model"], "P110");
        assert_eq!(response["get_emeter_data"]["error_code"], -1301);
    }

    #[tokio::test]
    async fn test_single_method_error_raises() {
        let transport =
            ScriptedTransport::new(|_request: Value| json!({"error_code": -1301}));
        let err = protocol(transport)
            .query(json!({"get_device_info": null}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceError {
                code: SmartErrorCode::DeviceError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_method_requeried_singly() {
        let transport = ScriptedTransport::new(|request: Value| {
            match request["method"].as_str().unwrap() {
                "multipleRequest" => json!({"error_code": 0, "result": {"responses": [
                    {"method": "get_device_info", "error_code": 0, "result": {}},
                    // Firmware quirk: no method name on the second response.
                    {"error_code": 0, "result": {}},
                ]}}),
                "get_device_usage" => json!({"error_code": 0, "result": {"requeried": true}}),
                other => panic!("unexpected single {other}"),
            }
        });
        let response = protocol(transport)
            .query(json!({"get_device_info": null, "get_device_usage": null}))
            .await
            .unwrap();
        assert_eq!(response["get_device_usage"]["requeried"], true);
    }

    #[tokio::test]
    async fn test_pagination_assembles_full_list() {
        let transport = ScriptedTransport::new(|request: Value| {
            let start = request["params"]["start_index"].as_u64().unwrap_or(0);
            match start {
                0 => json!({"error_code": 0, "result":
                    {"start_index": 0, "sum": 5, "rules": [1, 2]}}),
                2 => json!({"error_code": 0, "result":
                    {"start_index": 2, "sum": 5, "rules": [3, 4]}}),
                4 => json!({"error_code": 0, "result":
                    {"start_index": 4, "sum": 5, "rules": [5]}}),
                other => panic!("unexpected start_index {other}"),
            }
        });
        let response = protocol(transport)
            .query(json!({"get_schedule_rules": {"start_index": 0}}))
            .await
            .unwrap();
        let rules = response["get_schedule_rules"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 5);
    }

    #[tokio::test]
    async fn test_pagination_empty_page_guard() {
        let transport = ScriptedTransport::new(|request: Value| {
            let start = request["params"]["start_index"].as_u64().unwrap_or(0);
            match start {
                0 => json!({"error_code": 0, "result":
                    {"start_index": 0, "sum": 10, "rules": [1, 2]}}),
                // Device claims 10 entries but has nothing more to give.
                _ => json!({"error_code": 0, "result":
                    {"start_index": 2, "sum": 10, "rules": []}}),
            }
        });
        let response = protocol(transport)
            .query(json!({"get_schedule_rules": {"start_index": 0}}))
            .await
            .unwrap();
        let rules = response["get_schedule_rules"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_consumes_budget() {
        let transport = ScriptedTransport::failing_then(
            2,
            || Error::Retryable("session expired".into()),
            |_request| json!({"error_code": 0, "result": {}}),
        );
        let response = protocol(transport)
            .query(json!({"get_device_info": null}))
            .await
            .unwrap();
        assert!(response["get_device_info"].is_object());
    }

    #[tokio::test]
    async fn test_auth_error_surfaces() {
        let transport = ScriptedTransport::failing_then(
            usize::MAX,
            || Error::AuthenticationFailed("login failed".into()),
            |_request| unreachable!(),
        );
        let err = protocol(transport)
            .query(json!({"get_device_info": null}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }
}
