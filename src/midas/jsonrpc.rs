//! ODB access through the `mhttpd` JSON-RPC interface
//!
//! Requests are JSON-RPC 2.0 bodies posted to `<url>/?mjsonrpc`. Each ODB method
//! returns a per-path MIDAS `status` array alongside any data.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, trace};

use super::odb::{DB_KEY_EXIST, DB_NO_KEY, MessageType, Odb, OdbError, SUCCESS, Tid};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    path: &'a str,
    #[serde(rename = "type")]
    tid: u32,
    array_length: usize,
    string_length: usize,
}

/// Per-path status codes returned by the ODB methods
#[derive(Deserialize, Default)]
struct StatusResult {
    #[serde(default)]
    status: Vec<i64>,
    #[serde(default)]
    data: Vec<Value>,
}

/// Client for one experiment's `mhttpd`
pub struct JsonRpcOdb {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcOdb {
    /// `base_url` is the mhttpd address, e.g. `http://localhost:8080`
    pub fn new(base_url: &str) -> Result<Self, OdbError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("epics_fe/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(JsonRpcOdb {
            client,
            url: format!("{}/?mjsonrpc", base_url.trim_end_matches('/')),
            next_id: AtomicU64::new(1),
        })
    }

    /// Make one JSON-RPC call, returning its `result`
    async fn call(&self, method: &str, params: Value) -> Result<Value, OdbError> {
        let request = Request {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        trace!("mjsonrpc {method}: {}", request.params);
        let response: Response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.error {
            let message = match error.data {
                Some(Value::String(data)) => format!("{}: {data}", error.message),
                _ => error.message,
            };
            return Err(OdbError::Rpc {
                code: error.code,
                message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Make a call that reports a status for the single path it was given
    async fn call_status(
        &self,
        method: &'static str,
        path: &str,
        params: Value,
    ) -> Result<StatusResult, OdbError> {
        let result: StatusResult = serde_json::from_value(self.call(method, params).await?)?;
        match result.status.first().copied().unwrap_or(SUCCESS) {
            SUCCESS | DB_KEY_EXIST => Ok(result),
            DB_NO_KEY => Err(OdbError::NoKey(path.to_owned())),
            status => Err(OdbError::Status {
                method,
                path: path.to_owned(),
                status,
            }),
        }
    }
}

impl Odb for JsonRpcOdb {
    async fn get(&self, path: &str) -> Result<Value, OdbError> {
        let result = self
            .call_status("db_get_values", path, json!({ "paths": [path] }))
            .await?;
        match result.data.into_iter().next() {
            None | Some(Value::Null) => Err(OdbError::NoKey(path.to_owned())),
            Some(value) => Ok(value),
        }
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), OdbError> {
        self.call_status(
            "db_paste",
            path,
            json!({ "paths": [path], "values": [value] }),
        )
        .await
        .map(|_| ())
    }

    async fn create(
        &self,
        path: &str,
        tid: Tid,
        array_length: usize,
        string_length: usize,
    ) -> Result<(), OdbError> {
        debug!("Creating ODB key {path} as {tid}[{array_length}]");
        let request = CreateRequest {
            path,
            tid: tid as u32,
            array_length,
            string_length,
        };
        self.call_status("db_create", path, json!([request]))
            .await
            .map(|_| ())
    }

    async fn resize(&self, path: &str, new_length: usize) -> Result<(), OdbError> {
        self.call_status(
            "db_resize",
            path,
            json!({ "paths": [path], "new_lengths": [new_length] }),
        )
        .await
        .map(|_| ())
    }

    async fn msg(
        &self,
        msg_type: MessageType,
        routine: &str,
        message: &str,
    ) -> Result<(), OdbError> {
        self.call(
            "cm_msg1",
            json!({
                "facility": "midas",
                "user": routine,
                "type": msg_type as u32,
                "message": message,
            }),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_bodies() {
        let request = Request {
            jsonrpc: "2.0",
            method: "db_create",
            params: json!([CreateRequest {
                path: "/Programs/EPICS Frontend/Start command",
                tid: Tid::String as u32,
                array_length: 1,
                string_length: 256,
            }]),
            id: 3,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "jsonrpc": "2.0",
                "method": "db_create",
                "params": [{
                    "path": "/Programs/EPICS Frontend/Start command",
                    "type": 12,
                    "array_length": 1,
                    "string_length": 256,
                }],
                "id": 3,
            })
        );
    }

    #[test]
    fn response_bodies() {
        let response: Response = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "result": {"data": [null], "status": [312]},
            "id": 1,
        }))
        .unwrap();
        let result: StatusResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.status, vec![DB_NO_KEY]);

        let response: Response = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "error": {"code": -32601, "message": "Method not found", "data": "db_frob"},
            "id": 2,
        }))
        .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[test]
    fn url_normalisation() {
        let odb = JsonRpcOdb::new("http://localhost:8080/").unwrap();
        assert_eq!(odb.url, "http://localhost:8080/?mjsonrpc");
    }
}
