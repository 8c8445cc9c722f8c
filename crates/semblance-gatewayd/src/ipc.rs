//! Newline-delimited JSON protocol spoken with the core over stdio.
//!
//! Each request line is `{"id", "method", "params"}`; each reply line is
//! `{"id", "result"}` or `{"id", "error"}`. Requests are handled
//! concurrently, so replies may come back out of order.

use std::sync::Arc;

use semblance_audit::AuditQuery;
use semblance_gateway::{Gateway, Granularity, Period};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEFAULT_LOG_LIMIT: usize = 50;
const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct IpcRequest {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct IpcReply {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcReply {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, error: impl ToString) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid params: {0}")]
    InvalidParams(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PageParams {
    limit: Option<usize>,
    offset: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PeriodParams {
    period: Option<Period>,
    granularity: Option<Granularity>,
}

/// Execute one method against the gateway.
pub async fn dispatch(gateway: &Gateway, method: &str, params: Value) -> Result<Value, IpcError> {
    match method {
        "submit_action" => {
            let response = gateway.process(params).await;
            Ok(serde_json::to_value(response)?)
        }
        "get_action_log" => {
            let page: PageParams = from_params(params)?;
            let log = gateway.action_log(page.limit.unwrap_or(DEFAULT_LOG_LIMIT), page.offset);
            Ok(serde_json::to_value(log)?)
        }
        "get_privacy_status" => Ok(serde_json::to_value(gateway.privacy_status())?),
        "query_audit" => {
            let query: AuditQuery = from_params(params)?;
            Ok(serde_json::to_value(gateway.audit().query(&query))?)
        }
        "verify_audit" => Ok(serde_json::to_value(gateway.audit().verify())?),
        "network:getAllowlist" => Ok(serde_json::to_value(gateway.network_allowlist())?),
        "network:getActiveConnections" => {
            Ok(serde_json::to_value(gateway.active_connections())?)
        }
        "network:getUnauthorizedAttempts" => {
            let params: PeriodParams = from_params(params)?;
            let attempts = gateway.unauthorized_attempts(params.period.unwrap_or_default());
            Ok(serde_json::to_value(attempts)?)
        }
        "network:getHistory" => {
            let page: PageParams = from_params(params)?;
            let history = gateway.connection_history(page.limit.unwrap_or(DEFAULT_HISTORY_LIMIT));
            Ok(serde_json::to_value(history)?)
        }
        "network:getStatistics" => {
            let params: PeriodParams = from_params(params)?;
            let stats = gateway.network_statistics(params.period.unwrap_or(Period::Day));
            Ok(serde_json::to_value(stats)?)
        }
        "network:getTimeline" => {
            let params: PeriodParams = from_params(params)?;
            let timeline = gateway.connection_timeline(
                params.period.unwrap_or(Period::Day),
                params.granularity.unwrap_or_default(),
            );
            Ok(serde_json::to_value(timeline)?)
        }
        other => Err(IpcError::UnknownMethod(other.to_string())),
    }
}

/// Absent params mean "all defaults".
fn from_params<T: DeserializeOwned + Default>(params: Value) -> Result<T, IpcError> {
    if params.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(params)?)
}

async fn handle_line(gateway: &Gateway, line: &str) -> IpcReply {
    let request: IpcRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Unparseable IPC request");
            return IpcReply::err(Value::Null, format!("invalid request: {e}"));
        }
    };
    debug!(method = %request.method, "IPC request");
    match dispatch(gateway, &request.method, request.params).await {
        Ok(result) => IpcReply::ok(request.id, result),
        Err(e) => IpcReply::err(request.id, e),
    }
}

/// Serve requests from `reader` until it reaches EOF, writing replies to
/// `writer`. Replies for requests still in flight at EOF are flushed before
/// returning.
pub async fn serve<R, W>(gateway: Arc<Gateway>, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<IpcReply>(64);

    let writer_task = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let mut line = match serde_json::to_vec(&reply) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Could not encode IPC reply");
                    continue;
                }
            };
            line.push(b'\n');
            writer.write_all(&line).await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let gateway = gateway.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = handle_line(&gateway, &line).await;
            let _ = tx.send(reply).await;
        });
    }
    drop(tx);

    writer_task.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use semblance_crypto::{sign_request, SigningKey};
    use semblance_gateway::{GatewayConfig, MockAdapter};
    use semblance_types::{now_rfc3339, ActionRequest, ActionType};
    use tokio::io::BufReader;

    fn key() -> SigningKey {
        SigningKey::new(vec![3u8; 32]).unwrap()
    }

    async fn gateway() -> Arc<Gateway> {
        let config = GatewayConfig {
            allowlist: vec!["api.search.brave.com".into()],
            replay_sweep_interval_ms: 0,
            ..GatewayConfig::default()
        };
        Arc::new(
            Gateway::builder(config, key())
                .adapter(
                    ActionType::WebSearch,
                    Arc::new(MockAdapter::succeeding(json!({"results": []}))),
                )
                .build()
                .await
                .unwrap(),
        )
    }

    fn envelope(id: &str) -> Value {
        let mut request = ActionRequest {
            id: id.into(),
            timestamp: now_rfc3339(),
            action: ActionType::WebSearch,
            payload: json!({"query": "weather"}),
            signature: String::new(),
        };
        sign_request(&key(), &mut request);
        serde_json::to_value(request).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_methods() {
        let gateway = gateway().await;

        let response = dispatch(&gateway, "submit_action", envelope("ipc-1")).await.unwrap();
        assert_eq!(response["status"], "success");
        assert_eq!(response["requestId"], "ipc-1");

        let log = dispatch(&gateway, "get_action_log", json!({"limit": 5})).await.unwrap();
        assert_eq!(log.as_array().unwrap().len(), 1);

        let status = dispatch(&gateway, "get_privacy_status", Value::Null).await.unwrap();
        assert_eq!(status["connection_count"], 1);

        let entries = dispatch(&gateway, "query_audit", json!({"requestId": "ipc-1"}))
            .await
            .unwrap();
        assert_eq!(entries.as_array().unwrap().len(), 2);

        let report = dispatch(&gateway, "verify_audit", Value::Null).await.unwrap();
        assert_eq!(report["valid"], true);

        assert!(matches!(
            dispatch(&gateway, "delete_audit", Value::Null).await,
            Err(IpcError::UnknownMethod(_))
        ));
    }

    #[tokio::test]
    async fn test_reply_field_names_match_host() {
        let gateway = gateway().await;
        dispatch(&gateway, "submit_action", envelope("ipc-3")).await.unwrap();

        let status = dispatch(&gateway, "get_privacy_status", Value::Null).await.unwrap();
        for field in ["all_local", "connection_count", "last_audit_entry", "anomaly_detected"] {
            assert!(status.get(field).is_some(), "privacy status missing {field}");
        }
        assert_eq!(status["all_local"], false);

        let log = dispatch(&gateway, "get_action_log", Value::Null).await.unwrap();
        let row = &log[0];
        for field in [
            "id",
            "timestamp",
            "action",
            "status",
            "description",
            "autonomy_tier",
            "payload_hash",
            "audit_ref",
            "estimated_time_saved_seconds",
        ] {
            assert!(row.get(field).is_some(), "action log row missing {field}");
        }
    }

    #[tokio::test]
    async fn test_network_monitor_methods() {
        let gateway = gateway().await;
        dispatch(&gateway, "submit_action", envelope("net-1")).await.unwrap();

        let allowlist = dispatch(&gateway, "network:getAllowlist", Value::Null).await.unwrap();
        assert_eq!(allowlist[0]["domain"], "api.search.brave.com");
        assert_eq!(allowlist[0]["connection_count"], 1);

        let history = dispatch(&gateway, "network:getHistory", json!({"limit": null}))
            .await
            .unwrap();
        assert_eq!(history[0]["request_id"], "net-1");
        assert_eq!(history[0]["status"], "success");

        let stats = dispatch(&gateway, "network:getStatistics", json!({"period": "today"}))
            .await
            .unwrap();
        assert_eq!(stats["total_connections"], 1);
        assert_eq!(stats["unauthorized_attempts"], 0);

        let attempts = dispatch(
            &gateway,
            "network:getUnauthorizedAttempts",
            json!({"period": null}),
        )
        .await
        .unwrap();
        assert!(attempts.as_array().unwrap().is_empty());

        let timeline = dispatch(
            &gateway,
            "network:getTimeline",
            json!({"period": "day", "granularity": "hour"}),
        )
        .await
        .unwrap();
        let total: u64 = timeline
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["connections"].as_u64().unwrap())
            .sum();
        assert_eq!(total, 1);

        let active = dispatch(&gateway, "network:getActiveConnections", Value::Null)
            .await
            .unwrap();
        assert!(active.as_array().unwrap().is_empty());

        assert!(matches!(
            dispatch(&gateway, "network:getStatistics", json!({"period": "fortnight"})).await,
            Err(IpcError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_round_trip() {
        let gateway = gateway().await;
        let input = format!(
            "{}\nnot json\n{}\n",
            json!({"id": 1, "method": "submit_action", "params": envelope("ipc-2")}),
            json!({"id": 2, "method": "verify_audit"}),
        );
        let (client, server) = tokio::io::duplex(64 * 1024);

        serve(gateway, BufReader::new(input.as_bytes()), server)
            .await
            .unwrap();

        let mut output = String::new();
        let mut client = BufReader::new(client);
        let mut replies = Vec::new();
        while client.read_line(&mut output).await.unwrap() > 0 {
            replies.push(serde_json::from_str::<Value>(output.trim()).unwrap());
            output.clear();
        }

        assert_eq!(replies.len(), 3);
        let by_id = |id: Value| replies.iter().find(|r| r["id"] == id).cloned().unwrap();
        assert_eq!(by_id(json!(1))["result"]["status"], "success");
        assert_eq!(by_id(json!(2))["result"]["valid"], true);
        assert!(by_id(Value::Null)["error"].is_string());
    }
}
