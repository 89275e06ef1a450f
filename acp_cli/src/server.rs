//! HTTP front end of the agent.
//!
//! Every method on every path reaches one fallback handler, which hands the
//! request to the synchronous [`Dispatcher`] on the blocking pool and always
//! answers `200 OK` with a JSON envelope.

use acp_core::{AgentError, Dispatcher, Request};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State, rejection::QueryRejection},
    http::{Method, Uri},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error};

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new().fallback(handle).with_state(dispatcher)
}

pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Result<(), anyhow::Error> {
    axum::serve(listener, router(dispatcher)).await?;
    Ok(())
}

async fn handle(
    State(dispatcher): State<Arc<Dispatcher>>,
    method: Method,
    uri: Uri,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    debug!(%method, %path, bytes = body.len(), "Request");

    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            let err = AgentError::Decode(rejection.body_text());
            return Json(dispatcher.reject(&path, &err).to_json()).into_response();
        }
    };

    let request = Request {
        path: path.clone(),
        query,
        body: body.to_vec(),
    };
    let worker = dispatcher.clone();
    let reply = match tokio::task::spawn_blocking(move || worker.handle(&request)).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(%path, error = %e, "Request handler panicked");
            let err = AgentError::Collaborator("request handler panicked".to_string());
            dispatcher.reject(&path, &err)
        }
    };
    Json(reply.to_json()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_core::config::SessionConfig;
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn spawn_agent() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(SessionConfig::default()));
        tokio::spawn(serve(listener, dispatcher));
        addr
    }

    /// Sends one raw HTTP/1.1 request and returns the status code and JSON
    /// body.
    async fn request(addr: SocketAddr, method: &str, target: &str, body: &str) -> (u16, Value) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let raw = format!(
            "{method} {target} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(raw.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        let (head, payload) = text.split_once("\r\n\r\n").expect("HTTP response head");

        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status code");
        assert!(
            head.to_ascii_lowercase().contains("content-type: application/json"),
            "Replies should be JSON, got head: {head}"
        );
        (status, serde_json::from_str(payload).expect("JSON body"))
    }

    #[tokio::test]
    async fn connect_and_unknown_command_over_http() {
        let addr = spawn_agent().await;

        let (status, body) = request(addr, "POST", "/Agent/AgentConnect", "").await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({"Status": true}));

        let (status, body) = request(addr, "GET", "/Agent/Bogus", "").await;
        assert_eq!(status, 200, "Unknown commands are still HTTP 200");
        assert_eq!(body, json!({"Error": "Error, unknown command."}));

        let (status, body) = request(addr, "GET", "/favicon.ico", "").await;
        assert_eq!(status, 200);
        assert_eq!(body["Error"], "Error, unknown command.");
    }

    #[tokio::test]
    async fn failures_are_envelopes_not_http_errors() {
        let addr = spawn_agent().await;

        let (status, body) = request(addr, "POST", "/Agent/SessionStarting", "").await;
        assert_eq!(status, 200);
        assert_eq!(body["Status"], false);

        let (status, body) = request(addr, "POST", "/Agent/Publisher/open", "").await;
        assert_eq!(status, 200);
        assert_eq!(body["error"], true);
        assert!(body["errorString"].is_string());
    }

    #[tokio::test]
    async fn query_parameters_are_percent_decoded() {
        let addr = spawn_agent().await;
        request(addr, "POST", "/Agent/AgentConnect", "").await;

        let target = "/Agent/StartMonitor?name=my%20monitor&cls=Null";
        let (_, body) = request(addr, "POST", target, r#"{"args":{}}"#).await;
        assert_eq!(body, json!({"Status": true}));

        let (_, body) = request(addr, "POST", target, r#"{"args":{}}"#).await;
        assert_eq!(body["Status"], false);
        assert!(
            body["Reason"].as_str().unwrap().contains("my monitor"),
            "Duplicate should name the decoded monitor, got {body}"
        );
    }

    #[tokio::test]
    async fn publisher_round_trip_over_http() {
        let addr = spawn_agent().await;
        request(addr, "POST", "/Agent/AgentConnect", "").await;

        let create = r#"{"Cls":"Loopback","name":"loop"}"#;
        let (_, body) = request(addr, "POST", "/Agent/CreatePublisher", create).await;
        assert_eq!(body, json!({"Status": true}));

        for cmd in ["start", "open"] {
            let (_, body) = request(addr, "POST", &format!("/Agent/Publisher/{cmd}/loop"), "").await;
            assert_eq!(body, json!({"error": false, "errorString": null}), "{cmd}");
        }

        let (_, body) = request(
            addr,
            "POST",
            "/Agent/Publisher/output/loop",
            r#"{"data":"AP8Q"}"#,
        )
        .await;
        assert_eq!(body["error"], false);

        let (_, body) = request(addr, "POST", "/Agent/Publisher/ReadAllBytes/loop", "").await;
        assert_eq!(
            body,
            json!({"error": false, "errorString": null, "data": "AP8Q"})
        );

        let (_, body) = request(
            addr,
            "POST",
            "/Agent/Publisher/output/loop",
            r#"{"data":"not base64!"}"#,
        )
        .await;
        assert_eq!(body["error"], true, "Malformed base64 is a decode error");
    }
}
