#![allow(dead_code)]

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::time::Duration;
use tokio::net::TcpListener;
use zip::write::FileOptions;
use zip::ZipWriter;

pub const GOOD_KEY: &str = "sk-good";
pub const QUOTA_KEY: &str = "sk-quota";
/// How long the `/slow/...` endpoint holds each reply
pub const SLOW_REPLY: Duration = Duration::from_secs(2);

/// Stand-in for a chat-completions service.
///
/// `sk-good` gets an echo of the last message, `sk-quota` a 429, anything
/// else a 401.
async fn completions(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if auth == format!("Bearer {}", GOOD_KEY) {
        let messages = body["messages"].as_array().cloned().unwrap_or_default();
        let last = messages
            .last()
            .and_then(|m| m["content"].as_str())
            .unwrap_or("")
            .to_string();
        let reply = format!(
            "echo({}, {} messages): {}",
            body["model"].as_str().unwrap_or(""),
            messages.len(),
            last
        );
        Json(json!({
            "id": "chatcmpl-test",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": reply}}]
        }))
        .into_response()
    } else if auth == format!("Bearer {}", QUOTA_KEY) {
        (StatusCode::TOO_MANY_REQUESTS, "insufficient_quota").into_response()
    } else {
        (StatusCode::UNAUTHORIZED, "invalid api key").into_response()
    }
}

async fn slow_completions(headers: HeaderMap, body: Json<Value>) -> Response {
    tokio::time::sleep(SLOW_REPLY).await;
    completions(headers, body).await
}

async fn empty_reply() -> Json<Value> {
    Json(json!({"choices": [{"message": {"role": "assistant", "content": ""}}]}))
}

async fn not_json() -> &'static str {
    "<html>gateway</html>"
}

/// Run `router` on an ephemeral port in a background thread
pub fn spawn_router(router: Router) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, router).await.unwrap();
        });
    });
    rx.recv().unwrap()
}

pub fn spawn_mock_chat() -> SocketAddr {
    spawn_router(
        Router::new()
            .route("/v1/chat/completions", post(completions))
            .route("/slow/chat/completions", post(slow_completions))
            .route("/empty/chat/completions", post(empty_reply))
            .route("/html/chat/completions", post(not_json))
            // prompts carry whole files
            .layer(DefaultBodyLimit::disable()),
    )
}

/// Zip the given parts into an in-memory .xlsx
pub fn build_xlsx(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A one-sheet workbook using shared and inline strings
pub fn sample_xlsx() -> Vec<u8> {
    build_xlsx(&[
        (
            "xl/workbook.xml",
            r#"<workbook xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Budget" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        ),
        (
            "xl/_rels/workbook.xml.rels",
            r#"<Relationships><Relationship Id="rId1" Target="worksheets/sheet1.xml"/></Relationships>"#,
        ),
        (
            "xl/sharedStrings.xml",
            r#"<sst><si><t>Item</t></si><si><t>Cost</t></si><si><t>Rent</t></si></sst>"#,
        ),
        (
            "xl/worksheets/sheet1.xml",
            r#"<worksheet><sheetData><row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row><row r="2"><c r="A2" t="s"><v>2</v></c><c r="B2"><v>1200</v></c></row><row r="3"><c r="A3" t="inlineStr"><is><t>Food</t></is></c><c r="B3"><v>300</v></c></row></sheetData></worksheet>"#,
        ),
    ])
}
