use crate::chat::ChatClient;
use crate::config::ServerConfig;
use crate::persistence;
use crate::session::{Role, SessionError, SessionState};
use crate::workflow::{self, BatchReport, Upload, WorkflowError};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post, put},
    Form, Json, Router,
};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything the web shell handlers share. The session sits behind one
/// async mutex, one writer at a time.
pub struct AppState {
    session: Mutex<SessionState>,
    state_file: PathBuf,
    chat: ChatClient,
    max_upload_bytes: usize,
    /// One-shot message for the next page render
    notice: Mutex<Option<String>>,
}

pub type Shared = Arc<AppState>;

impl AppState {
    pub fn new(session: SessionState, state_file: PathBuf, chat: ChatClient) -> Self {
        AppState {
            session: Mutex::new(session),
            state_file,
            chat,
            max_upload_bytes: ServerConfig::default().max_upload_bytes(),
            notice: Mutex::new(None),
        }
    }

    pub fn with_upload_limit(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    fn persist(&self, session: &SessionState) -> bool {
        persistence::flush(&self.state_file, &session.snapshot())
    }

    // The *_blocking methods wait on the session lock and may call the chat
    // service or write the state file; run them through `run_blocking`.

    fn analyze_blocking(
        &self,
        uploads: &[Upload],
        instruction: Option<String>,
    ) -> Result<BatchReport, WorkflowError> {
        let mut session = self.session.blocking_lock();
        if let Some(instruction) = instruction {
            session.set_instruction(instruction);
        }

        let result = workflow::analyze_uploads(&mut session, &self.chat, uploads, |i, total, name| {
            info!("Processing ({}/{}): {}", i + 1, total, name)
        });
        // Partial batches are saved too
        self.persist(&session);
        result
    }

    fn ask_blocking(&self, filename: &str, question: &str) -> Result<String, WorkflowError> {
        let mut session = self.session.blocking_lock();
        let result = workflow::ask(&mut session, &self.chat, filename, question);
        if session.record(filename).is_some() {
            self.persist(&session);
        }
        result
    }

    fn set_instruction_blocking(&self, instruction: String) -> (String, bool) {
        let mut session = self.session.blocking_lock();
        session.set_instruction(instruction);
        let saved = self.persist(&session);
        (session.instruction().to_string(), saved)
    }

    fn set_credential_blocking(&self, credential: &str) -> bool {
        let mut session = self.session.blocking_lock();
        session.set_credential(credential.trim());
        self.persist(&session)
    }

    fn save_blocking(&self) -> bool {
        let session = self.session.blocking_lock();
        let saved = self.persist(&session);
        if !saved {
            warn!("Explicit save failed; state kept in memory");
        }
        saved
    }

    fn confirm_clear_blocking(&self) -> bool {
        let mut session = self.session.blocking_lock();
        let cleared = session.confirm_clear();
        if cleared {
            self.persist(&session);
            info!("All conversations cleared");
        }
        cleared
    }

    async fn notify(&self, message: impl Into<String>) {
        *self.notice.lock().await = Some(message.into());
    }
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        let status = match e {
            WorkflowError::Session(SessionError::NotFound(_)) => StatusCode::NOT_FOUND,
            WorkflowError::Chat(_) => StatusCode::BAD_GATEWAY,
            WorkflowError::EmptyInstruction
            | WorkflowError::EmptyQuestion
            | WorkflowError::MissingCredential
            | WorkflowError::NoFiles => StatusCode::BAD_REQUEST,
        };
        ApiError::new(status, e.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        WorkflowError::from(e).into()
    }
}

pub fn router(state: Shared) -> Router {
    let upload_limit = state.max_upload_bytes;

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        // JSON API
        .route("/api/files", get(list_files))
        .route("/api/files/:name", get(show_file))
        .route("/api/files/:name/ask", post(ask))
        .route("/api/analyze", post(analyze))
        .route("/api/instruction", put(set_instruction))
        .route("/api/credential", put(set_credential))
        .route("/api/save", post(save))
        .route("/api/clear", post(request_clear))
        .route("/api/clear/confirm", post(confirm_clear))
        .route("/api/clear/cancel", post(cancel_clear))
        // HTML form posts, each redirecting back to the index
        .route("/ui/analyze", post(ui_analyze))
        .route("/ui/ask", post(ui_ask))
        .route("/ui/credential", post(ui_credential))
        .route("/ui/save", post(ui_save))
        .route("/ui/clear", post(ui_request_clear))
        .route("/ui/clear/confirm", post(ui_confirm_clear))
        .route("/ui/clear/cancel", post(ui_cancel_clear))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(state)
}

pub async fn run_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("filechat listening on http://{}", addr);
    info!("State file: {}", state.state_file.display());
    serve(listener, state).await
}

pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(Arc::new(state))).await?;
    Ok(())
}

/// Run session work that may block (chat requests, file writes) off the
/// async workers
async fn run_blocking<T, F>(app: Shared, work: F) -> Result<T, ApiError>
where
    F: FnOnce(&AppState) -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || work(&app))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn health() -> &'static str {
    "filechat OK"
}

async fn list_files(State(app): State<Shared>) -> Json<Value> {
    let session = app.session.lock().await;
    let files: Vec<Value> = session
        .records()
        .map(|(name, record)| {
            json!({
                "filename": name,
                "initial_response": record.initial_response,
                "turns": record.history.len(),
            })
        })
        .collect();

    Json(json!({
        "files": files,
        "instruction": session.instruction(),
        "clear_pending": session.clear_pending(),
    }))
}

async fn show_file(
    State(app): State<Shared>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = app.session.lock().await;
    let history = workflow::display_history(&session, &name)?;
    let content = session
        .record(&name)
        .map(|record| record.content.clone())
        .unwrap_or_default();

    Ok(Json(json!({
        "filename": name,
        "content": content,
        "history": history,
    })))
}

#[derive(Deserialize)]
struct AskBody {
    question: String,
}

async fn ask(
    State(app): State<Shared>,
    Path(name): Path<String>,
    Json(body): Json<AskBody>,
) -> Result<Json<Value>, ApiError> {
    let filename = name.clone();
    let reply = run_blocking(app, move |app| app.ask_blocking(&filename, &body.question)).await??;
    Ok(Json(json!({ "filename": name, "reply": reply })))
}

/// Split a multipart request into file uploads and the optional
/// `instruction` text field
async fn read_multipart(
    mut multipart: Multipart,
) -> Result<(Vec<Upload>, Option<String>), ApiError> {
    let mut uploads = Vec::new();
    let mut instruction = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(|f| f.to_string());

        match filename {
            Some(filename) if !filename.is_empty() => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
                uploads.push(Upload::new(filename, bytes.to_vec()));
            }
            _ if field_name == "instruction" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
                instruction = Some(text);
            }
            // browsers send an empty file part when nothing was picked
            _ => {}
        }
    }

    Ok((uploads, instruction))
}

async fn analyze(
    State(app): State<Shared>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let (uploads, instruction) = read_multipart(multipart).await?;
    let report = run_blocking(app, move |app| app.analyze_blocking(&uploads, instruction)).await??;
    Ok(Json(report_json(&report)))
}

fn report_json(report: &BatchReport) -> Value {
    let failed: Vec<Value> = report
        .failed
        .iter()
        .map(|(filename, reason)| json!({ "filename": filename, "reason": reason }))
        .collect();
    json!({ "analyzed": report.analyzed, "failed": failed })
}

fn report_notice(report: &BatchReport) -> String {
    let mut notice = format!("Processed {} file(s).", report.analyzed.len());
    if !report.is_clean() {
        let failed: Vec<String> = report
            .failed
            .iter()
            .map(|(filename, reason)| format!("{} ({})", filename, reason))
            .collect();
        notice.push_str(&format!(" Failed: {}", failed.join("; ")));
    }
    notice
}

#[derive(Deserialize)]
struct InstructionBody {
    instruction: String,
}

async fn set_instruction(
    State(app): State<Shared>,
    Json(body): Json<InstructionBody>,
) -> Result<Json<Value>, ApiError> {
    let (instruction, saved) =
        run_blocking(app, move |app| app.set_instruction_blocking(body.instruction)).await?;
    Ok(Json(json!({ "instruction": instruction, "saved": saved })))
}

#[derive(Deserialize)]
struct CredentialBody {
    credential: String,
}

async fn set_credential(
    State(app): State<Shared>,
    Json(body): Json<CredentialBody>,
) -> Result<Json<Value>, ApiError> {
    let saved = run_blocking(app, move |app| app.set_credential_blocking(&body.credential)).await?;
    Ok(Json(json!({ "saved": saved })))
}

async fn save(State(app): State<Shared>) -> Result<Json<Value>, ApiError> {
    let saved = run_blocking(app, |app| app.save_blocking()).await?;
    Ok(Json(json!({ "saved": saved })))
}

async fn request_clear(State(app): State<Shared>) -> Json<Value> {
    app.session.lock().await.request_clear();
    Json(json!({
        "clear_pending": true,
        "message": "All files and conversations will be deleted. POST /api/clear/confirm to proceed or /api/clear/cancel to keep them.",
    }))
}

async fn confirm_clear(State(app): State<Shared>) -> Result<Json<Value>, ApiError> {
    let cleared = run_blocking(app, |app| app.confirm_clear_blocking()).await?;
    Ok(Json(json!({ "cleared": cleared })))
}

async fn cancel_clear(State(app): State<Shared>) -> Json<Value> {
    app.session.lock().await.cancel_clear();
    Json(json!({ "clear_pending": false }))
}

async fn ui_analyze(State(app): State<Shared>, multipart: Multipart) -> Redirect {
    let notice = match read_multipart(multipart).await {
        Ok((uploads, instruction)) => {
            let worker = app.clone();
            match run_blocking(worker, move |app| app.analyze_blocking(&uploads, instruction)).await {
                Ok(Ok(report)) => report_notice(&report),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.message,
            }
        }
        Err(e) => e.message,
    };
    app.notify(notice).await;
    Redirect::to("/")
}

#[derive(Deserialize)]
struct AskForm {
    filename: String,
    question: String,
}

async fn ui_ask(State(app): State<Shared>, Form(form): Form<AskForm>) -> Redirect {
    let worker = app.clone();
    let result = run_blocking(worker, move |app| app.ask_blocking(&form.filename, &form.question)).await;
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => app.notify(format!("Sorry, no reply this time: {}", e)).await,
        Err(e) => app.notify(e.message).await,
    }
    Redirect::to("/")
}

async fn ui_credential(State(app): State<Shared>, Form(form): Form<CredentialBody>) -> Redirect {
    let worker = app.clone();
    let notice = match run_blocking(worker, move |app| app.set_credential_blocking(&form.credential)).await {
        Ok(true) => "API key saved.".to_string(),
        Ok(false) => "API key set for this session; the state file could not be written.".to_string(),
        Err(e) => e.message,
    };
    app.notify(notice).await;
    Redirect::to("/")
}

async fn ui_save(State(app): State<Shared>) -> Redirect {
    let worker = app.clone();
    let notice = match run_blocking(worker, |app| app.save_blocking()).await {
        Ok(true) => "All data saved.".to_string(),
        Ok(false) => "Save failed; data is kept in memory.".to_string(),
        Err(e) => e.message,
    };
    app.notify(notice).await;
    Redirect::to("/")
}

async fn ui_request_clear(State(app): State<Shared>) -> Redirect {
    app.session.lock().await.request_clear();
    Redirect::to("/")
}

async fn ui_confirm_clear(State(app): State<Shared>) -> Redirect {
    let worker = app.clone();
    if let Ok(true) = run_blocking(worker, |app| app.confirm_clear_blocking()).await {
        app.notify("All history cleared.").await;
    }
    Redirect::to("/")
}

async fn ui_cancel_clear(State(app): State<Shared>) -> Redirect {
    app.session.lock().await.cancel_clear();
    Redirect::to("/")
}

async fn index(State(app): State<Shared>) -> impl IntoResponse {
    let notice = app.notice.lock().await.take();
    let session = app.session.lock().await;
    (StatusCode::OK, Html(render_index_html(&session, notice.as_deref())))
}

fn render_index_html(session: &SessionState, notice: Option<&str>) -> String {
    let mut html = String::from(
        r#"<!DOCTYPE html>
<html>
<head>
<title>filechat</title>
<style>
body { font-family: system-ui, sans-serif; margin: 2rem; background: #1a1a2e; color: #eee; max-width: 1000px; }
h1, h2 { color: #00d9ff; }
form.inline { display: inline; }
.bar { border-bottom: 1px solid #333; padding-bottom: 1rem; margin-bottom: 1rem; }
.file { border: 1px solid #333; border-radius: 4px; padding: 0.5rem 1rem; margin-bottom: 1rem; }
.turn { margin: 0.5rem 0; white-space: pre-wrap; }
.user { color: #9ecbff; }
.assistant { color: #eee; }
.notice { background: #1f3b4d; padding: 0.5rem 1rem; border-radius: 4px; }
.warning { background: #5c2b29; padding: 0.5rem 1rem; border-radius: 4px; }
.muted { color: #888; }
</style>
</head>
<body>
<h1>filechat</h1>
"#,
    );

    if let Some(notice) = notice {
        html.push_str(&format!("<p class=\"notice\">{}</p>\n", html_escape(notice)));
    }

    // Settings and storage
    let key_status = if workflow::effective_credential(session).is_some() {
        "An API key is configured."
    } else {
        "No API key yet. Enter one or set OPENAI_API_KEY."
    };
    html.push_str(&format!(
        r#"<div class="bar">
<form class="inline" method="post" action="/ui/credential">
<input type="password" name="credential" placeholder="sk-..." size="40"> <button type="submit">Save API key</button>
</form>
<span class="muted">{}</span>
<form class="inline" method="post" action="/ui/save"><button type="submit">Save all data</button></form>
"#,
        key_status
    ));

    if session.clear_pending() {
        html.push_str(
            r#"<p class="warning">Delete all processed files and conversations? This cannot be undone.
<form class="inline" method="post" action="/ui/clear/confirm"><button type="submit">Yes, clear everything</button></form>
<form class="inline" method="post" action="/ui/clear/cancel"><button type="submit">Cancel</button></form></p>
"#,
        );
    } else {
        html.push_str(
            r#"<form class="inline" method="post" action="/ui/clear"><button type="submit">Clear all history</button></form>
"#,
        );
    }
    html.push_str("</div>\n");

    // Batch upload
    html.push_str(&format!(
        r#"<form method="post" action="/ui/analyze" enctype="multipart/form-data">
<p><textarea name="instruction" rows="4" cols="100">{}</textarea></p>
<p><input type="file" name="files" multiple> <button type="submit">Process files</button></p>
</form>
"#,
        html_escape(session.instruction())
    ));

    if session.is_empty() {
        html.push_str("<p class=\"muted\">No files processed yet.</p>\n");
    }

    for (filename, record) in session.records() {
        html.push_str(&format!(
            "<div class=\"file\"><h2>{}</h2>\n",
            html_escape(filename)
        ));
        let turns = workflow::display_history(session, filename).unwrap_or_default();
        for turn in turns.iter() {
            let (class, label) = match turn.role {
                Role::User => ("user", "You"),
                Role::Assistant => ("assistant", "Model"),
            };
            html.push_str(&format!(
                "<div class=\"turn {}\"><b>{}:</b> {}</div>\n",
                class,
                label,
                html_escape(&turn.content)
            ));
        }
        html.push_str(&format!(
            r#"<form method="post" action="/ui/ask">
<input type="hidden" name="filename" value="{}">
<input type="text" name="question" size="80" placeholder="Ask a follow-up about this file"> <button type="submit">Send</button>
</form>
<p class="muted">{} characters of content, {} turns</p></div>
"#,
            html_escape(filename),
            record.content.chars().count(),
            record.history.len()
        ));
    }

    html.push_str("</body></html>");
    html
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_escapes_file_content() {
        let mut session = SessionState::default();
        session.record_initial_analysis(
            "<script>.txt",
            "x".into(),
            "prompt".into(),
            "a < b & c".into(),
        );

        let html = render_index_html(&session, None);

        assert!(html.contains("&lt;script&gt;.txt"));
        assert!(html.contains("a &lt; b &amp; c"));
        assert!(!html.contains("<script>.txt"));
    }

    #[test]
    fn index_offers_a_follow_up_form_per_file() {
        let mut session = SessionState::default();
        session.record_initial_analysis("a.txt", "x".into(), "p".into(), "r".into());
        session.record_initial_analysis("b.md", "y".into(), "p".into(), "r".into());

        let html = render_index_html(&session, None);

        assert_eq!(html.matches(r#"action="/ui/ask""#).count(), 2);
        assert!(html.contains(r#"name="filename" value="a.txt""#));
        assert!(html.contains(r#"name="filename" value="b.md""#));
        assert!(html.contains(r#"action="/ui/credential""#));
        assert!(html.contains(r#"action="/ui/save""#));
    }

    #[test]
    fn index_asks_for_confirmation_while_clear_is_pending() {
        let mut session = SessionState::default();
        let idle = render_index_html(&session, None);
        assert!(idle.contains(r#"action="/ui/clear""#));
        assert!(!idle.contains("/ui/clear/confirm"));

        session.request_clear();
        let pending = render_index_html(&session, None);
        assert!(pending.contains(r#"action="/ui/clear/confirm""#));
        assert!(pending.contains(r#"action="/ui/clear/cancel""#));
    }

    #[test]
    fn notice_is_rendered_escaped() {
        let html = render_index_html(&SessionState::default(), Some("Failed: <b>.png"));
        assert!(html.contains(r#"<p class="notice">Failed: &lt;b&gt;.png</p>"#));
    }

    #[test]
    fn batch_notice_lists_failures() {
        let report = BatchReport {
            analyzed: vec!["a.txt".to_string()],
            failed: vec![("b.png".to_string(), "unsupported".to_string())],
        };
        assert_eq!(report_notice(&report), "Processed 1 file(s). Failed: b.png (unsupported)");
    }

    #[test]
    fn workflow_errors_map_to_status_codes() {
        let not_found: ApiError = WorkflowError::Session(SessionError::NotFound("f".into())).into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let bad: ApiError = WorkflowError::EmptyQuestion.into();
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);

        let upstream: ApiError = WorkflowError::Chat(crate::chat::ChatError::EmptyResponse).into();
        assert_eq!(upstream.status, StatusCode::BAD_GATEWAY);
    }
}
