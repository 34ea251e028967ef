use log::{info, warn};
use thiserror::Error;

use crate::chat::{ChatCompletion, ChatError};
use crate::ingest;
use crate::prompt;
use crate::session::{Role, SessionError, SessionState, Turn};

/// Environment variable that takes precedence over the stored API key
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("the processing instruction is empty")]
    EmptyInstruction,
    #[error("the question is empty")]
    EmptyQuestion,
    #[error("no API key configured; set OPENAI_API_KEY or store one with `filechat credential`")]
    MissingCredential,
    #[error("no files to process")]
    NoFiles,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no reply from the model: {0}")]
    Chat(#[from] ChatError),
}

/// A file handed over by a shell
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Upload {
            filename: filename.into(),
            bytes,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub analyzed: Vec<String>,
    /// (filename, reason) for every file that produced no record
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The key used for requests: environment first, then the stored one
pub fn effective_credential(state: &SessionState) -> Option<String> {
    let from_env = std::env::var(API_KEY_ENV).ok();
    pick_credential(from_env.as_deref(), state.credential())
}

fn pick_credential(from_env: Option<&str>, stored: &str) -> Option<String> {
    from_env
        .filter(|key| !key.trim().is_empty())
        .or(Some(stored).filter(|key| !key.trim().is_empty()))
        .map(|key| key.trim().to_string())
}

/// Analyze each upload in turn with the current instruction.
///
/// One request per file, strictly sequential. A file that cannot be read or
/// gets no reply is reported in the batch and leaves the store untouched.
pub fn analyze_uploads<C, F>(
    state: &mut SessionState,
    client: &C,
    uploads: &[Upload],
    mut on_progress: F,
) -> Result<BatchReport, WorkflowError>
where
    C: ChatCompletion + ?Sized,
    F: FnMut(usize, usize, &str),
{
    if state.instruction().trim().is_empty() {
        return Err(WorkflowError::EmptyInstruction);
    }
    let credential = effective_credential(state).ok_or(WorkflowError::MissingCredential)?;
    if uploads.is_empty() {
        return Err(WorkflowError::NoFiles);
    }

    let total = uploads.len();
    let mut report = BatchReport::default();

    for (index, upload) in uploads.iter().enumerate() {
        on_progress(index, total, &upload.filename);

        let content = match ingest::read_upload(&upload.filename, &upload.bytes) {
            Ok(content) => content,
            Err(e) => {
                warn!("Skipping {}: {}", upload.filename, e);
                report.failed.push((upload.filename.clone(), e.to_string()));
                continue;
            }
        };

        let initial_prompt = prompt::build_initial_prompt(&content, state.instruction());
        let messages = [Turn::user(initial_prompt.clone())];

        match client.complete(&credential, &messages) {
            Ok(response) => {
                state.record_initial_analysis(&upload.filename, content, initial_prompt, response);
                info!("Initial analysis of {} complete", upload.filename);
                report.analyzed.push(upload.filename.clone());
            }
            Err(e) => {
                report.failed.push((upload.filename.clone(), e.to_string()));
            }
        }
    }

    Ok(report)
}

/// Ask a follow-up question about an analyzed file.
///
/// The question is kept in the history even when the model does not answer;
/// only a successful reply adds an assistant turn. An unanswered question
/// therefore stays in the context of the next request, which then carries
/// two user turns in a row. Chat-completions endpoints accept that, and the
/// model sees what went unanswered.
pub fn ask<C>(
    state: &mut SessionState,
    client: &C,
    filename: &str,
    question: &str,
) -> Result<String, WorkflowError>
where
    C: ChatCompletion + ?Sized,
{
    if state.record(filename).is_none() {
        return Err(SessionError::NotFound(filename.to_string()).into());
    }
    if question.trim().is_empty() {
        return Err(WorkflowError::EmptyQuestion);
    }
    let credential = effective_credential(state).ok_or(WorkflowError::MissingCredential)?;

    state.append_turn(filename, Role::User, question)?;

    let history = state
        .record(filename)
        .map(|record| record.history.clone())
        .ok_or_else(|| SessionError::NotFound(filename.to_string()))?;

    let reply = client.complete(&credential, &history)?;
    state.append_turn(filename, Role::Assistant, reply.clone())?;
    Ok(reply)
}

/// History as a shell should show it, with the first prompt replaced by a
/// short summary
pub fn display_history(state: &SessionState, filename: &str) -> Result<Vec<Turn>, SessionError> {
    let record = state
        .record(filename)
        .ok_or_else(|| SessionError::NotFound(filename.to_string()))?;

    Ok(record
        .history
        .iter()
        .enumerate()
        .map(|(i, turn)| {
            if i == 0 && turn.role == Role::User {
                Turn::user(prompt::initial_turn_summary(filename, state.instruction()))
            } else {
                turn.clone()
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Replays canned results and records every request
    struct ScriptedChat {
        replies: RefCell<VecDeque<Result<String, ChatError>>>,
        requests: RefCell<Vec<Vec<Turn>>>,
    }

    impl ScriptedChat {
        fn new(replies: Vec<Result<String, ChatError>>) -> Self {
            ScriptedChat {
                replies: RefCell::new(replies.into()),
                requests: RefCell::new(Vec::new()),
            }
        }
    }

    impl ChatCompletion for ScriptedChat {
        fn complete(&self, _credential: &str, messages: &[Turn]) -> Result<String, ChatError> {
            self.requests.borrow_mut().push(messages.to_vec());
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or(Err(ChatError::EmptyResponse))
        }
    }

    fn state_with_key() -> SessionState {
        let mut state = SessionState::default();
        state.set_credential("sk-test");
        state.set_instruction("summarize");
        state
    }

    #[test]
    fn credential_prefers_environment_value() {
        assert_eq!(pick_credential(Some("sk-env"), "sk-stored").as_deref(), Some("sk-env"));
        assert_eq!(pick_credential(Some("  "), "sk-stored").as_deref(), Some("sk-stored"));
        assert_eq!(pick_credential(None, "sk-stored").as_deref(), Some("sk-stored"));
        assert_eq!(pick_credential(None, ""), None);
    }

    #[test]
    fn analyzing_a_text_file_records_the_conversation() {
        let mut state = state_with_key();
        let chat = ScriptedChat::new(vec![Ok("It says hello.".to_string())]);
        let uploads = [Upload::new("notes.txt", b"hello".to_vec())];

        let report = analyze_uploads(&mut state, &chat, &uploads, |_, _, _| {}).unwrap();

        assert_eq!(report.analyzed, vec!["notes.txt"]);
        assert!(report.is_clean());
        let record = state.record("notes.txt").unwrap();
        assert_eq!(record.history[0].role, Role::User);
        assert!(record.history[0].content.contains("hello"));
        assert!(record.history[0].content.contains("summarize"));
        assert_eq!(record.history[1], Turn::assistant("It says hello."));
        assert_eq!(chat.requests.borrow()[0].len(), 1);
    }

    #[test]
    fn batch_continues_past_failures() {
        let mut state = state_with_key();
        let chat = ScriptedChat::new(vec![
            Err(ChatError::RateLimited("quota".to_string())),
            Ok("fine".to_string()),
        ]);
        let uploads = [
            Upload::new("a.txt", b"a".to_vec()),
            Upload::new("b.png", vec![0x89]),
            Upload::new("c.md", b"c".to_vec()),
        ];
        let mut progress = Vec::new();

        let report = analyze_uploads(&mut state, &chat, &uploads, |i, total, name| {
            progress.push((i, total, name.to_string()))
        })
        .unwrap();

        assert_eq!(report.analyzed, vec!["c.md"]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, "a.txt");
        assert_eq!(report.failed[1].0, "b.png");
        assert!(state.record("a.txt").is_none());
        assert_eq!(state.filenames(), vec!["c.md"]);
        assert_eq!(progress.len(), 3);
        assert_eq!(progress[2], (2, 3, "c.md".to_string()));
        // the unsupported file never reached the model
        assert_eq!(chat.requests.borrow().len(), 2);
    }

    #[test]
    fn analysis_is_refused_without_instruction_or_files() {
        let chat = ScriptedChat::new(vec![]);
        let uploads = [Upload::new("a.txt", b"a".to_vec())];

        let mut state = state_with_key();
        state.set_instruction("   ");
        assert!(matches!(
            analyze_uploads(&mut state, &chat, &uploads, |_, _, _| {}),
            Err(WorkflowError::EmptyInstruction)
        ));

        let mut state = state_with_key();
        assert!(matches!(
            analyze_uploads(&mut state, &chat, &[], |_, _, _| {}),
            Err(WorkflowError::NoFiles)
        ));
        assert!(chat.requests.borrow().is_empty());
    }

    #[test]
    fn follow_up_extends_history_to_four_turns() {
        let mut state = state_with_key();
        let chat = ScriptedChat::new(vec![Ok("first".to_string()), Ok("more".to_string())]);
        let uploads = [Upload::new("notes.txt", b"hello".to_vec())];
        analyze_uploads(&mut state, &chat, &uploads, |_, _, _| {}).unwrap();
        let seeded = state.record("notes.txt").unwrap().history.clone();

        let reply = ask(&mut state, &chat, "notes.txt", "explain more").unwrap();

        assert_eq!(reply, "more");
        let history = &state.record("notes.txt").unwrap().history;
        assert_eq!(history.len(), 4);
        assert_eq!(history[..2], seeded[..]);
        assert_eq!(history[2], Turn::user("explain more"));
        assert_eq!(history[3], Turn::assistant("more"));
        // the whole conversation is sent, ending with the question
        let sent = &chat.requests.borrow()[1];
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2], Turn::user("explain more"));
    }

    #[test]
    fn failed_follow_up_adds_no_assistant_turn() {
        let mut state = state_with_key();
        state.record_initial_analysis("f.txt", "x".into(), "p".into(), "r".into());
        let chat = ScriptedChat::new(vec![Err(ChatError::Transport("down".to_string()))]);

        let err = ask(&mut state, &chat, "f.txt", "why?").unwrap_err();

        assert!(matches!(err, WorkflowError::Chat(ChatError::Transport(_))));
        let history = &state.record("f.txt").unwrap().history;
        assert_eq!(history.len(), 3);
        assert_eq!(history[2], Turn::user("why?"));
    }

    #[test]
    fn next_question_after_a_failure_carries_both_user_turns() {
        let mut state = state_with_key();
        state.record_initial_analysis("f.txt", "x".into(), "p".into(), "r".into());
        let chat = ScriptedChat::new(vec![
            Err(ChatError::Transport("down".to_string())),
            Ok("answer".to_string()),
        ]);

        ask(&mut state, &chat, "f.txt", "why?").unwrap_err();
        let reply = ask(&mut state, &chat, "f.txt", "still there?").unwrap();

        assert_eq!(reply, "answer");
        let sent = &chat.requests.borrow()[1];
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[2], Turn::user("why?"));
        assert_eq!(sent[3], Turn::user("still there?"));
        let history = &state.record("f.txt").unwrap().history;
        assert_eq!(history.len(), 5);
        assert_eq!(history[4], Turn::assistant("answer"));
    }

    #[test]
    fn asking_about_unknown_file_is_not_found() {
        let mut state = state_with_key();
        let chat = ScriptedChat::new(vec![]);

        let err = ask(&mut state, &chat, "ghost.txt", "hi").unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::Session(SessionError::NotFound(ref f)) if f == "ghost.txt"
        ));
        assert!(chat.requests.borrow().is_empty());
    }

    #[test]
    fn display_history_hides_the_full_prompt() {
        let mut state = state_with_key();
        state.record_initial_analysis("f.txt", "x".into(), "HUGE PROMPT".into(), "r".into());

        let shown = display_history(&state, "f.txt").unwrap();

        assert!(!shown[0].content.contains("HUGE PROMPT"));
        assert!(shown[0].content.contains("f.txt"));
        assert_eq!(shown[1], Turn::assistant("r"));
    }
}
