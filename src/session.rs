use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::persistence::Snapshot;

/// Instruction used on first start and after a clear
pub const DEFAULT_INSTRUCTION: &str = "Please carefully check the translation quality of the following text, \
evaluating its accuracy, fluency and cultural adaptation. If anything is unreasonable, point it out \
specifically and provide suggested revisions.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role-tagged message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Turn {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Turn {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Everything known about one analyzed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(rename = "content_str", alias = "content")]
    pub content: String,
    #[serde(rename = "initial_user_prompt_content", alias = "initial_prompt")]
    pub initial_prompt: String,
    pub initial_response: String,
    #[serde(rename = "chat_history", alias = "history")]
    pub history: Vec<Turn>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no conversation recorded for file '{0}'")]
    NotFound(String),
}

/// In-memory session: one conversation per filename plus the shared
/// instruction and credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    files: BTreeMap<String, ConversationRecord>,
    instruction: String,
    credential: String,
    clear_pending: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            files: BTreeMap::new(),
            instruction: DEFAULT_INSTRUCTION.to_string(),
            credential: String::new(),
            clear_pending: false,
        }
    }
}

impl SessionState {
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        SessionState {
            files: snapshot.files,
            instruction: snapshot.instruction,
            credential: snapshot.credential,
            clear_pending: false,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            files: self.files.clone(),
            instruction: self.instruction.clone(),
            credential: self.credential.clone(),
        }
    }

    /// Store the first exchange for a file. Re-analyzing a file replaces
    /// its whole conversation.
    pub fn record_initial_analysis(
        &mut self,
        filename: &str,
        content: String,
        prompt: String,
        response: String,
    ) {
        let history = vec![Turn::user(prompt.clone()), Turn::assistant(response.clone())];
        self.files.insert(
            filename.to_string(),
            ConversationRecord {
                content,
                initial_prompt: prompt,
                initial_response: response,
                history,
            },
        );
    }

    pub fn append_turn(
        &mut self,
        filename: &str,
        role: Role,
        content: impl Into<String>,
    ) -> Result<(), SessionError> {
        let record = self
            .files
            .get_mut(filename)
            .ok_or_else(|| SessionError::NotFound(filename.to_string()))?;
        record.history.push(Turn {
            role,
            content: content.into(),
        });
        Ok(())
    }

    /// Drop every conversation and restore the default instruction
    pub fn clear_all(&mut self) {
        self.files.clear();
        self.instruction = DEFAULT_INSTRUCTION.to_string();
        self.clear_pending = false;
    }

    /// First half of the destructive clear: nothing is removed yet
    pub fn request_clear(&mut self) {
        self.clear_pending = true;
    }

    pub fn cancel_clear(&mut self) {
        self.clear_pending = false;
    }

    /// Second half of the destructive clear. Returns whether anything ran.
    pub fn confirm_clear(&mut self) -> bool {
        if !self.clear_pending {
            return false;
        }
        self.clear_all();
        true
    }

    pub fn clear_pending(&self) -> bool {
        self.clear_pending
    }

    pub fn record(&self, filename: &str) -> Option<&ConversationRecord> {
        self.files.get(filename)
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &ConversationRecord)> {
        self.files.iter()
    }

    pub fn filenames(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn set_instruction(&mut self, instruction: impl Into<String>) {
        self.instruction = instruction.into();
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn set_credential(&mut self, credential: impl Into<String>) {
        self.credential = credential.into();
    }
}
