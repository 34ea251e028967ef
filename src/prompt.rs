/// Build the first prompt sent for a file.
///
/// Any text is accepted, including an empty string or an error placeholder
/// produced during ingestion.
pub fn build_initial_prompt(file_text: &str, instruction: &str) -> String {
    format!(
        "The following is the file content and processing instruction provided by the user. \
Analyze the file content according to the instruction.\n\
\n\
User instruction:\n\
{}\n\
\n\
File content:\n\
---\n\
{}\n\
---\n\
\n\
Please provide your analysis:\n",
        instruction, file_text
    )
}

/// Short stand-in shown instead of the first user turn, which carries the
/// whole file.
pub fn initial_turn_summary(filename: &str, instruction: &str) -> String {
    format!(
        "Submitted an analysis request for file '{}'.\n\n\
**Instruction**:\n{}\n\n\
(The model received the full file content; its first analysis is the reply below.)",
        filename, instruction
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_instruction_before_content() {
        let prompt = build_initial_prompt("hello", "summarize");

        let instruction_at = prompt.find("User instruction:\nsummarize").unwrap();
        let content_at = prompt.find("File content:\n---\nhello\n---").unwrap();
        assert!(instruction_at < content_at);
        assert!(prompt.ends_with("Please provide your analysis:\n"));
    }

    #[test]
    fn prompt_is_deterministic_and_accepts_empty_input() {
        assert_eq!(build_initial_prompt("", ""), build_initial_prompt("", ""));
        assert!(build_initial_prompt("", "x").contains("---\n\n---"));
    }

    #[test]
    fn summary_names_file_and_instruction() {
        let summary = initial_turn_summary("notes.txt", "summarize");
        assert!(summary.contains("'notes.txt'"));
        assert!(summary.contains("summarize"));
    }
}
