//! System prompt assembly.

use std::path::PathBuf;

/// Assembles the system prompt from task, workspace, memory, and facts.
#[derive(Debug, Clone, Default)]
pub struct SystemPromptBuilder {
    task: String,
    working_dir: Option<PathBuf>,
    memory_notes: Vec<String>,
    fact_sheet: Option<String>,
}

impl SystemPromptBuilder {
    /// Start a prompt for the given task.
    #[must_use]
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    /// Name the workspace the agent operates in.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add a note carried over from earlier sessions.
    #[must_use]
    pub fn memory_note(mut self, note: impl Into<String>) -> Self {
        self.memory_notes.push(note.into());
        self
    }

    /// Include a rendered fact sheet.
    #[must_use]
    pub fn fact_sheet(mut self, rendered: impl Into<String>) -> Self {
        let rendered = rendered.into();
        if !rendered.is_empty() {
            self.fact_sheet = Some(rendered);
        }
        self
    }

    /// Render the prompt.
    #[must_use]
    pub fn build(&self) -> String {
        let mut prompt = String::from(
            "You are an autonomous engineering agent. Work the task with the tools \
             provided, verify what you claim, and call `report` with your final \
             answer when done. Prefer reading over guessing; cite files and lines.",
        );

        prompt.push_str("\n\n# Task\n");
        prompt.push_str(&self.task);

        if let Some(dir) = &self.working_dir {
            prompt.push_str("\n\n# Workspace\n");
            prompt.push_str(&dir.to_string_lossy());
        }

        if !self.memory_notes.is_empty() {
            prompt.push_str("\n\n# Notes from earlier sessions\n");
            for note in &self.memory_notes {
                prompt.push_str("- ");
                prompt.push_str(note);
                prompt.push('\n');
            }
        }

        if let Some(facts) = &self.fact_sheet {
            prompt.push_str("\n\n# Working facts\n");
            prompt.push_str(facts);
        }

        prompt
    }
}
