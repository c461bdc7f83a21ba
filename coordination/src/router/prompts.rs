//! Prompt templates for each task type
//!
//! Renders the text sent to a backend model. Document content is truncated
//! to a character budget so a single oversized document cannot blow the
//! backend's context window.

use crate::task::{Task, TaskType};

/// Marker appended when content was cut to fit the budget.
const TRUNCATION_MARKER: &str = "\n[... document truncated ...]";

/// Builder for backend prompts
pub struct TaskPrompt<'a> {
    task_type: TaskType,
    content: &'a str,
    question: Option<&'a str>,
    max_content_chars: usize,
}

impl<'a> TaskPrompt<'a> {
    /// Create a new builder
    pub fn new(task_type: TaskType, content: &'a str) -> Self {
        Self {
            task_type,
            content,
            question: None,
            max_content_chars: usize::MAX,
        }
    }

    /// Builder pre-filled from a task.
    pub fn for_task(task: &'a Task) -> Self {
        let mut prompt = Self::new(task.task_type(), task.content());
        prompt.question = task.question();
        prompt
    }

    /// Question answered by `qa` prompts
    pub fn with_question(mut self, question: &'a str) -> Self {
        self.question = Some(question);
        self
    }

    /// Limit the document characters included
    pub fn max_content_chars(mut self, max: usize) -> Self {
        self.max_content_chars = max;
        self
    }

    fn instructions(&self) -> &'static str {
        match self.task_type {
            TaskType::Summary => {
                "Summarize the document below in a few short paragraphs. \
                 Keep names, dates and amounts exact. Do not add information \
                 that is not in the document."
            }
            TaskType::ActionItems => {
                "List every action item in the document below. One item per \
                 line, formatted as `- [owner] task (due date)`. Use `unassigned` \
                 when no owner is named and omit the due date when none is given."
            }
            TaskType::Risk => {
                "Assess the legal, financial and operational risks in the \
                 document below. For each risk give a severity (low, medium, \
                 high, critical), the clause or passage it comes from, and a \
                 one-sentence explanation."
            }
            TaskType::Qa => {
                "Answer the question using only the document below. If the \
                 document does not contain the answer, say so."
            }
            TaskType::Embedding => "Represent the document below for semantic retrieval.",
            TaskType::Search => "",
        }
    }

    /// Build the prompt string
    pub fn build(&self) -> String {
        let mut prompt = String::new();

        prompt.push_str(&format!("# Task: {}\n\n", self.task_type));
        prompt.push_str("## Instructions\n\n");
        prompt.push_str(self.instructions());
        prompt.push_str("\n\n");

        if self.task_type == TaskType::Qa {
            let question = self.question.unwrap_or("Summarize what the document is about.");
            prompt.push_str(&format!("## Question\n\n{}\n\n", question));
        }

        prompt.push_str("## Document\n\n");
        let (content, truncated) = truncate_chars(self.content, self.max_content_chars);
        prompt.push_str(content);
        if truncated {
            prompt.push_str(TRUNCATION_MARKER);
        }
        prompt.push('\n');

        prompt
    }
}

/// Cut `s` to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> (&str, bool) {
    match s.char_indices().nth(max) {
        Some((idx, _)) => (&s[..idx], true),
        None => (s, false),
    }
}
