//! Prompt rendering for batched grouping evaluation.
//!
//! The system instruction and the reply parser share one grammar: the
//! `Task N:` marker plus four labels in a fixed order. Both sides read the
//! labels from [`ReplyField`] so they cannot drift apart.

use crate::gateway::Message;
use crate::grading::reply::ReplyField;
use crate::grading::types::{Grade, GroupingTask};

/// Identifies the template that produced a prompt, recorded in traces.
pub const TEMPLATE_SLUG: &str = "grouping_batch_v1";

/// Reference corpora the model is told to consult.
pub const SOURCES: [&str; 4] = [
    "Google Scholar",
    "PubMed",
    "JSTOR",
    "Office for National Statistics (ONS)",
];

const USER_PREAMBLE: &str =
    "Evaluate multiple feature groupings for their semantic value and usage frequency.";

/// Rendered prompt ready for the model.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: String,
    pub user: String,
    pub task_count: usize,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// The fixed system instruction: rubric, sources and reply template.
pub fn system_instruction() -> String {
    let mut out = String::from(
        "You are tasked with evaluating the semantic value of given groupings for specified \
         features. For each task, judge how commonly the stated grouping method is used with \
         the stated feature.\n\n",
    );

    out.push_str("Use these sources as the standard reference corpus:\n");
    for source in SOURCES {
        out.push_str(&format!("- {source}\n"));
    }

    out.push_str("\nGrade each grouping on this scale:\n");
    for (value, definition) in Grade::DEFINITIONS {
        out.push_str(&format!("{value} = {definition}\n"));
    }

    out.push_str(
        "\nReport how many references you found in the sources and give links to two of \
         them for validation.\n\n",
    );

    out.push_str("Format your response for each task exactly as:\n");
    out.push_str("Task N:\n");
    for field in ReplyField::ORDER {
        out.push_str(&format!("- {}: {}\n", field.label(), field.placeholder()));
    }

    out.push_str(
        "\nAnswer every task in the order given and keep the task numbers exactly as given. \
         Do not add text before the first task.",
    );
    out
}

/// Render one task block, numbered from 1.
pub fn render_task(number: usize, task: &GroupingTask) -> String {
    format!(
        "Task {number}:\nFeature: {}\nRange: {}\nGrouping: {}",
        single_line(&task.feature_name),
        task.domain_range.render_domain(),
        task.grouping_string()
    )
}

/// Render a batch. A single task is a batch of one.
pub fn render_batch(tasks: &[GroupingTask]) -> PromptInstance {
    let mut blocks = Vec::with_capacity(tasks.len() + 1);
    blocks.push(USER_PREAMBLE.to_string());
    for (idx, task) in tasks.iter().enumerate() {
        blocks.push(render_task(idx + 1, task));
    }

    PromptInstance {
        template_slug: TEMPLATE_SLUG,
        system: system_instruction(),
        user: blocks.join("\n\n"),
        task_count: tasks.len(),
    }
}

/// Collapse whitespace so a feature name cannot inject its own `Task N:` line.
fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// =============================================================================
// TESTS
// =============================================================================
