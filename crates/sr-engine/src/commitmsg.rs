//! Template-driven commit messages: task name as the subject, a description
//! excerpt, and the changed file list.

use sr_core::types::Task;

const EXCERPT_LIMIT: usize = 200;

pub fn commit_message(task: &Task, files: &[String]) -> String {
    let mut message = task.name.clone();

    let excerpt = excerpt(&task.description);
    if !excerpt.is_empty() {
        message.push_str("\n\n");
        message.push_str(&excerpt);
    }

    if !files.is_empty() {
        message.push_str("\n\nFiles:\n");
        for file in files {
            message.push_str(&format!("- {}\n", file));
        }
    }

    message
}

fn excerpt(description: &str) -> String {
    let trimmed = description.trim();
    if trimmed.len() <= EXCERPT_LIMIT {
        return trimmed.to_string();
    }
    // Cut on a char boundary, then back off to the last word.
    let mut cut = EXCERPT_LIMIT;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    let head = &trimmed[..cut];
    let head = head.rsplit_once(' ').map(|(h, _)| h).unwrap_or(head);
    format!("{}…", head)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
