//! Task Divider
//!
//! Deterministically splits a prompt into subtask fragments according to
//! the division mode.

use regex::Regex;
use std::sync::OnceLock;

use iris_common::TaskMode;

use crate::config::Config;

/// Sentence boundaries: text up to `.`, `!` or `?` plus trailing space.
fn sentence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^.!?]+[.!?]*\s*").expect("valid regex"))
}

/// Split a prompt into fragments for the given mode. Always returns at
/// least one fragment for non-empty input; `Direct` never reaches here.
#[must_use]
pub fn divide(mode: TaskMode, prompt: &str, config: &Config) -> Vec<String> {
    match mode {
        TaskMode::Subtasks => split_fragments(prompt, config.max_subtasks_per_task),
        TaskMode::Consensus => {
            vec![prompt.to_string(); config.consensus_replicas as usize]
        }
        TaskMode::Context => {
            split_windows(prompt, config.context_window_tokens, config.context_overlap_tokens)
        }
        TaskMode::Direct => vec![prompt.to_string()],
    }
}

/// Paragraph boundaries first, sentences when the prompt is one paragraph,
/// capped at `max` fragments by merging the tail into the last one.
fn split_fragments(prompt: &str, max: usize) -> Vec<String> {
    let paragraphs: Vec<String> = prompt
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect();

    let fragments = if paragraphs.len() > 1 {
        paragraphs
    } else {
        sentence_pattern()
            .find_iter(prompt)
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    };

    let fragments = if fragments.is_empty() {
        vec![prompt.trim().to_string()]
    } else {
        fragments
    };

    cap_fragments(fragments, max.max(1))
}

fn cap_fragments(mut fragments: Vec<String>, max: usize) -> Vec<String> {
    if fragments.len() <= max {
        return fragments;
    }
    let tail = fragments.split_off(max - 1).join(" ");
    fragments.push(tail);
    fragments
}

/// Overlapping whitespace-token windows of `window` tokens advancing by
/// `window - overlap` each step.
fn split_windows(document: &str, window: usize, overlap: usize) -> Vec<String> {
    let tokens: Vec<&str> = document.split_whitespace().collect();
    let window = window.max(1);
    let step = window.saturating_sub(overlap).max(1);

    if tokens.len() <= window {
        return vec![tokens.join(" ")];
    }

    let mut windows = Vec::new();
    let mut start = 0;
    while start < tokens.len() {
        let end = (start + window).min(tokens.len());
        windows.push(tokens[start..end].join(" "));
        if end == tokens.len() {
            break;
        }
        start += step;
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default_for_test()
    }

    #[test]
    fn paragraphs_become_fragments() {
        let prompt = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let fragments = divide(TaskMode::Subtasks, prompt, &config());
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0], "First paragraph.");
    }

    #[test]
    fn single_paragraph_splits_on_sentences() {
        let prompt = "One sentence. Another sentence! A third?";
        let fragments = divide(TaskMode::Subtasks, prompt, &config());
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[1], "Another sentence!");
    }

    #[test]
    fn fragment_count_is_capped() {
        let mut cfg = config();
        cfg.max_subtasks_per_task = 2;
        let prompt = "A.\n\nB.\n\nC.\n\nD.";
        let fragments = divide(TaskMode::Subtasks, prompt, &cfg);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1], "B. C. D.");
    }

    #[test]
    fn division_is_deterministic() {
        let prompt = "Alpha. Beta. Gamma.";
        let first = divide(TaskMode::Subtasks, prompt, &config());
        let second = divide(TaskMode::Subtasks, prompt, &config());
        assert_eq!(first, second);
    }

    #[test]
    fn consensus_duplicates_the_prompt() {
        let fragments = divide(TaskMode::Consensus, "Is 1+1 = 2?", &config());
        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|f| f == "Is 1+1 = 2?"));
    }

    #[test]
    fn context_windows_overlap() {
        let mut cfg = config();
        cfg.context_window_tokens = 4;
        cfg.context_overlap_tokens = 1;
        let doc = "t0 t1 t2 t3 t4 t5 t6 t7";
        let windows = divide(TaskMode::Context, doc, &cfg);
        assert_eq!(windows[0], "t0 t1 t2 t3");
        assert_eq!(windows[1], "t3 t4 t5 t6");
        assert_eq!(windows[2], "t6 t7");
    }

    #[test]
    fn small_document_is_one_window() {
        let windows = divide(TaskMode::Context, "just a few tokens", &config());
        assert_eq!(windows.len(), 1);
    }
}
