//! Response Aggregator
//!
//! Combines completed subtask payloads into the task's final answer
//! according to the division mode.

/// Placeholder inserted where a subtask failed in a PARTIAL aggregate.
fn gap_marker(index: usize) -> String {
    format!("[segment {index} unavailable]")
}

/// Outcome of a consensus vote.
#[derive(Debug, Clone)]
pub struct ConsensusOutcome {
    /// Winning answer text.
    pub answer: String,
    /// Node ids whose answers clearly disagreed with the winner
    /// (similarity below the threshold). Near-paraphrases are not listed.
    pub dissenters: Vec<String>,
}

/// SUBTASKS: concatenate completed payloads in subtask-index order.
/// Returns the aggregate and whether any gap was annotated.
#[must_use]
pub fn aggregate_subtasks(parts: &[Option<String>]) -> (String, bool) {
    let mut gaps = false;
    let joined = parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            part.clone().unwrap_or_else(|| {
                gaps = true;
                gap_marker(i)
            })
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    (joined, gaps)
}

/// CONSENSUS: pick the modal answer among `(node_id, answer, reputation)`
/// replies, clustering by normalised similarity above `threshold`. Cluster
/// size ties go to the cluster holding the highest-reputation producer.
#[must_use]
pub fn aggregate_consensus(
    replies: &[(String, String, i64)],
    threshold: f64,
) -> Option<ConsensusOutcome> {
    if replies.is_empty() {
        return None;
    }

    // Cluster greedily: each reply joins the first cluster whose
    // representative it resembles, else starts its own.
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for (i, (_, answer, _)) in replies.iter().enumerate() {
        let found = clusters.iter_mut().find(|members| {
            let (_, rep_answer, _) = &replies[members[0]];
            similarity(answer, rep_answer) >= threshold
        });
        match found {
            Some(members) => members.push(i),
            None => clusters.push(vec![i]),
        }
    }

    let winner = clusters
        .iter()
        .max_by_key(|members| {
            let best_rep = members.iter().map(|&i| replies[i].2).max().unwrap_or(0);
            (members.len(), best_rep)
        })?;

    // Representative: the highest-reputation producer inside the cluster.
    let best = winner
        .iter()
        .max_by_key(|&&i| replies[i].2)
        .copied()?;
    let answer = replies[best].1.clone();

    let dissenters = replies
        .iter()
        .filter(|(_, reply, _)| similarity(reply, &answer) < threshold)
        .map(|(node_id, _, _)| node_id.clone())
        .collect();

    Some(ConsensusOutcome { answer, dissenters })
}

/// CONTEXT: stitch overlapping window outputs, trimming the first
/// `overlap_tokens` whitespace tokens from every window except the first.
/// Any missing window degrades the aggregate to partial.
#[must_use]
pub fn aggregate_context(windows: &[Option<String>], overlap_tokens: usize) -> (String, bool) {
    let mut gaps = false;
    let mut pieces: Vec<String> = Vec::with_capacity(windows.len());

    for (i, window) in windows.iter().enumerate() {
        match window {
            Some(text) if i == 0 => pieces.push(text.clone()),
            Some(text) => {
                let trimmed: Vec<&str> =
                    text.split_whitespace().skip(overlap_tokens).collect();
                pieces.push(trimmed.join(" "));
            }
            None => {
                gaps = true;
                pieces.push(gap_marker(i));
            }
        }
    }

    (pieces.join(" "), gaps)
}

/// Normalised similarity in [0, 1]: 1 minus the Levenshtein distance over
/// the longer folded string.
#[must_use]
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = fold(a);
    let b = fold(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    let distance = levenshtein(&a, &b);
    let longest = a.chars().count().max(b.chars().count());
    1.0 - distance as f64 / longest as f64
}

/// Case-fold, drop punctuation, collapse whitespace.
fn fold(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Two-row Levenshtein distance over chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }

    prev[b.len()]
}
