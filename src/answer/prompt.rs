//! Grounded prompt construction.
use std::fmt::Write;

use crate::db::models::Message;
use crate::index::Passage;

/// Build the prompt for `query` from the retrieved passages and the tail
/// of the conversation (at most `history_turns` messages).
#[must_use]
pub fn build_prompt(
    client_id: &str,
    query: &str,
    passages: &[Passage],
    history: &[Message],
    history_turns: usize,
) -> String {
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "You are a helpful assistant for a practitioner reviewing their notes for client \"{client_id}\"."
    );
    prompt.push_str(
        "Answer the question using only the numbered passages below and cite them by number, e.g. [1]. \
         If the passages do not contain the answer, say clearly that the information is not present \
         in this client's documents. Do not guess and do not use outside knowledge.\n\n",
    );

    if passages.is_empty() {
        prompt.push_str(
            "No relevant information was found in this client's documents. \
             Tell the user that the documents do not contain information about this question.\n\n",
        );
    } else {
        prompt.push_str("Passages:\n\n");
        for (n, passage) in passages.iter().enumerate() {
            let _ = writeln!(
                prompt,
                "[{}] (source: {}, passage {})\n{}\n",
                n + 1,
                passage.filename,
                passage.sequence + 1,
                passage.text.trim()
            );
        }
    }

    let recent = &history[history.len().saturating_sub(history_turns)..];
    if !recent.is_empty() {
        prompt.push_str("Recent conversation:\n");
        for message in recent {
            let _ = writeln!(prompt, "{}: {}", message.role.label(), message.content.trim());
        }
        prompt.push('\n');
    }

    let _ = write!(prompt, "Question: {}\nAnswer:", query.trim());
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(filename: &str, sequence: usize, text: &str) -> Passage {
        Passage {
            chunk_id: crate::index::models::chunk_id(filename, sequence),
            filename: filename.to_string(),
            sequence,
            text: text.to_string(),
            section: crate::indexer::Section::Unstructured,
            score: 0.5,
        }
    }

    #[test]
    fn test_numbered_passages_with_sources() {
        let prompt = build_prompt(
            "jane_doe",
            "How is sleep?",
            &[
                passage("session1.txt", 0, "Patient reports improved sleep."),
                passage("session3.txt", 2, "Still waking at 4am."),
            ],
            &[],
            6,
        );
        assert!(prompt.contains("[1] (source: session1.txt, passage 1)\nPatient reports improved sleep."));
        assert!(prompt.contains("[2] (source: session3.txt, passage 3)"));
        assert!(prompt.contains("not present"));
        assert!(prompt.ends_with("Question: How is sleep?\nAnswer:"));
        assert!(!prompt.contains("No relevant information"));
    }

    #[test]
    fn test_no_passages_instruction() {
        let prompt = build_prompt("jane_doe", "Any allergies?", &[], &[], 6);
        assert!(prompt.contains("No relevant information was found"));
        assert!(!prompt.contains("Passages:"));
    }

    #[test]
    fn test_history_is_truncated_to_recent_turns() {
        let history: Vec<Message> = (0..10)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("question {i}"))
                } else {
                    Message::assistant(format!("answer {i}"), vec![])
                }
            })
            .collect();
        let prompt = build_prompt("jane_doe", "And now?", &[], &history, 4);
        assert!(prompt.contains("Recent conversation:\nUser: question 6\nAssistant: answer 7"));
        assert!(prompt.contains("Assistant: answer 9"));
        assert!(!prompt.contains("question 4"));

        let prompt = build_prompt("jane_doe", "And now?", &[], &history, 0);
        assert!(!prompt.contains("Recent conversation"));
    }
}
