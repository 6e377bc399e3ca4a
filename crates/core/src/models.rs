use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassageMetadata {
    pub doc_id: String,
    pub page: u32,
    /// Zero-based position of the passage within its document.
    pub ordinal: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Passage {
    pub text: String,
    pub metadata: PassageMetadata,
}

impl Passage {
    /// Stable vector id within a namespace.
    pub fn vector_id(&self) -> String {
        format!("{}#{}", self.metadata.doc_id, self.metadata.ordinal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub passage: Passage,
    pub score: f32,
}

/// Hits ordered by descending similarity.
pub type RetrievalResult = Vec<RetrievalHit>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Answer {
    pub context: String,
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    Human,
    Ai,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only conversation for one (owner, document) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    turns: Vec<ChatTurn>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a history from stored turns, restoring `created_at` order.
    pub fn from_turns(mut turns: Vec<ChatTurn>) -> Self {
        turns.sort_by_key(|turn| turn.created_at);
        Self { turns }
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn human_turns(&self) -> usize {
        self.turns
            .iter()
            .filter(|turn| turn.role == ChatRole::Human)
            .count()
    }

    /// Appends a `human` question followed by its `ai` answer.
    pub fn record_exchange(&mut self, question: &str, answer: &str) {
        let asked_at = self.next_timestamp();
        self.turns.push(ChatTurn {
            role: ChatRole::Human,
            text: question.to_string(),
            created_at: asked_at,
        });
        let answered_at = self.next_timestamp();
        self.turns.push(ChatTurn {
            role: ChatRole::Ai,
            text: answer.to_string(),
            created_at: answered_at,
        });
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.turns.last() {
            Some(last) if now <= last.created_at => last.created_at + Duration::microseconds(1),
            _ => now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub completed: bool,
    /// `false` when an existing namespace was reused.
    pub built: bool,
    pub passages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AskResponse {
    pub success: bool,
    pub answer: Option<String>,
    pub error_message: Option<String>,
}

impl AskResponse {
    pub fn answered(answer: String) -> Self {
        Self {
            success: true,
            answer: Some(answer),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            answer: None,
            error_message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_appends_human_then_ai_with_increasing_timestamps() {
        let mut history = ChatHistory::new();
        history.record_exchange("What is Alpha?", "A letter.");
        history.record_exchange("And Beta?", "Another letter.");

        let roles: Vec<ChatRole> = history.turns().iter().map(|turn| turn.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::Human, ChatRole::Ai, ChatRole::Human, ChatRole::Ai]
        );
        assert!(history
            .turns()
            .windows(2)
            .all(|pair| pair[0].created_at < pair[1].created_at));
        assert_eq!(history.human_turns(), 2);
    }

    #[test]
    fn from_turns_sorts_by_creation_time() {
        let now = Utc::now();
        let history = ChatHistory::from_turns(vec![
            ChatTurn {
                role: ChatRole::Ai,
                text: "second".to_string(),
                created_at: now + Duration::seconds(1),
            },
            ChatTurn {
                role: ChatRole::Human,
                text: "first".to_string(),
                created_at: now,
            },
        ]);
        assert_eq!(history.turns()[0].text, "first");
    }

    #[test]
    fn vector_id_combines_document_and_ordinal() {
        let passage = Passage {
            text: "x".to_string(),
            metadata: PassageMetadata {
                doc_id: "doc".to_string(),
                page: 1,
                ordinal: 3,
            },
        };
        assert_eq!(passage.vector_id(), "doc#3");
    }
}
