//! Human-in-the-loop chat broker.
//!
//! A single process-lifetime broker shared by every in-flight run: an agent
//! posts a question and blocks on the reply, an external actor posts the
//! answer from another task. Wait/notify via a stored oneshot channel;
//! the wait path never polls.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMessageKind {
    Question,
    Answer,
    Note,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub author: String,
    pub text: String,
    pub kind: ChatMessageKind,
    pub timestamp: DateTime<Utc>,
}

struct ChatInner {
    history: Vec<ChatMessage>,
    next_id: u64,
    /// Question id of the outstanding ask, if any.
    pending_question: Option<u64>,
    pending_tx: Option<oneshot::Sender<String>>,
    pending_rx: Option<oneshot::Receiver<String>>,
}

/// Thread-safe question/answer broker with an append-only, id-ordered
/// history. At most one question is pending at a time.
pub struct ChatBroker {
    inner: Mutex<ChatInner>,
}

impl ChatBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ChatInner {
                history: Vec::new(),
                next_id: 1,
                pending_question: None,
                pending_tx: None,
                pending_rx: None,
            }),
        }
    }

    /// Post a question and mark it pending. A second ask before the answer
    /// is a caller error.
    pub async fn ask(&self, author: &str, text: &str) -> Result<ChatMessage> {
        let mut inner = self.inner.lock().await;
        if inner.pending_question.is_some() {
            return Err(TrellisError::QuestionPending);
        }
        let message = inner.append(author, text, ChatMessageKind::Question);
        let (tx, rx) = oneshot::channel();
        inner.pending_question = Some(message.id);
        inner.pending_tx = Some(tx);
        inner.pending_rx = Some(rx);
        debug!(id = message.id, "question posted");
        Ok(message)
    }

    /// Record a reply; if a question is pending, wake the blocked waiter
    /// with this exact text.
    pub async fn answer(&self, text: &str) -> Result<ChatMessage> {
        let mut inner = self.inner.lock().await;
        let message = inner.append("user", text, ChatMessageKind::Answer);
        if let Some(tx) = inner.pending_tx.take() {
            // Delivery failure means the waiter gave up; the history entry stands.
            let _ = tx.send(text.to_string());
            debug!(id = message.id, "answer delivered to waiter");
        }
        Ok(message)
    }

    /// Record a plain note (no wakeup semantics).
    pub async fn note(&self, author: &str, text: &str) -> Result<ChatMessage> {
        let mut inner = self.inner.lock().await;
        Ok(inner.append(author, text, ChatMessageKind::Note))
    }

    /// Block until the pending question is answered or the timeout elapses.
    ///
    /// Faults immediately when no question is pending. A timeout leaves the
    /// question pending so a later wait can still pick up the answer; a
    /// received answer clears the pending flag.
    pub async fn wait_for_answer(&self, timeout: Duration) -> Result<String> {
        let mut rx = {
            let mut inner = self.inner.lock().await;
            inner
                .pending_rx
                .take()
                .ok_or(TrellisError::NoPendingQuestion)?
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(text)) => {
                let mut inner = self.inner.lock().await;
                inner.pending_question = None;
                Ok(text)
            }
            Ok(Err(_)) => {
                // Sender dropped without an answer; treat as no longer pending.
                let mut inner = self.inner.lock().await;
                inner.pending_question = None;
                Err(TrellisError::NoPendingQuestion)
            }
            Err(_) => {
                let mut inner = self.inner.lock().await;
                inner.pending_rx = Some(rx);
                Err(TrellisError::AnswerTimeout {
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    /// All messages with an id strictly greater than `after_id`.
    pub async fn messages_after(&self, after_id: u64) -> Vec<ChatMessage> {
        let inner = self.inner.lock().await;
        inner
            .history
            .iter()
            .filter(|m| m.id > after_id)
            .cloned()
            .collect()
    }

    /// The outstanding question, if any.
    pub async fn pending_question(&self) -> Option<ChatMessage> {
        let inner = self.inner.lock().await;
        let id = inner.pending_question?;
        inner.history.iter().find(|m| m.id == id).cloned()
    }

    pub async fn history(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.history.clone()
    }
}

impl Default for ChatBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatInner {
    fn append(&mut self, author: &str, text: &str, kind: ChatMessageKind) -> ChatMessage {
        let message = ChatMessage {
            id: self.next_id,
            author: author.to_string(),
            text: text.to_string(),
            kind,
            timestamp: Utc::now(),
        };
        self.next_id += 1;
        self.history.push(message.clone());
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_without_question_faults_immediately() {
        let broker = ChatBroker::new();
        let result = broker.wait_for_answer(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TrellisError::NoPendingQuestion)));
    }

    #[tokio::test]
    async fn answer_from_second_task_unblocks_waiter_with_exact_text() {
        let broker = Arc::new(ChatBroker::new());
        broker.ask("planner", "Which region?").await.unwrap();

        let responder = broker.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            responder.answer("eu-west-1").await.unwrap();
        });

        let text = broker
            .wait_for_answer(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(text, "eu-west-1");
        handle.await.unwrap();

        // pending flag cleared: a new question is accepted
        assert!(broker.pending_question().await.is_none());
        assert!(broker.ask("planner", "Anything else?").await.is_ok());
    }

    #[tokio::test]
    async fn second_ask_while_pending_is_a_caller_error() {
        let broker = ChatBroker::new();
        broker.ask("a", "first?").await.unwrap();
        let result = broker.ask("b", "second?").await;
        assert!(matches!(result, Err(TrellisError::QuestionPending)));
    }

    #[tokio::test]
    async fn timeout_leaves_question_pending() {
        let broker = ChatBroker::new();
        broker.ask("agent", "still there?").await.unwrap();

        let result = broker.wait_for_answer(Duration::from_millis(5)).await;
        assert!(matches!(result, Err(TrellisError::AnswerTimeout { .. })));
        assert!(broker.pending_question().await.is_some());

        // answer posted after the timeout is picked up by a later wait
        broker.answer("yes").await.unwrap();
        let text = broker
            .wait_for_answer(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(text, "yes");
    }

    #[tokio::test]
    async fn answer_before_wait_is_buffered() {
        let broker = ChatBroker::new();
        broker.ask("agent", "color?").await.unwrap();
        broker.answer("green").await.unwrap();

        let text = broker
            .wait_for_answer(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(text, "green");
    }

    #[tokio::test]
    async fn history_is_append_only_and_id_ordered() {
        let broker = ChatBroker::new();
        broker.ask("agent", "q1").await.unwrap();
        broker.answer("a1").await.unwrap();
        broker.note("system", "n1").await.unwrap();

        let all = broker.history().await;
        let ids: Vec<u64> = all.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let tail = broker.messages_after(1).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].text, "a1");
        assert_eq!(tail[1].kind, ChatMessageKind::Note);
    }
}
