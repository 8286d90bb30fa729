//! Per-agent conversation state.
//!
//! A [`Conversation`] keeps two message lists:
//!
//! - the **preamble**: permanent messages (system prompt, seed user message) that are sent
//!   with every request and never trimmed;
//! - the **history**: a bounded rolling window of task prompts and assistant replies.
//!
//! Trimming is lazy. Appending never evicts anything; [`Conversation::trim`] is called by
//! [`Agent::generate`](crate::Agent::generate) right before a request is composed, so the
//! history may temporarily hold more than `max_history` entries between generations.
//!
//! ```
//! use storychain::client_wrapper::Role;
//! use storychain::conversation::Conversation;
//!
//! let mut conversation = Conversation::new(1);
//! conversation.append(Role::System, "You are a product owner.", false);
//! conversation.append(Role::User, "first", true);
//! conversation.append(Role::User, "second", true);
//! assert_eq!(conversation.history().len(), 2);
//!
//! conversation.trim();
//! let request = conversation.compose_request();
//! assert_eq!(request.len(), 2);
//! assert_eq!(request[0].content, "You are a product owner.");
//! assert_eq!(request[1].content, "second");
//! ```

use crate::storychain::client_wrapper::{Message, MessageError, Role};
use std::collections::VecDeque;

/// Preamble plus bounded history for one agent.
#[derive(Debug, Clone)]
pub struct Conversation {
    preamble: Vec<Message>,
    history: VecDeque<Message>,
    max_history: usize,
}

impl Conversation {
    /// Creates an empty conversation whose history is bounded by `max_history` at trim time.
    pub fn new(max_history: usize) -> Self {
        Conversation {
            preamble: Vec::new(),
            history: VecDeque::new(),
            max_history,
        }
    }

    /// Push a message to the history (`to_history = true`) or to the permanent preamble.
    pub fn append(&mut self, role: Role, content: impl Into<String>, to_history: bool) {
        let message = Message::with_role(role, content);
        if to_history {
            self.history.push_back(message);
        } else {
            self.preamble.push(message);
        }
    }

    /// Same as [`append`](Conversation::append) but validates a role given by name.
    pub fn append_named(
        &mut self,
        role: &str,
        content: impl Into<String>,
        to_history: bool,
    ) -> Result<(), MessageError> {
        let role = role.parse()?;
        self.append(role, content, to_history);
        Ok(())
    }

    /// Evict the oldest history entries until at most `max_history` remain.
    ///
    /// Returns how many messages were dropped.
    pub fn trim(&mut self) -> usize {
        let mut evicted = 0;
        while self.history.len() > self.max_history {
            self.history.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// The exact payload for the next request: preamble followed by the current history.
    pub fn compose_request(&self) -> Vec<Message> {
        let mut request = Vec::with_capacity(self.preamble.len() + self.history.len());
        request.extend(self.preamble.iter().cloned());
        request.extend(self.history.iter().cloned());
        request
    }

    /// Record one streamed fragment of an assistant reply.
    ///
    /// Consecutive fragments of the same reply are folded into a single assistant entry.
    pub fn fold_fragment(&mut self, fragment: &str) {
        match self.history.back_mut() {
            Some(last) if last.role == Role::Assistant => last.content.push_str(fragment),
            _ => self
                .history
                .push_back(Message::with_role(Role::Assistant, fragment)),
        }
    }

    pub fn preamble(&self) -> &[Message] {
        &self.preamble
    }

    pub fn history(&self) -> &VecDeque<Message> {
        &self.history
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }
}
