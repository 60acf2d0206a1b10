//! ordered chat history with a single mutable tail.

use serde::{Deserialize, Serialize};

use crate::error::ConversationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// stable identity of a message within one conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
}

/// role and content without identity; what an engine receives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

impl From<&Message> for Turn {
    fn from(m: &Message) -> Self {
        Self { role: m.role, content: m.content.clone() }
    }
}

impl Message {
    /// whether the presentation layer shows this message (system prompts are hidden).
    pub fn is_displayed(&self) -> bool {
        !matches!(self.role, Role::System)
    }
}

/// append-only history; only the trailing assistant message may be rewritten.
#[derive(Clone, Debug, Default)]
pub struct ConversationStore {
    messages: Vec<Message>,
    next_id: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// drop all history and start over with a single system message.
    pub fn reset_with_system_prompt(&mut self, text: impl Into<String>) -> MessageId {
        self.messages.clear();
        self.push(Role::System, text.into())
    }

    pub fn append_user(&mut self, text: impl Into<String>) -> MessageId {
        self.push(Role::User, text.into())
    }

    pub fn append_assistant_placeholder(&mut self) -> MessageId {
        self.push(Role::Assistant, String::new())
    }

    /// replace the content of the last message, only if it is an assistant message.
    pub fn update_trailing_assistant(
        &mut self,
        text: impl Into<String>,
    ) -> Result<(), ConversationError> {
        match self.messages.last_mut() {
            Some(m) if m.role == Role::Assistant => {
                m.content = text.into();
                Ok(())
            }
            _ => Err(ConversationError::TrailingNotAssistant),
        }
    }

    /// replace the content of the assistant message `id`.
    pub fn update_message(
        &mut self,
        id: MessageId,
        text: impl Into<String>,
    ) -> Result<(), ConversationError> {
        // ids are issued in order, so the open message is almost always last
        let msg = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.id == id)
            .ok_or(ConversationError::UnknownMessage(id))?;
        if msg.role != Role::Assistant {
            return Err(ConversationError::NotAssistant(id));
        }
        msg.content = text.into();
        Ok(())
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn displayed(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.is_displayed())
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.messages.iter().map(Turn::from).collect()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn push(&mut self, role: Role, content: String) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        self.messages.push(Message { id, role, content });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reset_leaves_only_system() {
        let mut c = ConversationStore::new();
        c.reset_with_system_prompt("old");
        c.append_user("hi");
        c.append_assistant_placeholder();
        c.reset_with_system_prompt("be brief");

        assert_eq!(c.len(), 1);
        assert_eq!(c.messages()[0].role, Role::System);
        assert_eq!(c.messages()[0].content, "be brief");
    }

    #[test]
    fn trailing_update_requires_assistant_tail() {
        let mut c = ConversationStore::new();
        c.reset_with_system_prompt("sys");
        c.append_user("hi");
        assert_eq!(
            c.update_trailing_assistant("nope"),
            Err(ConversationError::TrailingNotAssistant)
        );
        assert_eq!(c.last().map(|m| m.content.as_str()), Some("hi"));

        c.append_assistant_placeholder();
        c.update_trailing_assistant("Hel").unwrap();
        c.update_trailing_assistant("Hello").unwrap();
        assert_eq!(c.last().map(|m| m.content.as_str()), Some("Hello"));
    }

    #[test]
    fn update_by_identity() {
        let mut c = ConversationStore::new();
        let sys = c.reset_with_system_prompt("sys");
        c.append_user("q1");
        let a1 = c.append_assistant_placeholder();
        c.update_message(a1, "first").unwrap();

        assert_eq!(c.update_message(sys, "x"), Err(ConversationError::NotAssistant(sys)));
        assert_eq!(
            c.update_message(MessageId(99), "x"),
            Err(ConversationError::UnknownMessage(MessageId(99)))
        );
        assert_eq!(c.get(a1).map(|m| m.content.as_str()), Some("first"));
    }

    #[test]
    fn displayed_hides_system() {
        let mut c = ConversationStore::new();
        c.reset_with_system_prompt("sys");
        c.append_user("hi");
        c.append_assistant_placeholder();
        let roles: Vec<Role> = c.displayed().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }
}
