//! Conversation history: a node's private, ordered record of events.
//!
//! Appending goes through [`ConversationHistory::push`], which collapses
//! consecutive fragments of the same textual kind (agent text, agent speech,
//! user transcript) into a single entry. The stored sequence therefore never
//! holds two adjacent events of the same mergeable kind.

use parley_core::Event;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationHistory {
    events: Vec<Event>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, merging it into the last entry when both share a
    /// mergeable kind.
    pub fn push(&mut self, event: Event) {
        if event.is_mergeable() {
            if let Some(last) = self.events.last_mut() {
                if last.try_merge(&event) {
                    return;
                }
            }
        }
        self.events.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.push(event);
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// The most recent `n` events (all of them if fewer are stored).
    pub fn tail(&self, n: usize) -> &[Event] {
        let start = self.events.len().saturating_sub(n);
        &self.events[start..]
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Empty the history and return everything it held.
    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

impl From<Vec<Event>> for ConversationHistory {
    fn from(events: Vec<Event>) -> Self {
        let mut history = Self::new();
        history.extend(events);
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_fragments_merge() {
        let mut history = ConversationHistory::new();
        for chunk in ["Hel", "lo, ", "wor", "ld"] {
            history.push(Event::agent_response(chunk));
        }
        assert_eq!(history.len(), 1);
        assert_eq!(history.events()[0].content(), Some("Hello, world"));
    }

    #[test]
    fn kind_change_starts_new_entry() {
        let mut history = ConversationHistory::new();
        history.push(Event::user_transcript("hi "));
        history.push(Event::user_transcript("there"));
        history.push(Event::agent_response("Hello"));
        history.push(Event::user_transcript("bye"));

        let contents: Vec<_> = history.events().iter().filter_map(Event::content).collect();
        assert_eq!(contents, vec!["hi there", "Hello", "bye"]);
    }

    #[test]
    fn non_textual_events_never_merge() {
        let mut history = ConversationHistory::new();
        history.push(Event::UserStartedSpeaking);
        history.push(Event::UserStartedSpeaking);
        assert_eq!(history.len(), 2);

        // A non-mergeable event in between breaks a run.
        history.push(Event::agent_response("a"));
        history.push(Event::ToolResult(Default::default()));
        history.push(Event::agent_response("b"));
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn no_adjacent_mergeable_duplicates() {
        let sequence = [
            Event::agent_response("a"),
            Event::agent_speech("b"),
            Event::agent_speech("c"),
            Event::user_transcript("d"),
            Event::UserStoppedSpeaking,
            Event::user_transcript("e"),
            Event::user_transcript("f"),
            Event::agent_response("g"),
        ];
        let history = ConversationHistory::from(sequence.to_vec());
        for pair in history.events().windows(2) {
            assert!(!(pair[0].is_mergeable() && pair[0].kind() == pair[1].kind()));
        }
        assert_eq!(history.len(), 6);
    }

    #[test]
    fn take_empties_history() {
        let mut history = ConversationHistory::new();
        history.push(Event::user_transcript("one"));
        history.push(Event::agent_response("two"));
        history.push(Event::EndCall);

        let taken = history.take();
        assert_eq!(taken.len(), 3);
        assert!(history.is_empty());
    }

    #[test]
    fn tail_is_a_view() {
        let history = ConversationHistory::from(vec![
            Event::user_transcript("a"),
            Event::agent_response("b"),
            Event::user_transcript("c"),
        ]);
        assert_eq!(history.tail(2).len(), 2);
        assert_eq!(history.tail(2)[0].content(), Some("b"));
        assert_eq!(history.tail(10).len(), 3);
        assert_eq!(history.len(), 3);
    }
}
