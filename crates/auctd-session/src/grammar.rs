//! The reactive grammar: which inbound request shapes are legal now.
//!
//! Each session holds an ordered list of accepted request shapes,
//! replaced wholesale on every phase transition. Inbound requests walk
//! the list in order; the first shape match gets to process the message,
//! and no match at all is a protocol violation ("wrong phase").

use auctd_core::{Phase, Role};
use auctd_wire::{Message, Verb};

/// One accepted request shape: a verb plus an optional `Type` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrammarEntry {
    pub verb: Verb,
    /// Required `Type` header value; `None` accepts any.
    pub msg_type: Option<&'static str>,
}

impl GrammarEntry {
    const fn verb(verb: Verb) -> Self {
        Self {
            verb,
            msg_type: None,
        }
    }

    const fn typed(verb: Verb, msg_type: &'static str) -> Self {
        Self {
            verb,
            msg_type: Some(msg_type),
        }
    }

    /// Whether this entry's shape matches the message.
    #[must_use]
    pub fn matches(&self, msg: &Message) -> bool {
        if msg.verb != self.verb {
            return false;
        }
        match self.msg_type {
            None => true,
            Some(required) => msg.msg_type.as_deref() == Some(required),
        }
    }
}

/// Ordered set of currently-legal reactive request shapes.
#[derive(Debug, Clone, Default)]
pub struct ReactiveGrammar {
    entries: Vec<GrammarEntry>,
}

impl ReactiveGrammar {
    /// Grammar before identification: REGISTER only.
    #[must_use]
    pub fn unidentified() -> Self {
        Self {
            entries: vec![GrammarEntry::verb(Verb::Register)],
        }
    }

    /// Grammar after escalation to FATAL: accept nothing.
    #[must_use]
    pub fn closed() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Build the grammar for an identified participant in a phase.
    ///
    /// GET, SUBSCRIBE and REGISTER stay legal throughout a game; order
    /// and settlement verbs open and close with the phase windows.
    #[must_use]
    pub fn for_phase(phase: Phase, role: Role) -> Self {
        let mut entries = Vec::with_capacity(6);

        if phase.trading_open() {
            match role {
                Role::Seller => entries.push(GrammarEntry::typed(Verb::Order, "ask")),
                Role::Buyer => entries.push(GrammarEntry::typed(Verb::Order, "bid")),
                Role::Operator => {}
            }
        }
        if role == Role::Operator {
            if phase.clearing_open() {
                entries.push(GrammarEntry::verb(Verb::Settle));
            }
            if phase.solicits_fees() {
                entries.push(GrammarEntry::verb(Verb::Options));
            }
        }

        entries.push(GrammarEntry::verb(Verb::Subscribe));
        entries.push(GrammarEntry::verb(Verb::Register));
        entries.push(GrammarEntry::verb(Verb::Get));

        Self { entries }
    }

    /// Walk the grammar in order; return the first matching entry.
    #[must_use]
    pub fn first_match(&self, msg: &Message) -> Option<GrammarEntry> {
        self.entries.iter().copied().find(|e| e.matches(msg))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(kind: &str) -> Message {
        Message::new(Verb::Order).with_type(kind)
    }

    #[test]
    fn test_unidentified_accepts_register_only() {
        let g = ReactiveGrammar::unidentified();
        assert!(g.first_match(&Message::new(Verb::Register)).is_some());
        assert!(g.first_match(&Message::new(Verb::Subscribe)).is_none());
        assert!(g.first_match(&order("ask")).is_none());
    }

    #[test]
    fn test_seller_grammar_in_open_day() {
        let g = ReactiveGrammar::for_phase(Phase::DayOpened, Role::Seller);
        assert!(g.first_match(&order("ask")).is_some());
        assert!(g.first_match(&order("bid")).is_none());
        assert!(g.first_match(&Message::new(Verb::Subscribe)).is_some());
        assert!(g.first_match(&Message::new(Verb::Register)).is_some());
    }

    #[test]
    fn test_buyer_grammar_in_open_day() {
        let g = ReactiveGrammar::for_phase(Phase::RoundOpened, Role::Buyer);
        assert!(g.first_match(&order("bid")).is_some());
        assert!(g.first_match(&order("ask")).is_none());
    }

    #[test]
    fn test_no_orders_before_day_opened() {
        let g = ReactiveGrammar::for_phase(Phase::DayOpening, Role::Seller);
        assert!(g.first_match(&order("ask")).is_none());
        assert!(g.first_match(&Message::new(Verb::Get)).is_some());
    }

    #[test]
    fn test_operator_grammar_windows() {
        let opening = ReactiveGrammar::for_phase(Phase::DayOpening, Role::Operator);
        assert!(opening.first_match(&Message::new(Verb::Options)).is_some());
        assert!(opening.first_match(&Message::new(Verb::Settle)).is_none());

        let round = ReactiveGrammar::for_phase(Phase::RoundOpened, Role::Operator);
        assert!(round.first_match(&Message::new(Verb::Settle)).is_some());
        assert!(round.first_match(&Message::new(Verb::Options)).is_none());
        assert!(round.first_match(&order("ask")).is_none());
    }

    #[test]
    fn test_closed_grammar_accepts_nothing() {
        let g = ReactiveGrammar::closed();
        assert!(g.first_match(&Message::new(Verb::Register)).is_none());
        assert!(g.first_match(&Message::new(Verb::Get)).is_none());
        assert!(g.is_empty());
    }
}
