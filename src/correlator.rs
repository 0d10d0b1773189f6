//! Name-based matching of raised external events to waiting call-sites.
//!
//! Built fresh from history on every replay. Signals that arrive before any
//! wait are simply left unconsumed, which gives per-name FIFO buffering
//! without any state outside history.
use std::collections::{HashMap, VecDeque};

use crate::Event;

#[derive(Debug, Default, Clone)]
pub struct EventCorrelator {
    // name -> (history index, payload) in arrival order, not yet consumed
    pending: HashMap<String, VecDeque<(usize, String)>>,
}

impl EventCorrelator {
    pub fn from_history(history: &[Event]) -> Self {
        let mut pending: HashMap<String, VecDeque<(usize, String)>> = HashMap::new();
        for (idx, ev) in history.iter().enumerate() {
            if let Event::EventRaised { name, data } = ev {
                pending.entry(name.clone()).or_default().push_back((idx, data.clone()));
            }
        }
        Self { pending }
    }

    /// History position of the next signal a wait on `name` would receive.
    pub fn peek(&self, name: &str) -> Option<usize> {
        self.pending.get(name).and_then(|q| q.front()).map(|(idx, _)| *idx)
    }

    /// Hand the oldest buffered signal for `name` to a wait.
    pub fn consume(&mut self, name: &str) -> Option<String> {
        self.pending.get_mut(name).and_then(|q| q.pop_front()).map(|(_, data)| data)
    }
}
