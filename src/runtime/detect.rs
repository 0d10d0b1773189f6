//! Consistency checks between history and the completions arriving for it.
//!
//! Call-site mismatches during replay are caught by the context itself; the
//! checks here cover history that is corrupt before replay even starts.
use std::collections::HashMap;

use crate::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SiteKind {
    Task,
    Timer,
    Wait,
}

/// Every completion in `history` must point at a scheduling record of the
/// matching kind that precedes it. Returns a description of the first
/// violation.
pub(crate) fn detect_completion_kind_mismatch(history: &[Event]) -> Option<String> {
    let mut sites: HashMap<u64, SiteKind> = HashMap::new();
    for (pos, ev) in history.iter().enumerate() {
        match ev {
            Event::TaskScheduled { id, .. } => {
                if let Some(prev) = sites.insert(*id, SiteKind::Task) {
                    return Some(format!("call-site {id} recorded twice ({prev:?} then Task) at position {pos}"));
                }
            }
            Event::TimerCreated { id, .. } => {
                if let Some(prev) = sites.insert(*id, SiteKind::Timer) {
                    return Some(format!("call-site {id} recorded twice ({prev:?} then Timer) at position {pos}"));
                }
            }
            Event::EventSubscribed { id, .. } => {
                if let Some(prev) = sites.insert(*id, SiteKind::Wait) {
                    return Some(format!("call-site {id} recorded twice ({prev:?} then Wait) at position {pos}"));
                }
            }
            Event::TaskCompleted { id, .. } | Event::TaskFailed { id, .. } => match sites.get(id) {
                Some(SiteKind::Task) => {}
                other => {
                    return Some(format!(
                        "activity completion for call-site {id} at position {pos} matches {other:?}"
                    ))
                }
            },
            Event::TimerFired { id, .. } => match sites.get(id) {
                Some(SiteKind::Timer) => {}
                other => return Some(format!("timer firing for call-site {id} at position {pos} matches {other:?}")),
            },
            _ => {}
        }
    }
    None
}

/// History must open with exactly one `OrchestrationStarted`.
pub(crate) fn detect_malformed_start(history: &[Event]) -> Option<String> {
    match history.first() {
        Some(Event::OrchestrationStarted { .. }) => {}
        Some(other) => return Some(format!("history does not begin with OrchestrationStarted: {other:?}")),
        None => return Some("history is empty".to_string()),
    }
    let starts = history
        .iter()
        .filter(|e| matches!(e, Event::OrchestrationStarted { .. }))
        .count();
    (starts > 1).then(|| format!("history holds {starts} OrchestrationStarted records"))
}
