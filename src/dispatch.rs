//! Controller-side consumer of the outbound channel.
//!
//! Routes decoded events into per-index session views, so concurrent
//! downloads never clobber each other's state. One malformed line must never
//! stop the read loop, and events for indices the controller has not seen
//! yet are tolerated.

use crate::protocol::{Event, Status, VALIDATION_INDEX};
use std::collections::HashMap;

/// What the controller knows about one session, keyed by index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    pub progress: u8,
    pub finished: Option<Status>,
    pub error: Option<String>,
}

/// A user-visible outcome distilled from a terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Completed { index: i64 },
    Failed { index: i64, error: String },
    Cancelled { index: i64 },
    /// The manager refused a request before it became a session.
    Rejected { error: String },
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    sessions: HashMap<i64, SessionView>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, index: i64) -> Option<&SessionView> {
        self.sessions.get(&index)
    }

    pub fn sessions(&self) -> impl Iterator<Item = (i64, &SessionView)> {
        self.sessions.iter().map(|(k, v)| (*k, v))
    }

    /// Feed one raw outbound line. Malformed lines are logged and skipped.
    pub fn handle_line(&mut self, line: &str) -> Option<Notice> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match Event::decode(line) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                tracing::warn!(error = %e, line, "ignoring malformed event line");
                None
            }
        }
    }

    pub fn handle_event(&mut self, event: Event) -> Option<Notice> {
        match event {
            Event::Progress { index, progress } => {
                let view = self.sessions.entry(index).or_default();
                if view.finished.is_some() {
                    // Late event for an already-terminal session.
                    return None;
                }
                view.progress = view.progress.max(progress);
                None
            }
            Event::Terminal { index, progress, status, error } => {
                if index == VALIDATION_INDEX {
                    return Some(Notice::Rejected { error: error.unwrap_or_default() });
                }
                let view = self.sessions.entry(index).or_default();
                if view.finished.is_some() {
                    return None;
                }
                view.finished = Some(status);
                view.error = error.clone();
                match status {
                    Status::Completed => {
                        view.progress = 100;
                        Some(Notice::Completed { index })
                    }
                    Status::Error => {
                        view.progress = view.progress.max(progress);
                        Some(Notice::Failed { index, error: error.unwrap_or_default() })
                    }
                    Status::Cancelled => Some(Notice::Cancelled { index }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_routes_by_index() {
        let mut d = Dispatcher::new();
        assert_eq!(d.handle_line(r#"{"index":0,"progress":10}"#), None);
        assert_eq!(d.handle_line(r#"{"index":1,"progress":55}"#), None);
        assert_eq!(d.handle_line(r#"{"index":0,"progress":30}"#), None);

        assert_eq!(d.session(0).unwrap().progress, 30);
        assert_eq!(d.session(1).unwrap().progress, 55);
    }

    #[test]
    fn unknown_index_is_tolerated() {
        let mut d = Dispatcher::new();
        // First thing the dispatcher ever sees is a terminal for index 9.
        let notice = d.handle_line(r#"{"index":9,"progress":100,"status":"completed"}"#);
        assert_eq!(notice, Some(Notice::Completed { index: 9 }));
        assert_eq!(d.session(9).unwrap().progress, 100);
    }

    #[test]
    fn malformed_line_does_not_stop_the_loop() {
        let mut d = Dispatcher::new();
        assert_eq!(d.handle_line("garbage"), None);
        assert_eq!(d.handle_line(""), None);
        assert_eq!(
            d.handle_line(r#"{"index":0,"progress":100,"status":"completed"}"#),
            Some(Notice::Completed { index: 0 })
        );
    }

    #[test]
    fn terminal_events_become_notices() {
        let mut d = Dispatcher::new();
        assert_eq!(
            d.handle_event(Event::failed(2, "dns error")),
            Some(Notice::Failed { index: 2, error: "dns error".into() })
        );
        assert_eq!(d.handle_event(Event::cancelled(3)), Some(Notice::Cancelled { index: 3 }));
        assert_eq!(
            d.handle_event(Event::rejected("empty path")),
            Some(Notice::Rejected { error: "empty path".into() })
        );
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let mut d = Dispatcher::new();
        assert_eq!(d.handle_event(Event::completed(0)), Some(Notice::Completed { index: 0 }));
        assert_eq!(d.handle_event(Event::progress(0, 10)), None);
        assert_eq!(d.handle_event(Event::failed(0, "late")), None);
        assert_eq!(d.session(0).unwrap().finished, Some(Status::Completed));
        assert_eq!(d.session(0).unwrap().progress, 100);
    }

    #[test]
    fn progress_never_regresses() {
        let mut d = Dispatcher::new();
        d.handle_event(Event::progress(0, 80));
        d.handle_event(Event::progress(0, 20));
        assert_eq!(d.session(0).unwrap().progress, 80);
    }
}
