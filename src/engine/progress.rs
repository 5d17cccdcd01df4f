//! Progress tracking for a running transcode.
//!
//! The host supervisor owns the process; it feeds every output line and
//! lifecycle event through a [`ProgressHandler`]. [`ProgressTracker`] turns
//! `out_time=`/`time=` positions into a completion percentage and passes the
//! lifecycle events on to the handler it wraps, so the host's own elapsed-time
//! bookkeeping keeps working.

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, trace};

/// Percent is held below this until the process is unset
pub const MAX_RUNNING_PERCENT: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent<'a> {
    /// One line of process output
    TextLine(&'a str),
    /// The supervisor started the process
    Registration { pid: u32, start_time: DateTime<Local> },
    /// The process finished or was torn down
    Unset,
}

/// What a handler reports back to the supervisor after each event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProgressReport {
    pub percent: Option<u8>,
    pub done: bool,
}

pub trait ProgressHandler {
    fn handle(&mut self, event: ProgressEvent<'_>) -> ProgressReport;
}

impl<F> ProgressHandler for F
where
    F: FnMut(ProgressEvent<'_>) -> ProgressReport,
{
    fn handle(&mut self, event: ProgressEvent<'_>) -> ProgressReport {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProgressState {
    /// None when the job has no usable duration
    pub percent: Option<u8>,
    pub registered: bool,
    pub done: bool,
}

/// Parse `HH:MM:SS.fraction` into seconds. Negative or `N/A` values yield None.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds)
}

/// Find the encode position in one line of `-progress` or stats output
pub fn parse_position(line: &str) -> Option<f64> {
    line.split_whitespace().find_map(|token| {
        token
            .strip_prefix("out_time=")
            .or_else(|| token.strip_prefix("time="))
            .and_then(parse_timestamp)
    })
}

/// Per-job tracker. Create one per job, optionally wrapping the host's default handler.
pub struct ProgressTracker {
    duration_seconds: f64,
    state: ProgressState,
    inner: Option<Box<dyn ProgressHandler + Send>>,
    registration_forwarded: bool,
    unset_forwarded: bool,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("duration_seconds", &self.duration_seconds)
            .field("state", &self.state)
            .field("wrapped", &self.inner.is_some())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(duration_seconds: f64) -> Self {
        let available = duration_seconds.is_finite() && duration_seconds > 0.0;
        Self {
            duration_seconds,
            state: ProgressState {
                percent: available.then_some(0),
                ..ProgressState::default()
            },
            inner: None,
            registration_forwarded: false,
            unset_forwarded: false,
        }
    }

    /// Delegate lifecycle events to the host's handler
    pub fn wrap(mut self, inner: Box<dyn ProgressHandler + Send>) -> Self {
        self.inner = Some(inner);
        self
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    pub fn progress_available(&self) -> bool {
        self.state.percent.is_some()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    fn report(&self) -> ProgressReport {
        ProgressReport {
            percent: self.state.percent,
            done: self.state.done,
        }
    }

    fn forward(&mut self, event: ProgressEvent<'_>) {
        if let Some(inner) = self.inner.as_mut() {
            inner.handle(event);
        }
    }

    fn on_line(&mut self, line: &str) {
        let Some(current) = self.state.percent else {
            return;
        };
        let Some(position) = parse_position(line) else {
            trace!(line, "no position in progress line");
            return;
        };
        let raw = (100.0 * position / self.duration_seconds).min(MAX_RUNNING_PERCENT as f64);
        let percent = raw.floor().max(0.0) as u8;
        if percent > current {
            self.state.percent = Some(percent);
        }
    }
}

impl ProgressHandler for ProgressTracker {
    fn handle(&mut self, event: ProgressEvent<'_>) -> ProgressReport {
        match event {
            ProgressEvent::Registration { pid, .. } => {
                if !self.registration_forwarded {
                    self.registration_forwarded = true;
                    self.forward(event);
                    debug!(pid, "process registered");
                }
                if !self.state.done {
                    self.state.registered = true;
                }
            }
            ProgressEvent::Unset => {
                if !self.unset_forwarded {
                    self.unset_forwarded = true;
                    self.forward(event);
                }
                self.state.done = true;
                self.state.registered = false;
                if self.state.percent.is_some() {
                    self.state.percent = Some(100);
                }
                debug!("process unset");
            }
            ProgressEvent::TextLine(line) => {
                if !self.state.done {
                    self.on_line(line);
                }
            }
        }
        self.report()
    }
}
