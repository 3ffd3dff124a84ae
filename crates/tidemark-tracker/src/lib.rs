//! Tidemark Tracker crate - sessions, dwell time and the activity pipeline.
//!
//! The session tracker turns the stream of page changes and idle
//! transitions into closed sessions with clamped durations, per-domain
//! dwell totals and content-capture requests. The activity pipeline is the
//! single writer that feeds browser signals through the tracker and into the
//! event store.

pub mod capture;
pub mod dwell;
pub mod pipeline;
pub mod session;

pub use capture::{CaptureOutcome, CaptureSettings, ContentCapture, ContentExtractor, MailboxExtractor};
pub use dwell::{DwellAccumulator, DwellEntry};
pub use pipeline::{ActivityPipeline, SharedPipeline, Signal, SignalOutcome};
pub use session::{
    CloseOut, ClosedSession, ContentRequest, Session, SessionTracker, TrackerSettings,
    TrackerSnapshot,
};
