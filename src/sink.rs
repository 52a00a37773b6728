use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::AudioSession;

/// Signals reported back by an [AudioSink] while it plays a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// Playback of the bound session has started.
    Started,
    /// The bound session ended, naturally or through a deliberate stop.
    Idle,
    /// Playback failed and cannot continue.
    Errored { detail: String },
}

pub type SinkEventSender = mpsc::UnboundedSender<SinkEvent>;
pub type SinkEventReceiver = mpsc::UnboundedReceiver<SinkEvent>;

/// The audio encoding and transport layer a [Queue] plays into.
///
/// Implementations receive ownership of each [AudioSession] and report
/// [SinkEvent]s through the sender handed to them at construction. A sink
/// must not report [SinkEvent::Idle] when no session is bound, so a stop
/// that races a natural finish collapses into a single idle signal.
///
/// [Queue]: crate::Queue
#[async_trait]
pub trait AudioSink: Send + Sync + 'static {
    /// Binds a new session and begins playing it.
    async fn play(&self, session: AudioSession);

    /// Pauses the bound session, keeping it bound.
    fn pause(&self);

    /// Resumes a paused session.
    fn resume(&self);

    /// Stops and unbinds the bound session, reporting [SinkEvent::Idle].
    fn stop(&self);
}
