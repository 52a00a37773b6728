//! The per-session playback queue and its state machine.

use std::{collections::VecDeque, sync::Arc};

use crossbeam::atomic::AtomicCell;
use log::{error, info};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;

use crate::{
    AudioSink, SessionHandle, SinkEvent, SinkEventReceiver, SinkEventSender, StreamSource, Track,
};

/// The playback state of a [Queue].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Nothing is bound to the sink.
    #[default]
    Idle,
    /// The head track is playing.
    Playing,
    /// The head track is bound but paused.
    Paused,
}

/// An ordered sequence of tracks driving one audio sink.
///
/// The head of the sequence is the current track. At most one session is
/// ever live: every transition that begins a track tears the previous
/// session down first. Advancement is driven by [SinkEvent]s arriving on a
/// single driver task, so no two transitions interleave; when a user
/// command races a natural track finish, whichever the queue observes
/// first wins and the other becomes a no-op.
pub struct Queue {
    provider: Arc<dyn StreamSource>,
    sink: Arc<dyn AudioSink>,

    status: AtomicCell<QueueStatus>,
    tracks: Mutex<VecDeque<Track>>,
    session: Mutex<Option<SessionHandle>>,
    destroyed: AtomicCell<bool>,

    /// Serializes attempts to begin the head track
    advance_lock: tokio::sync::Mutex<()>,
}

impl Queue {
    /// Creates a queue and the sender its sink reports through.
    pub fn new(
        provider: Arc<dyn StreamSource>,
        sink: Arc<dyn AudioSink>,
    ) -> (Arc<Self>, SinkEventSender) {
        let (sender, receiver) = mpsc::unbounded_channel();

        let queue = Arc::new(Self {
            provider,
            sink,
            status: AtomicCell::new(QueueStatus::Idle),
            tracks: Default::default(),
            session: Default::default(),
            destroyed: AtomicCell::new(false),
            advance_lock: Default::default(),
        });

        spawn_driver_task(&queue, receiver);

        (queue, sender)
    }

    /// Appends a track, beginning playback if nothing is active.
    pub async fn add(&self, track: Track) -> bool {
        if self.destroyed.load() {
            return false;
        }

        info!("Queued {}", track.describe());
        self.tracks.lock().push_back(track);

        if self.status.load() == QueueStatus::Idle && self.session.lock().is_none() {
            self.play_next().await;
        }

        true
    }

    /// Stops the current track. Advancement happens when the sink reports
    /// idle, exactly as it does for a natural finish.
    pub fn skip(&self) -> bool {
        if self.tracks.lock().is_empty() {
            return false;
        }

        self.sink.stop();
        true
    }

    /// Pauses playback. Fails when nothing is playing.
    pub fn pause(&self) -> bool {
        if self.status.load() != QueueStatus::Playing {
            return false;
        }

        self.sink.pause();
        self.status.store(QueueStatus::Paused);
        true
    }

    /// Resumes playback. Fails when nothing is paused.
    pub fn resume(&self) -> bool {
        if self.status.load() != QueueStatus::Paused {
            return false;
        }

        self.sink.resume();
        self.status.store(QueueStatus::Playing);
        true
    }

    /// Stops playback and clears the entire sequence. Always succeeds, and
    /// stopping an already stopped queue is fine.
    pub fn stop(&self) -> bool {
        self.sink.stop();
        self.teardown_session();
        self.tracks.lock().clear();
        self.status.store(QueueStatus::Idle);

        true
    }

    /// Shuffles every track except the protected head.
    ///
    /// Fails when fewer than two tracks follow the head, since there is
    /// nothing meaningful to permute.
    pub fn shuffle(&self) -> bool {
        let mut tracks = self.tracks.lock();

        if tracks.len() <= 2 {
            return false;
        }

        let mut remainder: Vec<Track> = tracks.drain(1..).collect();
        remainder.shuffle(&mut rand::thread_rng());
        tracks.extend(remainder);

        true
    }

    /// The track at the head of the sequence, if any.
    pub fn current(&self) -> Option<Track> {
        self.tracks.lock().front().cloned()
    }

    /// Every track in play order, including the head.
    pub fn tracks(&self) -> Vec<Track> {
        self.tracks.lock().iter().cloned().collect()
    }

    /// Every track after the head.
    pub fn upcoming(&self) -> Vec<Track> {
        self.tracks.lock().iter().skip(1).cloned().collect()
    }

    pub fn is_playing(&self) -> bool {
        self.status.load() == QueueStatus::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.status.load() == QueueStatus::Paused
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }

    pub fn status(&self) -> QueueStatus {
        self.status.load()
    }

    /// Stops the sink and releases everything this queue owns. Terminal,
    /// and safe to call twice.
    pub fn destroy(&self) {
        if self.destroyed.swap(true) {
            return;
        }

        self.sink.stop();
        self.teardown_session();
        self.tracks.lock().clear();
        self.status.store(QueueStatus::Idle);
    }

    fn handle_started(&self) {
        self.status.store(QueueStatus::Playing);
    }

    /// The sink finished or was deliberately stopped: advance.
    async fn handle_idle(&self) {
        self.teardown_session();
        self.status.store(QueueStatus::Idle);

        self.tracks.lock().pop_front();
        self.play_next().await;
    }

    /// The sink reported a fatal playback error: drop the head, advance.
    async fn handle_errored(&self, detail: String) {
        error!("Playback failed: {detail}");

        self.teardown_session();
        self.status.store(QueueStatus::Idle);

        self.tracks.lock().pop_front();
        self.play_next().await;
    }

    /// Begins the head track, advancing past tracks whose stream cannot be
    /// created. The attempt count is bounded by the remaining sequence, so
    /// a queue of consistently failing tracks settles into Idle instead of
    /// spinning. Callers must have torn the previous session down.
    async fn play_next(&self) {
        let _advancing = self.advance_lock.lock().await;

        // Another transition won the race and already began a track.
        if self.session.lock().is_some() {
            return;
        }

        let mut attempts = self.tracks.lock().len();

        while attempts > 0 {
            attempts -= 1;

            let Some(track) = self.current() else { break };

            match self.provider.create_stream(&track.url).await {
                Ok(session) => {
                    // The queue may have been stopped or cleared while the
                    // subprocess was spawning. Dropping the fresh session
                    // tears it down again.
                    if self.current().as_ref() != Some(&track) {
                        return;
                    }

                    *self.session.lock() = Some(session.handle());

                    info!("Playing {}", track.describe());
                    self.sink.play(session).await;

                    return;
                }
                Err(process_error) => {
                    error!("Skipping {}: {process_error}", track.describe());
                    self.tracks.lock().pop_front();
                }
            }
        }

        self.status.store(QueueStatus::Idle);
    }

    /// Cancels the live session, if any. Safe to call twice.
    fn teardown_session(&self) {
        if let Some(handle) = self.session.lock().take() {
            handle.destroy();
        }
    }
}

/// Applies sink events to the queue in arrival order.
///
/// The task holds a weak reference so a destroyed and dropped queue ends
/// the loop rather than living forever.
fn spawn_driver_task(queue: &Arc<Queue>, mut receiver: SinkEventReceiver) {
    let queue = Arc::downgrade(queue);

    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let Some(queue) = queue.upgrade() else { break };

            if queue.destroyed.load() {
                break;
            }

            match event {
                SinkEvent::Started => queue.handle_started(),
                SinkEvent::Idle => queue.handle_idle().await,
                SinkEvent::Errored { detail } => queue.handle_errored(detail).await,
            }
        }
    });
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use async_trait::async_trait;
    use crossbeam::atomic::AtomicCell;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{AudioSession, ByteStream, ProcessError};

    /// A stream source that hands out empty sessions, recording every spawn
    /// and optionally failing after the first N.
    struct FakeSource {
        spawns: AtomicCell<usize>,
        succeed_first: usize,
        handles: Mutex<Vec<SessionHandle>>,
        overlapped: AtomicCell<bool>,
    }

    impl FakeSource {
        fn new(succeed_first: usize) -> Arc<Self> {
            Arc::new(Self {
                spawns: AtomicCell::new(0),
                succeed_first,
                handles: Default::default(),
                overlapped: AtomicCell::new(false),
            })
        }

        fn empty_session() -> (AudioSession, SessionHandle) {
            let (_, receiver) = mpsc::channel(1);
            let handle = SessionHandle::new(CancellationToken::new(), None);
            let session = AudioSession::from_parts(ByteStream::new(receiver), handle.clone());

            (session, handle)
        }
    }

    #[async_trait]
    impl StreamSource for FakeSource {
        async fn create_stream(&self, _url: &str) -> Result<AudioSession, ProcessError> {
            let spawned = self.spawns.fetch_add(1);

            // A prior session still alive here means two sessions overlapped
            if self.handles.lock().iter().any(|h| !h.is_destroyed()) {
                self.overlapped.store(true);
            }

            if spawned >= self.succeed_first {
                return Err(ProcessError::Exited {
                    code: Some(1),
                    process_error: None,
                    diagnostics: "ERROR: unable to download".to_string(),
                });
            }

            let (session, handle) = Self::empty_session();
            self.handles.lock().push(handle);

            Ok(session)
        }
    }

    /// A sink that confirms playback immediately and keeps the session
    /// bound until stopped or told to finish.
    struct FakeSink {
        events: SinkEventSender,
        bound: Mutex<Option<AudioSession>>,
    }

    impl FakeSink {
        fn new(events: SinkEventSender) -> Arc<Self> {
            Arc::new(Self {
                events,
                bound: Default::default(),
            })
        }

        /// Simulates the bound track finishing naturally.
        fn finish(&self) {
            if self.bound.lock().take().is_some() {
                self.events.send(SinkEvent::Idle).ok();
            }
        }

        /// Simulates a fatal playback error.
        fn fail(&self, detail: &str) {
            if self.bound.lock().take().is_some() {
                self.events
                    .send(SinkEvent::Errored {
                        detail: detail.to_string(),
                    })
                    .ok();
            }
        }
    }

    #[async_trait]
    impl AudioSink for FakeSink {
        async fn play(&self, session: AudioSession) {
            *self.bound.lock() = Some(session);
            self.events.send(SinkEvent::Started).ok();
        }

        fn pause(&self) {}

        fn resume(&self) {}

        fn stop(&self) {
            if self.bound.lock().take().is_some() {
                self.events.send(SinkEvent::Idle).ok();
            }
        }
    }

    fn track(title: &str) -> Track {
        Track {
            title: title.to_string(),
            author: "someone".to_string(),
            duration: 125,
            url: format!("https://example.com/watch?v={title}"),
        }
    }

    fn fixture(succeed_first: usize) -> (Arc<Queue>, Arc<FakeSink>, Arc<FakeSource>) {
        let source = FakeSource::new(succeed_first);
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink = FakeSink::new(sender);

        let (queue, queue_sender) = Queue::new(source.clone(), sink.clone());

        // The fixture sink was built before the queue, so forward its events
        forward_events(receiver, queue_sender);

        (queue, sink, source)
    }

    fn forward_events(mut from: SinkEventReceiver, to: SinkEventSender) {
        tokio::spawn(async move {
            while let Some(event) = from.recv().await {
                if to.send(event).is_err() {
                    break;
                }
            }
        });
    }

    async fn settled(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        panic!("queue never settled into the expected state");
    }

    #[tokio::test]
    async fn tracks_keep_enqueue_order() {
        let (queue, _sink, _source) = fixture(usize::MAX);

        for title in ["one", "two", "three"] {
            assert!(queue.add(track(title)).await);
        }

        settled(|| queue.is_playing()).await;

        let titles: Vec<_> = queue.tracks().into_iter().map(|t| t.title).collect();
        assert_eq!(titles, vec!["one", "two", "three"]);

        let upcoming: Vec<_> = queue.upcoming().into_iter().map(|t| t.title).collect();
        assert_eq!(upcoming, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn playback_begins_and_advances() {
        let (queue, sink, _source) = fixture(usize::MAX);

        queue.add(track("Song1")).await;
        settled(|| queue.is_playing()).await;

        let current = queue.current().expect("head exists");
        assert_eq!(current.title, "Song1");
        assert_eq!(current.duration, 125);

        sink.finish();
        settled(|| queue.is_empty() && !queue.is_playing()).await;

        assert_eq!(queue.status(), QueueStatus::Idle);
        assert_eq!(queue.current(), None);
    }

    #[tokio::test]
    async fn skip_advances_to_next_track() {
        let (queue, _sink, _source) = fixture(usize::MAX);

        queue.add(track("first")).await;
        queue.add(track("second")).await;
        settled(|| queue.is_playing()).await;

        assert!(queue.skip());
        settled(|| queue.current().map(|t| t.title) == Some("second".to_string())).await;
        settled(|| queue.is_playing()).await;
    }

    #[tokio::test]
    async fn skip_on_empty_queue_fails() {
        let (queue, _sink, _source) = fixture(usize::MAX);
        assert!(!queue.skip());
    }

    #[tokio::test]
    async fn sessions_never_overlap() {
        let (queue, sink, source) = fixture(usize::MAX);

        for title in ["a", "b", "c"] {
            queue.add(track(title)).await;
        }

        settled(|| queue.is_playing()).await;
        sink.finish();
        settled(|| queue.tracks().len() == 2 && queue.is_playing()).await;
        assert!(queue.skip());
        settled(|| queue.tracks().len() == 1 && queue.is_playing()).await;

        assert_eq!(source.spawns.load(), 3);
        assert!(!source.overlapped.load(), "two sessions were live at once");
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let (queue, _sink, _source) = fixture(usize::MAX);

        queue.add(track("held")).await;
        settled(|| queue.is_playing()).await;

        assert!(queue.pause());
        assert!(queue.is_paused());

        // Pausing twice fails and changes nothing
        assert!(!queue.pause());
        assert!(queue.is_paused());

        assert!(queue.resume());
        assert!(queue.is_playing());
        assert_eq!(queue.current().map(|t| t.title), Some("held".to_string()));

        // Resuming while playing fails
        assert!(!queue.resume());
    }

    #[tokio::test]
    async fn pause_requires_playback() {
        let (queue, _sink, _source) = fixture(usize::MAX);

        assert!(!queue.pause());
        assert!(!queue.resume());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (queue, _sink, _source) = fixture(usize::MAX);

        queue.add(track("doomed")).await;
        settled(|| queue.is_playing()).await;

        assert!(queue.stop());
        assert!(queue.stop());

        settled(|| queue.status() == QueueStatus::Idle).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shuffle_preserves_the_head() {
        let (queue, _sink, _source) = fixture(usize::MAX);

        for title in ["a", "b", "c", "d"] {
            queue.add(track(title)).await;
        }

        settled(|| queue.is_playing()).await;

        assert!(queue.shuffle());
        assert_eq!(queue.current().map(|t| t.title), Some("a".to_string()));

        let mut rest: Vec<_> = queue.upcoming().into_iter().map(|t| t.title).collect();
        rest.sort();
        assert_eq!(rest, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn shuffle_needs_enough_tracks() {
        let (queue, _sink, _source) = fixture(usize::MAX);

        assert!(!queue.shuffle());

        queue.add(track("a")).await;
        settled(|| queue.is_playing()).await;
        assert!(!queue.shuffle());

        queue.add(track("b")).await;
        assert!(!queue.shuffle());

        queue.add(track("c")).await;
        assert!(queue.shuffle());
    }

    #[tokio::test]
    async fn failing_tracks_cascade_to_idle() {
        // Every spawn fails
        let (queue, _sink, source) = fixture(0);

        queue.add(track("a")).await;
        queue.add(track("b")).await;
        queue.add(track("c")).await;

        settled(|| queue.is_empty() && queue.status() == QueueStatus::Idle).await;

        // Each track was attempted exactly once, then given up on
        assert_eq!(source.spawns.load(), 3);
    }

    #[tokio::test]
    async fn advance_cascade_is_bounded() {
        // The first spawn succeeds, everything after it fails
        let (queue, sink, source) = fixture(1);

        for title in ["a", "b", "c"] {
            queue.add(track(title)).await;
        }

        settled(|| queue.is_playing()).await;

        // Finishing the head forces one advancement through two bad tracks
        sink.finish();

        settled(|| queue.is_empty() && queue.status() == QueueStatus::Idle).await;
        assert_eq!(source.spawns.load(), 3);
    }

    #[tokio::test]
    async fn sink_error_advances_to_next_track() {
        let (queue, sink, _source) = fixture(usize::MAX);

        queue.add(track("bad")).await;
        queue.add(track("good")).await;
        settled(|| queue.is_playing()).await;

        sink.fail("connection reset");

        settled(|| queue.current().map(|t| t.title) == Some("good".to_string())).await;
        settled(|| queue.is_playing()).await;
    }

    #[tokio::test]
    async fn destroyed_queue_rejects_tracks() {
        let (queue, _sink, _source) = fixture(usize::MAX);

        queue.add(track("gone")).await;
        settled(|| queue.is_playing()).await;

        queue.destroy();
        queue.destroy();

        assert!(queue.is_empty());
        assert!(!queue.add(track("late")).await);
    }
}
