//! The playback core of a voice-session music bot.
//!
//! A [Queue] owns an ordered sequence of [Track]s and drives one
//! [AudioSink] through a [StreamProvider], which spawns a yt-dlp subprocess
//! per track and exposes its output as a backpressured byte stream.
//! The chat gateway, command rendering, and voice transport live outside
//! this crate and talk to it through [SessionManager] and [Queue].

mod config;
mod logging;
mod provider;
mod queue;
mod session;
mod sink;
mod track;
mod util;
mod ytdlp;

pub use config::*;
pub use logging::*;
pub use provider::*;
pub use queue::*;
pub use session::*;
pub use sink::*;
pub use track::*;
pub use util::*;
pub use ytdlp::*;
