use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Matches the download progress lines the binary prints to stderr,
    /// e.g. `[download]  12.3% of ~4.42MiB at 256.00KiB/s ETA 00:03`
    static ref PROGRESS_REGEX: Regex =
        Regex::new(r"\[download\] *(.*) of ([^ ]*)(?: *at *([^ ]*))?(?: *ETA *([^ ]*))?").unwrap();
}

/// Download progress parsed from one line of diagnostic output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    /// Percentage of the download so far, with the trailing `%` stripped
    pub percent: Option<f32>,
    /// Total size of the resource, with a leading `~` (estimate) stripped
    pub total_size: Option<String>,
    /// Current transfer rate, as printed
    pub speed: Option<String>,
    /// Estimated time remaining, as printed
    pub eta: Option<String>,
}

/// Describes the events a [Runner] emits alongside its byte stream.
///
/// [Runner]: super::Runner
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    /// A progress line was printed while downloading.
    Progress(Progress),
    /// Any other bracket-tagged line the subprocess printed.
    Output { tag: String, text: String },
    /// The subprocess exited cleanly or was killed deliberately.
    Closed { code: Option<i32> },
    /// The subprocess exited with a failure.
    Failed { detail: String },
}

/// Parses one line of diagnostic output into zero or more events.
///
/// Only lines whose first character is `[` carry events. A progress line
/// produces both a [RunnerEvent::Progress] and the generic tagged event.
pub fn parse_line(line: &str) -> Vec<RunnerEvent> {
    let mut events = Vec::new();

    if !line.starts_with('[') {
        return events;
    }

    if let Some(captures) = PROGRESS_REGEX.captures(line) {
        let percent = captures
            .get(1)
            .and_then(|m| m.as_str().trim().trim_end_matches('%').parse().ok());

        let total_size = captures
            .get(2)
            .map(|m| m.as_str().trim_start_matches('~').to_string());

        let speed = captures.get(3).map(|m| m.as_str().to_string());
        let eta = captures.get(4).map(|m| m.as_str().to_string());

        events.push(RunnerEvent::Progress(Progress {
            percent,
            total_size,
            speed,
            eta,
        }));
    }

    if let Some(end) = line.find(']') {
        let tag = line[1..end].to_string();
        let text = line[end + 1..].trim_start().to_string();

        events.push(RunnerEvent::Output { tag, text });
    }

    events
}
