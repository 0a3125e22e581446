//! Parsing of ffmpeg progress output.
//!
//! Two shapes are understood:
//!
//! * the stats line ffmpeg prints to stderr,
//!   `frame=  100 fps= 25 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x`
//! * the `-progress pipe:1` stream, one `key=value` per line, each block
//!   closed by `progress=continue` or `progress=end`.
//!
//! Both reduce to a sequence of `key=value` tokens where whitespace may follow
//! the `=`. Unknown keys are ignored and `N/A` values are treated as absent.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)=\s*(\S+)").expect("token regex is valid")
});

/// One progress observation of an encode or copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodeProgress {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    /// Realtime multiplier, `2.0` means twice as fast as playback.
    pub speed: Option<f64>,
    /// Media time written so far.
    pub out_time_secs: Option<f64>,
    pub total_size_bytes: Option<u64>,
    pub bitrate_kbps: Option<f64>,
    /// Set on the final `progress=end` block.
    pub finished: bool,
}

impl EncodeProgress {
    /// Percentage of `duration_secs` written, when both are known.
    pub fn percent_of(&self, duration_secs: f64) -> Option<f64> {
        let out = self.out_time_secs?;
        if duration_secs <= 0.0 {
            return None;
        }
        Some((out / duration_secs * 100.0).clamp(0.0, 100.0))
    }

    fn is_empty(&self) -> bool {
        self.frame.is_none()
            && self.fps.is_none()
            && self.speed.is_none()
            && self.out_time_secs.is_none()
            && self.total_size_bytes.is_none()
    }

    fn apply(&mut self, key: &str, value: &str) {
        if value.eq_ignore_ascii_case("N/A") {
            return;
        }
        match key {
            "frame" => self.frame = value.parse().ok(),
            "fps" => self.fps = value.parse().ok(),
            "speed" => self.speed = parse_speed(value),
            "time" | "out_time" => {
                if let Some(t) = parse_time(value) {
                    self.out_time_secs = Some(t);
                }
            }
            // ffmpeg reports both in microseconds despite the name.
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.out_time_secs = Some(us.max(0) as f64 / 1_000_000.0);
                }
            }
            "total_size" => self.total_size_bytes = value.parse().ok(),
            "size" | "Lsize" => self.total_size_bytes = parse_size(value),
            "bitrate" => self.bitrate_kbps = parse_bitrate_kbps(value),
            "progress" => self.finished = value == "end",
            _ => {}
        }
    }
}

/// Split a record into `key=value` tokens.
pub fn tokens(line: &str) -> impl Iterator<Item = (&str, &str)> {
    TOKEN_RE.captures_iter(line).filter_map(|caps| {
        let key = caps.get(1)?.as_str();
        let value = caps.get(2)?.as_str();
        Some((key, value))
    })
}

/// Parse a stats line. Requires `frame=` plus `time=` or `size=` so unrelated
/// log lines that happen to contain a `=` are not mistaken for progress.
pub fn parse_stats_line(line: &str) -> Option<EncodeProgress> {
    let mut has_frame = false;
    let mut has_position = false;
    let mut progress = EncodeProgress::default();

    for (key, value) in tokens(line) {
        match key {
            "frame" => has_frame = true,
            "time" | "size" | "Lsize" => has_position = true,
            _ => {}
        }
        progress.apply(key, value);
    }

    (has_frame && has_position).then_some(progress)
}

/// Accumulates `-progress` blocks and stats lines into progress events.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: EncodeProgress,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one record; returns a completed observation when one is available.
    pub fn push(&mut self, record: &str) -> Option<EncodeProgress> {
        if let Some(stats) = parse_stats_line(record) {
            return Some(stats);
        }

        let mut block_closed = false;
        for (key, value) in tokens(record) {
            self.current.apply(key, value);
            if key == "progress" {
                block_closed = true;
            }
        }

        if !block_closed {
            return None;
        }

        let done = std::mem::take(&mut self.current);
        (!done.is_empty() || done.finished).then_some(done)
    }
}

/// Parse `HH:MM:SS.fraction` into seconds.
pub fn parse_time(value: &str) -> Option<f64> {
    let negative = value.starts_with('-');
    let value = value.trim_start_matches('-');
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    Some(if negative { 0.0 } else { total })
}

/// Parse `1.25x` into `1.25`.
pub fn parse_speed(value: &str) -> Option<f64> {
    value.trim().trim_end_matches('x').parse().ok()
}

/// Parse `1024kB` / `512KiB` / `2048` into bytes.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let number: u64 = value[..digits_end].parse().ok()?;
    let unit = value[digits_end..].to_ascii_lowercase();
    let multiplier = match unit.as_str() {
        "" | "b" => 1,
        "kb" | "kib" => 1024,
        "mb" | "mib" => 1024 * 1024,
        "gb" | "gib" => 1024 * 1024 * 1024,
        _ => return None,
    };
    Some(number * multiplier)
}

/// Parse `2097.2kbits/s` into kilobits per second.
pub fn parse_bitrate_kbps(value: &str) -> Option<f64> {
    value.trim().strip_suffix("kbits/s")?.trim().parse().ok()
}
