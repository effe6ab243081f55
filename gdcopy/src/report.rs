use std::io::{self, IsTerminal, Write};
use std::sync::Mutex;
use std::time::Duration;

use owo_colors::{AnsiColors, OwoColorize};

use crate::remote::executor::{FailureClass, RemoteOp};
use crate::sync::engine::SyncStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Cycle,
    DepthLimit,
}

/// Something the engine did or decided, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    FolderEntered { path: String },
    FolderReady { path: String },
    FolderSkipped { path: String, reason: SkipReason },
    Copied { path: String },
    AlreadyPresent { path: String },
    Ignored { path: String },
    Duplicate { path: String },
    PartialReplaced { path: String },
    RateLimited { in_window: usize, cooldown: Duration },
    Retrying {
        op: RemoteOp,
        class: FailureClass,
        attempt: u32,
        delay: Duration,
    },
}

pub trait SyncObserver: Send + Sync {
    fn notify(&self, event: &SyncEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SyncObserver for NullObserver {
    fn notify(&self, _event: &SyncEvent) {}
}

const LEGEND: &[(char, AnsiColors, &str)] = &[
    ('+', AnsiColors::Green, "copied"),
    ('.', AnsiColors::BrightBlack, "already copied"),
    ('i', AnsiColors::Yellow, "ignored"),
    ('=', AnsiColors::Cyan, "duplicate at destination"),
    ('*', AnsiColors::Magenta, "partial copy replaced"),
    ('r', AnsiColors::Blue, "rate limit cooldown"),
    ('R', AnsiColors::BrightBlue, "rate limited, retrying"),
    ('E', AnsiColors::Red, "server error, retrying"),
];

/// Prints one glyph per event so long runs show progress on a single line.
pub struct ConsoleReporter<W: Write + Send = io::Stdout> {
    out: Mutex<W>,
    color: bool,
}

impl ConsoleReporter<io::Stdout> {
    pub fn stdout() -> Self {
        let color = io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        Self::new(io::stdout(), color)
    }
}

impl<W: Write + Send> ConsoleReporter<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self {
            out: Mutex::new(out),
            color,
        }
    }

    pub fn print_legend(&self) {
        let entries = LEGEND
            .iter()
            .map(|(glyph, color, label)| format!("{} {label}", self.paint(*glyph, *color)))
            .collect::<Vec<_>>()
            .join("  ");
        self.write_line(&format!("Legend: {entries}"));
    }

    /// Ends the glyph line so later output starts on a fresh line.
    pub fn finish_line(&self) {
        self.write_line("");
    }

    pub fn print_summary(&self, stats: &SyncStats) {
        self.finish_line();
        self.write_line(&format!(
            "Done: {} copied, {} already copied, {} ignored, {} duplicates, {} partials replaced, {} folders visited, {} folders created",
            stats.copied,
            stats.already_present,
            stats.ignored,
            stats.duplicates,
            stats.partials_replaced,
            stats.folders_visited,
            stats.folders_ready,
        ));
        if stats.folders_skipped > 0 {
            self.write_line(&format!(
                "Skipped {} folders (cycle or depth limit), see log for details",
                stats.folders_skipped
            ));
        }
    }

    fn paint(&self, glyph: char, color: AnsiColors) -> String {
        if self.color {
            glyph.color(color).to_string()
        } else {
            glyph.to_string()
        }
    }

    fn write_line(&self, line: &str) {
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

impl<W: Write + Send> SyncObserver for ConsoleReporter<W> {
    fn notify(&self, event: &SyncEvent) {
        let Some(glyph) = glyph_for(event) else {
            return;
        };
        let color = LEGEND
            .iter()
            .find(|(candidate, _, _)| *candidate == glyph)
            .map(|(_, color, _)| *color)
            .unwrap_or(AnsiColors::Default);
        let painted = self.paint(glyph, color);
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = write!(out, "{painted}");
        let _ = out.flush();
    }
}

fn glyph_for(event: &SyncEvent) -> Option<char> {
    match event {
        SyncEvent::Copied { .. } => Some('+'),
        SyncEvent::AlreadyPresent { .. } => Some('.'),
        SyncEvent::Ignored { .. } => Some('i'),
        SyncEvent::Duplicate { .. } => Some('='),
        SyncEvent::PartialReplaced { .. } => Some('*'),
        SyncEvent::RateLimited { .. } => Some('r'),
        SyncEvent::Retrying {
            class: FailureClass::RateLimit,
            ..
        } => Some('R'),
        SyncEvent::Retrying { .. } => Some('E'),
        SyncEvent::FolderEntered { .. }
        | SyncEvent::FolderReady { .. }
        | SyncEvent::FolderSkipped { .. } => None,
    }
}
