//! Stage output
//!
//! Every line a stage produces, and every marker the engine emits about it, is written to
//! stdout prefixed with the stage's ancestry chain (`[group] [stage] `) in the stage's color.
//! Loggers are execution-local values handed down the stage tree; the manifest itself is never
//! annotated with display state.

use console::Style;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// 256-color palette indexes cycled over sibling stages
const STAGE_COLORS: [u8; 5] = [11, 12, 13, 8, 6];

/// Gray used for engine markers and the root prefix
const MARKER_COLOR: u8 = 244;

/// Pick the display color for the sibling at `index`
pub fn stage_color(index: usize) -> u8 {
    STAGE_COLORS[index % STAGE_COLORS.len()]
}

/// Where stage output ends up
#[derive(Debug, Clone, Default)]
pub enum LogSink {
    /// Styled lines on stdout
    #[default]
    Stdout,
    /// Plain lines kept in memory, shared by every logger derived from the same sink
    Memory(Arc<Mutex<Vec<String>>>),
}

impl LogSink {
    /// Create an in-memory sink
    pub fn memory() -> Self {
        Self::Memory(Arc::new(Mutex::new(Vec::new())))
    }

    /// Lines captured so far (empty for stdout)
    pub fn lines(&self) -> Vec<String> {
        match self {
            Self::Stdout => Vec::new(),
            Self::Memory(lines) => lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Outcome flavor of a timed marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Completed,
    Failed,
    Canceled,
}

impl Marker {
    fn label(self) -> &'static str {
        match self {
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        }
    }

    fn style(self) -> Style {
        match self {
            Self::Completed => Style::new().green().bright(),
            Self::Failed => Style::new().red().bright(),
            Self::Canceled => Style::new().cyan().bright(),
        }
    }
}

/// Prefixing logger for one stage (or for the engine itself)
#[derive(Debug, Clone)]
pub struct StageLogger {
    chain: Vec<String>,
    color: u8,
    sink: LogSink,
}

impl StageLogger {
    /// Logger for engine-level messages, prefixed `[infinity]`
    pub fn root(sink: LogSink) -> Self {
        Self {
            chain: vec!["infinity".to_string()],
            color: MARKER_COLOR,
            sink,
        }
    }

    /// Logger for a top-level stage
    pub fn for_stage(sink: LogSink, name: &str, color: u8) -> Self {
        Self {
            chain: vec![name.to_string()],
            color,
            sink,
        }
    }

    /// Logger for a stage nested below this one
    pub fn child(&self, name: &str, color: u8) -> Self {
        let mut chain = self.chain.clone();
        chain.push(name.to_string());
        Self {
            chain,
            color,
            sink: self.sink.clone(),
        }
    }

    /// The rendered prefix without styling, e.g. `[group] [stage]`
    pub fn prefix(&self) -> String {
        format!("[{}]", self.chain.join("] ["))
    }

    /// Name of the innermost stage
    pub fn stage_name(&self) -> &str {
        self.chain.last().map(String::as_str).unwrap_or_default()
    }

    /// Write a raw output line
    pub fn line(&self, text: &str) {
        self.emit(text, text.to_string());
    }

    /// Write an engine message
    pub fn info(&self, text: &str) {
        self.emit(
            text,
            Style::new().color256(MARKER_COLOR).apply_to(text).to_string(),
        );
    }

    /// Write a `<label> in <elapsed>` marker
    pub fn timed(&self, label: &str, marker: Marker, elapsed: Duration) {
        let elapsed = format!("{:?}", elapsed);
        let plain = format!("{} in {}", label, elapsed);
        let styled = format!(
            "{} {}",
            Style::new()
                .color256(MARKER_COLOR)
                .apply_to(format!("{} in", label)),
            marker.style().apply_to(elapsed)
        );
        self.emit(&plain, styled);
    }

    /// Write the final outcome marker of a stage or operation
    pub fn outcome(&self, marker: Marker, elapsed: Duration) {
        self.timed(marker.label(), marker, elapsed);
    }

    fn emit(&self, plain: &str, styled: String) {
        let prefix = self.prefix();
        match &self.sink {
            LogSink::Stdout => {
                let prefix = Style::new().color256(self.color).apply_to(prefix);
                println!("{} {}", prefix, styled);
            }
            LogSink::Memory(lines) => lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(format!("{} {}", prefix, plain)),
        }
    }
}
