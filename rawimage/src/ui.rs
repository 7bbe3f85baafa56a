//! Progress bars driven by engine events.
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use rawimage_core::progress::{Hms, Progress};
use rawimage_core::session::{EngineState, Event};
use std::time::Duration;

const BAR_TEMPLATE: &str =
    "{prefix:12} [{elapsed_precise}] [{bar:40.COLOR/black}] {bytes}/{total_bytes} {msg}";

/// Turns the engine's event stream into one bar per phase.
pub struct ProgressUi {
    decompress: Option<ProgressBar>,
    current: Option<(EngineState, ProgressBar)>,
}

impl ProgressUi {
    pub fn new() -> Self {
        Self {
            decompress: None,
            current: None,
        }
    }

    pub fn on_event(&mut self, event: Event) {
        match event {
            Event::Decompressing { bytes } => {
                self.decompress.get_or_insert_with(|| spinner("Decompress")).set_position(bytes);
            }
            Event::Started {
                state,
                total_sectors,
                sector_size,
            } => {
                if let Some(pb) = self.decompress.take() {
                    pb.finish_with_message("Decompression complete.");
                }
                self.finish_current();
                let pb = ProgressBar::new(total_sectors.saturating_mul(sector_size));
                let (prefix, color) = phase(state);
                pb.set_prefix(prefix);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template(&BAR_TEMPLATE.replace("COLOR", color))
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("■ "),
                );
                self.current = Some((state, pb));
            }
            Event::Progress(p) => {
                if let Some((_, pb)) = &self.current {
                    pb.set_position(p.done_bytes());
                    pb.set_message(rate_message(&p));
                }
            }
        }
    }

    fn finish_current(&mut self) {
        if let Some((state, pb)) = self.current.take() {
            let (prefix, _) = phase(state);
            pb.finish_with_message(format!("{prefix} complete."));
        }
    }

    /// Marks every open bar as complete.
    pub fn finish(mut self) {
        self.finish_current();
    }

    /// Leaves the bars where they stopped, with `message` on the last one.
    pub fn abandon(mut self, message: &str) {
        if let Some(pb) = self.decompress.take() {
            pb.abandon_with_message(message.to_string());
        }
        if let Some((_, pb)) = self.current.take() {
            pb.abandon_with_message(message.to_string());
        }
    }
}

fn phase(state: EngineState) -> (&'static str, &'static str) {
    match state {
        EngineState::Writing => ("Writing", "green"),
        EngineState::Verifying => ("Verifying", "magenta"),
        _ => ("Reading", "cyan"),
    }
}

fn rate_message(p: &Progress) -> String {
    match (p.rate, p.remaining) {
        (Some(rate), Some(left)) => format!("({rate:.1} MB/s, {} left)", Hms(left)),
        (None, Some(left)) => format!("({} left)", Hms(left)),
        _ => String::new(),
    }
}

/// A byte-counting spinner for work without a known length.
pub fn spinner(prefix: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_prefix(prefix);
    let frames: Vec<String> = ["■     ", " ■    ", "  ■   ", "   ■  ", "    ■ ", "     ■", "■■■■■■"]
        .iter()
        .map(|f| style(f).blue().to_string())
        .collect();
    let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:12} [{elapsed_precise}] [{spinner}] {bytes} ({bytes_per_sec}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&frames),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
