/*!
 * Terminal progress for the CLI
 *
 * Renders the scheduler's events as one indicatif bar per transfer, with
 * speed and ETA.
 */

use std::collections::HashMap;
use std::time::Instant;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::error::ErrorCategory;
use crate::transfer::{TransferEvent, TransferId};

struct BarState {
    bar: ProgressBar,
    started: Instant,
    total: u64,
}

/// Renders transfer events as progress bars
pub struct ProgressRenderer {
    multi: MultiProgress,
    bars: HashMap<TransferId, BarState>,
    show_progress: bool,
}

impl ProgressRenderer {
    pub fn new(show_progress: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            show_progress,
        }
    }

    pub fn handle(&mut self, event: TransferEvent) {
        if !self.show_progress {
            return;
        }
        match event {
            TransferEvent::Start { id, name, size, .. } => self.start(id, &name, size),
            TransferEvent::Progress(update) => {
                if let Some(state) = self.bars.get(&update.id) {
                    state.bar.set_position(update.loaded.min(state.total));
                }
            }
            TransferEvent::Paused { id } => self.message(id, "paused"),
            TransferEvent::Resumed { id } => self.message(id, "resumed"),
            TransferEvent::BeforeComplete { id } => self.message(id, "verified, saving"),
            TransferEvent::Complete { id, .. } => self.finish(id, true, None),
            TransferEvent::Error {
                id,
                message,
                category,
            } => self.finish(id, false, Some((category, message))),
            TransferEvent::Cancelled { id } => self.finish(id, false, None),
            TransferEvent::Overquota { retry_after, .. } => {
                let wait = retry_after
                    .map(|d| format!(", retrying in {}s", d.as_secs()))
                    .unwrap_or_default();
                let _ = self.multi.println(format!("transfer quota exceeded{}", wait));
            }
            TransferEvent::OverquotaCleared { .. } => {
                let _ = self.multi.println("transfer quota available again");
            }
            TransferEvent::Queued { .. } | TransferEvent::Working { .. } => {}
        }
    }

    fn start(&mut self, id: TransferId, name: &str, total: u64) {
        if self.bars.contains_key(&id) {
            return;
        }
        let bar = self.multi.add(ProgressBar::new(total));
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(name.to_string());
        self.bars.insert(
            id,
            BarState {
                bar,
                started: Instant::now(),
                total,
            },
        );
    }

    fn message(&self, id: TransferId, note: &str) {
        if let Some(state) = self.bars.get(&id) {
            state.bar.set_message(note.to_string());
        }
    }

    fn finish(&mut self, id: TransferId, success: bool, error: Option<(ErrorCategory, String)>) {
        let Some(state) = self.bars.remove(&id) else {
            return;
        };
        let elapsed = state.started.elapsed().as_secs_f64();
        let message = match (success, error) {
            (true, _) => {
                let rate = if elapsed > 0.0 {
                    state.total as f64 / elapsed
                } else {
                    0.0
                };
                format!(
                    "✓ Complete - {} in {:.2}s ({}/s)",
                    format_bytes(state.total),
                    elapsed,
                    format_bytes(rate as u64)
                )
            }
            (false, Some((category, message))) => format!("✗ {} ({})", message, category),
            (false, None) => "✗ Cancelled".to_string(),
        };
        if success {
            state.bar.finish_with_message(message);
        } else {
            state.bar.abandon_with_message(message);
        }
    }
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let base = 1024.0_f64;
    let exp = (bytes_f.ln() / base.ln()).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);

    let value = bytes_f / base.powi(exp as i32);

    if exp == 0 {
        format!("{} {}", bytes, UNITS[exp])
    } else {
        format!("{:.2} {}", value, UNITS[exp])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
    }

    #[test]
    fn test_bars_follow_lifecycle() {
        let mut renderer = ProgressRenderer::new(true);
        let id = TransferId(1);
        renderer.handle(TransferEvent::Start {
            id,
            direction: crate::transfer::Direction::Download,
            name: "a.bin".into(),
            size: 100,
        });
        assert!(renderer.bars.contains_key(&id));
        renderer.handle(TransferEvent::Complete { id, size: 100 });
        assert!(renderer.bars.is_empty());
    }

    #[test]
    fn test_hidden_renderer_ignores_events() {
        let mut renderer = ProgressRenderer::new(false);
        renderer.handle(TransferEvent::Start {
            id: TransferId(1),
            direction: crate::transfer::Direction::Upload,
            name: "b".into(),
            size: 1,
        });
        assert!(renderer.bars.is_empty());
    }
}
