use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use fwbuild_core::BuildContext;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::models::PackageStage;

/// Stage-level progress protocol. Download and unpack report byte/entry
/// counts; install reports free-form status text with `total == 0`.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, task: &str, stage: PackageStage, current: u64, total: u64, detail: &str);
    fn on_finished(&self, task: &str, stage: PackageStage, elapsed: Duration);
    fn on_summary(&self, total: usize, active: usize, done: usize);
}

/// Sink for operations that do not render progress (tests, quiet mode).
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_progress(&self, _: &str, _: PackageStage, _: u64, _: u64, _: &str) {}
    fn on_finished(&self, _: &str, _: PackageStage, _: Duration) {}
    fn on_summary(&self, _: usize, _: usize, _: usize) {}
}

/// Live multi-line terminal view: one bar per task plus a summary line.
pub struct ProgressAggregator {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
    summary: ProgressBar,
}

impl ProgressAggregator {
    pub fn new(total_tasks: usize) -> Self {
        let multi = MultiProgress::new();
        let summary = multi.add(ProgressBar::new(total_tasks as u64));
        summary.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:30.cyan/blue}] {pos}/{len}")
                .expect("summary template"),
        );
        summary.set_message("packages");
        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            summary,
        }
    }

    fn bar_for(&self, task: &str) -> ProgressBar {
        let mut bars = self.bars.lock().expect("progress bars lock poisoned");
        bars.entry(task.to_owned())
            .or_insert_with(|| {
                let bar = self.multi.insert_before(&self.summary, ProgressBar::new(0));
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{prefix:>24} {spinner:.green} {msg:24} {bar:24} {bytes}/{total_bytes}")
                        .expect("task template")
                        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
                );
                bar.set_prefix(task.to_owned());
                bar.enable_steady_tick(Duration::from_millis(120));
                bar
            })
            .clone()
    }
}

impl ProgressSink for ProgressAggregator {
    fn on_progress(&self, task: &str, stage: PackageStage, current: u64, total: u64, detail: &str) {
        let bar = self.bar_for(task);
        if total > 0 {
            bar.set_length(total);
            bar.set_position(current);
        }
        if detail.is_empty() {
            bar.set_message(stage.label().to_owned());
        } else {
            bar.set_message(format!("{} {detail}", stage.label()));
        }
    }

    fn on_finished(&self, task: &str, stage: PackageStage, elapsed: Duration) {
        let bar = self.bar_for(task);
        let label = match stage {
            PackageStage::Done => console::style("done").green().to_string(),
            PackageStage::Cancelled => console::style("cancelled").yellow().to_string(),
            _ => console::style(stage.label()).red().to_string(),
        };
        bar.finish_with_message(format!("{label} in {:.1}s", elapsed.as_secs_f64()));
    }

    fn on_summary(&self, total: usize, active: usize, done: usize) {
        self.summary.set_length(total as u64);
        self.summary.set_position(done as u64);
        self.summary
            .set_message(format!("packages ({active} active)"));
        if done == total {
            self.summary.finish_with_message("packages");
        }
    }
}

/// Pick the rendering for this process: the live multi-line view when
/// stderr is a terminal (a foreground coordinator), otherwise plain lines
/// through the request's context.
pub fn stderr_sink(context: BuildContext) -> std::sync::Arc<dyn ProgressSink> {
    if console::Term::stderr().is_term() {
        std::sync::Arc::new(ProgressAggregator::new(0))
    } else {
        std::sync::Arc::new(PlainProgress::new(context))
    }
}

/// Non-TTY rendering: the same progress as plain lines through the request's
/// build context, without repositioning.
pub struct PlainProgress {
    context: BuildContext,
}

impl PlainProgress {
    pub fn new(context: BuildContext) -> Self {
        Self { context }
    }
}

impl ProgressSink for PlainProgress {
    fn on_progress(&self, task: &str, stage: PackageStage, current: u64, total: u64, detail: &str) {
        if total > 0 {
            let pct = (current as f64 / total as f64 * 100.0).min(100.0);
            self.context
                .emit_verbose(&format!("{task}: {} {pct:.0}% {detail}", stage.label()));
        } else {
            self.context
                .emit(&format!("{task}: {} {detail}", stage.label()));
        }
    }

    fn on_finished(&self, task: &str, stage: PackageStage, elapsed: Duration) {
        self.context.emit(&format!(
            "{task}: {} in {:.1}s",
            stage.label(),
            elapsed.as_secs_f64()
        ));
    }

    fn on_summary(&self, total: usize, active: usize, done: usize) {
        self.context
            .emit_verbose(&format!("packages: {done}/{total} done, {active} active"));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fwbuild_core::{BuildContext, RequestId, Verbosity};

    use crate::models::PackageStage;

    use super::{PlainProgress, ProgressSink};

    #[test]
    fn plain_progress_emits_stage_transitions_and_completions() {
        let (context, buffer) =
            BuildContext::in_memory(RequestId::new("req-progress"), Verbosity::Normal);
        let sink = PlainProgress::new(context);

        sink.on_progress("toolchain-xtensa", PackageStage::Installing, 0, 0, "verifying");
        sink.on_finished("toolchain-xtensa", PackageStage::Done, Duration::from_secs(3));

        let written = String::from_utf8(buffer.lock().expect("buffer").clone()).expect("utf8");
        assert!(written.contains("toolchain-xtensa: installing verifying"));
        assert!(written.contains("toolchain-xtensa: done in 3.0s"));
    }

    #[test]
    fn plain_progress_keeps_percent_lines_verbose_only() {
        let (context, buffer) =
            BuildContext::in_memory(RequestId::new("req-quiet"), Verbosity::Normal);
        let sink = PlainProgress::new(context);
        sink.on_progress("platform-esp32", PackageStage::Downloading, 50, 100, "1.2 MB/s");
        assert!(buffer.lock().expect("buffer").is_empty());
    }
}
