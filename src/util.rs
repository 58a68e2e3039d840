//! Utility functions

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// A progress bar of `len` steps drawn to stderr, or hidden if `draw_progress` is false.
pub(crate) fn progress_bar(len: u64, message: &'static str, draw_progress: bool) -> ProgressBar {
    let draw_target = if draw_progress {
        ProgressDrawTarget::stderr()
    } else {
        ProgressDrawTarget::hidden()
    };
    let progress = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{msg:16}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:3}% ({eta:5})")
    {
        progress.set_style(style.progress_chars("=> "));
    }
    progress.set_message(message);
    progress
}

/// Render a fraction as a percentage with two decimal places.
pub(crate) fn percent(numerator: usize, denominator: usize) -> String {
    format!(
        "{:.2}%",
        100.0 * numerator as f64 / denominator.max(1) as f64
    )
}
