//! Helpers shared by the stages that fan work out over the rayon pool:
//! independent random streams and progress bars.
//!
//! Every parallel task (an HMC chain, a bootstrap resample, the clustering of
//! the search, the thinning of the projection) seeds its own RNG from the
//! master seed and a stream index, so results do not depend on how rayon
//! schedules the tasks.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;

/// Seed of an independent random stream derived from the master seed.
pub fn stream_seed(seed: u64, stream: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((stream as u64 + 1).wrapping_mul(0xD1B5_4A32_D192_ED03))
}

/// Progress bar on stderr, hidden when stderr is not a terminal.
pub fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}
