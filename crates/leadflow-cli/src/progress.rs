//! Progress indicators for long-running commands

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner for an indeterminate operation. Hidden when `quiet` is set so
/// JSON output stays clean.
pub fn create_spinner(message: &str, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Seconds as a short human-readable duration
pub fn format_seconds(secs: f64) -> String {
    if secs < 1.0 {
        format!("{:.0} ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{secs:.2} s")
    } else {
        let minutes = (secs / 60.0).floor();
        format!("{minutes:.0} m {:.0} s", secs - minutes * 60.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(0.25), "250 ms");
        assert_eq!(format_seconds(1.5), "1.50 s");
        assert_eq!(format_seconds(125.0), "2 m 5 s");
    }

    #[test]
    fn test_quiet_spinner_is_hidden() {
        let pb = create_spinner("Working", true);
        assert!(pb.is_hidden());
        pb.finish_and_clear();
    }
}
