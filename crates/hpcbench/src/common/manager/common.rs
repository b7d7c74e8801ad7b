use std::time::Duration;

/// Format a duration as a Slurm time string, e.g. 01:05:02.
/// Durations of at least one day get a day prefix, e.g. 2-00:00:10.
pub(super) fn format_duration(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let days = seconds / 86400;
    seconds %= 86400;
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    seconds %= 60;
    if days > 0 {
        format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}
