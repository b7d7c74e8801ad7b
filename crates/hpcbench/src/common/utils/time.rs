use std::time::Duration;

use anyhow::anyhow;
use nom::character::complete::char;
use nom::combinator::{map_res, opt};
use nom::sequence::{preceded, terminated, tuple};

use crate::common::parser::{NomResult, consume_all, p_u32};

fn p_hms_time(input: &str) -> NomResult<'_, Duration> {
    map_res(
        tuple((
            p_u32,
            opt(preceded(char(':'), p_u32)),
            opt(preceded(char(':'), p_u32)),
        )),
        |parsed| match parsed {
            (seconds, None, None) => Ok(Duration::from_secs(seconds as u64)),
            (minutes, Some(seconds), None) => {
                Ok(Duration::from_secs(minutes as u64 * 60 + seconds as u64))
            }
            (hours, Some(minutes), Some(seconds)) => Ok(Duration::from_secs(
                hours as u64 * 3600 + minutes as u64 * 60 + seconds as u64,
            )),
            _ => Err(anyhow!("Invalid time specification")),
        },
    )(input)
}

/// Parses time strings in the format [[hh:]mm:]ss.
/// Individual time values may be zero padded.
pub fn parse_hms_time(input: &str) -> anyhow::Result<Duration> {
    consume_all(p_hms_time, input)
}

fn p_slurm_time(input: &str) -> NomResult<'_, Duration> {
    map_res(
        tuple((opt(terminated(p_u32, char('-'))), p_hms_time)),
        |(days, time)| -> anyhow::Result<Duration> {
            let days = Duration::from_secs(days.unwrap_or(0) as u64 * 24 * 3600);
            Ok(days + time)
        },
    )(input)
}

/// Parses Slurm elapsed/limit values: `[D-][[HH:]MM:]SS`.
pub fn parse_slurm_time(input: &str) -> anyhow::Result<Duration> {
    consume_all(p_slurm_time, input)
}

/// Parses either a humantime duration (`90s`, `2h`) or `[D-]HH:MM:SS`.
pub fn parse_hms_or_human_time(text: &str) -> anyhow::Result<Duration> {
    parse_slurm_time(text)
        .or_else(|_| humantime::parse_duration(text).map_err(anyhow::Error::from))
        .map_err(|e| {
            anyhow!(
                "Could not parse time limit. Use either `[D-]HH:MM:SS` or humantime format (2hours): {e:?}"
            )
        })
}

#[cfg(not(test))]
pub fn now_monotonic() -> std::time::Instant {
    std::time::Instant::now()
}

#[cfg(test)]
pub use mock_time::now_monotonic;

/// Testing utilities for mocking (monotonic) timestamps.
/// Use the `now_monotonic` function if you want to be able to mock the time in tests.
#[cfg(test)]
pub mod mock_time {
    use std::cell::RefCell;
    use std::time::Instant;

    thread_local! {
        static MOCK_TIME: RefCell<Option<Instant>> = const { RefCell::new(None) };
    }

    pub struct MockTime;

    impl MockTime {
        pub fn mock(time: Instant) -> Self {
            MOCK_TIME.with(|cell| {
                assert!(cell.borrow().is_none());
                *cell.borrow_mut() = Some(time);
            });
            MockTime
        }

        /// Moves the mocked clock forward.
        pub fn advance(&self, duration: std::time::Duration) {
            MOCK_TIME.with(|cell| {
                let mut time = cell.borrow_mut();
                let current = time.expect("time is not mocked");
                *time = Some(current + duration);
            });
        }
    }

    impl Drop for MockTime {
        fn drop(&mut self) {
            MOCK_TIME.with(|cell| *cell.borrow_mut() = None);
        }
    }

    pub fn now_monotonic() -> Instant {
        MOCK_TIME.with(|cell| cell.borrow().as_ref().cloned().unwrap_or_else(Instant::now))
    }
}
