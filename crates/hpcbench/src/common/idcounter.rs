use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

/// Process-wide counter of generated job ids.
static JOB_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Random tag of the current process, it separates ids of different runs that end up in the same
/// remote directories or scheduler queues.
static RUN_TAG: OnceLock<String> = OnceLock::new();

const RUN_TAG_BYTES: usize = 3;
const MIN_COUNTER_DIGITS: usize = 4;

#[derive(Copy, Clone, Default, Debug)]
pub struct IdCounter {
    counter: u32,
}

impl IdCounter {
    pub fn new(initial_value: u32) -> Self {
        Self {
            counter: initial_value,
        }
    }

    pub fn increment(&mut self) -> u32 {
        let value = self.counter;
        self.counter += 1;
        value
    }
}

/// Identifier generated by hpcbench for each started job.
///
/// Not to be confused with the scheduler job id, which is assigned by Slurm after submission.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Creates an id that is unique for the lifetime of the process.
    pub fn generate() -> Self {
        let tag = RUN_TAG.get_or_init(|| hex::encode(rand::random::<[u8; RUN_TAG_BYTES]>()));
        let value = JOB_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{tag}{value:04}"))
    }

    /// Recognizes ids created by [`JobId::generate`], possibly in another process.
    pub fn parse_generated(value: &str) -> Option<Self> {
        let (tag, counter) = value.split_at_checked(RUN_TAG_BYTES * 2)?;
        let is_tag = tag.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        let is_counter =
            counter.len() >= MIN_COUNTER_DIGITS && counter.bytes().all(|b| b.is_ascii_digit());
        (is_tag && is_counter).then(|| Self::new(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
