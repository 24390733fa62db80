#![forbid(unsafe_code)]

use crate::Error;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::{ops::RangeInclusive, time::Duration};

/// Filter priorities accepted by the capture driver.
pub const PRIORITY_RANGE: RangeInclusive<i16> = -30000..=30000;

/// Largest number of packets moved by a single batched receive or send.
pub const MAX_BATCH: usize = 0xff;

/// Packets queued by the driver before it starts dropping.
pub const QUEUE_LENGTH_RANGE: RangeInclusive<u64> = 32..=16384;

/// Milliseconds a packet may sit in the driver queue.
pub const QUEUE_TIME_RANGE: RangeInclusive<u64> = 100..=16000;

/// Bytes queued by the driver before it starts dropping.
pub const QUEUE_SIZE_RANGE: RangeInclusive<u64> = 65535..=33554432;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Capture {
    /// Priority of the intent handle. The packet and reinjection handles use
    /// the next two priorities.
    pub priority: i16,

    /// Packets per batched receive/send.
    pub batch_size: usize,

    /// Driver queue length in packets. Driver default when unset.
    pub queue_length: Option<u64>,

    /// Driver queue time. Driver default when unset.
    #[serde_as(as = "Option<serde_with::DurationMilliSeconds>")]
    pub queue_time: Option<Duration>,

    /// Driver queue size in bytes. Driver default when unset.
    pub queue_size: Option<u64>,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            priority: 100,
            batch_size: 32,
            queue_length: None,
            queue_time: None,
            queue_size: None,
        }
    }
}

impl Capture {
    pub fn validate(&self) -> Result<(), Error> {
        let priority = i64::from(self.priority);
        let lowest = i64::from(*PRIORITY_RANGE.start());
        let highest = i64::from(*PRIORITY_RANGE.end());
        // the packet and reinjection handles sit two priorities above
        if priority < lowest || priority + 2 > highest {
            return Err(Error::Invalid {
                field: "capture.priority",
                reason: format!("{priority} leaves no room in {lowest}..={highest}"),
            });
        }

        if !(1..=MAX_BATCH).contains(&self.batch_size) {
            return Err(Error::OutOfRange {
                param: "capture.batch_size",
                value: self.batch_size as u64,
                min: 1,
                max: MAX_BATCH as u64,
            });
        }

        if let Some(len) = self.queue_length {
            check_range("capture.queue_length", len, QUEUE_LENGTH_RANGE)?;
        }
        if let Some(time) = self.queue_time {
            check_range("capture.queue_time", time.as_millis() as u64, QUEUE_TIME_RANGE)?;
        }
        if let Some(size) = self.queue_size {
            check_range("capture.queue_size", size, QUEUE_SIZE_RANGE)?;
        }
        Ok(())
    }
}

/// Fail when `value` lies outside `range`. Values are never clamped.
pub fn check_range(
    param: &'static str,
    value: u64,
    range: RangeInclusive<u64>,
) -> Result<(), Error> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(Error::OutOfRange {
            param,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_is_valid() {
        Capture::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_batch() {
        let capture = Capture {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            capture.validate(),
            Err(Error::OutOfRange {
                param: "capture.batch_size",
                ..
            })
        ));
    }

    #[test]
    fn rejects_priority_at_the_top() {
        let capture = Capture {
            priority: 29999,
            ..Default::default()
        };
        assert!(capture.validate().is_err());
    }

    proptest! {
        #[test]
        fn queue_length_is_never_clamped(len in 0u64..40000) {
            let capture = Capture { queue_length: Some(len), ..Default::default() };
            prop_assert_eq!(capture.validate().is_ok(), QUEUE_LENGTH_RANGE.contains(&len));
        }

        #[test]
        fn queue_time_is_never_clamped(ms in 0u64..40000) {
            let capture = Capture {
                queue_time: Some(Duration::from_millis(ms)),
                ..Default::default()
            };
            prop_assert_eq!(capture.validate().is_ok(), QUEUE_TIME_RANGE.contains(&ms));
        }
    }
}
