use std::time::{Duration, Instant};

/// Byte offset and rate bookkeeping for a single transfer.
///
/// Speed is the byte delta since the previous sample divided by the whole
/// seconds elapsed (at least one), so bursts of samples within the same
/// second do not inflate it.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub current_offset: Option<u64>,
    pub last_offset: Option<u64>,
    /// Bytes per second at the last sample.
    pub speed: Option<u64>,
    /// Time spent transferring, carried over across resumes.
    pub time_elapsed: Duration,
    /// Seconds until completion at the current speed.
    pub time_left: Option<u64>,
    start_time: Option<Instant>,
    last_update: Option<Instant>,
}

impl Progress {
    /// Start (or resume) timing a transfer whose data begins at `offset`.
    pub fn begin(&mut self, offset: Option<u64>, now: Instant) {
        if offset.is_some() {
            self.last_offset = offset;
        }
        self.last_update = Some(now);
        self.start_time = now.checked_sub(self.time_elapsed).or(Some(now));
    }

    /// Record that `current_offset` bytes of `size` have been transferred.
    pub fn update(&mut self, current_offset: u64, size: u64, now: Instant) -> u64 {
        let current_offset = if size > 0 {
            current_offset.min(size)
        } else {
            current_offset
        };

        let start_time = *self.start_time.get_or_insert(now);
        let last_update = self.last_update.unwrap_or(now);
        let last_offset = *self.last_offset.get_or_insert(current_offset);

        self.time_elapsed = now.saturating_duration_since(start_time);
        self.current_offset = Some(current_offset);

        let byte_difference = current_offset.saturating_sub(last_offset);

        if byte_difference > 0 {
            if size > current_offset || self.speed.is_none() {
                let seconds = now.saturating_duration_since(last_update).as_secs().max(1);
                let speed = byte_difference / seconds;

                self.speed = Some(speed);
                self.time_left = Some(if speed > 0 {
                    (size.saturating_sub(current_offset)) / speed
                } else {
                    0
                });
            } else {
                self.time_left = Some(0);
            }
        }

        self.last_offset = Some(current_offset);
        self.last_update = Some(now);

        byte_difference
    }

    /// Mark the whole file as transferred.
    pub fn complete(&mut self, size: u64) {
        self.current_offset = Some(size);
        self.time_left = Some(0);
    }

    /// Carry counters over from an earlier record of the same file.
    pub fn inherit(&mut self, previous: &Progress) {
        self.current_offset = previous.current_offset;
        self.time_elapsed = previous.time_elapsed;
        self.time_left = previous.time_left;
        self.speed = previous.speed;
    }

    pub fn percent(&self, size: u64) -> f64 {
        match (self.current_offset, size) {
            (_, 0) | (None, _) => 0.0,
            (Some(offset), size) => offset as f64 * 100.0 / size as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_from_delta() {
        let start = Instant::now();
        let mut progress = Progress::default();
        progress.begin(Some(0), start);

        progress.update(4000, 10_000, start + Duration::from_secs(2));

        assert_eq!(progress.current_offset, Some(4000));
        assert_eq!(progress.speed, Some(2000));
        assert_eq!(progress.time_left, Some(3));
    }

    #[test]
    fn test_offset_never_exceeds_size() {
        let start = Instant::now();
        let mut progress = Progress::default();
        progress.begin(Some(0), start);

        progress.update(15_000, 10_000, start + Duration::from_secs(1));

        assert_eq!(progress.current_offset, Some(10_000));
    }

    #[test]
    fn test_resume_keeps_elapsed_time() {
        let start = Instant::now();
        let mut progress = Progress {
            time_elapsed: Duration::from_secs(30),
            ..Progress::default()
        };
        progress.begin(Some(500), start + Duration::from_secs(60));
        progress.update(600, 1000, start + Duration::from_secs(61));

        assert_eq!(progress.time_elapsed, Duration::from_secs(31));
        assert_eq!(progress.percent(1000), 60.0);
    }

    #[test]
    fn test_percent_of_unknown_or_empty_size() {
        let progress = Progress {
            current_offset: Some(700),
            ..Progress::default()
        };

        assert_eq!(progress.percent(1000), 70.0);
        assert_eq!(progress.percent(0), 0.0);
        assert_eq!(Progress::default().percent(1000), 0.0);
    }
}
