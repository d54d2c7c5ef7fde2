//! Device activity tracking
//!
//! The host application reports work either in-process through
//! [`IdleTracker::mark_active`] or by touching a stamp file, which is how an
//! out-of-process agent learns the device is busy.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub struct IdleTracker {
    last_active: Mutex<DateTime<Utc>>,
    stamp_path: Option<PathBuf>,
}

impl IdleTracker {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_active: Mutex::new(now),
            stamp_path: None,
        }
    }

    /// Also count the modification time of `path` as activity. An existing
    /// stamp replaces the starting mark, so an agent started on a quiet device
    /// sees how long it has really been idle.
    pub fn with_stamp_file(mut self, path: &Path) -> Self {
        self.stamp_path = Some(path.to_path_buf());
        if let Some(stamp) = self.stamp_time() {
            *self.last_active.get_mut().unwrap_or_else(|e| e.into_inner()) = stamp;
        }
        self
    }

    pub fn mark_active(&self, now: DateTime<Utc>) {
        let mut last = self.last_active.lock().unwrap_or_else(|e| e.into_inner());
        if now > *last {
            *last = now;
        }
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        let in_process = *self.last_active.lock().unwrap_or_else(|e| e.into_inner());
        match self.stamp_time() {
            Some(stamp) if stamp > in_process => stamp,
            _ => in_process,
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_active()).to_std().unwrap_or(Duration::ZERO)
    }

    fn stamp_time(&self) -> Option<DateTime<Utc>> {
        let path = self.stamp_path.as_ref()?;
        let modified = fs::metadata(path).ok()?.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::tempdir;

    #[test]
    fn test_idle_duration() {
        let start = Utc::now();
        let tracker = IdleTracker::new(start);

        let later = start + TimeDelta::minutes(30);
        assert_eq!(tracker.idle_for(later), Duration::from_secs(30 * 60));

        tracker.mark_active(later);
        assert_eq!(tracker.idle_for(later), Duration::ZERO);

        // Clock going backwards never yields negative idle time
        assert_eq!(tracker.idle_for(start), Duration::ZERO);
    }

    #[test]
    fn test_old_stamp_seeds_idle_time() {
        let dir = tempdir().unwrap();
        let stamp = dir.path().join("activity.stamp");
        let file = fs::File::create(&stamp).unwrap();
        let two_hours_ago = std::time::SystemTime::now() - Duration::from_secs(2 * 3600);
        file.set_modified(two_hours_ago).unwrap();

        let now = Utc::now();
        let tracker = IdleTracker::new(now).with_stamp_file(&stamp);
        let idle = tracker.idle_for(now);
        assert!(idle >= Duration::from_secs(2 * 3600 - 60), "{idle:?}");
        assert!(idle <= Duration::from_secs(2 * 3600 + 60), "{idle:?}");

        // Work reported in-process still resets the clock
        tracker.mark_active(now);
        assert_eq!(tracker.idle_for(now), Duration::ZERO);
    }

    #[test]
    fn test_missing_stamp_keeps_start_mark() {
        let dir = tempdir().unwrap();
        let start = Utc::now();
        let tracker = IdleTracker::new(start).with_stamp_file(&dir.path().join("activity.stamp"));
        assert_eq!(tracker.idle_for(start + TimeDelta::minutes(5)), Duration::from_secs(300));
    }

    #[test]
    fn test_stamp_file_counts_as_activity() {
        let dir = tempdir().unwrap();
        let stamp = dir.path().join("activity.stamp");
        let long_ago = Utc::now() - TimeDelta::hours(5);
        let tracker = IdleTracker::new(long_ago).with_stamp_file(&stamp);

        assert!(tracker.idle_for(Utc::now()) >= Duration::from_secs(4 * 3600));

        fs::write(&stamp, b"").unwrap();
        assert!(tracker.idle_for(Utc::now()) < Duration::from_secs(60));
    }
}
