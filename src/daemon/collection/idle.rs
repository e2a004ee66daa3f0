use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use super::Activity;

/// `true` once no distinguishing signal was seen for strictly longer than `threshold`.
pub fn is_idle(now: DateTime<Utc>, last_signal: DateTime<Utc>, threshold: chrono::Duration) -> bool {
    now - last_signal > threshold
}

/// Keeps the rolling "last distinguishing signal" timestamp. Input idle time reported by the probe
/// is the primary source; when the probe can't report it, a change of the activity key counts as
/// the signal.
pub struct IdleDetector {
    threshold: chrono::Duration,
    last_signal_at: Option<DateTime<Utc>>,
    last_key: Option<(Arc<str>, Arc<str>)>,
}

impl IdleDetector {
    pub fn new(threshold: chrono::Duration) -> Self {
        Self {
            threshold,
            last_signal_at: None,
            last_key: None,
        }
    }

    pub fn set_threshold(&mut self, threshold: chrono::Duration) {
        self.threshold = threshold;
    }

    /// Feeds one tick and returns the updated last signal.
    pub fn observe(
        &mut self,
        now: DateTime<Utc>,
        activity: &Activity,
        input_idle: Option<Duration>,
    ) -> DateTime<Utc> {
        let key = match activity {
            Activity::Tracked(context) => {
                let (app, signature) = context.key();
                Some((Arc::from(app), Arc::from(signature)))
            }
            Activity::Excluded => Some((Arc::from(""), Arc::from(""))),
            Activity::Unknown => None,
        };

        let signal = match input_idle {
            Some(idle) => chrono::Duration::from_std(idle)
                .ok()
                .map(|idle| now - idle),
            None if key.is_some() && key != self.last_key => Some(now),
            None => None,
        };
        if key.is_some() {
            self.last_key = key;
        }

        let last = match (self.last_signal_at, signal) {
            (Some(last), Some(signal)) => last.max(signal),
            (None, Some(signal)) => signal,
            (Some(last), None) => last,
            // The first tick counts as a signal so a fresh daemon doesn't start out idle.
            (None, None) => now,
        };
        self.last_signal_at = Some(last);
        last
    }

    pub fn is_idle(&self, now: DateTime<Utc>, last_signal: DateTime<Utc>) -> bool {
        is_idle(now, last_signal, self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use crate::daemon::{collection::Activity, storage::entities::SpanContext};

    use super::IdleDetector;

    fn tracked(title: &str) -> Activity {
        Activity::Tracked(SpanContext {
            app_name: "kitty".into(),
            window_title: title.into(),
            project_path: None,
        })
    }

    #[test]
    fn test_threshold_is_strict() {
        let detector = IdleDetector::new(chrono::Duration::seconds(60));
        let last = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert!(!detector.is_idle(last + chrono::Duration::seconds(60), last));
        assert!(detector.is_idle(last + chrono::Duration::seconds(61), last));
    }

    #[test]
    fn test_input_idle_time_moves_signal_back() {
        let mut detector = IdleDetector::new(chrono::Duration::seconds(60));
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let last = detector.observe(now, &tracked("a"), Some(Duration::from_secs(90)));
        assert_eq!(last, now - chrono::Duration::seconds(90));
        assert!(detector.is_idle(now, last));
    }

    #[test]
    fn test_context_change_is_a_signal_without_input_time() {
        let mut detector = IdleDetector::new(chrono::Duration::seconds(60));
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        detector.observe(start, &tracked("a"), None);

        let later = start + chrono::Duration::seconds(100);
        let last = detector.observe(later, &tracked("a"), None);
        assert_eq!(last, start);
        assert!(detector.is_idle(later, last));

        let last = detector.observe(later, &tracked("b"), None);
        assert_eq!(last, later);
    }

    #[test]
    fn test_unknown_samples_keep_the_last_signal() {
        let mut detector = IdleDetector::new(chrono::Duration::seconds(60));
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        detector.observe(start, &tracked("a"), None);
        let last = detector.observe(
            start + chrono::Duration::seconds(5),
            &Activity::Unknown,
            None,
        );
        assert_eq!(last, start);
    }
}
