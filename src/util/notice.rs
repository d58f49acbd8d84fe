use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const THROTTLE_WINDOW: Duration = Duration::from_secs(60);

/// User-facing progress messages, logged at info level.
///
/// An identical message repeated within the throttle window is dropped so
/// periodic runs don't flood the log with the same line.
pub struct Notifier {
    window: Duration,
    last_shown: Mutex<HashMap<String, Instant>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::with_window(THROTTLE_WINDOW)
    }
}

impl Notifier {
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            last_shown: Mutex::new(HashMap::new()),
        }
    }

    /// Emit `text` unless it was emitted less than one window ago.
    /// Returns whether the message was shown.
    pub fn notify(&self, text: &str) -> bool {
        let now = Instant::now();
        let mut last_shown = match self.last_shown.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(at) = last_shown.get(text)
            && now.duration_since(*at) < self.window
        {
            tracing::trace!(notice = text, "notice throttled");
            return false;
        }

        // entries past the window can no longer throttle anything
        last_shown.retain(|_, at| now.duration_since(*at) < self.window);
        last_shown.insert(text.to_string(), now);
        tracing::info!("{text}");
        true
    }

    /// Emit a warning-level notice, bypassing the throttle.
    pub fn alert(&self, text: &str) {
        tracing::warn!("{text}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_message_is_throttled() {
        let n = Notifier::default();
        assert!(n.notify("Got the plan!"));
        assert!(!n.notify("Got the plan!"));
        assert!(n.notify("Sync completed in: 1.2s"));
    }

    #[test]
    fn zero_window_never_throttles() {
        let n = Notifier::with_window(Duration::ZERO);
        assert!(n.notify("a"));
        assert!(n.notify("a"));
    }

    #[test]
    fn expired_messages_are_forgotten() {
        let n = Notifier::with_window(Duration::from_millis(20));
        for i in 0..50 {
            assert!(n.notify(&format!("Updated file {i}/50")));
        }
        std::thread::sleep(Duration::from_millis(40));
        assert!(n.notify("Sync completed in: 0.1s"));
        assert_eq!(n.last_shown.lock().unwrap().len(), 1);
    }
}
