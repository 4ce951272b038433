//! Night transfer window

use chrono::NaiveTime;

/// Daily `[start, end)` window in local time; may wrap past midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NightWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl NightWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Window from optional bounds; both must be set
    pub fn from_bounds(start: Option<NaiveTime>, end: Option<NaiveTime>) -> Option<Self> {
        Some(Self::new(start?, end?))
    }

    pub fn contains(&self, at: NaiveTime) -> bool {
        if self.start <= self.end {
            at >= self.start && at < self.end
        } else {
            at >= self.start || at < self.end
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_same_day_window() {
        let window = NightWindow::new(t(1, 0), t(5, 30));
        assert!(window.contains(t(1, 0)));
        assert!(window.contains(t(3, 0)));
        assert!(!window.contains(t(5, 30)));
        assert!(!window.contains(t(0, 59)));
    }

    #[test]
    fn test_window_wrapping_midnight() {
        let window = NightWindow::new(t(23, 0), t(6, 0));
        assert!(window.contains(t(23, 30)));
        assert!(window.contains(t(0, 0)));
        assert!(window.contains(t(5, 59)));
        assert!(!window.contains(t(6, 0)));
        assert!(!window.contains(t(12, 0)));
    }

    #[test]
    fn test_window_needs_both_bounds() {
        assert!(NightWindow::from_bounds(Some(t(1, 0)), None).is_none());
        assert!(NightWindow::from_bounds(None, None).is_none());
        assert!(NightWindow::from_bounds(Some(t(1, 0)), Some(t(2, 0))).is_some());
    }
}
