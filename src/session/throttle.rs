/// Interval gate for a recurring warning.
///
/// The session holds one per warning and asks before each emission; the
/// first call always passes.
#[derive(Debug)]
pub(crate) struct WarningThrottle {
    interval: f64,
    last: Option<f64>,
}

impl WarningThrottle {
    pub(crate) fn new(interval: f64) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True when at least `interval` seconds have passed since the last
    /// emission; records `now` when it is.
    pub(crate) fn should_emit(&mut self, now: f64) -> bool {
        let due = self.last.is_none_or(|last| now - last >= self.interval);
        if due {
            self.last = Some(now);
        }
        due
    }
}
