use chrono::{DateTime, Utc};

/// Source of "now" for expiry decisions.
///
/// Production uses [`SystemClock`]; tests drive time by hand so TTLs can
/// elapse without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
