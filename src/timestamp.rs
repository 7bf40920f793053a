use std::time::Instant;

/// A point in time sampled once the poller returns from a wait, handed
/// through to read callbacks. No formatting/display is implemented here;
/// callers that need wall-clock display should convert at the edge.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(Instant);

impl Timestamp {
    pub fn now() -> Timestamp {
        Timestamp(Instant::now())
    }

    pub fn into_instant(self) -> Instant {
        self.0
    }
}

impl From<Instant> for Timestamp {
    fn from(instant: Instant) -> Timestamp {
        Timestamp(instant)
    }
}
