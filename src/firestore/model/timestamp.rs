use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut timestamp = Self { seconds, nanos };
        timestamp.normalize();
        timestamp
    }

    pub fn now() -> Self {
        Self::from_millis(Utc::now().timestamp_millis())
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(
            millis.div_euclid(1_000),
            (millis.rem_euclid(1_000) * 1_000_000) as i32,
        )
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1_000 + i64::from(self.nanos) / 1_000_000
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.nanos) / 1_000
    }

    /// Parses the RFC 3339 form used on the wire, e.g. `2024-01-01T00:00:00.5Z`.
    pub fn parse_rfc3339(value: &str) -> FirestoreResult<Self> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|err| invalid_argument(format!("Invalid timestamp {value}: {err}")))?;
        Ok(Self::new(
            parsed.timestamp(),
            parsed.timestamp_subsec_nanos() as i32,
        ))
    }

    pub fn to_rfc3339(&self) -> String {
        DateTime::<Utc>::from_timestamp(self.seconds, self.nanos as u32)
            .map(|time| time.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .unwrap_or_default()
    }

    fn normalize(&mut self) {
        let total = i64::from(self.nanos);
        self.seconds += total.div_euclid(NANOS_PER_SECOND);
        self.nanos = total.rem_euclid(NANOS_PER_SECOND) as i32;
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.seconds.cmp(&other.seconds) {
            Ordering::Equal => self.nanos.cmp(&other.nanos),
            ordering => ordering,
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp(seconds={}, nanos={})", self.seconds, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_nanoseconds() {
        let timestamp = Timestamp::new(1, 1_500_000_000);
        assert_eq!(timestamp.seconds, 2);
        assert_eq!(timestamp.nanos, 500_000_000);
        let negative = Timestamp::new(1, -1);
        assert_eq!((negative.seconds, negative.nanos), (0, 999_999_999));
    }

    #[test]
    fn ordering() {
        let earlier = Timestamp::new(1, 0);
        let later = Timestamp::new(2, 0);
        assert!(earlier < later);
    }

    #[test]
    fn rfc3339_round_trip() {
        let parsed = Timestamp::parse_rfc3339("2023-05-01T10:20:30.123456789Z").unwrap();
        assert_eq!(parsed.nanos, 123_456_789);
        assert_eq!(Timestamp::parse_rfc3339(&parsed.to_rfc3339()).unwrap(), parsed);
        assert_eq!(Timestamp::from_millis(1_500).to_millis(), 1_500);
    }
}
