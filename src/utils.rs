use chrono::{DateTime, TimeZone, Timelike};
use sha2::{Digest, Sha256};
use std::fmt::Display;

use crate::models::geo::Coordinate;

/// Last second of a day, used when a vehicle window has no explicit end.
pub const END_OF_DAY_SECS: u32 = 86_399;

/// Seconds since midnight of the value's own local wall clock.
///
/// The offset carried by `t` is never converted away: a creneau stored as
/// 09:00+02:00 yields 32400 whatever the server timezone is. Vehicle windows
/// and stop windows must both go through this function.
pub fn seconds_since_midnight<Tz: TimeZone>(t: &DateTime<Tz>) -> u32 {
    t.naive_local().time().num_seconds_from_midnight()
}

/// Deterministic cache key builder.
///
/// Coordinates are rounded to 5 decimal places (about a metre) before hashing
/// so that jitter in the last digits of a client-side coordinate still hits
/// the same entry.
pub struct Fingerprint {
    namespace: &'static str,
    hasher: Sha256,
}

impl Fingerprint {
    pub fn new(namespace: &'static str) -> Self {
        Self {
            namespace,
            hasher: Sha256::new(),
        }
    }

    pub fn coordinate(&mut self, coordinate: &Coordinate) -> &mut Self {
        self.hasher.update(format!(
            "c:{:.5},{:.5};",
            coordinate.latitude, coordinate.longitude
        ));
        self
    }

    pub fn coordinates(&mut self, coordinates: &[Coordinate]) -> &mut Self {
        for coordinate in coordinates {
            self.coordinate(coordinate);
        }
        self
    }

    pub fn field(&mut self, name: &str, value: impl Display) -> &mut Self {
        self.hasher.update(format!("{}={};", name, value));
        self
    }

    pub fn optional<T: Display>(&mut self, name: &str, value: Option<T>) -> &mut Self {
        match value {
            Some(value) => self.field(name, value),
            None => self.field(name, "-"),
        }
    }

    pub fn finish(self) -> String {
        format!("{}:{}", self.namespace, hex::encode(self.hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn test_seconds_since_midnight_uses_local_wall_clock() {
        let paris = FixedOffset::east_opt(2 * 3600).unwrap();
        let t = paris.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();
        assert_eq!(seconds_since_midnight(&t), 32_400);

        let utc = t.with_timezone(&chrono::Utc);
        assert_eq!(seconds_since_midnight(&utc), 25_200);
    }

    #[test]
    fn test_fingerprint_ignores_sub_metre_jitter() {
        let mut a = Fingerprint::new("route");
        a.coordinate(&Coordinate::new(48.856_613_1, 2.352_221_9));
        let mut b = Fingerprint::new("route");
        b.coordinate(&Coordinate::new(48.856_614_9, 2.352_220_2));
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn test_fingerprint_changes_with_fields() {
        let mut a = Fingerprint::new("trip");
        a.field("service", 600);
        let mut b = Fingerprint::new("trip");
        b.field("service", 300);
        let (a, b) = (a.finish(), b.finish());
        assert_ne!(a, b);
        assert!(a.starts_with("trip:"));
    }
}
