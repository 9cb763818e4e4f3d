use serde::{Deserialize, Serialize};

/// A WGS84 point. Callers speak latitude-first; upstream engines get
/// longitude-first through [`Coordinate::lon_lat`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    pub fn lon_lat(&self) -> [f64; 2] {
        [self.longitude, self.latitude]
    }
}
