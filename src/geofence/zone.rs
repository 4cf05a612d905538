//! Zone records and their validation.

use crate::geo;
use crate::model::Coordinate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Zone geometry. Closed sum: every dispatch site matches
/// exhaustively.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Geometry {
    Circular {
        center: Coordinate,
        radius_m: f64,
    },
    Polygon {
        /// Ordered ring vertices; the ring closes implicitly
        /// (last back to first).
        vertices: Vec<Coordinate>,
    },
}

/// A named geographic zone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub geometry: Geometry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl Zone {
    pub fn circular(
        id: impl Into<String>,
        name: impl Into<String>,
        center: Coordinate,
        radius_m: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            geometry: Geometry::Circular { center, radius_m },
            metadata: None,
        }
    }

    pub fn polygon(
        id: impl Into<String>,
        name: impl Into<String>,
        vertices: Vec<Coordinate>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            geometry: Geometry::Polygon { vertices },
            metadata: None,
        }
    }

    /// Checks the zone definition, collecting every violation instead
    /// of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<ZoneValidationError>> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push(ZoneValidationError::MissingId);
        }
        if self.name.trim().is_empty() {
            errors.push(ZoneValidationError::MissingName);
        }

        match &self.geometry {
            Geometry::Circular { center, radius_m } => {
                if *radius_m <= 0.0 || !radius_m.is_finite() {
                    errors.push(ZoneValidationError::NonPositiveRadius(*radius_m));
                }
                if !geo::valid_coordinate(center.lat, center.lon) {
                    errors.push(ZoneValidationError::InvalidVertex(*center));
                }
            }
            Geometry::Polygon { vertices } => {
                if vertices.len() < 3 {
                    errors.push(ZoneValidationError::TooFewVertices(vertices.len()));
                }
                for v in vertices {
                    if !geo::valid_coordinate(v.lat, v.lon) {
                        errors.push(ZoneValidationError::InvalidVertex(*v));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A single violation found by [`Zone::validate`].
#[derive(Clone, Debug, PartialEq)]
pub enum ZoneValidationError {
    MissingId,
    MissingName,
    NonPositiveRadius(f64),
    TooFewVertices(usize),
    InvalidVertex(Coordinate),
}

impl fmt::Display for ZoneValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingId => write!(f, "zone id is required"),
            Self::MissingName => write!(f, "zone name is required"),
            Self::NonPositiveRadius(r) => write!(f, "radius must be positive, got {}", r),
            Self::TooFewVertices(n) => {
                write!(f, "polygon needs at least 3 vertices, got {}", n)
            }
            Self::InvalidVertex(c) => write!(f, "vertex {} is out of range", c),
        }
    }
}

impl std::error::Error for ZoneValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_circular_zone_passes() {
        let zone = Zone::circular("depot", "Main Depot", Coordinate::new(40.7, -74.0), 500.0);
        assert!(zone.validate().is_ok());
    }

    #[test]
    fn zero_radius_fails_validation() {
        let zone = Zone::circular("z", "zone", Coordinate::new(40.7, -74.0), 0.0);
        let errors = zone.validate().unwrap_err();
        assert!(errors.contains(&ZoneValidationError::NonPositiveRadius(0.0)));
    }

    #[test]
    fn two_vertex_polygon_fails_validation() {
        let zone = Zone::polygon(
            "z",
            "zone",
            vec![Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 1.0)],
        );
        let errors = zone.validate().unwrap_err();
        assert!(errors.contains(&ZoneValidationError::TooFewVertices(2)));
    }

    #[test]
    fn empty_id_and_name_are_both_reported() {
        let zone = Zone::circular("", "  ", Coordinate::new(0.0, 0.0), 10.0);
        let errors = zone.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn out_of_range_vertex_is_reported() {
        let zone = Zone::polygon(
            "z",
            "zone",
            vec![
                Coordinate::new(0.0, 0.0),
                Coordinate::new(91.0, 0.0),
                Coordinate::new(1.0, 1.0),
            ],
        );
        let errors = zone.validate().unwrap_err();
        assert!(matches!(errors[0], ZoneValidationError::InvalidVertex(_)));
    }

    #[test]
    fn geometry_uses_lowercase_wire_tags() {
        let zone = Zone::circular("z", "zone", Coordinate::new(1.0, 2.0), 100.0);
        let json = serde_json::to_value(&zone).unwrap();
        assert_eq!(json["kind"], "circular");

        let poly = Zone::polygon(
            "p",
            "poly",
            vec![
                Coordinate::new(0.0, 0.0),
                Coordinate::new(0.0, 1.0),
                Coordinate::new(1.0, 0.0),
            ],
        );
        let json = serde_json::to_value(&poly).unwrap();
        assert_eq!(json["kind"], "polygon");

        let back: Zone = serde_json::from_value(json).unwrap();
        assert_eq!(back, poly);
    }
}
