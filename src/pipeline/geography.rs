//! Geofence annotation
//!
//! [`PolygonGeography`] loads district / service-area polygons from a GeoJSON
//! FeatureCollection, indexes their bounding boxes in an R-tree, and answers
//! point-in-polygon membership. When several geographies contain a point the
//! smallest one is listed first and becomes the point's district.

use super::error::{PipelineError, Result};
use super::types::{GeoAnnotation, Gps};
use geo::{Area, BoundingRect, Contains, MultiPolygon, Point};
use geojson::{Feature, GeoJson};
use rstar::{RTree, RTreeObject, AABB};
use std::path::Path;

pub const DEFAULT_ANNOTATION_VERSION: &str = "1.0";

/// Feature properties checked, in order, for a geography id
const ID_PROPERTIES: [&str; 3] = ["geography_id", "id", "name"];

pub trait GeographyLookup: Send + Sync {
    fn annotate(&self, gps: &Gps) -> Result<GeoAnnotation>;
}

/// Lookup used when no geography file is configured
#[derive(Debug, Default, Clone)]
pub struct NoGeography;

impl GeographyLookup for NoGeography {
    fn annotate(&self, _gps: &Gps) -> Result<GeoAnnotation> {
        Ok(GeoAnnotation {
            geography_ids: Vec::new(),
            in_bound: false,
            version: DEFAULT_ANNOTATION_VERSION.to_string(),
        })
    }
}

struct GeographyEntry {
    id: String,
    area: f64,
    envelope: AABB<[f64; 2]>,
    polygon: MultiPolygon<f64>,
}

impl RTreeObject for GeographyEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

pub struct PolygonGeography {
    index: RTree<GeographyEntry>,
    version: String,
}

impl PolygonGeography {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read geography file {}: {}", path.display(), e))
        })?;
        Self::from_geojson(&contents)
    }

    /// Build from a GeoJSON FeatureCollection. A top-level `version` member
    /// sets the annotation version.
    pub fn from_geojson(geojson: &str) -> Result<Self> {
        let parsed: GeoJson = geojson
            .parse()
            .map_err(|e| PipelineError::Config(format!("invalid geography GeoJSON: {}", e)))?;

        let GeoJson::FeatureCollection(collection) = parsed else {
            return Err(PipelineError::Config(
                "geography GeoJSON must be a FeatureCollection".to_string(),
            ));
        };

        let version = collection
            .foreign_members
            .as_ref()
            .and_then(|m| m.get("version"))
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_ANNOTATION_VERSION)
            .to_string();

        let mut entries = Vec::with_capacity(collection.features.len());
        for (position, feature) in collection.features.into_iter().enumerate() {
            let Some(id) = feature_id(&feature) else {
                log::warn!("Skipping geography feature #{} without an id", position);
                continue;
            };
            let Some(polygon) = feature_polygon(feature) else {
                log::warn!("Skipping geography {}: geometry is not a polygon", id);
                continue;
            };

            entries.push(GeographyEntry {
                area: polygon.unsigned_area(),
                envelope: compute_envelope(&polygon),
                id,
                polygon,
            });
        }

        log::info!("Loaded {} geographies (version {})", entries.len(), version);

        Ok(Self {
            index: RTree::bulk_load(entries),
            version,
        })
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.index.size() == 0
    }
}

impl GeographyLookup for PolygonGeography {
    fn annotate(&self, gps: &Gps) -> Result<GeoAnnotation> {
        let point = Point::new(gps.lng, gps.lat);
        let query = AABB::from_point([gps.lng, gps.lat]);

        let mut matches: Vec<&GeographyEntry> = self
            .index
            .locate_in_envelope_intersecting(&query)
            .filter(|entry| entry.polygon.contains(&point))
            .collect();
        matches.sort_by(|a, b| a.area.total_cmp(&b.area).then_with(|| a.id.cmp(&b.id)));

        Ok(GeoAnnotation {
            in_bound: !matches.is_empty(),
            geography_ids: matches.into_iter().map(|e| e.id.clone()).collect(),
            version: self.version.clone(),
        })
    }
}

fn feature_id(feature: &Feature) -> Option<String> {
    for key in ID_PROPERTIES {
        match feature.property(key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }

    match &feature.id {
        Some(geojson::feature::Id::String(s)) => Some(s.clone()),
        Some(geojson::feature::Id::Number(n)) => Some(n.to_string()),
        None => None,
    }
}

fn feature_polygon(feature: Feature) -> Option<MultiPolygon<f64>> {
    let geometry: geo::Geometry<f64> = feature.geometry?.try_into().ok()?;
    match geometry {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        _ => None,
    }
}

fn compute_envelope(mp: &MultiPolygon<f64>) -> AABB<[f64; 2]> {
    mp.bounding_rect().map_or_else(
        || AABB::from_point([0.0, 0.0]),
        |rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
    )
}
