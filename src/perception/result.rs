use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Face location in normalized 0..1 coordinates.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// One detected face. The embedding is zeroed on drop.
#[derive(Clone, Debug, Deserialize)]
pub struct FaceObservation {
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

impl Drop for FaceObservation {
    fn drop(&mut self) {
        self.embedding.zeroize();
    }
}

/// Normalized landmark; y grows downward.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

/// Landmarks of one hand, indexed by the 21-point hand layout.
#[derive(Clone, Debug, Deserialize)]
pub struct HandLandmarks {
    #[serde(rename = "landmarks")]
    points: Vec<Landmark>,
}

impl HandLandmarks {
    pub fn new(points: Vec<Landmark>) -> Self {
        Self { points }
    }

    pub fn point(&self, idx: usize) -> Option<&Landmark> {
        self.points.get(idx)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Move one landmark vertically. Out-of-range indices are ignored.
    pub fn set_y(&mut self, idx: usize, y: f32) {
        if let Some(p) = self.points.get_mut(idx) {
            p.y = y;
        }
    }
}
