//! Tracked outputs and their canvas placement.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::prediction::{PredictionStatus, RemoteJob};

/// Width every new output gets on the canvas; height follows the aspect ratio.
pub const BASE_SIZE: f64 = 300.0;

pub const OUTPUT_ID_PREFIX: &str = "output-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    /// Identifier used to poll the remote service.
    #[serde(default)]
    pub remote_job_id: Option<String>,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub rotation_degrees: f64,
    pub width: f64,
    pub height: f64,
}

impl Placement {
    pub fn remote_job_id(&self) -> Option<&str> {
        self.remote_job_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// A placement edit from the canvas. `None` sizes leave the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlacementUpdate {
    pub x: f64,
    pub y: f64,
    pub rotation_degrees: f64,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

impl PlacementUpdate {
    pub fn new(x: f64, y: f64, rotation_degrees: f64) -> Self {
        Self {
            x,
            y,
            rotation_degrees,
            width: None,
            height: None,
        }
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn apply(&self, placement: &mut Placement) {
        placement.x = self.x;
        placement.y = self.y;
        placement.rotation_degrees = self.rotation_degrees;
        if let Some(width) = self.width {
            placement.width = width;
        }
        if let Some(height) = self.height {
            placement.height = height;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid aspect ratio '{0}', expected W:H with positive integers")]
pub struct InvalidAspectRatio(pub String);

impl FromStr for AspectRatio {
    type Err = InvalidAspectRatio;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidAspectRatio(s.to_string());
        let (w, h) = s.split_once(':').ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl AspectRatio {
    /// Read the ratio from generation input (`aspect_ratio` or `aspectRatio`).
    pub fn from_input(input: &serde_json::Value) -> Result<Self, InvalidAspectRatio> {
        let raw = input
            .get("aspect_ratio")
            .or_else(|| input.get("aspectRatio"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| InvalidAspectRatio(String::new()))?;
        raw.parse()
    }

    /// Canvas footprint: fixed width, height scaled by the ratio.
    pub fn footprint(&self) -> (f64, f64) {
        let height = (self.height as f64 / self.width as f64) * BASE_SIZE;
        (BASE_SIZE, height)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    pub placement: Placement,
}

impl Output {
    /// Build a freshly created output for a remote job.
    pub fn from_created(job: &RemoteJob, ratio: AspectRatio) -> Self {
        let (width, height) = ratio.footprint();
        Self {
            id: format!("{OUTPUT_ID_PREFIX}{}", job.id),
            status: job.status,
            input: job.input.clone(),
            result: None,
            placement: Placement {
                remote_job_id: Some(job.id.clone()),
                x: 0.0,
                y: 0.0,
                rotation_degrees: 0.0,
                width,
                height,
            },
        }
    }

    pub fn remote_job_id(&self) -> Option<&str> {
        self.placement.remote_job_id()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Has a usable remote id and has not finished yet.
    pub fn is_trackable(&self) -> bool {
        self.remote_job_id().is_some() && !self.is_terminal()
    }
}
