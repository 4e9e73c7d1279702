use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Robot pose in field coordinates.
///
/// `theta` is a compass heading in degrees: 0 faces +y and positive angles turn
/// clockwise. It is kept unwrapped so it can be compared against a cumulative
/// inertial sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    position: na::Point2<f64>,
    theta: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self {
            position: na::Point2::new(x, y),
            theta,
        }
    }

    pub fn from_na(position: na::Point2<f64>, theta: f64) -> Self {
        Self { position, theta }
    }

    pub fn x(&self) -> f64 {
        self.position.x
    }

    pub fn y(&self) -> f64 {
        self.position.y
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn position(&self) -> &na::Point2<f64> {
        &self.position
    }

    pub fn distance_to(&self, target: &na::Point2<f64>) -> f64 {
        na::distance(&self.position, target)
    }

    /// Compass bearing from this pose to `target`.
    ///
    /// A target on top of the robot has no bearing, so the current heading is
    /// returned and any heading error against it is zero.
    pub fn bearing_to(&self, target: &na::Point2<f64>) -> f64 {
        let delta = target - self.position;
        if delta.norm() == 0.0 {
            return self.theta;
        }
        delta.x.atan2(delta.y).to_degrees()
    }

    /// Moves the pose by a global displacement and a heading change.
    pub(crate) fn advance(&mut self, displacement: na::Vector2<f64>, delta_theta: f64) {
        self.position += displacement;
        self.theta += delta_theta;
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{:.2}, {:.2}] -> {:.2}",
            self.position.x, self.position.y, self.theta
        )
    }
}

/// Signed difference `current - target` wrapped to [-180, 180).
pub fn angle_error(current: f64, target: f64) -> f64 {
    (current - target + 180.0).rem_euclid(360.0) - 180.0
}

/// Rotates a robot-frame displacement (forward, right) into the field frame
/// for a compass heading in radians.
pub fn local_to_global(forward: f64, lateral: f64, heading: f64) -> na::Vector2<f64> {
    // compass headings rotate clockwise, so the field frame sees -heading
    na::Rotation2::new(-heading) * na::Vector2::new(lateral, forward)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forwards,
    Backwards,
}

impl Direction {
    /// Heading the robot travels along: its nose, or its tail when reversing.
    pub fn travel_heading(&self, theta: f64) -> f64 {
        match self {
            Direction::Forwards => theta,
            Direction::Backwards => theta + 180.0,
        }
    }
}
