//! Dead reckoning from tracking wheels and an inertial sensor.
//!
//! Each update takes the change of every wheel since the previous update,
//! strips the part caused by rotation, and integrates the remaining travel as
//! an arc along the average heading of the step.

use crate::{
    pose::{local_to_global, Pose},
    sensors::{Axis, SensorAdapter, SensorFrame, SensorSample},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OdometryError {
    #[error("odometry has not been calibrated")]
    NotCalibrated,
}

/// Shared view of the estimated pose.
///
/// Written by the odometry task and by callers resetting the pose, read by
/// everything else. Reads never block on a writer.
#[derive(Clone, Debug)]
pub struct PoseHandle {
    sender: Arc<watch::Sender<Pose>>,
}

impl PoseHandle {
    pub fn new(pose: Pose) -> Self {
        let (sender, _) = watch::channel(pose);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn get(&self) -> Pose {
        *self.sender.borrow()
    }

    pub fn set(&self, pose: Pose) {
        self.sender.send_replace(pose);
    }

    pub fn update(&self, modify: impl FnOnce(&mut Pose)) {
        self.sender.send_modify(modify);
    }

    /// Receiver that wakes on every pose change.
    pub fn subscribe(&self) -> watch::Receiver<Pose> {
        self.sender.subscribe()
    }
}

impl Default for PoseHandle {
    fn default() -> Self {
        Self::new(Pose::default())
    }
}

/// Readings at the end of the previous update.
#[derive(Debug, Clone, Copy)]
struct Previous {
    vertical: [Option<f64>; 2],
    horizontal: [Option<f64>; 2],
    /// Fresh inertial heading and when it was read. Held readings are left out.
    heading: Option<(f64, Instant)>,
}

impl Previous {
    fn from_frame(frame: &SensorFrame) -> Self {
        let distance = |sample: Option<SensorSample>| sample.map(|s| s.distance);
        Self {
            vertical: frame.vertical.map(distance),
            horizontal: frame.horizontal.map(distance),
            heading: frame
                .heading
                .filter(|sample| !sample.stale)
                .map(|sample| (sample.heading, sample.timestamp)),
        }
    }
}

fn delta(current: Option<f64>, previous: Option<f64>) -> Option<f64> {
    Some(current? - previous?)
}

/// Re-zero request for a running odometry task: the new starting pose and a
/// reply sent once the sensors have a fresh baseline.
pub type Recalibration = (Pose, oneshot::Sender<()>);

const MIN_RATE_DT: Duration = Duration::from_millis(1);

pub struct Odometry {
    adapter: SensorAdapter,
    pose: PoseHandle,
    previous: Option<Previous>,
    max_heading_rate: Option<f64>,
}

impl Odometry {
    pub fn new(adapter: SensorAdapter, pose: PoseHandle) -> Self {
        Self {
            adapter,
            pose,
            previous: None,
            max_heading_rate: None,
        }
    }

    /// Inertial heading changes faster than this many degrees per second
    /// are replaced by the heading from a tracking wheel pair, if fitted.
    pub fn with_max_heading_rate(mut self, max_heading_rate: Option<f64>) -> Self {
        self.max_heading_rate = max_heading_rate;
        self
    }

    pub fn pose_handle(&self) -> PoseHandle {
        self.pose.clone()
    }

    pub fn adapter_mut(&mut self) -> &mut SensorAdapter {
        &mut self.adapter
    }

    pub fn is_calibrated(&self) -> bool {
        self.previous.is_some()
    }

    /// Zeroes every sensor and starts tracking from `start`.
    pub fn calibrate(&mut self, start: Pose) {
        self.adapter.zero();
        let frame = self.adapter.sample();
        self.previous = Some(Previous::from_frame(&frame));
        self.pose.set(start);
        info!("Odometry tracking from {}", start);
    }

    /// Heading change in radians from a pair of parallel wheels.
    fn wheel_heading_delta(
        &self,
        vertical: [Option<f64>; 2],
        horizontal: [Option<f64>; 2],
    ) -> Option<f64> {
        let offset = |axis, index| self.adapter.wheel_config(axis, index).map(|c| c.offset);
        if let ([Some(d1), Some(d2)], Some(o1), Some(o2)) = (
            vertical,
            offset(Axis::Vertical, 0),
            offset(Axis::Vertical, 1),
        ) {
            return Some((d1 - d2) / (o2 - o1));
        }
        if let ([Some(d1), Some(d2)], Some(o1), Some(o2)) = (
            horizontal,
            offset(Axis::Horizontal, 0),
            offset(Axis::Horizontal, 1),
        ) {
            return Some((d1 - d2) / (o1 - o2));
        }
        None
    }

    pub fn update(&mut self) -> Result<Pose, OdometryError> {
        let previous = self.previous.ok_or(OdometryError::NotCalibrated)?;
        let frame = self.adapter.sample();
        let current = Previous::from_frame(&frame);

        let vertical = [
            delta(current.vertical[0], previous.vertical[0]),
            delta(current.vertical[1], previous.vertical[1]),
        ];
        let horizontal = [
            delta(current.horizontal[0], previous.horizontal[0]),
            delta(current.horizontal[1], previous.horizontal[1]),
        ];

        let wheel_delta = self.wheel_heading_delta(vertical, horizontal);
        let imu_delta = match (current.heading, previous.heading) {
            (Some((now, read_at)), Some((before, read_before))) => Some((
                (now - before).to_radians(),
                read_at.saturating_duration_since(read_before),
            )),
            _ => None,
        };
        let delta_theta = match (imu_delta, wheel_delta) {
            (Some((imu, dt)), Some(wheels)) if self.heading_implausible(imu, dt) => {
                warn!(
                    "Inertial heading jumped {:.1} deg, using tracking wheels",
                    imu.to_degrees()
                );
                wheels
            }
            (Some((imu, _)), _) => imu,
            (None, Some(wheels)) => wheels,
            (None, None) => 0.0,
        };

        let config = |axis, index| self.adapter.wheel_config(axis, index);
        let forward = match (vertical[0], config(Axis::Vertical, 0)) {
            (Some(travel), Some(wheel)) => {
                wheel.remove_rotation(Axis::Vertical, travel, delta_theta)
            }
            _ => 0.0,
        };
        let lateral = match (horizontal[0], config(Axis::Horizontal, 0)) {
            (Some(travel), Some(wheel)) => {
                wheel.remove_rotation(Axis::Horizontal, travel, delta_theta)
            }
            _ => 0.0,
        };

        // straight travel becomes the chord of the arc swept this step
        let chord = if delta_theta == 0.0 {
            1.0
        } else {
            2.0 * (delta_theta / 2.0).sin() / delta_theta
        };

        let delta_degrees = delta_theta.to_degrees();
        self.pose.update(|pose| {
            let average_heading = (pose.theta() + delta_degrees / 2.0).to_radians();
            let displacement = local_to_global(forward * chord, lateral * chord, average_heading);
            pose.advance(displacement, delta_degrees);
        });
        let imu_held = frame.heading.is_some_and(|sample| sample.stale);
        let mut next = current;
        if imu_held && wheel_delta.is_none() {
            // nothing else saw the rotation, the next fresh reading catches up
            next.heading = previous.heading;
        }
        self.previous = Some(next);
        Ok(self.pose.get())
    }

    fn heading_implausible(&self, imu_delta: f64, dt: Duration) -> bool {
        let Some(max_rate) = self.max_heading_rate else {
            return false;
        };
        imu_delta.to_degrees().abs() / dt.max(MIN_RATE_DT).as_secs_f64() > max_rate
    }

    /// Updates the pose every `period` until the task is dropped.
    ///
    /// Recalibration requests are served between updates.
    pub async fn run(
        mut self,
        period: Duration,
        mut recalibrations: mpsc::Receiver<Recalibration>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.update() {
                        error!("Odometry update failed {}", err);
                    }
                }
                Some((start, done)) = recalibrations.recv() => {
                    self.calibrate(start);
                    if done.send(()).is_err() {
                        debug!("Recalibration requester went away");
                    }
                }
            }
        }
    }
}
