//! Sensor adapter for odometry.
//!
//! Turns raw encoder angles and inertial sensor rotation into calibrated
//! distances and headings. Every reading is taken relative to a baseline
//! captured by [`SensorAdapter::zero`], and a sensor that stops answering keeps
//! reporting its last good value so the estimator never stalls on a dropout.
//! A sensor that could not be read at zero takes its first good reading as
//! the baseline.

use crate::{configuration::ConfigurationError, drivetrain::DrivetrainConfig};
use serde::Deserialize;
use std::{f64::consts::PI, time::Duration};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SensorError {
    #[error("sensor disconnected")]
    Disconnected,
    #[error("sensor is still calibrating")]
    Calibrating,
    #[error("sensor calibration failed")]
    CalibrationFailed,
}

/// Rotation sensor or shaft encoder on a tracking wheel.
pub trait Encoder: Send + Sync {
    /// Cumulative shaft angle in degrees.
    fn position(&mut self) -> Result<f64, SensorError>;
}

pub trait InertialSensor: Send + Sync {
    /// Starts calibration. Readings may be stale until `is_calibrating` clears.
    fn calibrate(&mut self) -> Result<(), SensorError>;

    fn is_calibrating(&mut self) -> bool;

    /// Cumulative clockwise rotation in degrees.
    fn rotation(&mut self) -> Result<f64, SensorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Rolls along the robot's forward direction.
    Vertical,
    /// Rolls sideways.
    Horizontal,
}

fn default_gear_ratio() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TrackingWheelConfig {
    pub wheel_diameter: f64,
    /// Vertical wheels: distance right of the tracking center.
    /// Horizontal wheels: distance forward of the tracking center.
    pub offset: f64,
    /// Wheel revolutions per encoder revolution.
    #[serde(default = "default_gear_ratio")]
    pub gear_ratio: f64,
}

impl TrackingWheelConfig {
    pub fn new(wheel_diameter: f64, offset: f64) -> Self {
        Self {
            wheel_diameter,
            offset,
            gear_ratio: 1.0,
        }
    }

    pub fn with_gear_ratio(mut self, gear_ratio: f64) -> Self {
        self.gear_ratio = gear_ratio;
        self
    }

    /// Linear distance rolled for an encoder angle in degrees.
    pub fn distance(&self, degrees: f64) -> f64 {
        degrees / 360.0 * PI * self.wheel_diameter * self.gear_ratio
    }

    /// Strips the part of a wheel's travel caused by the robot rotating about
    /// its tracking center, leaving the travel of the center itself.
    ///
    /// `delta_theta` is the clockwise heading change in radians.
    pub fn remove_rotation(&self, axis: Axis, delta: f64, delta_theta: f64) -> f64 {
        match axis {
            Axis::Vertical => delta + self.offset * delta_theta,
            Axis::Horizontal => delta - self.offset * delta_theta,
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.wheel_diameter > 0.0) {
            return Err(ConfigurationError::InvalidWheelDiameter(self.wheel_diameter));
        }
        if !(self.gear_ratio > 0.0) {
            return Err(ConfigurationError::InvalidGearRatio(self.gear_ratio));
        }
        Ok(())
    }
}

/// Checks a tracking wheel layout before any hardware is touched.
///
/// Second wheels need a first wheel on the same axis, and without an inertial
/// sensor one axis needs two wheels at different offsets to derive heading.
pub fn validate_layout(
    vertical: [Option<&TrackingWheelConfig>; 2],
    horizontal: [Option<&TrackingWheelConfig>; 2],
    has_imu: bool,
) -> Result<(), ConfigurationError> {
    for (axis, pair) in [(Axis::Vertical, &vertical), (Axis::Horizontal, &horizontal)] {
        if pair[0].is_none() && pair[1].is_some() {
            return Err(ConfigurationError::SecondWheelWithoutFirst(axis));
        }
        for wheel in pair.iter().flatten() {
            wheel.validate()?;
        }
    }
    if has_imu {
        return Ok(());
    }
    let heading_pair = [vertical, horizontal].into_iter().find_map(|pair| match pair {
        [Some(first), Some(second)] => Some((first, second)),
        _ => None,
    });
    match heading_pair {
        Some((first, second)) if first.offset == second.offset => {
            Err(ConfigurationError::ParallelWheelsShareOffset(first.offset))
        }
        Some(_) => Ok(()),
        None => Err(ConfigurationError::NoHeadingSource),
    }
}

pub struct TrackingWheel {
    encoder: Box<dyn Encoder>,
    config: TrackingWheelConfig,
}

impl TrackingWheel {
    pub fn new(encoder: Box<dyn Encoder>, config: TrackingWheelConfig) -> Self {
        Self { encoder, config }
    }

    pub fn config(&self) -> &TrackingWheelConfig {
        &self.config
    }
}

/// Hardware handles for odometry. Absent wheels are `None`.
#[derive(Default)]
pub struct OdomSensors {
    pub vertical1: Option<TrackingWheel>,
    pub vertical2: Option<TrackingWheel>,
    pub horizontal1: Option<TrackingWheel>,
    pub horizontal2: Option<TrackingWheel>,
    pub imu: Option<Box<dyn InertialSensor>>,
}

impl OdomSensors {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_layout(
            [
                self.vertical1.as_ref().map(TrackingWheel::config),
                self.vertical2.as_ref().map(TrackingWheel::config),
            ],
            [
                self.horizontal1.as_ref().map(TrackingWheel::config),
                self.horizontal2.as_ref().map(TrackingWheel::config),
            ],
            self.imu.is_some(),
        )
    }

    /// Fills missing vertical wheels with the drive side encoders.
    ///
    /// Only applies when no vertical tracking wheel is fitted. The sides sit
    /// half a track width either side of the tracking center.
    pub fn with_drive_encoders(
        mut self,
        left: Box<dyn Encoder>,
        right: Box<dyn Encoder>,
        drivetrain: &DrivetrainConfig,
    ) -> Self {
        if self.vertical1.is_none() && self.vertical2.is_none() {
            let half_track = drivetrain.track_width / 2.0;
            let side = |offset| TrackingWheelConfig::new(drivetrain.wheel_diameter, offset);
            self.vertical1 = Some(TrackingWheel::new(left, side(-half_track)));
            self.vertical2 = Some(TrackingWheel::new(right, side(half_track)));
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub distance: f64,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadingSample {
    /// Clockwise rotation since the last zero, in degrees.
    pub heading: f64,
    pub timestamp: Instant,
    /// The sensor did not answer and `heading` is the last good value.
    pub stale: bool,
}

/// One reading of every configured sensor.
#[derive(Debug, Clone, Copy)]
pub struct SensorFrame {
    pub vertical: [Option<SensorSample>; 2],
    pub horizontal: [Option<SensorSample>; 2],
    pub heading: Option<HeadingSample>,
}

struct WheelChannel {
    name: &'static str,
    wheel: TrackingWheel,
    /// Raw angle read as zero. `None` until the encoder answers.
    baseline: Option<f64>,
    /// Encoder degrees since zero at the last good reading.
    travelled: f64,
    last: SensorSample,
    dropped: bool,
}

impl WheelChannel {
    fn new(name: &'static str, wheel: TrackingWheel) -> Self {
        Self {
            name,
            wheel,
            baseline: None,
            travelled: 0.0,
            last: SensorSample {
                distance: 0.0,
                timestamp: Instant::now(),
            },
            dropped: false,
        }
    }

    fn zero(&mut self) {
        self.baseline = match self.wheel.encoder.position() {
            Ok(degrees) => Some(degrees),
            Err(err) => {
                warn!("{} tracking wheel could not be zeroed: {}", self.name, err);
                None
            }
        };
        self.dropped = self.baseline.is_none();
        self.travelled = 0.0;
        self.last = SensorSample {
            distance: 0.0,
            timestamp: Instant::now(),
        };
    }

    fn sample(&mut self) -> SensorSample {
        match self.wheel.encoder.position() {
            Ok(degrees) => {
                if self.dropped {
                    info!("{} tracking wheel reconnected", self.name);
                    self.dropped = false;
                }
                let baseline = *self.baseline.get_or_insert(degrees - self.travelled);
                self.travelled = degrees - baseline;
                self.last = SensorSample {
                    distance: self.wheel.config.distance(self.travelled),
                    timestamp: Instant::now(),
                };
            }
            Err(err) => {
                if !self.dropped {
                    warn!("{} tracking wheel dropped out: {}", self.name, err);
                    self.dropped = true;
                }
            }
        }
        self.last
    }
}

struct ImuChannel {
    imu: Box<dyn InertialSensor>,
    /// Raw rotation read as zero. `None` until the sensor answers.
    baseline: Option<f64>,
    last: HeadingSample,
    dropped: bool,
}

impl ImuChannel {
    fn new(imu: Box<dyn InertialSensor>) -> Self {
        Self {
            imu,
            baseline: None,
            last: HeadingSample {
                heading: 0.0,
                timestamp: Instant::now(),
                stale: false,
            },
            dropped: false,
        }
    }

    fn zero(&mut self) {
        self.baseline = match self.imu.rotation() {
            Ok(rotation) => Some(rotation),
            Err(err) => {
                warn!("Inertial sensor could not be zeroed: {}", err);
                None
            }
        };
        self.dropped = self.baseline.is_none();
        self.last = HeadingSample {
            heading: 0.0,
            timestamp: Instant::now(),
            stale: false,
        };
    }

    fn sample(&mut self) -> HeadingSample {
        match self.imu.rotation() {
            Ok(rotation) => {
                if self.dropped {
                    info!("Inertial sensor reconnected");
                    self.dropped = false;
                }
                let baseline = *self.baseline.get_or_insert(rotation - self.last.heading);
                self.last = HeadingSample {
                    heading: rotation - baseline,
                    timestamp: Instant::now(),
                    stale: false,
                };
                self.last
            }
            Err(err) => {
                if !self.dropped {
                    warn!("Inertial sensor dropped out: {}", err);
                    self.dropped = true;
                }
                HeadingSample {
                    stale: true,
                    ..self.last
                }
            }
        }
    }
}

const IMU_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct SensorAdapter {
    vertical: [Option<WheelChannel>; 2],
    horizontal: [Option<WheelChannel>; 2],
    imu: Option<ImuChannel>,
}

impl SensorAdapter {
    pub fn new(sensors: OdomSensors) -> Result<Self, ConfigurationError> {
        sensors.validate()?;
        let OdomSensors {
            vertical1,
            vertical2,
            horizontal1,
            horizontal2,
            imu,
        } = sensors;
        Ok(Self {
            vertical: [
                vertical1.map(|wheel| WheelChannel::new("Vertical 1", wheel)),
                vertical2.map(|wheel| WheelChannel::new("Vertical 2", wheel)),
            ],
            horizontal: [
                horizontal1.map(|wheel| WheelChannel::new("Horizontal 1", wheel)),
                horizontal2.map(|wheel| WheelChannel::new("Horizontal 2", wheel)),
            ],
            imu: imu.map(ImuChannel::new),
        })
    }

    pub fn has_imu(&self) -> bool {
        self.imu.is_some()
    }

    pub fn wheel_config(&self, axis: Axis, index: usize) -> Option<&TrackingWheelConfig> {
        let channels = match axis {
            Axis::Vertical => &self.vertical,
            Axis::Horizontal => &self.horizontal,
        };
        channels
            .get(index)
            .and_then(Option::as_ref)
            .map(|channel| &channel.wheel.config)
    }

    /// Captures the current readings as the new zero for every sensor.
    pub fn zero(&mut self) {
        for channel in self
            .vertical
            .iter_mut()
            .chain(self.horizontal.iter_mut())
            .flatten()
        {
            channel.zero();
        }
        if let Some(imu) = &mut self.imu {
            imu.zero();
        }
    }

    pub fn sample(&mut self) -> SensorFrame {
        fn sample_pair(pair: &mut [Option<WheelChannel>; 2]) -> [Option<SensorSample>; 2] {
            let [first, second] = pair;
            [
                first.as_mut().map(WheelChannel::sample),
                second.as_mut().map(WheelChannel::sample),
            ]
        }

        SensorFrame {
            vertical: sample_pair(&mut self.vertical),
            horizontal: sample_pair(&mut self.horizontal),
            heading: self.imu.as_mut().map(ImuChannel::sample),
        }
    }

    /// Calibrates the inertial sensor and waits for it up to `timeout`.
    ///
    /// A sensor that refuses to calibrate is dropped when the tracking wheels
    /// can provide heading on their own, otherwise it is kept and trusted.
    pub async fn calibrate_imu(&mut self, timeout: Duration) {
        let Some(channel) = &mut self.imu else {
            return;
        };
        info!("Calibrating inertial sensor");
        if let Err(err) = channel.imu.calibrate() {
            error!("Inertial sensor calibration failed: {}", err);
            let wheels_have_heading = validate_layout(
                [self.wheel_config(Axis::Vertical, 0), self.wheel_config(Axis::Vertical, 1)],
                [
                    self.wheel_config(Axis::Horizontal, 0),
                    self.wheel_config(Axis::Horizontal, 1),
                ],
                false,
            )
            .is_ok();
            if wheels_have_heading {
                warn!("Falling back to tracking wheels for heading");
                self.imu = None;
            }
            return;
        }
        let started = Instant::now();
        while channel.imu.is_calibrating() {
            if started.elapsed() >= timeout {
                warn!(
                    "Inertial sensor still calibrating after {:?}, continuing anyway",
                    timeout
                );
                return;
            }
            sleep(IMU_POLL_INTERVAL).await;
        }
        info!("Inertial sensor calibrated in {:?}", started.elapsed());
    }
}
