use config::Config;
use serde::{Deserialize, Deserializer};
use std::{path::PathBuf, str, time::Duration};
use thiserror::Error;
use tracing::*;

use crate::{
    driver::serial_driver::SerialDriverConfig,
    drivetrain::{DrivetrainConfig, ResponseCurve},
    error::ErrorWrapper,
    pid::ControllerGains,
    pose::Direction,
    sensors::{validate_layout, Axis, TrackingWheelConfig},
    teleop::{HoldBinding, ToggleBinding},
};

#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigurationError {
    #[error("second {0:?} tracking wheel configured without a first one")]
    SecondWheelWithoutFirst(Axis),
    #[error("no heading source: fit an inertial sensor or two parallel tracking wheels")]
    NoHeadingSource,
    #[error("parallel tracking wheels share offset {0}, heading cannot be derived")]
    ParallelWheelsShareOffset(f64),
    #[error("wheel diameter must be positive, got {0}")]
    InvalidWheelDiameter(f64),
    #[error("gear ratio must be positive, got {0}")]
    InvalidGearRatio(f64),
    #[error("small error {small} must not exceed large error {large}")]
    SettleRangesInverted { small: f64, large: f64 },
    #[error("drivetrain max rpm must be positive, got {0}")]
    InvalidMaxRpm(f64),
    #[error("track width must be positive, got {0}")]
    InvalidTrackWidth(f64),
    #[error("motor board has no slot {0}")]
    InvalidMotorId(u8),
    #[error("both drive sides mapped to motor slot {0}")]
    DuplicateMotorId(u8),
}

pub(crate) fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub drivetrain: DrivetrainConfig,
    /// Motor board. Without one the simulated plant is driven alone.
    #[serde(default)]
    pub serial: Option<SerialDriverConfig>,
    pub linear: ControllerGains,
    pub angular: ControllerGains,
    pub odometry: OdometryConfig,
    #[serde(default)]
    pub motion: MotionSettings,
    #[serde(default)]
    pub teleop: TeleopConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub zenoh: KestrelZenohConfig,
    #[serde(default)]
    pub routine: Vec<RoutineStep>,
}

impl AppConfig {
    pub fn load_config(config: &Option<PathBuf>) -> anyhow::Result<Self> {
        let settings = if let Some(config) = config {
            info!("Using configuration from {:?}", config);
            Config::builder()
                .add_source(config::Environment::with_prefix("APP"))
                .add_source(config::File::with_name(
                    config
                        .to_str()
                        .ok_or_else(|| anyhow::anyhow!("Failed to convert path"))?,
                ))
                .build()?
        } else {
            info!("Using dev configuration");
            Config::builder()
                .add_source(config::Environment::with_prefix("APP"))
                .add_source(config::File::with_name("config/settings"))
                .build()?
        };

        let app_config: AppConfig = settings.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Rejects contradictory settings. Any error here must stop startup.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.drivetrain.validate()?;
        self.linear.validate()?;
        self.angular.validate()?;
        if let Some(serial) = &self.serial {
            serial.validate()?;
        }
        self.odometry.validate()
    }
}

/// Which sensors are fitted. Wheel slots left out of the file are absent.
#[derive(Deserialize, Debug, Clone)]
pub struct OdometryConfig {
    #[serde(default)]
    pub vertical1: Option<TrackingWheelConfig>,
    #[serde(default)]
    pub vertical2: Option<TrackingWheelConfig>,
    #[serde(default)]
    pub horizontal1: Option<TrackingWheelConfig>,
    #[serde(default)]
    pub horizontal2: Option<TrackingWheelConfig>,
    #[serde(default = "default_true")]
    pub imu: bool,
    /// Substitute the drive sides for missing vertical tracking wheels.
    #[serde(default = "default_true")]
    pub drive_encoders: bool,
    #[serde(
        rename = "period_ms",
        default = "default_odometry_period",
        deserialize_with = "millis"
    )]
    pub period: Duration,
    #[serde(
        rename = "imu_calibration_timeout_ms",
        default = "default_imu_timeout",
        deserialize_with = "millis"
    )]
    pub imu_calibration_timeout: Duration,
    /// Largest believable inertial heading rate in degrees per second.
    #[serde(default)]
    pub max_heading_rate: Option<f64>,
}

fn default_true() -> bool {
    true
}

fn default_odometry_period() -> Duration {
    Duration::from_millis(10)
}

fn default_imu_timeout() -> Duration {
    Duration::from_secs(3)
}

impl OdometryConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        validate_layout(
            [self.vertical1.as_ref(), self.vertical2.as_ref()],
            [self.horizontal1.as_ref(), self.horizontal2.as_ref()],
            self.imu,
        )
        .or_else(|err| match err {
            // the drive sides stand in for a missing vertical pair
            ConfigurationError::NoHeadingSource
                if self.drive_encoders && self.vertical1.is_none() =>
            {
                Ok(())
            }
            err => Err(err),
        })
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct MotionSettings {
    #[serde(
        rename = "period_ms",
        default = "default_motion_period",
        deserialize_with = "millis"
    )]
    pub period: Duration,
    /// Distance under which the robot stops steering and crawls in.
    #[serde(default = "default_close_distance")]
    pub close_distance: f64,
    /// Speed floor for the crawl-in phase, in rpm.
    #[serde(default = "default_settle_speed")]
    pub settle_speed: f64,
}

fn default_motion_period() -> Duration {
    Duration::from_millis(10)
}

fn default_close_distance() -> f64 {
    7.5
}

fn default_settle_speed() -> f64 {
    200.0
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            period: default_motion_period(),
            close_distance: default_close_distance(),
            settle_speed: default_settle_speed(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TeleopConfig {
    #[serde(
        rename = "period_ms",
        default = "default_teleop_period",
        deserialize_with = "millis"
    )]
    pub period: Duration,
    #[serde(default)]
    pub throttle_curve: ResponseCurve,
    #[serde(default)]
    pub steer_curve: ResponseCurve,
    /// Buttons that flip a switch published over zenoh.
    #[serde(default)]
    pub toggles: Vec<ToggleBinding>,
    /// Button pairs that run a motor while held.
    #[serde(default)]
    pub holds: Vec<HoldBinding>,
}

fn default_teleop_period() -> Duration {
    Duration::from_millis(20)
}

impl Default for TeleopConfig {
    fn default() -> Self {
        Self {
            period: default_teleop_period(),
            throttle_curve: ResponseCurve::default(),
            steer_curve: ResponseCurve::default(),
            toggles: vec![],
            holds: vec![],
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    #[serde(
        rename = "period_ms",
        default = "default_telemetry_period",
        deserialize_with = "millis"
    )]
    pub period: Duration,
    #[serde(default = "default_pose_topic")]
    pub pose_topic: String,
}

fn default_telemetry_period() -> Duration {
    Duration::from_millis(50)
}

fn default_pose_topic() -> String {
    String::from("kestrel/pose")
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            period: default_telemetry_period(),
            pose_topic: default_pose_topic(),
        }
    }
}

/// One step of a scripted autonomous routine.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RoutineStep {
    SetPose {
        x: f64,
        y: f64,
        theta: f64,
    },
    MoveToPoint {
        x: f64,
        y: f64,
        #[serde(rename = "timeout_ms", deserialize_with = "millis")]
        timeout: Duration,
        #[serde(default)]
        direction: Direction,
        #[serde(default)]
        max_speed: Option<f64>,
        #[serde(default)]
        min_speed: Option<f64>,
    },
    TurnToPoint {
        x: f64,
        y: f64,
        #[serde(rename = "timeout_ms", deserialize_with = "millis")]
        timeout: Duration,
        #[serde(default)]
        direction: Direction,
    },
    TurnToHeading {
        theta: f64,
        #[serde(rename = "timeout_ms", deserialize_with = "millis")]
        timeout: Duration,
    },
    Wait {
        #[serde(rename = "duration_ms", deserialize_with = "millis")]
        duration: Duration,
    },
    /// Switches a mechanism registered with the chassis under `name`.
    SetOutput {
        name: String,
        on: bool,
    },
    /// Runs a registered motor at `power` percent, negative in reverse.
    SetPower {
        name: String,
        power: f64,
    },
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct KestrelZenohConfig {
    #[serde(default)]
    pub connect: Vec<zenoh_config::EndPoint>,
    #[serde(default)]
    pub listen: Vec<zenoh_config::EndPoint>,
    #[serde(default)]
    pub config_path: Option<String>,
}

impl KestrelZenohConfig {
    pub fn get_zenoh_config(&self) -> anyhow::Result<zenoh::config::Config> {
        let mut config = if let Some(conf_file) = &self.config_path {
            zenoh::config::Config::from_file(conf_file).map_err(ErrorWrapper::ZenohError)?
        } else {
            zenoh::config::Config::default()
        };
        if !self.connect.is_empty() {
            config.connect.endpoints.clone_from(&self.connect);
        }
        if !self.listen.is_empty() {
            config.listen.endpoints.clone_from(&self.listen);
        }
        Ok(config)
    }
}
