//! Noiseless differential drive plant.
//!
//! Stands in for motors, tracking wheels and the inertial sensor so the
//! whole control loop can run on a host. Motion is integrated lazily up to
//! the current tokio time whenever something reads or writes the plant, so it
//! follows paused test clocks exactly.

use crate::{
    configuration::OdometryConfig,
    driver::MotorDriver,
    drivetrain::{DriveCommand, DrivetrainConfig},
    pose::Pose,
    sensors::{
        Axis, Encoder, InertialSensor, OdomSensors, SensorError, TrackingWheel,
        TrackingWheelConfig,
    },
};
use anyhow::Result;
use async_trait::async_trait;
use std::{
    f64::consts::PI,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

const IMU_CALIBRATION_TIME: Duration = Duration::from_millis(200);

struct PlantState {
    drivetrain: DrivetrainConfig,
    x: f64,
    y: f64,
    /// Compass heading in radians, unwrapped.
    heading: f64,
    /// Heading change since start, in radians.
    rotation: f64,
    left_travel: f64,
    right_travel: f64,
    command: DriveCommand,
    stalled: bool,
    imu_calibrated_at: Option<Instant>,
    updated: Instant,
}

impl PlantState {
    fn wheel_speed(&self, rpm: f64) -> f64 {
        rpm / 60.0 * PI * self.drivetrain.wheel_diameter
    }

    fn integrate(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.updated).as_secs_f64();
        self.updated = now;
        if self.stalled || dt == 0.0 {
            return;
        }

        let left = self.wheel_speed(self.command.left());
        let right = self.wheel_speed(self.command.right());
        let speed = (left + right) / 2.0;
        // compass headings grow clockwise, which is the left side outrunning the right
        let turn_rate = (left - right) / self.drivetrain.track_width;

        let start = self.heading;
        let end = start + turn_rate * dt;
        if turn_rate.abs() < 1e-9 {
            self.x += speed * dt * start.sin();
            self.y += speed * dt * start.cos();
        } else {
            let radius = speed / turn_rate;
            self.x += radius * (start.cos() - end.cos());
            self.y += radius * (end.sin() - start.sin());
        }
        self.heading = end;
        self.rotation += end - start;
        self.left_travel += left * dt;
        self.right_travel += right * dt;
    }

    fn centre_travel(&self) -> f64 {
        (self.left_travel + self.right_travel) / 2.0
    }
}

/// Handle to the simulated robot. Clones share the same plant.
#[derive(Clone)]
pub struct SimulatedRobot {
    state: Arc<Mutex<PlantState>>,
}

impl SimulatedRobot {
    pub fn new(drivetrain: DrivetrainConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlantState {
                drivetrain,
                x: 0.0,
                y: 0.0,
                heading: 0.0,
                rotation: 0.0,
                left_travel: 0.0,
                right_travel: 0.0,
                command: DriveCommand::stopped(),
                stalled: false,
                imu_calibrated_at: None,
                updated: Instant::now(),
            })),
        }
    }

    fn with_state<T>(&self, read: impl FnOnce(&mut PlantState) -> T) -> T {
        // a poisoned plant only means a test panicked mid-update
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        state.integrate();
        read(&mut state)
    }

    /// Ground truth pose.
    pub fn pose(&self) -> Pose {
        self.with_state(|state| Pose::new(state.x, state.y, state.heading.to_degrees()))
    }

    /// Moves the robot without touching any sensor.
    pub fn place(&self, pose: Pose) {
        self.with_state(|state| {
            state.x = pose.x();
            state.y = pose.y();
            state.heading = pose.theta().to_radians();
        })
    }

    /// A stalled robot ignores drive commands, as if pushed against a wall.
    pub fn set_stalled(&self, stalled: bool) {
        self.with_state(|state| state.stalled = stalled)
    }

    pub fn last_command(&self) -> DriveCommand {
        self.with_state(|state| state.command)
    }

    pub fn driver(&self) -> SimDriver {
        SimDriver {
            robot: self.clone(),
        }
    }

    pub fn imu(&self) -> SimImu {
        SimImu {
            robot: self.clone(),
        }
    }

    pub fn tracking_wheel(&self, axis: Axis, config: TrackingWheelConfig) -> TrackingWheel {
        let encoder = SimEncoder {
            robot: self.clone(),
            mount: Mount::Tracking(axis, config),
        };
        TrackingWheel::new(Box::new(encoder), config)
    }

    /// Encoder on one side of the drivetrain, `left` or right.
    pub fn drive_encoder(&self, left: bool) -> SimEncoder {
        let diameter = self.with_state(|state| state.drivetrain.wheel_diameter);
        SimEncoder {
            robot: self.clone(),
            mount: Mount::DriveSide { left, diameter },
        }
    }

    /// Builds the sensors described by an odometry configuration.
    pub fn odom_sensors(&self, config: &OdometryConfig) -> OdomSensors {
        let wheel = |axis, config: &Option<TrackingWheelConfig>| {
            config.map(|config| self.tracking_wheel(axis, config))
        };
        let sensors = OdomSensors {
            vertical1: wheel(Axis::Vertical, &config.vertical1),
            vertical2: wheel(Axis::Vertical, &config.vertical2),
            horizontal1: wheel(Axis::Horizontal, &config.horizontal1),
            horizontal2: wheel(Axis::Horizontal, &config.horizontal2),
            imu: config
                .imu
                .then(|| Box::new(self.imu()) as Box<dyn InertialSensor>),
        };
        if config.drive_encoders {
            let drivetrain = self.with_state(|state| state.drivetrain);
            sensors.with_drive_encoders(
                Box::new(self.drive_encoder(true)),
                Box::new(self.drive_encoder(false)),
                &drivetrain,
            )
        } else {
            sensors
        }
    }
}

pub struct SimDriver {
    robot: SimulatedRobot,
}

#[async_trait]
impl MotorDriver for SimDriver {
    async fn send(&mut self, command: DriveCommand) -> Result<()> {
        self.robot.with_state(|state| state.command = command);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Mount {
    Tracking(Axis, TrackingWheelConfig),
    DriveSide { left: bool, diameter: f64 },
}

pub struct SimEncoder {
    robot: SimulatedRobot,
    mount: Mount,
}

impl Encoder for SimEncoder {
    fn position(&mut self) -> Result<f64, SensorError> {
        let mount = self.mount;
        Ok(self.robot.with_state(|state| match mount {
            Mount::Tracking(axis, config) => {
                let travel = match axis {
                    Axis::Vertical => state.centre_travel() - config.offset * state.rotation,
                    Axis::Horizontal => config.offset * state.rotation,
                };
                travel / (PI * config.wheel_diameter * config.gear_ratio) * 360.0
            }
            Mount::DriveSide { left, diameter } => {
                let travel = if left {
                    state.left_travel
                } else {
                    state.right_travel
                };
                travel / (PI * diameter) * 360.0
            }
        }))
    }
}

pub struct SimImu {
    robot: SimulatedRobot,
}

impl InertialSensor for SimImu {
    fn calibrate(&mut self) -> Result<(), SensorError> {
        self.robot.with_state(|state| {
            state.imu_calibrated_at = Some(Instant::now() + IMU_CALIBRATION_TIME)
        });
        Ok(())
    }

    fn is_calibrating(&mut self) -> bool {
        self.robot.with_state(|state| {
            state
                .imu_calibrated_at
                .is_some_and(|ready| Instant::now() < ready)
        })
    }

    fn rotation(&mut self) -> Result<f64, SensorError> {
        Ok(self.robot.with_state(|state| state.rotation.to_degrees()))
    }
}
