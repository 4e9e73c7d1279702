use crate::{configuration::ConfigurationError, driver::MotorDriver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::*;

/// Full stick deflection reported by the operator input.
pub const STICK_MAX: f64 = 127.0;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct DrivetrainConfig {
    /// Distance between left and right wheel contact patches.
    pub track_width: f64,
    pub wheel_diameter: f64,
    /// Wheel rpm at full power.
    pub max_rpm: f64,
}

impl DrivetrainConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.max_rpm > 0.0) {
            return Err(ConfigurationError::InvalidMaxRpm(self.max_rpm));
        }
        if !(self.track_width > 0.0) {
            return Err(ConfigurationError::InvalidTrackWidth(self.track_width));
        }
        if !(self.wheel_diameter > 0.0) {
            return Err(ConfigurationError::InvalidWheelDiameter(self.wheel_diameter));
        }
        Ok(())
    }
}

/// Left and right wheel velocities in rpm.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DriveCommand {
    left: f64,
    right: f64,
}

impl DriveCommand {
    pub fn new(left: f64, right: f64) -> Self {
        Self { left, right }
    }

    pub fn stopped() -> Self {
        Self::default()
    }

    pub fn left(&self) -> f64 {
        self.left
    }

    pub fn right(&self) -> f64 {
        self.right
    }
}

/// Mixes linear and counter-clockwise angular output into wheel velocities.
///
/// When a wheel would exceed `limit` both wheels are scaled by the same factor,
/// so a saturated command still turns with the requested radius.
pub fn mix(linear: f64, angular: f64, limit: f64) -> DriveCommand {
    let left = linear - angular;
    let right = linear + angular;
    let ratio = left.abs().max(right.abs()) / limit.abs();
    if ratio > 1.0 {
        DriveCommand::new(left / ratio, right / ratio)
    } else {
        DriveCommand::new(left, right)
    }
}

/// Exponential joystick response with a dead band and a minimum output.
///
/// Works on the stick scale of ±127. Inputs inside the dead band return 0,
/// anything outside starts at `min_output` and reaches 127 at full deflection.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ResponseCurve {
    #[serde(default)]
    pub deadband: f64,
    #[serde(default)]
    pub min_output: f64,
    #[serde(default = "default_curve_gain")]
    pub curve_gain: f64,
}

fn default_curve_gain() -> f64 {
    1.0
}

impl Default for ResponseCurve {
    fn default() -> Self {
        Self {
            deadband: 0.0,
            min_output: 0.0,
            curve_gain: default_curve_gain(),
        }
    }
}

impl ResponseCurve {
    pub fn new(deadband: f64, min_output: f64, curve_gain: f64) -> Self {
        Self {
            deadband,
            min_output,
            curve_gain,
        }
    }

    pub fn apply(&self, input: f64) -> f64 {
        let input = input.clamp(-STICK_MAX, STICK_MAX);
        if input.abs() <= self.deadband {
            return 0.0;
        }
        let shifted = input.abs() - self.deadband;
        let shifted_max = STICK_MAX - self.deadband;
        let curved = self.curve_gain.powf(shifted - STICK_MAX) * shifted;
        let curved_max = self.curve_gain.powf(shifted_max - STICK_MAX) * shifted_max;
        let scaled = (STICK_MAX - self.min_output) * curved / curved_max + self.min_output;
        scaled * input.signum()
    }
}

pub type SharedDrivetrain = Arc<Mutex<Drivetrain>>;

pub struct Drivetrain {
    driver: Box<dyn MotorDriver>,
    config: DrivetrainConfig,
}

impl Drivetrain {
    pub fn new(driver: Box<dyn MotorDriver>, config: DrivetrainConfig) -> Self {
        Self { driver, config }
    }

    pub fn shared(self) -> SharedDrivetrain {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &DrivetrainConfig {
        &self.config
    }

    pub fn drive(&self, linear: f64, angular: f64) -> DriveCommand {
        mix(linear, angular, self.config.max_rpm)
    }

    /// Like [`Drivetrain::drive`] with a tighter limit. The limit never
    /// exceeds the drivetrain's max rpm.
    pub fn drive_limited(&self, linear: f64, angular: f64, limit: f64) -> DriveCommand {
        mix(linear, angular, limit.abs().min(self.config.max_rpm))
    }

    /// Manual control. Stick inputs are on the ±127 scale and a positive
    /// `turn` steers clockwise.
    pub fn arcade(
        &self,
        throttle: f64,
        turn: f64,
        throttle_curve: &ResponseCurve,
        steer_curve: &ResponseCurve,
    ) -> DriveCommand {
        let scale = self.config.max_rpm / STICK_MAX;
        let linear = throttle_curve.apply(throttle) * scale;
        let angular = -steer_curve.apply(turn) * scale;
        self.drive(linear, angular)
    }

    /// Sends a command to the motors. Driver failures are logged, never
    /// returned, so a control tick always completes.
    pub async fn apply(&mut self, command: DriveCommand) {
        trace!(left = command.left, right = command.right, "Drive command");
        if let Err(err) = self.driver.send(command).await {
            error!("Failed to send drive command {:?}", err);
        }
    }

    pub async fn stop(&mut self) {
        self.apply(DriveCommand::stopped()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::RecordingDriver;
    use approx::assert_relative_eq;

    fn config() -> DrivetrainConfig {
        DrivetrainConfig {
            track_width: 12.0,
            wheel_diameter: 3.25,
            max_rpm: 120.0,
        }
    }

    #[test]
    fn saturated_mix_keeps_ratio() {
        let command = mix(100.0, 50.0, 120.0);
        // unscaled 50:150, both scaled by 0.8
        assert_relative_eq!(command.left(), 40.0);
        assert_relative_eq!(command.right(), 120.0);
        assert_relative_eq!(command.left() / command.right(), 50.0 / 150.0);
    }

    #[test]
    fn unsaturated_mix_passes_through() {
        let command = mix(30.0, 10.0, 120.0);
        assert_relative_eq!(command.left(), 20.0);
        assert_relative_eq!(command.right(), 40.0);
    }

    #[test]
    fn mix_never_exceeds_limit() {
        for (linear, angular) in [(500.0, 0.0), (-300.0, 200.0), (0.0, -900.0), (90.0, 90.0)] {
            let command = mix(linear, angular, 120.0);
            assert!(command.left().abs() <= 120.0 + 1e-9);
            assert!(command.right().abs() <= 120.0 + 1e-9);
        }
    }

    #[test]
    fn drive_limited_caps_at_max_rpm() {
        let drivetrain = Drivetrain::new(Box::new(RecordingDriver::default()), config());
        let command = drivetrain.drive_limited(1000.0, 0.0, 5000.0);
        assert_relative_eq!(command.left(), 120.0);
        let command = drivetrain.drive_limited(1000.0, 0.0, 60.0);
        assert_relative_eq!(command.right(), 60.0);
    }

    #[test]
    fn default_curve_is_linear() {
        let curve = ResponseCurve::default();
        for input in [-127.0, -64.0, 0.0, 12.5, 127.0] {
            assert_relative_eq!(curve.apply(input), input, epsilon = 1e-9);
        }
    }

    #[test]
    fn curve_dead_band_and_minimum_output() {
        let curve = ResponseCurve::new(3.0, 10.0, 1.019);
        assert_eq!(curve.apply(2.0), 0.0);
        assert_eq!(curve.apply(-3.0), 0.0);
        let just_outside = curve.apply(4.0);
        assert!(just_outside > 10.0 && just_outside < 11.0);
        assert_relative_eq!(curve.apply(127.0), 127.0, epsilon = 1e-9);
        assert_relative_eq!(curve.apply(-127.0), -127.0, epsilon = 1e-9);
        assert_relative_eq!(curve.apply(-60.0), -curve.apply(60.0));
    }

    #[test]
    fn curve_gain_softens_mid_stick() {
        let curve = ResponseCurve::new(0.0, 0.0, 1.05);
        assert!(curve.apply(64.0) < 64.0);
    }

    #[test]
    fn arcade_turn_right_spins_clockwise() {
        let drivetrain = Drivetrain::new(Box::new(RecordingDriver::default()), config());
        let linear = ResponseCurve::default();
        let command = drivetrain.arcade(0.0, 127.0, &linear, &linear);
        assert!(command.left() > 0.0);
        assert!(command.right() < 0.0);
        let command = drivetrain.arcade(127.0, 0.0, &linear, &linear);
        assert_relative_eq!(command.left(), 120.0);
        assert_relative_eq!(command.right(), 120.0);
    }

    #[tokio::test]
    async fn apply_forwards_to_driver() {
        let driver = RecordingDriver::default();
        let mut drivetrain = Drivetrain::new(Box::new(driver.clone()), config());
        drivetrain.apply(DriveCommand::new(1.0, 2.0)).await;
        drivetrain.stop().await;
        assert_eq!(
            driver.commands(),
            vec![DriveCommand::new(1.0, 2.0), DriveCommand::stopped()]
        );
    }

    #[tokio::test]
    async fn driver_failure_does_not_propagate() {
        let driver = RecordingDriver::failing();
        let mut drivetrain = Drivetrain::new(Box::new(driver), config());
        drivetrain.apply(DriveCommand::new(1.0, 2.0)).await;
    }
}
