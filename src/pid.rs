//! Feedback controller shared by the linear and angular loops.
//!
//! On top of the textbook terms the controller carries everything a motion
//! command needs to decide it is done: an integral that only accumulates near
//! the target, a per-step slew limit, and two settle timers (a tight band with
//! a short timeout and a loose band with a long one).

use crate::configuration::{millis, ConfigurationError};
use serde::Deserialize;
use std::time::Duration;

/// Floor for `dt` so a zero-length first tick cannot divide by zero.
pub const MIN_DT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ControllerGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Integral is zeroed while `|error|` exceeds this. 0 disables the clamp.
    pub anti_windup_range: f64,
    pub small_error: f64,
    #[serde(rename = "small_error_timeout_ms", deserialize_with = "millis")]
    pub small_error_timeout: Duration,
    pub large_error: f64,
    #[serde(rename = "large_error_timeout_ms", deserialize_with = "millis")]
    pub large_error_timeout: Duration,
    /// Largest output change per step. 0 disables slew limiting.
    pub max_slew_rate: f64,
    #[serde(default)]
    pub sign_flip_reset: bool,
}

impl ControllerGains {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.small_error > self.large_error {
            return Err(ConfigurationError::SettleRangesInverted {
                small: self.small_error,
                large: self.large_error,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PidState {
    pub integral: f64,
    /// `None` until the first step after a reset.
    pub previous_error: Option<f64>,
    pub previous_output: f64,
    /// Time spent continuously inside the small error band.
    pub small_error_timer: Option<Duration>,
    /// Time spent continuously inside the large error band.
    pub large_error_timer: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct Pid {
    gains: ControllerGains,
    state: PidState,
    output_limit: Option<f64>,
    slew_limiting: bool,
}

impl Pid {
    pub fn new(gains: ControllerGains) -> Self {
        Self {
            gains,
            state: PidState::default(),
            output_limit: None,
            slew_limiting: true,
        }
    }

    pub fn gains(&self) -> &ControllerGains {
        &self.gains
    }

    pub fn state(&self) -> &PidState {
        &self.state
    }

    pub fn integral(&self) -> f64 {
        self.state.integral
    }

    /// Clears all memory. Call at the start of every motion command.
    pub fn reset(&mut self) {
        self.state = PidState::default();
        self.output_limit = None;
        self.slew_limiting = true;
    }

    /// Bounds the magnitude of every following output.
    pub fn set_output_limit(&mut self, limit: Option<f64>) {
        self.output_limit = limit.map(f64::abs);
    }

    /// Suspends or restores the slew limit without touching its memory.
    pub fn set_slew_limiting(&mut self, enabled: bool) {
        self.slew_limiting = enabled;
    }

    pub fn step(&mut self, error: f64, dt: Duration) -> f64 {
        let dt = dt.max(MIN_DT);
        let seconds = dt.as_secs_f64();
        let gains = &self.gains;
        let state = &mut self.state;

        if gains.anti_windup_range != 0.0 && error.abs() > gains.anti_windup_range {
            state.integral = 0.0;
        } else {
            state.integral += error * seconds;
        }
        if gains.sign_flip_reset {
            if let Some(previous) = state.previous_error {
                if previous.signum() != error.signum() {
                    state.integral = 0.0;
                }
            }
        }

        let derivative = state
            .previous_error
            .map_or(0.0, |previous| (error - previous) / seconds);
        state.previous_error = Some(error);

        let mut output = gains.kp * error + gains.ki * state.integral + gains.kd * derivative;
        if let Some(limit) = self.output_limit {
            output = output.clamp(-limit, limit);
        }
        if self.slew_limiting && gains.max_slew_rate > 0.0 {
            let change = (output - state.previous_output)
                .clamp(-gains.max_slew_rate, gains.max_slew_rate);
            output = state.previous_output + change;
        }
        state.previous_output = output;

        advance_timer(
            &mut state.small_error_timer,
            error.abs() <= gains.small_error,
            dt,
        );
        advance_timer(
            &mut state.large_error_timer,
            error.abs() <= gains.large_error,
            dt,
        );

        output
    }

    /// Whether the error has stayed inside a settle band for that band's
    /// timeout. Updated by [`Pid::step`].
    pub fn is_settled(&self) -> bool {
        let reached = |timer: Option<Duration>, timeout: Duration| {
            timer.map_or(false, |elapsed| elapsed >= timeout)
        };
        reached(self.state.small_error_timer, self.gains.small_error_timeout)
            || reached(self.state.large_error_timer, self.gains.large_error_timeout)
    }
}

fn advance_timer(timer: &mut Option<Duration>, in_band: bool, dt: Duration) {
    *timer = if in_band {
        Some(timer.map_or(Duration::ZERO, |elapsed| elapsed + dt))
    } else {
        None
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const TICK: Duration = Duration::from_millis(10);

    fn gains() -> ControllerGains {
        ControllerGains {
            kp: 2.0,
            ki: 0.0,
            kd: 0.5,
            anti_windup_range: 3.0,
            small_error: 1.0,
            small_error_timeout: Duration::from_millis(100),
            large_error: 3.0,
            large_error_timeout: Duration::from_millis(500),
            max_slew_rate: 0.0,
            sign_flip_reset: false,
        }
    }

    #[test]
    fn proportional_only_first_step() {
        let mut pid = Pid::new(gains());
        // no derivative kick on the first step
        assert_relative_eq!(pid.step(10.0, TICK), 20.0);
    }

    #[test]
    fn derivative_uses_dt() {
        let mut pid = Pid::new(ControllerGains { kp: 0.0, ..gains() });
        pid.step(10.0, TICK);
        // (8 - 10) / 0.01 * 0.5
        assert_relative_eq!(pid.step(8.0, TICK), -100.0, epsilon = 1e-9);
    }

    #[test]
    fn without_integral_output_depends_only_on_last_error() {
        let mut long_history = Pid::new(gains());
        for error in [40.0, -3.0, 17.0, 5.0] {
            long_history.step(error, TICK);
        }
        let mut short_history = Pid::new(gains());
        short_history.step(5.0, TICK);

        let a = long_history.step(2.0, Duration::from_millis(15));
        let b = short_history.step(2.0, Duration::from_millis(15));
        assert_relative_eq!(a, b);
    }

    #[test]
    fn anti_windup_clears_integral() {
        let mut pid = Pid::new(ControllerGains { ki: 1.0, ..gains() });
        for _ in 0..5 {
            pid.step(2.0, TICK);
        }
        assert!(pid.integral() > 0.0);
        for _ in 0..7 {
            pid.step(50.0, TICK);
            assert_eq!(pid.integral(), 0.0);
        }
        pid.step(-50.0, TICK);
        assert_eq!(pid.integral(), 0.0);
    }

    #[test]
    fn sign_flip_reset_clears_integral() {
        let mut pid = Pid::new(ControllerGains {
            ki: 1.0,
            sign_flip_reset: true,
            ..gains()
        });
        pid.step(2.0, TICK);
        pid.step(2.0, TICK);
        assert!(pid.integral() > 0.0);
        pid.step(-1.0, TICK);
        assert_eq!(pid.integral(), 0.0);
    }

    #[test]
    fn slew_limits_change_per_step() {
        let mut pid = Pid::new(ControllerGains {
            max_slew_rate: 5.0,
            ..gains()
        });
        assert_relative_eq!(pid.step(100.0, TICK), 5.0);
        assert_relative_eq!(pid.step(100.0, TICK), 10.0);
        pid.set_slew_limiting(false);
        assert_relative_eq!(pid.step(100.0, TICK), 200.0);
    }

    #[test]
    fn output_limit_clamps_before_slew() {
        let mut pid = Pid::new(gains());
        pid.set_output_limit(Some(50.0));
        assert_relative_eq!(pid.step(100.0, TICK), 50.0);
        assert_relative_eq!(pid.step(-100.0, TICK), -50.0);
    }

    #[test]
    fn settles_after_exact_small_error_timeout() {
        let mut pid = Pid::new(gains());
        pid.step(10.0, TICK);
        assert!(!pid.is_settled());

        // the first in-band step starts the timer, ten more reach 100 ms
        for _ in 0..10 {
            pid.step(0.5, TICK);
            assert!(!pid.is_settled());
        }
        pid.step(0.5, TICK);
        assert!(pid.is_settled());
    }

    #[test]
    fn single_violation_resets_settle_timer() {
        let mut pid = Pid::new(gains());
        for _ in 0..10 {
            pid.step(0.5, TICK);
        }
        pid.step(2.0, TICK);
        pid.step(0.5, TICK);
        assert!(!pid.is_settled());
        assert_eq!(pid.state().small_error_timer, Some(Duration::ZERO));
    }

    #[test]
    fn settles_in_large_band_after_long_timeout() {
        let mut pid = Pid::new(gains());
        for _ in 0..50 {
            pid.step(2.0, TICK);
            assert!(!pid.is_settled());
        }
        pid.step(2.0, TICK);
        assert!(pid.is_settled());
    }

    #[test]
    fn reset_clears_memory() {
        let mut pid = Pid::new(ControllerGains {
            ki: 1.0,
            max_slew_rate: 5.0,
            ..gains()
        });
        for _ in 0..20 {
            pid.step(0.5, TICK);
        }
        pid.set_output_limit(Some(1.0));
        pid.reset();
        assert_eq!(*pid.state(), PidState::default());
        assert!(!pid.is_settled());
        // no derivative kick, only this step's error in the integral
        assert_relative_eq!(pid.step(1.0, TICK), 2.0 + 0.01);
        assert_relative_eq!(pid.integral(), 0.01);
    }

    #[test]
    fn inverted_settle_ranges_fail_validation() {
        let mut inverted = gains();
        inverted.small_error = 4.0;
        assert!(inverted.validate().is_err());
        assert!(gains().validate().is_ok());
    }
}
