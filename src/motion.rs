//! Point-to-point motion commands.
//!
//! A command owns both controllers for its whole run. Callers queue on the
//! controller lock, so at most one command drives at a time and the state
//! channel tells the teleop loop when to keep its hands off the drivetrain.

use crate::{
    configuration::MotionSettings,
    drivetrain::SharedDrivetrain,
    odometry::PoseHandle,
    pid::{ControllerGains, Pid},
    pose::{angle_error, Direction, Pose},
};
use nalgebra as na;
use std::time::Duration;
use tokio::{
    sync::{watch, Mutex},
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionOutcome {
    Settled,
    TimedOut,
    /// Crossed the exit line, or turned past the target, with a minimum speed set.
    ExitedEarly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionState {
    #[default]
    Idle,
    Moving,
    Finished(MotionOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveParams {
    pub direction: Direction,
    /// Speed limit in rpm. Capped by the drivetrain's max rpm.
    pub max_speed: f64,
    /// Linear speed floor in rpm. Non-zero enables early exit.
    pub min_speed: f64,
    /// Moves the exit line this far toward the robot.
    pub early_exit_range: f64,
}

impl Default for MoveParams {
    fn default() -> Self {
        Self {
            direction: Direction::Forwards,
            max_speed: f64::INFINITY,
            min_speed: 0.0,
            early_exit_range: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnParams {
    pub direction: Direction,
    pub max_speed: f64,
    pub min_speed: f64,
    /// With a minimum speed set, the turn ends once within this many degrees.
    pub early_exit_range: f64,
}

impl Default for TurnParams {
    fn default() -> Self {
        Self {
            direction: Direction::Forwards,
            max_speed: f64::INFINITY,
            min_speed: 0.0,
            early_exit_range: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TurnTarget {
    Point(na::Point2<f64>),
    Heading(f64),
}

impl TurnTarget {
    fn heading_from(&self, pose: &Pose) -> f64 {
        match self {
            TurnTarget::Point(point) => pose.bearing_to(point),
            TurnTarget::Heading(heading) => *heading,
        }
    }
}

struct Controllers {
    linear: Pid,
    angular: Pid,
}

/// Fixed rate loop timing shared by every command.
struct CommandClock {
    ticker: tokio::time::Interval,
    started: Instant,
    last: Instant,
    timeout: Duration,
}

impl CommandClock {
    fn new(period: Duration, timeout: Duration) -> Self {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let now = Instant::now();
        Self {
            ticker,
            started: now,
            last: now,
            timeout,
        }
    }

    /// Waits for the next tick. `None` once the timeout has elapsed,
    /// otherwise the time since the previous tick.
    async fn tick(&mut self) -> Option<Duration> {
        self.ticker.tick().await;
        let now = Instant::now();
        if now.duration_since(self.started) >= self.timeout {
            return None;
        }
        let dt = now.duration_since(self.last);
        self.last = now;
        Some(dt)
    }
}

pub struct MotionSupervisor {
    controllers: Mutex<Controllers>,
    state: watch::Sender<MotionState>,
    pose: PoseHandle,
    drivetrain: SharedDrivetrain,
    settings: MotionSettings,
}

impl MotionSupervisor {
    pub fn new(
        linear: ControllerGains,
        angular: ControllerGains,
        settings: MotionSettings,
        pose: PoseHandle,
        drivetrain: SharedDrivetrain,
    ) -> Self {
        let (state, _) = watch::channel(MotionState::Idle);
        Self {
            controllers: Mutex::new(Controllers {
                linear: Pid::new(linear),
                angular: Pid::new(angular),
            }),
            state,
            pose,
            drivetrain,
            settings,
        }
    }

    pub fn state(&self) -> MotionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MotionState> {
        self.state.subscribe()
    }

    pub fn is_moving(&self) -> bool {
        self.state() == MotionState::Moving
    }

    async fn send(&self, linear: f64, angular: f64, max_speed: f64) {
        let mut drivetrain = self.drivetrain.lock().await;
        let command = drivetrain.drive_limited(linear, angular, max_speed);
        drivetrain.apply(command).await;
    }

    async fn finish(&self, outcome: MotionOutcome) -> MotionOutcome {
        self.drivetrain.lock().await.stop().await;
        self.state.send_replace(MotionState::Finished(outcome));
        outcome
    }

    /// Drives to `target`, steering while far and crawling straight in once close.
    pub async fn move_to_point(
        &self,
        target: na::Point2<f64>,
        timeout: Duration,
        params: MoveParams,
    ) -> MotionOutcome {
        let mut controllers = self.controllers.lock().await;
        let Controllers { linear, angular } = &mut *controllers;
        linear.reset();
        angular.reset();
        self.state.send_replace(MotionState::Moving);

        let start = self.pose.get();
        info!("Moving from {} to [{:.2}, {:.2}]", start, target.x, target.y);
        // the exit line is perpendicular to the approach and passes through the target
        let approach = (target - *start.position())
            .try_normalize(f64::EPSILON)
            .unwrap_or_else(|| {
                let heading = params.direction.travel_heading(start.theta()).to_radians();
                na::Vector2::new(heading.sin(), heading.cos())
            });
        let forwards = params.direction == Direction::Forwards;

        let mut clock = CommandClock::new(self.settings.period, timeout);
        let mut close = false;
        let mut max_speed = params.max_speed;
        let mut previous_linear: f64 = 0.0;

        let outcome = loop {
            let Some(dt) = clock.tick().await else {
                break MotionOutcome::TimedOut;
            };
            let pose = self.pose.get();
            let distance = pose.distance_to(&target);

            if !close && distance < self.settings.close_distance {
                close = true;
                max_speed = previous_linear
                    .abs()
                    .max(self.settings.settle_speed)
                    .min(max_speed);
                linear.set_slew_limiting(false);
                debug!("Close to target, limiting speed to {:.1}", max_speed);
            }

            if params.min_speed != 0.0
                && (*pose.position() - target).dot(&approach) >= -params.early_exit_range
            {
                break MotionOutcome::ExitedEarly;
            }

            let bearing = pose.bearing_to(&target);
            let heading_error = angle_error(params.direction.travel_heading(pose.theta()), bearing);
            let linear_error = distance * angle_error(pose.theta(), bearing).to_radians().cos();

            linear.set_output_limit(Some(max_speed));
            angular.set_output_limit(Some(max_speed));
            let mut linear_output = linear.step(linear_error, dt);
            let angular_output = if close {
                0.0
            } else {
                angular.step(heading_error, dt)
            };

            if close && linear.is_settled() {
                break MotionOutcome::Settled;
            }

            if !close {
                linear_output = if forwards {
                    linear_output.max(0.0)
                } else {
                    linear_output.min(0.0)
                };
            }
            let min_speed = params.min_speed.abs();
            if forwards && linear_output > 0.0 && linear_output < min_speed {
                linear_output = min_speed;
            } else if !forwards && linear_output < 0.0 && linear_output > -min_speed {
                linear_output = -min_speed;
            }
            previous_linear = linear_output;

            trace!(
                distance,
                linear_error,
                heading_error,
                linear_output,
                angular_output,
                "Move tick"
            );
            self.send(linear_output, angular_output, max_speed).await;
        };

        info!(
            "Move finished {:?} at {} after {:?}",
            outcome,
            self.pose.get(),
            clock.started.elapsed()
        );
        self.finish(outcome).await
    }

    /// Turns in place until facing `point`.
    pub async fn turn_to_point(
        &self,
        point: na::Point2<f64>,
        timeout: Duration,
        params: TurnParams,
    ) -> MotionOutcome {
        self.turn(TurnTarget::Point(point), timeout, params).await
    }

    /// Turns in place to an absolute compass heading.
    pub async fn turn_to_heading(
        &self,
        heading: f64,
        timeout: Duration,
        params: TurnParams,
    ) -> MotionOutcome {
        self.turn(TurnTarget::Heading(heading), timeout, params)
            .await
    }

    async fn turn(&self, target: TurnTarget, timeout: Duration, params: TurnParams) -> MotionOutcome {
        let mut controllers = self.controllers.lock().await;
        let Controllers { linear, angular } = &mut *controllers;
        linear.reset();
        angular.reset();
        angular.set_output_limit(Some(params.max_speed));
        self.state.send_replace(MotionState::Moving);
        info!("Turning from {} toward {:?}", self.pose.get(), target);

        let mut clock = CommandClock::new(self.settings.period, timeout);
        let mut previous_error: Option<f64> = None;
        let mut settling = false;

        let outcome = loop {
            let Some(dt) = clock.tick().await else {
                break MotionOutcome::TimedOut;
            };
            let pose = self.pose.get();
            let error = angle_error(
                params.direction.travel_heading(pose.theta()),
                target.heading_from(&pose),
            );

            if previous_error.is_some_and(|previous| previous * error < 0.0) && !settling {
                settling = true;
                angular.set_slew_limiting(false);
                if params.min_speed != 0.0 {
                    break MotionOutcome::ExitedEarly;
                }
            }
            if params.min_speed != 0.0 && error.abs() < params.early_exit_range {
                break MotionOutcome::ExitedEarly;
            }
            previous_error = Some(error);

            let mut output = angular.step(error, dt);
            if angular.is_settled() {
                break MotionOutcome::Settled;
            }
            let min_speed = params.min_speed.abs();
            if output != 0.0 && output.abs() < min_speed {
                output = min_speed * output.signum();
            }

            trace!(error, output, "Turn tick");
            self.send(0.0, output, params.max_speed).await;
        };

        info!(
            "Turn finished {:?} at {} after {:?}",
            outcome,
            self.pose.get(),
            clock.started.elapsed()
        );
        self.finish(outcome).await
    }
}
