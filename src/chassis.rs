use crate::{
    configuration::{AppConfig, ConfigurationError, OdometryConfig, RoutineStep, TeleopConfig},
    driver::MotorDriver,
    drivetrain::{Drivetrain, SharedDrivetrain},
    motion::{MotionOutcome, MotionState, MotionSupervisor, MoveParams, TurnParams},
    odometry::{Odometry, PoseHandle, Recalibration},
    pose::Pose,
    sensors::{OdomSensors, SensorAdapter},
    teleop::{DigitalOutput, OperatorInput, PowerOutput, TeleopLoop},
};
use nalgebra as na;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tracing::*;

/// A differential drive robot: odometry, the two motion controllers and the
/// drivetrain, assembled from configuration.
pub struct Chassis {
    pose: PoseHandle,
    drivetrain: SharedDrivetrain,
    supervisor: Arc<MotionSupervisor>,
    odometry_config: OdometryConfig,
    teleop_config: TeleopConfig,
    /// Held until the first calibration, then moved into its task.
    odometry: Option<Odometry>,
    odometry_task: Option<OdometryTask>,
    /// Mechanisms a routine can drive, keyed by name.
    switches: Mutex<HashMap<String, Box<dyn DigitalOutput>>>,
    motors: Mutex<HashMap<String, Box<dyn PowerOutput>>>,
}

struct OdometryTask {
    handle: JoinHandle<()>,
    recalibrate: mpsc::Sender<Recalibration>,
}

impl Chassis {
    pub fn new(
        config: &AppConfig,
        sensors: OdomSensors,
        driver: Box<dyn MotorDriver>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let adapter = SensorAdapter::new(sensors)?;
        let pose = PoseHandle::default();
        let odometry = Odometry::new(adapter, pose.clone())
            .with_max_heading_rate(config.odometry.max_heading_rate);
        let drivetrain = Drivetrain::new(driver, config.drivetrain).shared();
        let supervisor = Arc::new(MotionSupervisor::new(
            config.linear,
            config.angular,
            config.motion,
            pose.clone(),
            drivetrain.clone(),
        ));
        Ok(Self {
            pose,
            drivetrain,
            supervisor,
            odometry_config: config.odometry.clone(),
            teleop_config: config.teleop.clone(),
            odometry: Some(odometry),
            odometry_task: None,
            switches: Mutex::default(),
            motors: Mutex::default(),
        })
    }

    /// Calibrates the sensors and starts tracking from `start`.
    ///
    /// The first call waits for the inertial sensor and starts the odometry
    /// task. Later calls re-zero the sensors inside the running task and
    /// return once the new baseline is in place.
    pub async fn calibrate(&mut self, start: Pose) {
        if let Some(mut odometry) = self.odometry.take() {
            odometry
                .adapter_mut()
                .calibrate_imu(self.odometry_config.imu_calibration_timeout)
                .await;
            odometry.calibrate(start);
            let (recalibrate, requests) = mpsc::channel(1);
            self.odometry_task = Some(OdometryTask {
                handle: tokio::spawn(odometry.run(self.odometry_config.period, requests)),
                recalibrate,
            });
        } else if let Some(task) = &self.odometry_task {
            let (done, finished) = oneshot::channel();
            if task.recalibrate.send((start, done)).await.is_err() || finished.await.is_err() {
                error!("Odometry task is gone, sensors were not re-zeroed");
            }
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.odometry_task.is_some()
    }

    pub fn pose(&self) -> Pose {
        self.pose.get()
    }

    pub fn set_pose(&self, pose: Pose) {
        info!("Pose set to {}", pose);
        self.pose.set(pose);
    }

    pub fn pose_handle(&self) -> PoseHandle {
        self.pose.clone()
    }

    /// Registers a switched mechanism for `set_output` routine steps.
    pub fn add_switch(&mut self, name: &str, output: Box<dyn DigitalOutput>) {
        self.switches.get_mut().insert(name.to_owned(), output);
    }

    /// Registers a motor for `set_power` routine steps.
    pub fn add_motor(&mut self, name: &str, output: Box<dyn PowerOutput>) {
        self.motors.get_mut().insert(name.to_owned(), output);
    }

    pub fn drivetrain(&self) -> SharedDrivetrain {
        self.drivetrain.clone()
    }

    pub fn supervisor(&self) -> Arc<MotionSupervisor> {
        self.supervisor.clone()
    }

    pub fn motion_state(&self) -> MotionState {
        self.supervisor.state()
    }

    pub fn subscribe_motion_state(&self) -> watch::Receiver<MotionState> {
        self.supervisor.subscribe_state()
    }

    fn warn_if_uncalibrated(&self) {
        if !self.is_calibrated() {
            warn!("Motion requested before calibration, pose is not being tracked");
        }
    }

    pub async fn move_to_point(
        &self,
        x: f64,
        y: f64,
        timeout: Duration,
        params: MoveParams,
    ) -> MotionOutcome {
        self.warn_if_uncalibrated();
        self.supervisor
            .move_to_point(na::Point2::new(x, y), timeout, params)
            .await
    }

    pub async fn turn_to_point(
        &self,
        x: f64,
        y: f64,
        timeout: Duration,
        params: TurnParams,
    ) -> MotionOutcome {
        self.warn_if_uncalibrated();
        self.supervisor
            .turn_to_point(na::Point2::new(x, y), timeout, params)
            .await
    }

    pub async fn turn_to_heading(
        &self,
        theta: f64,
        timeout: Duration,
        params: TurnParams,
    ) -> MotionOutcome {
        self.warn_if_uncalibrated();
        self.supervisor
            .turn_to_heading(theta, timeout, params)
            .await
    }

    /// Manual drive with the configured response curves. Ignored while a
    /// motion command is running.
    pub async fn arcade(&self, throttle: f64, turn: f64) {
        if self.supervisor.is_moving() {
            debug!("Ignoring arcade input during autonomous motion");
            return;
        }
        let mut drivetrain = self.drivetrain.lock().await;
        let command = drivetrain.arcade(
            throttle,
            turn,
            &self.teleop_config.throttle_curve,
            &self.teleop_config.steer_curve,
        );
        drivetrain.apply(command).await;
    }

    pub fn teleop(&self, input: Box<dyn OperatorInput>) -> TeleopLoop {
        TeleopLoop::new(
            input,
            self.drivetrain.clone(),
            self.supervisor.subscribe_state(),
            self.teleop_config.clone(),
        )
    }

    /// Runs one step of a scripted routine. Motion steps report their outcome.
    pub async fn run_step(&self, step: &RoutineStep) -> Option<MotionOutcome> {
        info!("Routine step {:?}", step);
        match *step {
            RoutineStep::SetPose { x, y, theta } => {
                self.set_pose(Pose::new(x, y, theta));
                None
            }
            RoutineStep::MoveToPoint {
                x,
                y,
                timeout,
                direction,
                max_speed,
                min_speed,
            } => {
                let defaults = MoveParams::default();
                let params = MoveParams {
                    direction,
                    max_speed: max_speed.unwrap_or(defaults.max_speed),
                    min_speed: min_speed.unwrap_or(defaults.min_speed),
                    ..defaults
                };
                Some(self.move_to_point(x, y, timeout, params).await)
            }
            RoutineStep::TurnToPoint {
                x,
                y,
                timeout,
                direction,
            } => {
                let params = TurnParams {
                    direction,
                    ..Default::default()
                };
                Some(self.turn_to_point(x, y, timeout, params).await)
            }
            RoutineStep::TurnToHeading { theta, timeout } => {
                Some(
                    self.turn_to_heading(theta, timeout, TurnParams::default())
                        .await,
                )
            }
            RoutineStep::Wait { duration } => {
                tokio::time::sleep(duration).await;
                None
            }
            RoutineStep::SetOutput { ref name, on } => {
                match self.switches.lock().await.get_mut(name) {
                    Some(output) => {
                        if let Err(err) = output.set(on).await {
                            error!("Failed to switch {}: {:?}", name, err);
                        }
                    }
                    None => warn!("No switch named {}", name),
                }
                None
            }
            RoutineStep::SetPower { ref name, power } => {
                match self.motors.lock().await.get_mut(name) {
                    Some(output) => {
                        if let Err(err) = output.set_power(power).await {
                            error!("Failed to run {}: {:?}", name, err);
                        }
                    }
                    None => warn!("No motor named {}", name),
                }
                None
            }
        }
    }
}

impl Drop for Chassis {
    fn drop(&mut self) {
        if let Some(task) = self.odometry_task.take() {
            task.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configuration::{KestrelZenohConfig, MotionSettings, TelemetryConfig},
        drivetrain::{DriveCommand, DrivetrainConfig},
        pid::ControllerGains,
        pose::Direction,
        sensors::TrackingWheelConfig,
        sim::SimulatedRobot,
    };
    use approx::assert_abs_diff_eq;
    use tokio::time::Instant;

    fn gains(kp: f64, kd: f64, max_slew_rate: f64) -> ControllerGains {
        ControllerGains {
            kp,
            ki: 0.0,
            kd,
            anti_windup_range: 3.0,
            small_error: 1.0,
            small_error_timeout: Duration::from_millis(100),
            large_error: 3.0,
            large_error_timeout: Duration::from_millis(500),
            max_slew_rate,
            sign_flip_reset: false,
        }
    }

    fn app_config() -> AppConfig {
        AppConfig {
            drivetrain: DrivetrainConfig {
                track_width: 12.0,
                wheel_diameter: 3.25,
                max_rpm: 450.0,
            },
            serial: None,
            linear: gains(60.0, 1.0, 40.0),
            angular: gains(6.0, 0.1, 0.0),
            odometry: OdometryConfig {
                vertical1: Some(TrackingWheelConfig::new(2.75, -0.5)),
                vertical2: None,
                horizontal1: None,
                horizontal2: None,
                imu: true,
                drive_encoders: true,
                period: Duration::from_millis(10),
                imu_calibration_timeout: Duration::from_secs(3),
                max_heading_rate: None,
            },
            motion: MotionSettings::default(),
            teleop: TeleopConfig::default(),
            telemetry: TelemetryConfig::default(),
            zenoh: KestrelZenohConfig::default(),
            routine: vec![],
        }
    }

    async fn calibrated(config: &AppConfig) -> (Chassis, SimulatedRobot) {
        let robot = SimulatedRobot::new(config.drivetrain);
        let mut chassis = Chassis::new(
            config,
            robot.odom_sensors(&config.odometry),
            Box::new(robot.driver()),
        )
        .unwrap();
        chassis.calibrate(Pose::default()).await;
        (chassis, robot)
    }

    #[test]
    fn chassis_can_be_shared_between_tasks() {
        fn shareable<T: Send + Sync + 'static>() {}
        shareable::<Chassis>();
        shareable::<Arc<Chassis>>();
    }

    #[tokio::test(start_paused = true)]
    async fn move_to_point_settles_on_target() {
        let (chassis, robot) = calibrated(&app_config()).await;
        let outcome = chassis
            .move_to_point(0.0, 100.0, Duration::from_millis(2000), MoveParams::default())
            .await;
        assert_eq!(outcome, MotionOutcome::Settled);

        let truth = robot.pose();
        assert!(truth.distance_to(&na::Point2::new(0.0, 100.0)) <= 1.0);
        assert_abs_diff_eq!(truth.theta(), 0.0, epsilon = 1.0);
        assert!(chassis.pose().distance_to(truth.position()) < 0.1);
        assert_eq!(robot.last_command(), DriveCommand::stopped());
        assert_eq!(
            chassis.motion_state(),
            MotionState::Finished(MotionOutcome::Settled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn turn_to_point_faces_target() {
        let config = app_config();
        let (chassis, robot) = calibrated(&config).await;
        let outcome = chassis
            .turn_to_point(10.0, 10.0, Duration::from_millis(1000), TurnParams::default())
            .await;
        assert_eq!(outcome, MotionOutcome::Settled);
        assert_abs_diff_eq!(robot.pose().theta(), 45.0, epsilon = 1.0);

        // odometry catches up with the last bit of motion on its next tick
        tokio::time::sleep(config.odometry.period * 2).await;
        assert_abs_diff_eq!(chassis.pose().theta(), robot.pose().theta(), epsilon = 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_to_heading_turns_the_short_way() {
        let (chassis, robot) = calibrated(&app_config()).await;
        chassis.set_pose(Pose::new(0.0, 0.0, 350.0));
        let outcome = chassis
            .turn_to_heading(10.0, Duration::from_millis(1000), TurnParams::default())
            .await;
        assert_eq!(outcome, MotionOutcome::Settled);
        // twenty degrees clockwise, not three hundred forty back
        assert_abs_diff_eq!(robot.pose().theta(), 20.0, epsilon = 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_robot_times_out() {
        let config = app_config();
        let (chassis, robot) = calibrated(&config).await;
        robot.set_stalled(true);
        let timeout = Duration::from_millis(500);
        let started = Instant::now();
        let outcome = chassis
            .move_to_point(0.0, 48.0, timeout, MoveParams::default())
            .await;
        assert_eq!(outcome, MotionOutcome::TimedOut);
        assert!(started.elapsed() <= timeout + config.motion.period);
        assert_eq!(robot.last_command(), DriveCommand::stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_robot_holds_pose() {
        let (chassis, _robot) = calibrated(&app_config()).await;
        chassis.set_pose(Pose::new(12.0, -3.0, 90.0));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(chassis.pose(), Pose::new(12.0, -3.0, 90.0));
    }

    #[tokio::test(start_paused = true)]
    async fn moves_continue_from_set_pose() {
        let (chassis, _robot) = calibrated(&app_config()).await;
        chassis.set_pose(Pose::new(10.0, 10.0, 90.0));
        let outcome = chassis
            .move_to_point(40.0, 10.0, Duration::from_millis(2000), MoveParams::default())
            .await;
        assert_eq!(outcome, MotionOutcome::Settled);
        assert!(chassis.pose().distance_to(&na::Point2::new(40.0, 10.0)) <= 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn drive_sides_track_without_wheels_or_imu() {
        let mut config = app_config();
        config.odometry.vertical1 = None;
        config.odometry.imu = false;
        let (chassis, robot) = calibrated(&config).await;

        chassis
            .turn_to_heading(90.0, Duration::from_millis(1000), TurnParams::default())
            .await;
        let outcome = chassis
            .move_to_point(30.0, 0.0, Duration::from_millis(2000), MoveParams::default())
            .await;
        assert_eq!(outcome, MotionOutcome::Settled);
        assert!(robot.pose().distance_to(&na::Point2::new(30.0, 0.0)) <= 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn backwards_move_reverses_into_target() {
        let (chassis, robot) = calibrated(&app_config()).await;
        let params = MoveParams {
            direction: Direction::Backwards,
            ..Default::default()
        };
        let outcome = chassis
            .move_to_point(0.0, -40.0, Duration::from_millis(2000), params)
            .await;
        assert_eq!(outcome, MotionOutcome::Settled);
        assert!(robot.pose().distance_to(&na::Point2::new(0.0, -40.0)) <= 1.0);
        assert_abs_diff_eq!(robot.pose().theta(), 0.0, epsilon = 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn arcade_is_ignored_while_moving() {
        let (chassis, robot) = calibrated(&app_config()).await;
        let chassis = Arc::new(chassis);
        let task = tokio::spawn({
            let chassis = chassis.clone();
            async move {
                chassis
                    .turn_to_heading(90.0, Duration::from_millis(200), TurnParams::default())
                    .await
            }
        });
        let mut state = chassis.subscribe_motion_state();
        state.changed().await.unwrap();
        chassis.arcade(127.0, 0.0).await;
        assert!(robot.last_command().left() > robot.last_command().right());
        task.await.unwrap();

        chassis.arcade(127.0, 0.0).await;
        assert_eq!(robot.last_command(), DriveCommand::new(450.0, 450.0));
    }

    #[tokio::test(start_paused = true)]
    async fn routine_steps_run_in_order() {
        let (chassis, _robot) = calibrated(&app_config()).await;
        let steps = [
            RoutineStep::SetPose {
                x: -4.0,
                y: -2.0,
                theta: -140.0,
            },
            RoutineStep::Wait {
                duration: Duration::from_millis(100),
            },
            RoutineStep::TurnToHeading {
                theta: 0.0,
                timeout: Duration::from_millis(1500),
            },
        ];
        assert_eq!(chassis.run_step(&steps[0]).await, None);
        assert_eq!(chassis.pose(), Pose::new(-4.0, -2.0, -140.0));
        assert_eq!(chassis.run_step(&steps[1]).await, None);
        assert_eq!(
            chassis.run_step(&steps[2]).await,
            Some(MotionOutcome::Settled)
        );
        assert_abs_diff_eq!(chassis.pose().theta(), 0.0, epsilon = 1.0);
    }

    #[derive(Clone, Default)]
    struct Piston(Arc<std::sync::Mutex<Vec<bool>>>);

    #[async_trait::async_trait]
    impl DigitalOutput for Piston {
        async fn set(&mut self, on: bool) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(on);
            Ok(())
        }

        fn value(&self) -> bool {
            self.0.lock().unwrap().last().copied().unwrap_or_default()
        }
    }

    #[derive(Clone, Default)]
    struct Roller(Arc<std::sync::Mutex<Vec<f64>>>);

    #[async_trait::async_trait]
    impl PowerOutput for Roller {
        async fn set_power(&mut self, power: f64) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(power);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn routine_drives_registered_mechanisms() {
        let (mut chassis, _robot) = calibrated(&app_config()).await;
        let piston = Piston::default();
        let roller = Roller::default();
        chassis.add_switch("clamp", Box::new(piston.clone()));
        chassis.add_motor("intake", Box::new(roller.clone()));

        let steps = [
            RoutineStep::SetOutput {
                name: String::from("clamp"),
                on: true,
            },
            RoutineStep::SetPower {
                name: String::from("intake"),
                power: 100.0,
            },
            RoutineStep::SetOutput {
                name: String::from("clamp"),
                on: false,
            },
            RoutineStep::SetOutput {
                name: String::from("wing"),
                on: true,
            },
        ];
        for step in &steps {
            assert_eq!(chassis.run_step(step).await, None);
        }
        assert_eq!(*piston.0.lock().unwrap(), vec![true, false]);
        assert_eq!(*roller.0.lock().unwrap(), vec![100.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_calibration_restarts_tracking() {
        let (mut chassis, robot) = calibrated(&app_config()).await;
        chassis.arcade(127.0, 0.0).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        chassis.drivetrain().lock().await.stop().await;
        assert!(chassis.pose().y() > 10.0);

        chassis.calibrate(Pose::new(5.0, 5.0, 90.0)).await;
        assert!(chassis.is_calibrated());
        assert_eq!(chassis.pose(), Pose::new(5.0, 5.0, 90.0));

        let outcome = chassis
            .move_to_point(35.0, 5.0, Duration::from_millis(2000), MoveParams::default())
            .await;
        assert_eq!(outcome, MotionOutcome::Settled);
        assert!(chassis.pose().distance_to(&na::Point2::new(35.0, 5.0)) <= 1.0);
        // only the estimate was rotated, the robot drove straight on
        assert_abs_diff_eq!(robot.pose().theta(), 0.0, epsilon = 1.0);
    }
}
