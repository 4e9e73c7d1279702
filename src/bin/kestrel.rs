use anyhow::Result;
use clap::{Parser, ValueEnum};
use kestrel::{
    chassis::Chassis,
    configuration,
    driver::{serial_driver::SerialDriver, FanOutDriver, MotorDriver},
    error::ErrorWrapper,
    logging,
    pose::Pose,
    sim::SimulatedRobot,
    telemetry::{start_telemetry, LogTelemetry, ZenohTelemetry},
    teleop::{GamepadInput, HoldToRun, PressToggle, ZenohMotor, ZenohSwitch},
};
use std::{path::PathBuf, time::Duration};
use tracing::*;
use zenoh::prelude::r#async::*;

const LOG_TELEMETRY_PERIOD: Duration = Duration::from_secs(1);

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Run the routine from the configuration, then exit
    Autonomous,
    /// Drive from the gamepad until interrupted
    Teleop,
}

#[derive(Parser, Debug)]
#[command(version, about = "Kestrel differential drive controller")]
struct Args {
    /// path to config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbosity: u8,

    #[arg(long, value_enum, default_value_t = Mode::Autonomous)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_tracing(args.verbosity);

    let app_config = configuration::AppConfig::load_config(&args.config)?;

    // the plant model doubles as odometry sensors when no real ones are fitted
    let robot = SimulatedRobot::new(app_config.drivetrain);
    let driver: Box<dyn MotorDriver> = if let Some(serial_config) = &app_config.serial {
        info!("Driving motor board on {}", serial_config.port);
        let board = SerialDriver::new(serial_config.clone(), app_config.drivetrain.max_rpm)?;
        Box::new(FanOutDriver::new(vec![
            Box::new(board),
            Box::new(robot.driver()),
        ]))
    } else {
        info!("No motor board configured, driving the simulated robot");
        Box::new(robot.driver())
    };

    // zenoh
    let zenoh_config = app_config.zenoh.get_zenoh_config()?;
    let zenoh_session = zenoh::open(zenoh_config)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?
        .into_arc();

    let mut chassis = Chassis::new(
        &app_config,
        robot.odom_sensors(&app_config.odometry),
        driver,
    )?;
    chassis.calibrate(Pose::default()).await;

    let _pose_publisher = start_telemetry(
        chassis.pose_handle(),
        Box::new(ZenohTelemetry::new(
            zenoh_session.clone(),
            &app_config.telemetry.pose_topic,
        )),
        app_config.telemetry.period,
    );
    let _pose_logger = start_telemetry(
        chassis.pose_handle(),
        Box::new(LogTelemetry),
        LOG_TELEMETRY_PERIOD,
    );

    match args.mode {
        Mode::Autonomous => {
            for binding in &app_config.teleop.toggles {
                chassis.add_switch(
                    &binding.name,
                    Box::new(ZenohSwitch::new(zenoh_session.clone(), &binding.topic)),
                );
            }
            for binding in &app_config.teleop.holds {
                chassis.add_motor(
                    &binding.name,
                    Box::new(ZenohMotor::new(zenoh_session.clone(), &binding.topic)),
                );
            }
            for step in &app_config.routine {
                if let Some(outcome) = chassis.run_step(step).await {
                    info!("Step finished {:?}", outcome);
                }
            }
            info!("Routine finished at {}", chassis.pose());
        }
        Mode::Teleop => {
            let input = GamepadInput::subscribe(zenoh_session.clone()).await?;
            let mut teleop = chassis.teleop(Box::new(input));
            for binding in &app_config.teleop.toggles {
                teleop.add_toggle(PressToggle::new(
                    binding.button,
                    Box::new(ZenohSwitch::new(zenoh_session.clone(), &binding.topic)),
                ));
            }
            for binding in &app_config.teleop.holds {
                teleop.add_hold(HoldToRun::new(
                    binding.forward,
                    binding.reverse,
                    binding.power,
                    Box::new(ZenohMotor::new(zenoh_session.clone(), &binding.topic)),
                ));
            }
            tokio::spawn(teleop.run());
            tokio::signal::ctrl_c().await?;
            chassis.drivetrain().lock().await.stop().await;
        }
    }

    Ok(())
}
