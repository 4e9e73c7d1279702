pub mod serial_driver;

use crate::drivetrain::DriveCommand;
use anyhow::Result;
use async_trait::async_trait;

/// Motor controller boundary. Takes wheel velocities in rpm.
#[async_trait]
pub trait MotorDriver: Send + Sync {
    async fn send(&mut self, command: DriveCommand) -> Result<()>;
}

/// Sends every command to several drivers, for example a motor board and a
/// model of the robot that stands in for its sensors.
pub struct FanOutDriver {
    drivers: Vec<Box<dyn MotorDriver>>,
}

impl FanOutDriver {
    pub fn new(drivers: Vec<Box<dyn MotorDriver>>) -> Self {
        Self { drivers }
    }
}

#[async_trait]
impl MotorDriver for FanOutDriver {
    async fn send(&mut self, command: DriveCommand) -> Result<()> {
        let mut result = Ok(());
        for driver in &mut self.drivers {
            // keep going so one broken output doesn't starve the rest
            if let Err(err) = driver.send(command).await {
                result = Err(err);
            }
        }
        result
    }
}
