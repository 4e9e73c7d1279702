use super::MotorDriver;
use crate::{configuration::ConfigurationError, drivetrain::DriveCommand};
use anyhow::Error;
use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::SinkExt;
use serde::Deserialize;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{Decoder, Encoder};

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DriverError {
    #[error("communication with motor driver failed")]
    CommError,
    #[error("failed opening serial port")]
    FailedOpeningSerialPort,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct MotorMapping {
    /// Slot on the motor board, 0 or 1.
    pub id: u8,
    #[serde(default)]
    pub inverted: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SerialDriverConfig {
    pub port: String,
    pub left: MotorMapping,
    pub right: MotorMapping,
}

const MOTOR_SLOTS: u8 = 2;

impl SerialDriverConfig {
    /// Each side needs its own slot on the board.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for mapping in [&self.left, &self.right] {
            if mapping.id >= MOTOR_SLOTS {
                return Err(ConfigurationError::InvalidMotorId(mapping.id));
            }
        }
        if self.left.id == self.right.id {
            return Err(ConfigurationError::DuplicateMotorId(self.left.id));
        }
        Ok(())
    }
}

/// One frame for the motor board. Values are duty on the 0-255 wire scale.
#[derive(Default, Debug, PartialEq)]
pub struct WireMoveCommand {
    pub wheel_a: f64,
    pub wheel_b: f64,
}

impl WireMoveCommand {
    fn new(wheel_a: f64, wheel_b: f64) -> Self {
        Self { wheel_a, wheel_b }
    }

    fn encode(&self) -> Vec<u8> {
        // direction flag followed by magnitude, per wheel
        let buffer = vec![
            (self.wheel_a > 0.0) as u8,
            self.wheel_a.abs() as u8,
            (self.wheel_b > 0.0) as u8,
            self.wheel_b.abs() as u8,
        ];

        let mut encoded = postcard_cobs::encode_vec(&buffer);
        encoded.push(0);
        encoded
    }
}

const WIRE_MAX: f64 = 255.0;

impl SerialDriverConfig {
    /// Expects a validated mapping. Commands for a slot the board lacks are dropped.
    fn to_wire(&self, command: &DriveCommand, max_rpm: f64) -> WireMoveCommand {
        fn create_motor_data(mapping: &MotorMapping, rpm: f64, max_rpm: f64) -> f64 {
            let inversion_mul = if mapping.inverted { -1.0 } else { 1.0 };
            (rpm / max_rpm * WIRE_MAX).clamp(-WIRE_MAX, WIRE_MAX) * inversion_mul
        }

        let mut data = [0.0; MOTOR_SLOTS as usize];
        for (mapping, rpm) in [(&self.left, command.left()), (&self.right, command.right())] {
            if let Some(slot) = data.get_mut(mapping.id as usize) {
                *slot = create_motor_data(mapping, rpm, max_rpm);
            }
        }
        WireMoveCommand::new(data[0], data[1])
    }
}

pub struct MotorBoardProtocol;

impl Decoder for MotorBoardProtocol {
    type Item = ();
    type Error = Error;

    fn decode(&mut self, _: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(None)
    }
}

impl Encoder<WireMoveCommand> for MotorBoardProtocol {
    type Error = Error;

    fn encode(&mut self, data: WireMoveCommand, buf: &mut BytesMut) -> Result<(), Error> {
        let encoded_data = data.encode();
        buf.reserve(encoded_data.len());
        buf.put_slice(&encoded_data);
        Ok(())
    }
}

/// Two channel DC motor board on a serial port.
pub struct SerialDriver {
    framed_port: tokio_util::codec::Framed<tokio_serial::SerialStream, MotorBoardProtocol>,
    config: SerialDriverConfig,
    max_rpm: f64,
}

const BAUD_RATE: u32 = 115200;

impl SerialDriver {
    pub fn new(config: SerialDriverConfig, max_rpm: f64) -> Result<Self> {
        config.validate()?;
        let serial_port = tokio_serial::new(&config.port, BAUD_RATE)
            .open_native_async()
            .map_err(|_| DriverError::FailedOpeningSerialPort)?;
        Ok(Self {
            framed_port: MotorBoardProtocol.framed(serial_port),
            config,
            max_rpm,
        })
    }
}

#[async_trait]
impl MotorDriver for SerialDriver {
    async fn send(&mut self, command: DriveCommand) -> Result<()> {
        let wire_command = self.config.to_wire(&command, self.max_rpm);
        self.framed_port
            .send(wire_command)
            .await
            .map_err(|_| DriverError::CommError)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_adds_trailing_zero() {
        let move_command = WireMoveCommand::default();
        let encoded = move_command.encode();
        assert_eq!(*encoded.last().unwrap(), 0_u8);
    }

    #[test]
    fn wheel_a_positive() {
        let move_command = WireMoveCommand {
            wheel_a: 255.0,
            ..Default::default()
        };
        let encoded = move_command.encode();
        let mut iter = encoded.iter();
        assert_eq!(*iter.next().unwrap(), 3_u8);
        assert_eq!(*iter.next().unwrap(), 1_u8);
        assert_eq!(*iter.next().unwrap(), 255_u8);
    }

    #[test]
    fn wheel_a_negative() {
        let move_command = WireMoveCommand {
            wheel_a: -255.0,
            ..Default::default()
        };
        let encoded = move_command.encode();
        let mut iter = encoded.iter();
        assert_eq!(*iter.next().unwrap(), 1_u8);
        assert_eq!(*iter.next().unwrap(), 2_u8);
        assert_eq!(*iter.next().unwrap(), 255_u8);
    }

    #[test]
    fn mapping_scales_and_inverts() {
        let config = SerialDriverConfig {
            port: String::from("/dev/null"),
            left: MotorMapping {
                id: 1,
                inverted: false,
            },
            right: MotorMapping {
                id: 0,
                inverted: true,
            },
        };
        assert!(config.validate().is_ok());
        let wire = config.to_wire(&DriveCommand::new(225.0, 900.0), 450.0);
        assert_eq!(wire, WireMoveCommand::new(-255.0, 127.5));
    }

    #[test]
    fn motor_slots_must_be_distinct_and_on_the_board() {
        let mut config = SerialDriverConfig {
            port: String::from("/dev/null"),
            left: MotorMapping::default(),
            right: MotorMapping::default(),
        };
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::DuplicateMotorId(0))
        );
        config.right.id = 2;
        assert_eq!(config.validate(), Err(ConfigurationError::InvalidMotorId(2)));
        config.right.id = 1;
        assert!(config.validate().is_ok());
    }
}
