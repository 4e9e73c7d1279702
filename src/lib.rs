#![doc = include_str!("../README.md")]
pub mod chassis;
pub mod configuration;
pub mod driver;
pub mod drivetrain;
pub mod error;
pub mod logging;
pub mod motion;
pub mod odometry;
pub mod pid;
pub mod pose;
pub mod sensors;
pub mod sim;
pub mod telemetry;
pub mod teleop;
