pub mod messages;

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::*;
use zenoh::{prelude::r#async::*, subscriber::FlumeSubscriber, Session, SessionDeclarations};

use crate::{
    configuration::TeleopConfig,
    drivetrain::{SharedDrivetrain, STICK_MAX},
    error::ErrorWrapper,
    motion::MotionState,
};
pub use messages::Button;
use messages::InputMessage;

pub const GAMEPAD_TOPIC: &str = "remote-control/gamepad";

/// Operator controls. Axes are on the ±127 stick scale.
pub trait OperatorInput: Send {
    /// Forward stick, positive drives forwards.
    fn throttle(&mut self) -> f64;

    /// Steering stick, positive steers clockwise.
    fn turn(&mut self) -> f64;

    fn button(&mut self, button: Button) -> bool;
}

/// Switched actuator such as a pneumatic valve.
#[async_trait]
pub trait DigitalOutput: Send {
    async fn set(&mut self, on: bool) -> Result<()>;

    fn value(&self) -> bool;
}

/// Motor run at a set power, such as an intake roller.
#[async_trait]
pub trait PowerOutput: Send {
    /// `power` is a percentage, negative runs in reverse.
    async fn set_power(&mut self, power: f64) -> Result<()>;
}

/// Maps a gamepad button to a zenoh topic that receives `on`/`off`.
/// `name` is how routines refer to the same mechanism.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ToggleBinding {
    pub name: String,
    pub button: Button,
    pub topic: String,
}

fn default_hold_power() -> f64 {
    100.0
}

/// Runs a motor published on `topic` while `forward` or `reverse` is held.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct HoldBinding {
    pub name: String,
    pub forward: Button,
    pub reverse: Button,
    #[serde(default = "default_hold_power")]
    pub power: f64,
    pub topic: String,
}

/// Runs a motor forwards while one button is held, in reverse while the
/// other is, and stops it when neither is. Forwards wins if both are down.
pub struct HoldToRun {
    forward: Button,
    reverse: Button,
    power: f64,
    output: Box<dyn PowerOutput>,
    sent: Option<f64>,
}

impl HoldToRun {
    pub fn new(
        forward: Button,
        reverse: Button,
        power: f64,
        output: Box<dyn PowerOutput>,
    ) -> Self {
        Self {
            forward,
            reverse,
            power,
            output,
            sent: None,
        }
    }

    async fn update(&mut self, input: &mut dyn OperatorInput) {
        let power = if input.button(self.forward) {
            self.power
        } else if input.button(self.reverse) {
            -self.power
        } else {
            0.0
        };
        if self.sent == Some(power) {
            return;
        }
        match self.output.set_power(power).await {
            Ok(()) => self.sent = Some(power),
            Err(err) => error!("Failed to run motor on {:?}: {:?}", self.forward, err),
        }
    }
}

/// Flips an output on every new press. Holding the button does nothing more.
pub struct PressToggle {
    button: Button,
    output: Box<dyn DigitalOutput>,
    was_pressed: bool,
}

impl PressToggle {
    pub fn new(button: Button, output: Box<dyn DigitalOutput>) -> Self {
        Self {
            button,
            output,
            was_pressed: false,
        }
    }

    async fn update(&mut self, input: &mut dyn OperatorInput) {
        let pressed = input.button(self.button);
        if pressed && !self.was_pressed {
            let on = !self.output.value();
            if let Err(err) = self.output.set(on).await {
                error!("Failed to switch output for {:?}: {:?}", self.button, err);
            }
        }
        self.was_pressed = pressed;
    }
}

pub struct TeleopLoop {
    input: Box<dyn OperatorInput>,
    toggles: Vec<PressToggle>,
    holds: Vec<HoldToRun>,
    drivetrain: SharedDrivetrain,
    motion_state: watch::Receiver<MotionState>,
    config: TeleopConfig,
}

impl TeleopLoop {
    pub fn new(
        input: Box<dyn OperatorInput>,
        drivetrain: SharedDrivetrain,
        motion_state: watch::Receiver<MotionState>,
        config: TeleopConfig,
    ) -> Self {
        Self {
            input,
            toggles: vec![],
            holds: vec![],
            drivetrain,
            motion_state,
            config,
        }
    }

    pub fn add_toggle(&mut self, toggle: PressToggle) {
        self.toggles.push(toggle);
    }

    pub fn add_hold(&mut self, hold: HoldToRun) {
        self.holds.push(hold);
    }

    /// One control step. Buttons are always read, the sticks are ignored
    /// while an autonomous command owns the drivetrain.
    pub async fn tick(&mut self) {
        for toggle in &mut self.toggles {
            toggle.update(self.input.as_mut()).await;
        }
        for hold in &mut self.holds {
            hold.update(self.input.as_mut()).await;
        }
        if *self.motion_state.borrow() == MotionState::Moving {
            return;
        }
        let throttle = self.input.throttle();
        let turn = self.input.turn();
        let mut drivetrain = self.drivetrain.lock().await;
        let command = drivetrain.arcade(
            throttle,
            turn,
            &self.config.throttle_curve,
            &self.config.steer_curve,
        );
        drivetrain.apply(command).await;
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Teleop running every {:?}", self.config.period);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}

/// Gamepad input older than this reads as neutral.
fn stale_input() -> chrono::Duration {
    chrono::Duration::seconds(1)
}

/// Operator input from gamepad messages published over zenoh.
pub struct GamepadInput {
    latest: Arc<Mutex<Option<InputMessage>>>,
}

impl GamepadInput {
    pub async fn subscribe(zenoh_session: Arc<Session>) -> Result<Self> {
        let mut gamepad_subscriber = zenoh_session
            .declare_subscriber(GAMEPAD_TOPIC)
            .res()
            .await
            .map_err(ErrorWrapper::ZenohError)?;

        let latest = Arc::new(Mutex::new(None));
        tokio::spawn({
            let latest = latest.clone();
            async move {
                while let Err(err) = run_gamepad_listener(&mut gamepad_subscriber, &latest).await
                {
                    error!("Gamepad listener failed with {:?}", err);
                }
            }
        });
        Ok(Self { latest })
    }

    fn read<T: Default>(&self, read: impl FnOnce(&messages::GamepadMessage) -> T) -> T {
        let latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        latest
            .as_ref()
            .and_then(|message| fresh_gamepad(message, Utc::now()))
            .map(read)
            .unwrap_or_default()
    }
}

/// First connected gamepad of a message, unless the message is stale.
fn fresh_gamepad(
    message: &InputMessage,
    now: DateTime<Utc>,
) -> Option<&messages::GamepadMessage> {
    if now - message.time > stale_input() {
        return None;
    }
    message.get_first().filter(|gamepad| gamepad.connected)
}

fn stick(value: f32) -> f64 {
    (value as f64 * STICK_MAX).clamp(-STICK_MAX, STICK_MAX)
}

impl OperatorInput for GamepadInput {
    fn throttle(&mut self) -> f64 {
        self.read(|gamepad| stick(gamepad.axis(messages::Axis::LeftStickY)))
    }

    fn turn(&mut self) -> f64 {
        self.read(|gamepad| stick(gamepad.axis(messages::Axis::RightStickX)))
    }

    fn button(&mut self, button: Button) -> bool {
        self.read(|gamepad| gamepad.is_down(button))
    }
}

async fn run_gamepad_listener(
    subscriber: &mut FlumeSubscriber<'_>,
    latest: &Mutex<Option<InputMessage>>,
) -> anyhow::Result<()> {
    loop {
        let sample = subscriber.recv_async().await?;
        let message: String = sample.value.try_into()?;
        let message: InputMessage = serde_json::from_str(&message)?;
        trace!(?message, "Received gamepad message");
        *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }
}

/// Output that publishes its state to a zenoh topic.
pub struct ZenohSwitch {
    zenoh_session: Arc<Session>,
    topic: String,
    on: bool,
}

impl ZenohSwitch {
    pub fn new(zenoh_session: Arc<Session>, topic: &str) -> Self {
        Self {
            zenoh_session,
            topic: topic.to_owned(),
            on: false,
        }
    }
}

#[async_trait]
impl DigitalOutput for ZenohSwitch {
    async fn set(&mut self, on: bool) -> Result<()> {
        let state = if on { "on" } else { "off" };
        self.zenoh_session
            .put(self.topic.as_str(), state)
            .res_async()
            .await
            .map_err(ErrorWrapper::ZenohError)?;
        self.on = on;
        info!("Switched {} {}", self.topic, state);
        Ok(())
    }

    fn value(&self) -> bool {
        self.on
    }
}

/// Motor that takes its power from a zenoh topic.
pub struct ZenohMotor {
    zenoh_session: Arc<Session>,
    topic: String,
}

impl ZenohMotor {
    pub fn new(zenoh_session: Arc<Session>, topic: &str) -> Self {
        Self {
            zenoh_session,
            topic: topic.to_owned(),
        }
    }
}

#[async_trait]
impl PowerOutput for ZenohMotor {
    async fn set_power(&mut self, power: f64) -> Result<()> {
        self.zenoh_session
            .put(self.topic.as_str(), power.to_string())
            .res_async()
            .await
            .map_err(ErrorWrapper::ZenohError)?;
        debug!("Motor {} at {}", self.topic, power);
        Ok(())
    }
}
