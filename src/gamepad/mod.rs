pub mod messages;

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tracing::*;
use zenoh::{prelude::r#async::*, subscriber::FlumeSubscriber, Session, SessionDeclarations};

use crate::{
    console::{ConsoleEvent, ConsoleHandle},
    error::ErrorWrapper,
    input_fusion::InputEvent,
};
use messages::{Axis, Button, GamepadMessage, InputMessage};

const GAMEPAD_TOPIC: &str = "remote-control/gamepad";

#[derive(Deserialize, Debug, Clone, Default)]
pub struct GamepadConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Feeds the remote gamepad's left stick into the console as joystick input.
pub async fn start_gamepad_loop(zenoh_session: Arc<Session>, handle: ConsoleHandle) -> Result<()> {
    let mut gamepad_subscriber = zenoh_session
        .declare_subscriber(GAMEPAD_TOPIC)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    info!(topic = GAMEPAD_TOPIC, "listening for gamepad input");

    tokio::spawn(async move {
        let mut tracker = GamepadTracker::default();
        while let Err(err) =
            run_gamepad_listener(&mut gamepad_subscriber, &mut tracker, &handle).await
        {
            if handle.is_closed() {
                break;
            }
            error!("Gamepad listener failed with {:?}", err);
        }
    });
    Ok(())
}

async fn run_gamepad_listener(
    subscriber: &mut FlumeSubscriber<'_>,
    tracker: &mut GamepadTracker,
    handle: &ConsoleHandle,
) -> Result<()> {
    loop {
        let sample = subscriber.recv_async().await?;
        let message: String = sample.value.try_into()?;
        let message: InputMessage = serde_json::from_str(&message)?;

        if let Some(gamepad_message) = message.get_first() {
            for event in tracker.update(gamepad_message) {
                handle.send(event)?;
            }
        }
    }
}

/// Edge detection over gamepad snapshots.
#[derive(Debug, Default)]
pub struct GamepadTracker {
    stick_active: bool,
    dpad_up: bool,
    dpad_down: bool,
}

impl GamepadTracker {
    pub fn update(&mut self, gamepad: &GamepadMessage) -> Vec<ConsoleEvent> {
        let mut events = vec![];

        let x = apply_deadzone(gamepad.axis(Axis::LeftStickX));
        let y = apply_deadzone(gamepad.axis(Axis::LeftStickY));
        if !gamepad.connected || (x == 0.0 && y == 0.0) {
            if self.stick_active {
                self.stick_active = false;
                events.push(ConsoleEvent::Input(InputEvent::JoystickRelease));
            }
        } else {
            self.stick_active = true;
            events.push(ConsoleEvent::Input(InputEvent::JoystickMove { x, y }));
        }

        let dpad_up = gamepad.is_down(Button::DPadUp);
        if dpad_up && !self.dpad_up {
            events.push(ConsoleEvent::FrequencyStep(1));
        }
        self.dpad_up = dpad_up;

        let dpad_down = gamepad.is_down(Button::DPadDown);
        if dpad_down && !self.dpad_down {
            events.push(ConsoleEvent::FrequencyStep(-1));
        }
        self.dpad_down = dpad_down;

        events
    }
}

fn apply_deadzone(value: f32) -> f32 {
    const DEADZONE: f32 = 0.07;
    if value.abs() < DEADZONE {
        0.0
    } else {
        value
    }
}
