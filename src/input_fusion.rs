use crate::error::ConfigError;
use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Motion limits and per-source gains.
#[derive(Deserialize, Debug, Clone)]
pub struct MotionConfig {
    /// m/s, bound on the (vx, vy) magnitude
    #[serde(default = "default_max_linear_speed")]
    pub max_linear_speed: f32,
    /// rad/s
    #[serde(default = "default_max_angular_speed")]
    pub max_angular_speed: f32,
    #[serde(default = "default_key_speed")]
    pub key_speed: f32,
    #[serde(default = "default_key_turn_rate")]
    pub key_turn_rate: f32,
    /// Fraction of the joystick radius treated as centered
    #[serde(default = "default_joystick_deadzone")]
    pub joystick_deadzone: f32,
    #[serde(default)]
    pub min_command_interval_ms: u64,
    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,
    #[serde(default = "default_frequency")]
    pub frequency: i64,
    #[serde(default = "default_frequency_step")]
    pub frequency_step: i64,
}

fn default_max_linear_speed() -> f32 {
    0.5
}

fn default_max_angular_speed() -> f32 {
    0.6
}

fn default_key_speed() -> f32 {
    0.3
}

fn default_key_turn_rate() -> f32 {
    0.6
}

fn default_joystick_deadzone() -> f32 {
    0.05
}

fn default_resend_interval_ms() -> u64 {
    250
}

fn default_frequency() -> i64 {
    1000
}

fn default_frequency_step() -> i64 {
    100
}

impl MotionConfig {
    /// Limits and gains must be positive and finite, the deadzone within [0, 1).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("max_linear_speed", self.max_linear_speed),
            ("max_angular_speed", self.max_angular_speed),
            ("key_speed", self.key_speed),
            ("key_turn_rate", self.key_turn_rate),
        ];
        for (field, value) in limits {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::NotPositive { field, value });
            }
        }
        if !(0.0..1.0).contains(&self.joystick_deadzone) {
            return Err(ConfigError::Deadzone(self.joystick_deadzone));
        }
        Ok(())
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            max_linear_speed: default_max_linear_speed(),
            max_angular_speed: default_max_angular_speed(),
            key_speed: default_key_speed(),
            key_turn_rate: default_key_turn_rate(),
            joystick_deadzone: default_joystick_deadzone(),
            min_command_interval_ms: 0,
            resend_interval_ms: default_resend_interval_ms(),
            frequency: default_frequency(),
            frequency_step: default_frequency_step(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VelocityCommand {
    pub vx: f32,
    pub vy: f32,
    pub omega: f32,
}

impl VelocityCommand {
    pub fn new(vx: f32, vy: f32, omega: f32) -> Self {
        Self { vx, vy, omega }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.vx == 0.0 && self.vy == 0.0 && self.omega == 0.0
    }

    pub fn linear_speed(&self) -> f32 {
        na::Vector2::new(self.vx, self.vy).norm()
    }

    /// Scales the linear part down onto the speed circle and clamps yaw rate.
    pub fn clamped(&self, max_linear: f32, max_angular: f32) -> Self {
        let linear = na::Vector2::new(self.vx, self.vy);
        let speed = linear.norm();
        let linear = if speed > max_linear && speed > 0.0 {
            linear * (max_linear / speed)
        } else {
            linear
        };
        Self {
            vx: linear.x,
            vy: linear.y,
            omega: self.omega.clamp(-max_angular, max_angular),
        }
    }
}

/// Physical keys that carry a motion binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    W,
    A,
    S,
    D,
    Q,
    E,
    Up,
    Down,
    Left,
    Right,
}

impl Key {
    /// Accepts lower case key names such as `w` or `arrowup`.
    pub fn from_name(name: &str) -> Option<Key> {
        match name.to_ascii_lowercase().as_str() {
            "w" => Some(Key::W),
            "a" => Some(Key::A),
            "s" => Some(Key::S),
            "d" => Some(Key::D),
            "q" => Some(Key::Q),
            "e" => Some(Key::E),
            "arrowup" | "up" => Some(Key::Up),
            "arrowdown" | "down" => Some(Key::Down),
            "arrowleft" | "left" => Some(Key::Left),
            "arrowright" | "right" => Some(Key::Right),
            _ => None,
        }
    }

    /// Contribution as (forward, strafe, yaw) in units of key speed and turn rate.
    fn contribution(&self) -> (f32, f32, f32) {
        match self {
            Key::W | Key::Up => (1.0, 0.0, 0.0),
            Key::S | Key::Down => (-1.0, 0.0, 0.0),
            Key::A | Key::Left => (0.0, 1.0, 0.0),
            Key::D | Key::Right => (0.0, -1.0, 0.0),
            Key::Q => (0.0, 0.0, 1.0),
            Key::E => (0.0, 0.0, -1.0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyboardState {
    pressed: BTreeSet<Key>,
}

impl KeyboardState {
    pub fn is_empty(&self) -> bool {
        self.pressed.is_empty()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.pressed.contains(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.pressed.iter()
    }

    fn press(&mut self, key: Key) {
        self.pressed.insert(key);
    }

    fn release(&mut self, key: Key) {
        self.pressed.remove(&key);
    }
}

/// Joystick displacement, `x` to the right and `y` forward, inside the unit circle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JoystickVector {
    displacement: na::Vector2<f32>,
}

impl JoystickVector {
    pub fn new(x: f32, y: f32) -> Self {
        let x = if x.is_finite() { x.clamp(-1.0, 1.0) } else { 0.0 };
        let y = if y.is_finite() { y.clamp(-1.0, 1.0) } else { 0.0 };
        let displacement = na::Vector2::new(x, y);
        let radius = displacement.norm();
        let displacement = if radius > 1.0 {
            displacement / radius
        } else {
            displacement
        };
        Self { displacement }
    }

    pub fn centered() -> Self {
        Self::default()
    }

    pub fn x(&self) -> f32 {
        self.displacement.x
    }

    pub fn y(&self) -> f32 {
        self.displacement.y
    }

    pub fn magnitude(&self) -> f32 {
        self.displacement.norm()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    KeyDown(Key),
    KeyUp(Key),
    JoystickMove { x: f32, y: f32 },
    JoystickRelease,
}

/// Merges keyboard and joystick state into one velocity command.
///
/// Any held motion key makes the keyboard authoritative and the joystick is
/// ignored until the key set is empty again.
#[derive(Debug, Clone)]
pub struct InputFusionEngine {
    config: MotionConfig,
    keyboard: KeyboardState,
    joystick: JoystickVector,
}

impl InputFusionEngine {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            keyboard: KeyboardState::default(),
            joystick: JoystickVector::centered(),
        }
    }

    pub fn handle(&mut self, event: InputEvent) -> VelocityCommand {
        match event {
            InputEvent::KeyDown(key) => self.key_down(key),
            InputEvent::KeyUp(key) => self.key_up(key),
            InputEvent::JoystickMove { x, y } => self.joystick_move(x, y),
            InputEvent::JoystickRelease => self.joystick_release(),
        }
    }

    pub fn key_down(&mut self, key: Key) -> VelocityCommand {
        self.keyboard.press(key);
        self.command()
    }

    pub fn key_up(&mut self, key: Key) -> VelocityCommand {
        self.keyboard.release(key);
        self.command()
    }

    pub fn joystick_move(&mut self, x: f32, y: f32) -> VelocityCommand {
        self.joystick = JoystickVector::new(x, y);
        self.command()
    }

    pub fn joystick_release(&mut self) -> VelocityCommand {
        self.joystick = JoystickVector::centered();
        self.command()
    }

    pub fn keyboard(&self) -> &KeyboardState {
        &self.keyboard
    }

    pub fn joystick(&self) -> JoystickVector {
        self.joystick
    }

    pub fn command(&self) -> VelocityCommand {
        let command = if !self.keyboard.is_empty() {
            self.keyboard_command()
        } else {
            self.joystick_command()
        };
        command.clamped(self.config.max_linear_speed, self.config.max_angular_speed)
    }

    fn keyboard_command(&self) -> VelocityCommand {
        let (forward, strafe, yaw) =
            self.keyboard
                .keys()
                .fold((0.0, 0.0, 0.0), |(forward, strafe, yaw), key| {
                    let (f, s, y) = key.contribution();
                    (forward + f, strafe + s, yaw + y)
                });
        VelocityCommand::new(
            forward * self.config.key_speed,
            strafe * self.config.key_speed,
            yaw * self.config.key_turn_rate,
        )
    }

    fn joystick_command(&self) -> VelocityCommand {
        let deadzone = self.config.joystick_deadzone.clamp(0.0, 0.95);
        let magnitude = self.joystick.magnitude();
        if magnitude <= deadzone {
            return VelocityCommand::zero();
        }
        let direction = self.joystick.displacement / magnitude;
        let scaled = (magnitude.min(1.0) - deadzone) / (1.0 - deadzone);
        let velocity = direction * scaled * self.config.max_linear_speed;
        // stick right is negative strafe, the robot's +y points left
        VelocityCommand::new(velocity.y, -velocity.x, 0.0)
    }
}
