#![doc = include_str!("../README.md")]
pub mod api;
pub mod configuration;
pub mod connection;
pub mod console;
pub mod error;
pub mod gamepad;
pub mod input_fusion;
pub mod logging;
pub mod map_decoder;
pub mod renderer;
pub mod terminal;
pub mod transmitter;
