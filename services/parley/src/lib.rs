//! The `parley` voice assistant: device adapters, local tools, terminal I/O
//! and configuration around the live session and chat engines.

pub mod audio_device;
pub mod config;
pub mod console;
pub mod toolbox;
