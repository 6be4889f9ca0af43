//! # Audio Device Layer
//!
//! Enumerates audio interfaces, negotiates sample rate and buffer size with
//! the native audio subsystem and delivers a real-time callback stream to a
//! single client, while absorbing hot-plug, device resets and parameter
//! changes imposed by drivers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          APPLICATION (control thread)                        │
//! │      DeviceClient::notify  ◀────────────────────────────────┐               │
//! └──────────┬──────────────────────────────────────────────────┼───────────────┘
//!            │ enumerate / init_new_current_device / idle       │
//!            ▼                                                  │
//! ┌─────────────────────────────────────────────────────────────┼───────────────┐
//! │                     DeviceManager (manager)                 │               │
//! │  ┌───────────────────┐   ┌──────────────────────────────────┴────────────┐  │
//! │  │  DeviceRegistry   │   │  current: AudioDevice (device)                │  │
//! │  │  (info)           │   │  ┌────────────┐ ┌──────────────┐ ┌──────────┐ │  │
//! │  │  None, dev 1, ... │   │  │ NullDevice │ │CallbackDevice│ │DriverDev.│ │  │
//! │  └───────────────────┘   │  └─────┬──────┘ └──────┬───────┘ └────┬─────┘ │  │
//! │                          │        │ DeviceEvents (events)       │       │  │
//! │                          └────────┼───────────────┼─────────────┼───────┘  │
//! └───────────────────────────────────┼───────────────┼─────────────┼──────────┘
//!                                     ▼               ▼             ▼
//!                               ┌──────────┐  ┌─────────────┐ ┌──────────────┐
//!                               │ software │  │ CallbackHal │ │ device thread│
//!                               │  clock   │  │ (RT thread) │ │  → Driver    │
//!                               └──────────┘  └─────────────┘ └──────────────┘
//!                                          hal: cpal_host, cpal_driver, software
//! ```
//!
//! Real-time callbacks run [`device::io::IoContext`], which never locks or
//! allocates. Everything asynchronous (property changes, driver messages,
//! frame-count mismatches) is recorded in [`events::DeviceEvents`] and
//! reported to the client from [`DeviceManager::idle`].

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod hal;
pub mod info;
pub mod manager;
pub mod notification;

pub use config::{AppConfig, BackendKind, BufferSizePolicy, ManagerConfig, NoneDeviceConfig};
pub use device::{AudioDevice, ConnectionState, DeviceKind, DeviceStatus, MonitorSettings};
pub use error::{DeviceError, DeviceResult, Error, HalError, Result};
pub use info::{DeviceFilter, DeviceInfo, NONE_DEVICE_NAME};
pub use manager::{DeviceManager, HostApi};
pub use notification::{AudioCallbackData, DeviceClient, Notification};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default buffer size in frames
    pub const DEFAULT_BUFFER_SIZE: u32 = 512;

    /// Idle tick of the command-line tool in milliseconds
    pub const IDLE_INTERVAL_MS: u64 = 50;
}
