//! Pump-cycle decision engine and flow-anomaly detector for a hydroponic
//! watering controller.
//!
//! Everything in this crate is synchronous and free of I/O.  Time is passed
//! in as wrapping `u32` milliseconds ([`clock::Millis`]) and hardware is
//! reached through the traits in [`ports`], so the whole control path can be
//! driven from tests.

pub mod clock;
pub mod controller;
pub mod cycle;
pub mod fault;
pub mod flow;
pub mod lighting;
pub mod ports;
pub mod pump;
pub mod settings;

pub use clock::{Clock, Millis};
pub use controller::{ControlEvent, Controller, ControllerStatus, FlowStatus, Inputs};
pub use cycle::{select_cycle, Band, Cycle};
pub use fault::{FaultStatus, FlowFaultDetector};
pub use flow::{FlowEstimator, PulseCounter};
pub use lighting::LightState;
pub use ports::{AlertSender, LightOutput, Relay};
pub use pump::{PumpCycleDriver, PumpCycleState, SwitchCause, Transition};
pub use settings::{BandCycle, SettingsPatch, SystemSettings};
