//! Hardware and notification seams the controller drives.
//!
//! Implementations live in the service binary (GPIO, MQTT, mocks); the core
//! only ever talks to these traits.

/// Pump relay output.  Called exactly once per state change.
pub trait Relay: Send + Sync {
    fn set(&self, on: bool);
}

/// Out-of-band alert channel.  The implementation applies its own start-up
/// delay and cooldown; `false` means the alert was not accepted.
pub trait AlertSender: Send + Sync {
    fn notify(&self, subject: &str, body: &str) -> bool;
}

/// Dimmable grow light, brightness 0–255.
pub trait LightOutput: Send + Sync {
    fn set_brightness(&self, brightness: u8);
}

#[cfg(test)]
pub(crate) mod recording {
    //! Recording doubles shared by the core tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingRelay {
        pub calls: Mutex<Vec<bool>>,
    }

    impl Relay for RecordingRelay {
        fn set(&self, on: bool) {
            self.calls.lock().unwrap().push(on);
        }
    }

    #[derive(Default)]
    pub struct RecordingAlerts {
        pub sent: Mutex<Vec<(String, String)>>,
    }

    impl AlertSender for RecordingAlerts {
        fn notify(&self, subject: &str, body: &str) -> bool {
            self.sent
                .lock()
                .unwrap()
                .push((subject.to_string(), body.to_string()));
            true
        }
    }

    #[derive(Default)]
    pub struct RecordingLight {
        pub levels: Mutex<Vec<u8>>,
    }

    impl LightOutput for RecordingLight {
        fn set_brightness(&self, brightness: u8) {
            self.levels.lock().unwrap().push(brightness);
        }
    }
}
