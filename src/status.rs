//! Current-status text surface.
//!
//! A single line of status text replaced on every meaningful event: mode
//! changes, load progress, detection summaries, errors. The line is logged,
//! shared through a handle for the host (and tests) to read, and optionally
//! mirrored as a desktop notification.

use std::sync::{Arc, Mutex};

use notify_rust::Notification;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct StatusHandle {
    current: Arc<Mutex<String>>,
}

impl StatusHandle {
    pub fn current(&self) -> String {
        self.current.lock().unwrap().clone()
    }
}

pub struct StatusSurface {
    notifications: bool,
    current: Arc<Mutex<String>>,
}

impl StatusSurface {
    pub fn new(notifications: bool) -> Self {
        Self {
            notifications,
            current: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn handle(&self) -> StatusHandle {
        StatusHandle {
            current: Arc::clone(&self.current),
        }
    }

    /// Replace the current status text.
    pub fn update(&self, text: &str) {
        info!(
            "[{}] {text}",
            chrono::Local::now().format("%H:%M:%S")
        );
        *self.current.lock().unwrap() = text.to_string();

        if !self.notifications {
            return;
        }

        debug!("Notification: {text}");
        if let Err(e) = Notification::new()
            .summary("Scene Narrator")
            .body(text)
            .icon("camera-web")
            .timeout(3000)
            .show()
        {
            warn!("Failed to show notification: {e}");
        }
    }
}
