use std::collections::HashMap;

use log::{debug, error, info, warn};
use proximity_rs::{LockThreshold, Notification, Reason};
use tokio::process::Command;
use tokio::sync::broadcast;

use crate::config::ActionConfig;

/// Runs the configured shell command for each presence transition.
pub struct ActionRunner {
    config: ActionConfig,
    lock: LockThreshold,
    names: HashMap<String, String>,
}

/// Picks the command for a transition. `close` only fires once every seen
/// device is back; `away` and `lost` only fire once the aggregate is absent,
/// and never while locking is disabled.
fn command_for(
    config: &ActionConfig,
    lock: LockThreshold,
    presence: bool,
    reason: Reason,
) -> Option<&str> {
    match reason {
        Reason::Close if presence => config.on_close.as_deref(),
        Reason::Away | Reason::Lost if presence || lock == LockThreshold::Disabled => None,
        Reason::Away => config.on_away.as_deref(),
        Reason::Lost => config.on_lost.as_deref(),
        Reason::Close => None,
    }
}

impl ActionRunner {
    pub fn new(config: ActionConfig, lock: LockThreshold, names: HashMap<String, String>) -> Self {
        ActionRunner {
            config,
            lock,
            names,
        }
    }

    pub async fn run_loop(&self, mut rx: broadcast::Receiver<Notification<String>>) {
        loop {
            match rx.recv().await {
                Ok(Notification::PresenceChanged {
                    presence,
                    reason,
                    device,
                }) => self.run(presence, reason, device.as_deref()).await,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Notification channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Action runner skipped {skipped} notifications");
                }
            }
        }
    }

    async fn run(&self, presence: bool, reason: Reason, device: Option<&str>) {
        let Some(script) = command_for(&self.config, self.lock, presence, reason) else {
            debug!("No {reason} action to run (presence {presence})");
            return;
        };
        let name = device
            .map(|d| self.names.get(d).map(String::as_str).unwrap_or(d))
            .unwrap_or_default();
        info!("Running {reason} action");
        let status = Command::new("sh")
            .arg("-c")
            .arg(script)
            .env("PROXIMITY_REASON", reason.as_str())
            .env("PROXIMITY_PRESENCE", presence.to_string())
            .env("PROXIMITY_DEVICE", name)
            .status()
            .await;
        match status {
            Ok(status) if status.success() => debug!("{reason} action finished"),
            Ok(status) => warn!("{reason} action exited with {status}"),
            Err(err) => error!("Error running {reason} action: {:?}", err),
        }
    }
}
