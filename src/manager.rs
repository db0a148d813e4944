use std::collections::HashMap;

use btleplug::api::{Central as _, CentralEvent, CentralState, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::StreamExt as _;
use log::{debug, error, info, trace, warn};
use proximity_rs::{Command, Engine, Notification};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};

use crate::listener::LogListener;
use crate::messages::ControlMessage;

/// Upper bound on how long the loop sleeps when no timer is armed.
const IDLE_WAKE: Duration = Duration::from_secs(60);

/// Result of a connected RSSI read, fed back into the loop.
#[derive(Debug)]
struct RssiRead {
    address: String,
    rssi: i16,
    update: u64,
}

/// Counts RSSI updates the adapter reported per device, so a connected read
/// is only fed to the engine when the adapter has something newer than the
/// previous read. Properties hold the last reported value, which can sit
/// unchanged for as long as a link stays up.
#[derive(Debug, Default)]
struct FreshReads {
    updates: HashMap<String, u64>,
    consumed: HashMap<String, u64>,
}

impl FreshReads {
    fn note_update(&mut self, address: &str) {
        *self.updates.entry(address.to_string()).or_default() += 1;
    }

    fn current(&self, address: &str) -> u64 {
        self.updates.get(address).copied().unwrap_or(0)
    }

    /// Whether a read taken at `update` carries a value not yet consumed.
    fn consume(&mut self, address: &str, update: u64) -> bool {
        if update == 0 || self.consumed.get(address) == Some(&update) {
            return false;
        }
        self.consumed.insert(address.to_string(), update);
        true
    }
}

/// Owns the engine and drives it from adapter events, timers and remote
/// control messages. Everything touching the engine runs on this one task.
pub struct Manager {
    adapter: Adapter,
    engine: Engine<String>,
    names: HashMap<String, String>,
    peripherals: HashMap<String, Peripheral>,
    fresh_reads: FreshReads,
    log_listener: LogListener,
    notifications: broadcast::Sender<Notification<String>>,
}

impl Manager {
    pub fn new(
        adapter: Adapter,
        engine: Engine<String>,
        names: HashMap<String, String>,
        notifications: broadcast::Sender<Notification<String>>,
    ) -> Self {
        Manager {
            adapter,
            engine,
            log_listener: LogListener::new(names.clone()),
            names,
            peripherals: HashMap::new(),
            fresh_reads: FreshReads::default(),
            notifications,
        }
    }

    pub async fn run_loop(
        mut self,
        mut control_rx: broadcast::Receiver<ControlMessage>,
    ) -> anyhow::Result<()> {
        let mut events = self.adapter.events().await?;
        let (reads_tx, mut reads_rx) = mpsc::unbounded_channel();

        match self.adapter.adapter_state().await {
            Ok(CentralState::PoweredOff) => self.engine.on_power_state_changed(false),
            Ok(_) => self.engine.on_power_state_changed(true),
            Err(err) => {
                warn!("Could not read adapter state, assuming powered on: {:?}", err);
                self.engine.on_power_state_changed(true);
            }
        }
        self.flush(&reads_tx).await;

        let mut control_open = true;
        loop {
            let deadline = self
                .engine
                .next_deadline()
                .map(Instant::from_std)
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);

            tokio::select! {
                event = events.next() => {
                    let Some(event) = event else {
                        info!("No more adapter events");
                        break;
                    };
                    if let Err(err) = self.handle_central_event(event).await {
                        warn!("Error handling adapter event: {:?}", err);
                    }
                }
                Some(read) = reads_rx.recv() => {
                    if self.fresh_reads.consume(&read.address, read.update) {
                        trace!("Connected read {}: {}dBm", read.address, read.rssi);
                        let now = Instant::now().into_std();
                        self.engine.on_sample(now, &read.address, i32::from(read.rssi), true);
                    } else {
                        trace!("No new RSSI for {} since the last read", read.address);
                    }
                }
                msg = control_rx.recv(), if control_open => match msg {
                    Ok(msg) => self.handle_control(msg),
                    Err(broadcast::error::RecvError::Closed) => control_open = false,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Skipped {skipped} control messages");
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.engine.advance(Instant::now().into_std());
                }
            }

            self.flush(&reads_tx).await;
        }

        info!("Exiting manager event loop");
        Ok(())
    }

    async fn handle_central_event(&mut self, event: CentralEvent) -> anyhow::Result<()> {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let peripheral = self.adapter.peripheral(&id).await?;
                let address = peripheral.address().to_string();
                if !self.names.contains_key(&address) {
                    return Ok(());
                }
                let rssi = peripheral.properties().await?.and_then(|p| p.rssi);
                self.peripherals.insert(address.clone(), peripheral);
                if let Some(rssi) = rssi {
                    self.fresh_reads.note_update(&address);
                    let now = Instant::now().into_std();
                    self.engine.on_sample(now, &address, i32::from(rssi), false);
                }
            }
            CentralEvent::DeviceConnected(id) => {
                if let Some(address) = self.monitored_address(&id).await? {
                    self.engine.on_connected(&address);
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                if let Some(address) = self.monitored_address(&id).await? {
                    self.engine.on_disconnected(&address);
                }
            }
            CentralEvent::StateUpdate(state) => match state {
                CentralState::PoweredOn => self.engine.on_power_state_changed(true),
                CentralState::PoweredOff => self.engine.on_power_state_changed(false),
                other => debug!("Adapter state {:?}", other),
            },
            _ => {}
        }
        Ok(())
    }

    async fn monitored_address(&self, id: &PeripheralId) -> anyhow::Result<Option<String>> {
        let peripheral = self.adapter.peripheral(id).await?;
        let address = peripheral.address().to_string();
        Ok(self.names.contains_key(&address).then_some(address))
    }

    fn handle_control(&mut self, msg: ControlMessage) {
        info!("Control message: {:?}", msg);
        match msg {
            ControlMessage::SetPassiveMode(passive) => self.engine.set_passive_mode(passive),
            ControlMessage::SetSuspended(suspended) => {
                self.engine
                    .set_suspended(Instant::now().into_std(), suspended)
            }
        }
    }

    /// Hands queued commands to the adapter and queued notifications to
    /// listeners.
    async fn flush(&mut self, reads_tx: &mpsc::UnboundedSender<RssiRead>) {
        for command in self.engine.drain_commands() {
            self.execute(command, reads_tx).await;
        }
        for notification in self.engine.drain_notifications() {
            notification.dispatch(&self.log_listener);
            // no receivers unless MQTT or actions are configured
            let _ = self.notifications.send(notification);
        }
    }

    async fn execute(&self, command: Command<String>, reads_tx: &mpsc::UnboundedSender<RssiRead>) {
        match command {
            Command::StartScan => {
                if let Err(err) = self.adapter.start_scan(ScanFilter::default()).await {
                    error!("Error starting scan: {:?}", err);
                }
            }
            // connect/disconnect can take a while; outcomes come back as adapter events
            Command::Connect(address) => {
                let Some(peripheral) = self.peripherals.get(&address).cloned() else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(err) = peripheral.connect().await {
                        debug!("Connection to {address} failed: {:?}", err);
                    }
                });
            }
            Command::Disconnect(address) => {
                let Some(peripheral) = self.peripherals.get(&address).cloned() else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(err) = peripheral.disconnect().await {
                        debug!("Disconnecting {address} failed: {:?}", err);
                    }
                });
            }
            Command::ReadRssi(address) => {
                let Some(peripheral) = self.peripherals.get(&address).cloned() else {
                    return;
                };
                // later updates only count towards the next read
                let update = self.fresh_reads.current(&address);
                let reads_tx = reads_tx.clone();
                tokio::spawn(async move {
                    match peripheral.properties().await {
                        Ok(Some(properties)) => {
                            if let Some(rssi) = properties.rssi {
                                let read = RssiRead {
                                    address,
                                    rssi,
                                    update,
                                };
                                if reads_tx.send(read).is_err() {
                                    debug!("Manager loop gone, dropping RSSI read");
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(err) => debug!("Reading RSSI of {address} failed: {:?}", err),
                    }
                });
            }
        }
    }
}
