use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use log::info;
use proximity_rs::Engine;
use tokio::sync::broadcast;

mod action;
mod config;
mod listener;
mod manager;
mod messages;
mod mqtt;

/// Tracks nearby Bluetooth devices and reports when they arrive, walk away or
/// drop out of range.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let config = config::AppConfig::load(&args.config)?;
    info!("Devices: {:?}", config.devices);

    let names: HashMap<String, String> = config
        .devices
        .iter()
        .map(|d| (d.address.to_string(), d.name.clone()))
        .collect();

    let settings = config.settings()?;

    let (notification_tx, _) = broadcast::channel(64);
    let (control_tx, control_rx) = broadcast::channel(10);

    let mut mqtt_client = None;
    if let Some(mqtt_config) = &config.mqtt {
        let (client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
        client.subscribe().await?;

        // Handle incoming MQTT messages (e.g. passive mode toggles)
        let event_client = client.clone();
        tokio::task::spawn(async move {
            event_client.event_loop(&mut eventloop, control_tx).await;
        });

        let announcer = client.clone();
        let rx = notification_tx.subscribe();
        let announce_names = names.clone();
        tokio::task::spawn(async move {
            announcer.announce_loop(rx, announce_names).await;
        });
        mqtt_client = Some(client);
    }

    if let Some(action_config) = config.action.clone() {
        let runner =
            action::ActionRunner::new(action_config, settings.lock_threshold, names.clone());
        let rx = notification_tx.subscribe();
        tokio::task::spawn(async move {
            runner.run_loop(rx).await;
        });
    }

    let bt_manager = Manager::new().await?;

    // get the first bluetooth adapter
    let central = bt_manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .context("no Bluetooth adapter found")?;

    let mut engine = Engine::new(settings);
    engine.set_monitored_set(config.device_ids());

    let core = manager::Manager::new(central, engine, names, notification_tx);
    core.run_loop(control_rx).await?;

    if let Some(client) = mqtt_client {
        client.disconnect().await?;
    }

    Ok(())
}
