use export_limiter::config::Config;
use export_limiter::device::spawn_device;
use export_limiter::modbus::ModbusLink;
use export_limiter::mqtt;
use export_limiter::surface::{publish_reports, DeviceTopics, Router};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);
const FLUSH_WINDOW: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!("loaded config; devices: {}", cfg.devices.len());

    let opts = mqtt::build_options(&cfg.mqtt)?;
    let (client, mut eventloop) = mqtt::new(opts);

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let mut router = Router::new();
    for device in &cfg.devices {
        info!(
            device = %device.name,
            host = %device.host,
            port = device.port,
            slave = device.slave,
            "starting device"
        );
        let link = ModbusLink::from_config(device);
        let handle = spawn_device(device, link, cancel.clone(), &mut tasks);
        let topics = DeviceTopics::new(&cfg.mqtt.base_topic, &device.name);
        tasks.spawn(publish_reports(
            client.clone(),
            topics.clone(),
            handle.reports.clone(),
            cancel.clone(),
        ));
        router.add(handle, topics, device.price.clone());
    }

    let filters = router.subscriptions();

    let sig = shutdown_signal();
    tokio::pin!(sig);
    loop {
        tokio::select! {
            biased;
            _ = &mut sig => {
                info!("shutdown requested");
                break;
            }
            res = mqtt::next_inbound(&mut eventloop) => {
                match res {
                    Ok(mqtt::Inbound::Connected) => {
                        info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "connected to MQTT broker");
                        tokio::spawn(mqtt::subscribe_all(client.clone(), filters.clone()));
                    }
                    Ok(mqtt::Inbound::Publish(msg)) => {
                        let topic = match std::str::from_utf8(&msg.topic) {
                            Ok(s) => s.to_string(),
                            Err(_) => {
                                warn!(topic_bytes = ?msg.topic, "non-utf8 topic; skipping message");
                                continue;
                            }
                        };
                        router.route(&topic, msg.payload.as_ref(), chrono::Utc::now());
                    }
                    Err(e) => {
                        warn!("mqtt error: {e}; reconnecting after short delay");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "task ended abnormally");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("tasks still running after {:?}; aborting", SHUTDOWN_GRACE);
        tasks.abort_all();
    }

    // Let the offline markers reach the broker before leaving.
    if let Err(e) = client.disconnect().await {
        warn!(error = %e, "mqtt disconnect failed");
    }
    let _ = tokio::time::timeout(FLUSH_WINDOW, async {
        while eventloop.poll().await.is_ok() {}
    })
    .await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
