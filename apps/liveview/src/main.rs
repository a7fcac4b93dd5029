mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::domain::ShipmentId;
use storage::Storage;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracker_core::{
    FixedLocation, LiveEventSubscriber, LiveTracker, LocationProvider, RoutePlanner,
    RouteToggle, ShipmentSource, SnapshotLoader, SystemClock, TrackerEvent, UnavailableLocation,
};

use config::{load_settings, normalize_database_url, Settings};

#[derive(Parser, Debug)]
#[command(about = "Live map state for shipments and courier positions")]
struct Cli {
    #[arg(long, default_value = "liveview.toml")]
    config: PathBuf,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    broker_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the broker and keep the working set current until ctrl-c.
    Watch,
    /// Fetch the shipment snapshot once and print what would be shown.
    Snapshot,
    /// Print the route from a shipment to the configured warehouse.
    Route { shipping_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings(&cli.config)?;
    if let Some(v) = cli.api_url {
        settings.api_url = v;
    }
    if let Some(v) = cli.broker_url {
        settings.broker_url = v;
    }
    if let Some(v) = cli.database_url {
        settings.database_url = normalize_database_url(&v);
    }

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(settings).await,
        Command::Snapshot => snapshot(settings).await,
        Command::Route { shipping_id } => {
            route(settings, ShipmentId::from(shipping_id.as_str())).await
        }
    }
}

fn location_provider(settings: &Settings) -> Box<dyn LocationProvider> {
    match settings.warehouse() {
        Some(point) => Box::new(FixedLocation(point)),
        None => Box::new(UnavailableLocation),
    }
}

async fn watch(settings: Settings) -> Result<()> {
    let storage = Storage::new(&settings.database_url).await.map_err(|err| {
        error!(
            database_url = %settings.database_url,
            error = %format!("{err:#}"),
            "liveview: failed to open local state"
        );
        err
    })?;
    storage
        .health_check()
        .await
        .context("local state database is not usable")?;
    let tracker = LiveTracker::new(
        Arc::new(SystemClock),
        settings.freshness_policy()?,
        Arc::new(storage),
    );
    let mut events = tracker.subscribe_events();

    tracker.restore().await;
    let handle = tracker.start(
        LiveEventSubscriber::new(settings.subscriber_config()),
        settings.sweep_interval(),
    );

    let loader = SnapshotLoader::new(&settings.api_url, settings.page_size)?;
    // Failure is already logged and leaves the live feed running.
    let _ = tracker.load_snapshot_from(&loader).await;

    let mut planner = RoutePlanner::new();
    planner
        .pin_warehouse(location_provider(&settings).as_ref())
        .await;

    info!(
        api_url = %settings.api_url,
        broker_url = %settings.broker_url,
        "liveview: watching"
    );
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "liveview: event log fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await;
    tracker.persist().await;
    info!(
        shipments = tracker.displayable_shipments().await.len(),
        deliveries = tracker.current_deliveries().await.len(),
        "liveview: stopped"
    );
    Ok(())
}

fn log_event(event: &TrackerEvent) {
    match event {
        TrackerEvent::SnapshotLoaded { shipments } => {
            info!(shipments, "liveview: snapshot loaded")
        }
        TrackerEvent::ShipmentUpserted { record, inserted } => info!(
            shipping_id = %record.shipping_id,
            status = record.status.as_str(),
            inserted,
            "liveview: shipment updated"
        ),
        TrackerEvent::ShipmentRemoved { shipping_id } => {
            info!(shipping_id = %shipping_id, "liveview: shipment removed")
        }
        TrackerEvent::DeliveryUpdated { record } => info!(
            tracking_number = %record.tracking_number,
            status = %record.status,
            lat = record.position.map(|p| p.lat),
            lng = record.position.map(|p| p.lng),
            "liveview: courier position"
        ),
        TrackerEvent::DeliveriesRestored { count } => {
            info!(count, "liveview: restored courier positions")
        }
        TrackerEvent::Swept(report) => info!(
            shipments_removed = report.shipments_removed,
            deliveries_removed = report.deliveries_removed,
            "liveview: expired records removed"
        ),
        TrackerEvent::BrokerConnected => info!("liveview: live feed connected"),
        TrackerEvent::BrokerDisconnected => warn!("liveview: live feed disconnected"),
    }
}

async fn snapshot(settings: Settings) -> Result<()> {
    let loader = SnapshotLoader::new(&settings.api_url, settings.page_size)?;
    let tracker = LiveTracker::new(
        Arc::new(SystemClock),
        settings.freshness_policy()?,
        Arc::new(tracker_core::MemoryPersistence::default()),
    );
    tracker.load_snapshot_from(&loader).await?;

    let shipments = tracker.displayable_shipments().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&shipments).context("failed to encode shipments")?
    );
    Ok(())
}

async fn route(settings: Settings, shipping_id: ShipmentId) -> Result<()> {
    let loader = SnapshotLoader::new(&settings.api_url, settings.page_size)?;
    let records = loader.fetch_shipments().await?;
    let shipment = records
        .into_iter()
        .find(|record| record.shipping_id == shipping_id)
        .with_context(|| format!("shipment {shipping_id} is not in the snapshot"))?;

    let mut planner = RoutePlanner::new();
    planner
        .pin_warehouse(location_provider(&settings).as_ref())
        .await;

    match planner.toggle_route(&shipment) {
        RouteToggle::Selected { route, .. } => println!(
            "{shipping_id}: ({}, {}) -> warehouse ({}, {})",
            route.from.lat, route.from.lng, route.to.lat, route.to.lng
        ),
        RouteToggle::WarehouseNotSet => {
            println!("no warehouse location configured; set warehouse_lat and warehouse_lng")
        }
        RouteToggle::NoCoordinates(id) => println!("{id}: shipment has no coordinates"),
        RouteToggle::Cleared => println!("{shipping_id}: route cleared"),
    }
    Ok(())
}
