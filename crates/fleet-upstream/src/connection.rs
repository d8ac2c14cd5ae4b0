//! Opening the local and upstream bus connections

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, Instrument};

use fleet_core::{BusResult, ConnectOptions, ConnectionEvent, Connector, GraphBus};

use crate::config::UpstreamConfig;

/// Open the upstream connection
///
/// Lifecycle events arrive on the returned receiver. The channel holds a
/// single event so the bus client waits for the engine to take each one.
pub(crate) async fn connect_remote(
    connector: &dyn Connector,
    config: &UpstreamConfig,
) -> BusResult<(Arc<dyn GraphBus>, mpsc::Receiver<ConnectionEvent>)> {
    let (events_tx, events_rx) = mpsc::channel(1);
    let opts = ConnectOptions::new(&config.uri, &config.auth_token)
        .no_echo()
        .with_events(events_tx);

    let bus = connector.connect(opts).await?;
    Ok((bus, events_rx))
}

/// Open the engine's own connection to the local bus
///
/// Echo is always off so writes the engine makes locally are not fed back
/// into its forwarding subscriptions. Lifecycle events are only logged.
pub(crate) async fn connect_local(
    connector: &dyn Connector,
    opts: ConnectOptions,
) -> BusResult<Arc<dyn GraphBus>> {
    let (events_tx, mut events_rx) = mpsc::channel(1);
    let bus = connector.connect(opts.no_echo().with_events(events_tx)).await?;

    tokio::spawn(
        async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ConnectionEvent::Connected => info!("Local bus connected"),
                    ConnectionEvent::Disconnected => info!("Local bus disconnected"),
                    ConnectionEvent::Reconnected => info!("Local bus reconnected"),
                    ConnectionEvent::Closed => {
                        info!("Local bus closed");
                        break;
                    }
                }
            }
        }
        .in_current_span(),
    );

    Ok(bus)
}
