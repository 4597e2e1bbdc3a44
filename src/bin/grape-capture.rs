/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use grape_recorder::{
    config::Config,
    error::{EXIT_CONFIG, EXIT_IO, EXIT_SUBSYSTEM, RecorderError},
    socket::create_rx_socket,
    supervisor, telemetry,
};
use miette::Result;
use std::{process::exit, time::Duration};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;

    let config = match Config::load().await {
        Ok(it) => it,
        Err(e) => {
            error!("Invalid configuration: {e}");
            exit(EXIT_CONFIG);
        }
    };

    // Socket failure at startup is fatal with its own exit code; the probe
    // socket is dropped and the receive loop re-binds with SO_REUSEADDR.
    if let Err(e) = create_rx_socket(
        config.multicast.group,
        config.multicast.port,
        config.multicast.interface_ip,
    ) {
        error!("Cannot bind multicast socket: {e}");
        exit(EXIT_IO);
    }

    info!(
        "Starting {} capture with {} channel(s)",
        config.instance_name(),
        config.channels.len()
    );

    let result = Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("grape-capture", move |s| async move {
            supervisor::start(&s, config).await?;
            Ok::<(), RecorderError>(())
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(10))
    .await;

    if let Err(e) = result {
        error!("Capture terminated abnormally: {e}");
        exit(EXIT_SUBSYSTEM);
    }

    Ok(())
}
