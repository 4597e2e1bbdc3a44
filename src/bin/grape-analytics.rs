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
    analytics,
    config::Config,
    error::{EXIT_CONFIG, EXIT_SUBSYSTEM, RecorderError},
    telemetry,
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

    info!(
        "Starting {} analytics for {} channel(s), watching {}",
        config.instance_name(),
        config.channels.len(),
        config.data.root.to_string_lossy()
    );

    let result = Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new(
            "grape-analytics",
            move |s| async move {
                analytics::start_analytics(&s, config).await?;
                Ok::<(), RecorderError>(())
            },
        ));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(10))
    .await;

    if let Err(e) = result {
        error!("Analytics terminated abnormally: {e}");
        exit(EXIT_SUBSYSTEM);
    }

    Ok(())
}
