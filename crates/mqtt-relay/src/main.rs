/*
 * SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */
use std::net::AddrParseError;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mqtt_relay::config::{Config, ConfigError};
use mqtt_relay::ingest::MalformedRecordPolicy;
use mqtt_relay::shutdown_handle::ShutdownHandle;
use mqtt_relay::transport::LoopbackBroker;
use tracing::metadata::LevelFilter;

#[tokio::main(flavor = "multi_thread")]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    setup_logging(&cli);

    match cli.command {
        Command::Run(run_command) => {
            let loopback = run_command.loopback;
            let config: Config = (*run_command).try_into()?;
            let spawn_handle = if loopback {
                tracing::warn!(
                    "using the in-process loopback broker, no real brokers will be contacted"
                );
                mqtt_relay::spawn_with_connector(config, Arc::new(LoopbackBroker::new())).await?
            } else {
                mqtt_relay::spawn(config).await?
            };

            tokio::signal::ctrl_c().await?;
            tracing::info!("received ctrl-c");
            spawn_handle
                .shutdown_and_wait()
                .await
                .expect("mqtt-relay task panicked");
        }
        Command::DefaultRunConfig => {
            print!("{}", Config::default().into_annotated_config_file())
        }
    }

    Ok(())
}

#[derive(clap::Parser, Debug)]
struct Cli {
    #[clap(long, short, help = "Turn on debug loggging (same as RUST_LOG=debug)")]
    debug: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Parser, Debug)]
enum Command {
    Run(Box<RunCommand>),
    #[clap(about = "Output a default TOML config file for use with run -c")]
    DefaultRunConfig,
}

#[derive(clap::Parser, Debug)]
struct RunCommand {
    #[clap(long, short, help = "Path to TOML configuration file")]
    config: Option<PathBuf>,
    #[clap(
        long,
        short,
        help = "Address to serve the HTTP API on, overriding configuration file"
    )]
    address: Option<String>,
    #[clap(
        long,
        env = "DATABASE_URL",
        help = "Postgres connection string. Defaults to DATABASE_URL; in-memory storage if neither is set"
    )]
    database_url: Option<String>,
    #[clap(
        long,
        env = "AMQP_URL",
        help = "AMQP broker for the relay queue. Defaults to AMQP_URL; in-process queue if neither is set"
    )]
    amqp_url: Option<String>,
    #[clap(long, short = 'r', help = "Queue routing key, overriding configuration file")]
    routing_key: Option<String>,
    #[clap(
        long,
        action,
        help = "Stop ingesting at the first record that cannot be decoded, instead of skipping it"
    )]
    halt_on_malformed: bool,
    #[clap(long, action, help = "Do not re-subscribe stored clients at startup")]
    no_replay: bool,
    #[clap(
        long,
        action,
        help = "Use an in-process broker instead of connecting to real brokers (useful for local testing)"
    )]
    loopback: bool,
}

impl TryInto<Config> for RunCommand {
    type Error = CliError;

    // Load the config file, or the default, allowing CLI flags to override the corresponding settings.
    fn try_into(self) -> Result<Config, Self::Error> {
        let mut config = if let Some(config_path) = self.config {
            Config::load(&config_path)?
        } else {
            Config::default()
        };

        if let Some(address) = self.address {
            config.listen_address =
                address
                    .parse()
                    .map_err(|error| CliError::InvalidListeningAddress {
                        addr: address,
                        error,
                    })?;
        }
        if let Some(database_url) = self.database_url {
            config.database_url = Some(database_url);
        }
        if let Some(amqp_url) = self.amqp_url {
            config.amqp_url = Some(amqp_url);
        }
        if let Some(routing_key) = self.routing_key {
            config.routing_key = routing_key;
        }
        if self.halt_on_malformed {
            config.malformed_record_policy = MalformedRecordPolicy::Halt;
        }
        if self.no_replay {
            config.replay_on_startup = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Invalid listening address {addr}: {error}")]
    InvalidListeningAddress { addr: String, error: AddrParseError },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

fn setup_logging(cli: &Cli) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = if cli.debug {
        Some(LevelFilter::DEBUG)
    } else {
        None
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::Layer::default().compact())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.map(Into::into).unwrap_or(LevelFilter::INFO.into()))
                .from_env_lossy(),
        )
        .try_init()
    {
        panic!(
            "Failed to initialize trace logging for mqtt-relay. It's possible some earlier \
            code path has already set a global default log subscriber: {e}"
        );
    }
}
