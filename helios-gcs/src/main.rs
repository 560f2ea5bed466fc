// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! GCS server binary entry point.

use clap::Parser;
use helios_common::config::HeliosConfig;
use helios_gcs::server::{GcsServer, GcsServerConfig};

#[derive(Parser, Debug)]
#[command(name = "gcs_server", about = "Helios Global Control Service")]
struct Args {
    /// GCS server port
    #[arg(long, default_value_t = 6379)]
    gcs_server_port: u16,

    /// Redis address (host:port) for persistent storage
    #[arg(long)]
    redis_address: Option<String>,

    /// Redis username
    #[arg(long)]
    redis_username: Option<String>,

    /// Redis password
    #[arg(long)]
    redis_password: Option<String>,

    /// Enable Redis SSL
    #[arg(long, default_value_t = false)]
    redis_enable_ssl: bool,

    /// Log directory
    #[arg(long)]
    log_dir: Option<String>,

    /// Base64-encoded config overrides
    #[arg(long)]
    config_list: Option<String>,

    /// Node IP address
    #[arg(long, default_value = "127.0.0.1")]
    node_ip_address: String,

    /// Session name
    #[arg(long, default_value = "session")]
    session_name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    helios_util::logging::init_helios_logging(
        "gcs_server",
        args.log_dir.as_ref().map(std::path::Path::new),
        0,
    );

    let config = match &args.config_list {
        Some(b64) => HeliosConfig::from_base64_json(b64)
            .map_err(|e| anyhow::anyhow!("invalid --config-list: {e}"))?,
        None => HeliosConfig::default(),
    };

    let server_config = GcsServerConfig {
        grpc_server_name: "GcsServer".to_string(),
        grpc_server_port: args.gcs_server_port,
        node_ip_address: args.node_ip_address,
        redis_address: args.redis_address,
        redis_username: args.redis_username,
        redis_password: args.redis_password,
        enable_redis_ssl: args.redis_enable_ssl,
        log_dir: args.log_dir,
        session_name: args.session_name,
        raylet_config_list: args.config_list.unwrap_or_default(),
        config,
    };

    let mut server = GcsServer::new(server_config)?;
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    server.stop();
    Ok(())
}
