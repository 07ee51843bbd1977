// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{any::Any, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use ipcmux_rs::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    connection::{ConnectionId, Receiver},
    message::{Message, MessageFlags},
    registry::test_support::BytesRegistry,
    resolver::StaticResolver,
    service::Service,
};
use tokio::time::sleep;
use tracing::info;

struct LoggingReceiver;

impl Receiver for LoggingReceiver {
    fn receive_message(&self, conn_id: ConnectionId, type_idx: u32, value: Box<dyn Any + Send>) {
        if let Ok(bytes) = value.downcast::<Vec<u8>>() {
            info!(conn_id, type_idx, len = bytes.len(), "received message");
        } else {
            info!(conn_id, type_idx, "received message of unrecognized shape");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("config/logger.yaml")?;

    let cfg = resolve_config_path("config/ipcmux.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let resolver = Arc::new(StaticResolver::new());
    if !cfg.listener.listen_address_str.is_empty()
        && let Ok(addr) = cfg.listener.listen_address_str.parse()
    {
        resolver.insert("loopback-probe", vec![addr]);
    }

    let server_only = cfg.listener.server_only;
    let service = Service::new(
        cfg.clone(),
        Arc::new(BytesRegistry),
        resolver,
        Arc::new(LoggingReceiver),
    );
    service.reconfigure(cfg).await.context("failed to start service")?;

    if !server_only {
        let payload = b"probe".to_vec();
        let msg = Message::new(Box::new(payload), 1, MessageFlags::ASYNCHRONOUS);
        match service.send("loopback-probe", msg, None) {
            Ok(msg_id) => info!(?msg_id, "probe message queued"),
            Err(e) => info!("probe send failed: {e}"),
        }
    }

    sleep(Duration::from_secs(2)).await;
    info!(pools = service.pool_count(), connections = service.connection_count(), "probe complete");

    Ok(())
}
