// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use sip_core::{Method, Properties};
use sip_location::{
    spawn_expiry_sweep, LocationConnector, LocationServiceConfig, MemoryLocationService,
};
use sip_observe::{publish_stats, set_stats_sink, TracingStatsSink};
use sip_proxy::{Proxy, ProxyConfig, RegisterPlugin};
use sip_registrar::{OperationMode, Registrar, RegistrarConfig};
use sip_transaction::{
    InterfaceConfig, SipListener, TimerScheduler, TokioScheduler, TransactionLayer,
};
use tokio::{runtime::Handle, time};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod transport;

/// SIP proxy, registrar and location service in one process.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Properties file with the `proxy.*`, `registrar.*` and `location.service.*` keys
    #[arg(long, default_value = "sipd.properties")]
    config: PathBuf,
    /// Seconds between statistics dumps (0 disables them)
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let props = Properties::load(&args.config)
        .with_context(|| format!("cannot read {}", args.config.display()))?;

    let ls_config = LocationServiceConfig::from_properties(&props)?;
    let location = Arc::new(MemoryLocationService::from_config(&ls_config)?);
    let _sweep = spawn_expiry_sweep(Arc::clone(&location), ls_config.update_period);
    let connector: Arc<dyn LocationConnector> = Arc::new(Arc::clone(&location));

    let registrar_config = RegistrarConfig::from_properties(&props)?;
    let standalone = registrar_config.mode == OperationMode::Standalone;
    let registrar = Arc::new(Registrar::new(registrar_config, Arc::clone(&connector))?);

    let scheduler: Arc<dyn TimerScheduler> = Arc::new(TokioScheduler::new(Handle::current()));
    let proxy_config = ProxyConfig::from_properties(&props)?;
    if proxy_config.interfaces.is_empty() {
        bail!("no proxy interfaces configured");
    }
    let register_plugin = proxy_config.plugin_enabled(&Method::Register) || !standalone;
    let mut proxy = Proxy::new(proxy_config, connector, Arc::clone(&scheduler))?;
    if register_plugin {
        let locality = proxy.locality().clone();
        proxy.register_plugin(Arc::new(RegisterPlugin::new(Arc::clone(&registrar), locality)));
        info!("REGISTER handled by the proxy");
    }
    let proxy = Arc::new(proxy);

    let mut layers = Vec::new();
    let proxy_listener: Arc<dyn SipListener> = proxy.clone();
    layers.extend(
        bind_interfaces(&proxy.config().interfaces, &proxy_listener, &scheduler).await?,
    );
    if standalone {
        let registrar_listener: Arc<dyn SipListener> = registrar.clone();
        let bound = bind_interfaces(
            &registrar.config().interfaces,
            &registrar_listener,
            &scheduler,
        )
        .await?;
        if bound.is_empty() {
            bail!("standalone registrar has no interfaces");
        }
        layers.extend(bound);
    }

    set_stats_sink(Arc::new(TracingStatsSink));
    if args.stats_interval > 0 {
        let proxy = Arc::clone(&proxy);
        let registrar = Arc::clone(&registrar);
        let location = Arc::clone(&location);
        let period = Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                publish_stats("proxy", &proxy.stats());
                publish_stats("registrar", &registrar.stats());
                publish_stats("location", &location.stats());
            }
        });
    }

    info!(
        domain = proxy.default_domain(),
        layers = layers.len(),
        standalone_registrar = standalone,
        "sipd started"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    info!("shutting down");
    Ok(())
}

async fn bind_interfaces(
    interfaces: &[InterfaceConfig],
    listener: &Arc<dyn SipListener>,
    scheduler: &Arc<dyn TimerScheduler>,
) -> Result<Vec<Arc<TransactionLayer>>> {
    let mut layers = Vec::new();
    for interface in interfaces {
        let bound = transport::serve_interface(
            interface,
            Arc::downgrade(listener),
            Arc::clone(scheduler),
        )
        .await?;
        layers.extend(bound);
    }
    Ok(layers)
}
