// aware-link: proximity link runtime. `demo` runs two simulated devices end to end.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use aware_core::{DeviceIdentity, Message};
use aware_link::config::{self, Config};
use aware_link::medium::LocalMedium;
use aware_link::AwareService;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut demo = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("aware-link {}", VERSION);
                return Ok(());
            }
            "demo" => demo = true,
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    let cfg = config::load();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    rt.block_on(async {
        if demo {
            run_demo(cfg).await
        } else {
            run(cfg).await
        }
    })
}

fn print_message(device: &'static str) -> impl Fn(Message) + Send + 'static {
    move |m: Message| {
        let marker = if m.is_service_notice { "*" } else { ">" };
        println!("[{}] {} {}", device, marker, m.content);
    }
}

/// Single device on the in-process medium until Ctrl+C / SIGTERM.
async fn run(cfg: Config) -> anyhow::Result<()> {
    let medium = LocalMedium::default();
    let device = medium.device();
    let identity = config::local_identity(&cfg);
    let service = AwareService::new(cfg, identity, device.providers());
    service
        .start_discovery(|m| info!(content = %m.content, notice = m.is_service_notice, "message"))
        .await?;
    info!(identity = %service.identity(), status = %service.get_connection_status(), "running");
    shutdown_signal().await?;
    service.stop_discovery().await;
    Ok(())
}

async fn run_demo(cfg: Config) -> anyhow::Result<()> {
    // The simulated networks resolve to IPv4 loopback.
    let cfg = Config {
        bind_addr: IpAddr::from([127u8, 0, 0, 1]),
        ..cfg
    };
    let medium = LocalMedium::default();
    let a = AwareService::new(
        cfg.clone(),
        DeviceIdentity::new("DeviceA"),
        medium.device().providers(),
    );
    let b = AwareService::new(
        cfg,
        DeviceIdentity::new("DeviceB"),
        medium.device().providers(),
    );
    a.start_discovery(print_message("DeviceA")).await?;
    b.start_discovery(print_message("DeviceB")).await?;

    wait_until("data connection", || {
        a.is_data_connection_active() && b.is_data_connection_active()
    })
    .await?;
    println!("[DeviceA] status: {}", a.get_connection_status());
    println!("[DeviceB] status: {}", b.get_connection_status());

    b.send_message("hello over discovery").await?;
    a.send_attachment(b"hello over the data channel".to_vec(), "text/plain")?;
    b.send_data(vec![0xde, 0xad, 0xbe, 0xef])?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    a.stop_discovery().await;
    b.stop_discovery().await;
    println!("[DeviceA] status: {}", a.get_connection_status());
    Ok(())
}

async fn wait_until(what: &str, ready: impl Fn() -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {}", what))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
