use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use sparkler_feeds::HttpFeedSource;
use std::path::PathBuf;
use std::time::Duration;
use vm_memory::GuestAddress;

mod config;
mod console;
mod cpuid;
mod devices;
mod loader;
mod session;
mod vcpu;

use config::VmmConfig;
use console::RawTerminal;
use devices::{Console, PortIoBus};
use session::VmSession;
use vcpu::VcpuManager;

/// Command line: an optional config file and an optional guest image that
/// overrides the configured one.
#[derive(Parser, Debug, Default, PartialEq)]
#[command(name = "vmm")]
#[command(about = "sparkler - run a flat real-mode guest under KVM", long_about = None)]
struct Args {
    /// JSON config file; missing fields keep their defaults
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Guest image to load instead of the configured one
    #[arg(value_name = "GUEST_IMAGE")]
    guest_image: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<VmmConfig> {
        let mut config = match &self.config {
            Some(path) => VmmConfig::from_file(path)?,
            None => VmmConfig::default(),
        };
        if let Some(image) = self.guest_image {
            config.guest_image = image;
        }
        Ok(config)
    }
}

fn run(config: &VmmConfig) -> Result<()> {
    let mut session = VmSession::create(config).context("Failed to create VM session")?;

    loader::load_image_file(
        &config.guest_image,
        session.guest_memory(),
        GuestAddress(config.guest_base),
    )?;

    let feeds = HttpFeedSource::new(
        &config.feeds.base_url,
        &config.feeds.user_agent,
        config.feeds.timeout_secs.map(Duration::from_secs),
    )
    .context("Failed to create feed client")?;

    let echo = config.console.echo;
    let mut bus = PortIoBus::new(&config.ports, Box::new(feeds), || {
        Console::new(Box::new(std::io::stdout()), Box::new(RawTerminal::new(echo)))
    })?;
    info!("Port I/O bus ready: {} devices", config.ports.len());

    VcpuManager::new(&mut session, &mut bus).run()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Args::parse().into_config()?;
    info!(
        "sparkler VMM starting: guest={}, memory=0x{:x}@0x{:x}",
        config.guest_image.display(),
        config.mem_size,
        config.guest_base
    );

    run(&config)?;

    info!("Guest halted");
    Ok(())
}
