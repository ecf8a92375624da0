// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * MCTP bus-owner/endpoint daemon.
 *
 * Copyright (c) 2025 Code Construct
 */
#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use argh::FromArgs;

use mctpd::config::{self, BindingConfig};
use mctpd::pcie::kernel::KernelPcie;
use mctpd::pcie::PcieBinding;
use mctpd::publisher::LogPublisher;
use mctpd::smbus::kernel::KernelSmbus;
use mctpd::smbus::SmbusPlane;

#[derive(FromArgs, Debug)]
#[argh(description = "MCTP bus-owner/endpoint daemon")]
struct Args {
    #[argh(switch, short = 'd')]
    /// debug logging
    debug: bool,

    #[argh(switch)]
    /// trace logging
    trace: bool,

    /// configuration file
    #[argh(option, default = "PathBuf::from(\"/etc/mctpd/mctpd.json\")")]
    config: PathBuf,

    /// binding to run, "smbus" or "pcie"
    #[argh(positional)]
    binding: String,

    /// PCIe MCTP device node
    #[argh(option, default = "PathBuf::from(\"/dev/mctp-pcie\")")]
    pcie_device: PathBuf,
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let level = match (args.trace, args.debug) {
        (true, _) => log::LevelFilter::Trace,
        (false, true) => log::LevelFilter::Debug,
        (false, false) => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter(None, level).init();

    let cfg = config::load(&args.config, &args.binding)?;
    let publisher = Rc::new(LogPublisher);

    match cfg {
        BindingConfig::Smbus(cfg) => {
            let driver = KernelSmbus::new(
                &cfg.bus,
                std::path::Path::new("/sys/bus/i2c/devices"),
                cfg.bmc_slave_addr,
            )
            .context("SMBus binding init failed")?;

            let plane = SmbusPlane::new(
                cfg,
                driver,
                publisher,
                PathBuf::from("/dev"),
                PathBuf::from("/sys/bus/i2c/devices"),
            )
            .context("SMBus binding init failed")?;
            plane.init().context("SMBus binding init failed")?;

            info!("mctpd SMBus binding running");
            let r = smol::block_on(plane.clone().run());
            plane.shutdown();
            r.context("SMBus binding failed")
        }
        BindingConfig::Pcie(cfg) => {
            let driver = KernelPcie::new(&args.pcie_device)
                .context("MCTP PCIe Interface initialization failed")?;

            let binding = PcieBinding::new(&cfg, driver, publisher)
                .context("MCTP PCIe Interface initialization failed")?;

            info!("mctpd PCIe binding running");
            smol::block_on(binding.run()).context("PCIe binding failed")
        }
    }
}
