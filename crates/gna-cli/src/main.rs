//! `gna` — command-line interface for GNA scoring accelerators.
//!
//! ```text
//! USAGE:
//!   gna enumerate                  List every GNA function on the host
//!   gna info <pcie-addr>           Open through VFIO and read capabilities
//!   gna bind-vfio <pcie-addr>      Bind device to vfio-pci (root)
//!   gna unbind-vfio <pcie-addr>    Unbind from vfio-pci (root)
//!   gna iommu-group <pcie-addr>    Query the IOMMU group
//!   gna simulate                   Run scoring requests on the simulated device
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gna_chip::descriptor::PAGE_SIZE;
use gna_chip::layer::{BufferSlot, LAYER_DESCRIPTOR_SIZE};
use gna_driver::layout::RequestBuilder;
use gna_driver::sim::SimulatedDevice;
use gna_driver::{vfio, Capabilities, DriverConfig, ScoreReport};
use tracing_subscriber::EnvFilter;

/// Simulated user buffer address.
const SIM_BASE: u64 = 0x4000_0000;

#[derive(Parser)]
#[command(name = "gna", about = "GNA scoring accelerator CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List every GNA function and the driver it is bound to.
    Enumerate,
    /// Open a device through VFIO and print what it reports.
    Info {
        /// PCIe address (e.g. 0000:00:08.0) or index from `enumerate`.
        device: String,
    },
    /// Bind a device to vfio-pci (requires root / CAP_SYS_ADMIN).
    BindVfio {
        /// PCIe address (e.g. 0000:00:08.0).
        pcie_addr: String,
    },
    /// Unbind a device from vfio-pci and re-bind to intel_gna (if loaded).
    UnbindVfio {
        /// PCIe address (e.g. 0000:00:08.0).
        pcie_addr: String,
    },
    /// Query the IOMMU group for a device.
    IommuGroup {
        /// PCIe address (e.g. 0000:00:08.0).
        pcie_addr: String,
    },
    /// Map a buffer and run scoring requests against the simulated device.
    Simulate {
        /// Number of requests to submit.
        #[arg(short, long, default_value_t = 4)]
        requests: u32,
        /// Layers per request.
        #[arg(short, long, default_value_t = 2)]
        layers: u32,
        /// Mapped buffer size in pages.
        #[arg(short, long, default_value_t = 16)]
        pages: usize,
        /// Leave the last request unfinished so the recovery timer fails it.
        #[arg(long)]
        hang_last: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate()?,
        Cmd::Info { device } => cmd_info(&device)?,
        Cmd::BindVfio { pcie_addr } => cmd_bind_vfio(&pcie_addr)?,
        Cmd::UnbindVfio { pcie_addr } => cmd_unbind_vfio(&pcie_addr)?,
        Cmd::IommuGroup { pcie_addr } => cmd_iommu_group(&pcie_addr)?,
        Cmd::Simulate {
            requests,
            layers,
            pages,
            hang_last,
        } => cmd_simulate(requests, layers, pages, hang_last)?,
    }

    Ok(())
}

fn bound_driver(pcie_addr: &str) -> String {
    std::fs::read_link(format!("/sys/bus/pci/devices/{pcie_addr}/driver"))
        .ok()
        .and_then(|link| link.file_name()?.to_str().map(str::to_owned))
        .unwrap_or_else(|| "(none)".into())
}

fn cmd_enumerate() -> Result<()> {
    let found = vfio::discover()?;
    println!("GNA devices: {}", found.len());
    println!();

    for (index, address) in found.iter().enumerate() {
        let id = vfio::gna_device_id(address)?;
        println!("[{index}] {address}  {}", gna_chip::pcie::lspci_filter(id));
        println!("     Driver  {}", bound_driver(address));
        match vfio::iommu_group(address) {
            Ok(group) => println!("     IOMMU   group {group}"),
            Err(_) => println!("     IOMMU   (not available)"),
        }
    }
    Ok(())
}

fn cmd_info(device: &str) -> Result<()> {
    // Accept index or PCIe address
    let address = if let Ok(index) = device.parse::<usize>() {
        vfio::discover()?
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow::anyhow!("No GNA device at index {index}"))?
    } else {
        device.to_owned()
    };

    let id = vfio::gna_device_id(&address)?;
    let opened = vfio::VfioDevice::open(&address)
        .with_context(|| format!("Cannot open {address}; is it bound to vfio-pci?"))?;
    let regs = opened.map_registers()?;
    let caps = Capabilities::read(&regs);

    println!("PCIe address : {}", opened.pcie_address());
    println!("Device ID    : {}", gna_chip::pcie::lspci_filter(id));
    println!("Generation   : {:?}", caps.generation);
    println!("Version      : {:#010x}", caps.version);
    println!("Features     : {:#010x}", caps.features);
    println!("IOMMU group  : {}", vfio::iommu_group(&address)?);
    Ok(())
}

fn cmd_bind_vfio(pcie_addr: &str) -> Result<()> {
    println!("Binding {pcie_addr} to vfio-pci ...");
    vfio::bind_to_vfio(pcie_addr)?;
    let group = vfio::iommu_group(pcie_addr)?;
    println!("Done. IOMMU group: {group}");
    println!("Grant access:  sudo chown $USER /dev/vfio/{group}");
    Ok(())
}

fn cmd_unbind_vfio(pcie_addr: &str) -> Result<()> {
    println!("Unbinding {pcie_addr} from vfio-pci ...");
    vfio::unbind_from_vfio(pcie_addr)?;
    println!("Done. Driver: {}", bound_driver(pcie_addr));
    Ok(())
}

fn cmd_iommu_group(pcie_addr: &str) -> Result<()> {
    let group = vfio::iommu_group(pcie_addr)?;
    println!("IOMMU group for {pcie_addr}: {group}");
    println!("Device file: /dev/vfio/{group}");
    Ok(())
}

fn print_report(index: u32, report: &ScoreReport) {
    let perf = report.perf.map_or_else(
        || "-".to_owned(),
        |p| format!("{} cycles ({} stalled)", p.total_cycles, p.stall_cycles),
    );
    println!(
        "[{index}] {:?}  perf {perf}  driver {:?}",
        report.status, report.driver_time
    );
}

fn cmd_simulate(requests: u32, layers: u32, pages: usize, hang_last: bool) -> Result<()> {
    let length = pages * PAGE_SIZE;
    let input_offset = layers as usize * LAYER_DESCRIPTOR_SIZE;
    anyhow::ensure!(layers > 0, "at least one layer is needed");
    anyhow::ensure!(
        input_offset + PAGE_SIZE <= length,
        "{layers} layers and a page of input do not fit in {pages} pages"
    );

    let sim = SimulatedDevice::started(DriverConfig::from_env())?;
    if let Some(caps) = sim.device.capabilities() {
        println!("Simulated device: {caps}");
    }
    sim.platform.add_user_region(SIM_BASE, length);

    let session = sim.device.open_session();
    let memory = sim.device.map(&session, SIM_BASE, length)?;
    println!("Mapped {length} bytes at {SIM_BASE:#x} as memory {memory}");

    #[allow(clippy::cast_possible_truncation)]
    let input_offset = input_offset as u32;
    for index in 0..requests {
        #[allow(clippy::cast_possible_truncation)]
        let input = vec![index as u8; 64];
        let payload = RequestBuilder::new(memory, 1)
            .layers(0, layers)
            .stats(1)
            .buffer(0, BufferSlot::Input, input_offset)
            .patch(input_offset, &input)
            .build();
        let handle = sim.device.submit(&session, payload)?;

        if hang_last && index + 1 == requests {
            sim.timer.fire();
        } else {
            sim.regs.set_perf(1000 + index * 10, index);
            sim.regs.complete_score();
            sim.device.on_interrupt();
        }
        print_report(index, &handle.wait());
    }

    sim.device.unmap(&session, memory)?;
    sim.device.close_session(&session);
    println!(
        "Released: {} pins, {} DMA allocations outstanding",
        sim.platform.live_pins(),
        sim.platform.live_allocations()
    );
    Ok(())
}
