mod selftest;

use clap::{Parser, Subcommand};
use tracing::info;

use rocdrv_core::config::{default_config_path, DriverConfig};
use rocdrv_driver::Driver;

#[derive(Parser)]
#[command(name = "rocdrv")]
#[command(about = "rocdrv - GPU driver layer over HIP")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to /etc/rocdrv/rocdrv.toml, then ./rocdrv.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices and their properties
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Allocate, fill, copy and launch on one device and check the results
    Selftest {
        /// Device ordinal to test
        #[arg(short, long, default_value_t = 0)]
        device: i32,

        /// Print JSON instead of a report
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    rocdrv_common::init_logging();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = DriverConfig::load_or_default(&config_path);

    match cli.command {
        Commands::Devices { json } => {
            let driver = open_driver(config)?;
            let count = driver.get_device_count()?;
            let mut devices = Vec::with_capacity(count.max(0) as usize);
            for ordinal in 0..count {
                devices.push(driver.get_device_properties(ordinal)?);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
                return Ok(());
            }

            println!(
                "{} backend, driver version {}",
                driver.backend_name(),
                driver.get_driver_version()?
            );
            println!("{} device(s):", devices.len());
            println!();
            for props in &devices {
                println!("  Device {}: {}", props.ordinal, props.name);
                println!(
                    "    Compute:   {}.{}",
                    props.compute_capability_major, props.compute_capability_minor
                );
                println!("    Memory:    {} MB", props.total_memory / (1024 * 1024));
                println!(
                    "    SMs:       {} x {} threads",
                    props.multiprocessor_count, props.max_threads_per_multiprocessor
                );
                println!("    Warp:      {}", props.warp_size);
                println!("    Grid:      {}", props.max_grid_dims);
                println!("    ECC:       {}", props.ecc_enabled);
                if let Some(ref bus) = props.pci_bus_id {
                    println!("    PCI:       {}", bus);
                }
                println!();
            }
        }

        Commands::Selftest { device, json } => {
            let driver = open_driver(config)?;
            selftest::run_selftest(&driver, device, json)?;
        }

        Commands::Config => {
            println!("# effective configuration (source: {})", config_path);
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn open_driver(config: DriverConfig) -> anyhow::Result<Driver> {
    let driver = Driver::new(config)?;
    driver.init()?;
    info!("driver ready ({} backend)", driver.backend_name());
    Ok(driver)
}
