//! clpool CLI for inspecting compute platforms and running kernels across them.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clpool::{
    DeviceHandle, Driver, ElementType, Runtime, RuntimeConfig, SimulatedDriver, SimulatedTopology,
};

#[derive(Parser)]
#[command(name = "clpool")]
#[command(author, version)]
#[command(about = "Pool compute devices across platforms and run kernels on them")]
#[command(long_about = "clpool: discover compute platforms, partition devices into
per-platform contexts and run kernels on them.

EXAMPLES:
  # List platforms
  clpool platforms

  # List devices as JSON
  clpool devices --json

  # Run a kernel on devices 0 and 2 with two float inputs
  clpool run --kernel add.cl --name vector_add --devices 0,2 \\
      --input 1,2,3 --input 10,20,30

  # Use a simulated topology instead of the OpenCL runtime
  clpool --simulate topology.json devices")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Runtime configuration file (JSON)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use a simulated topology (JSON) instead of the OpenCL driver
    #[arg(long, value_name = "FILE")]
    simulate: Option<PathBuf>,

    /// Program build options, overriding the configuration file
    #[arg(long, value_name = "OPTIONS", allow_hyphen_values = true)]
    build_options: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered platforms
    Platforms,
    /// List discovered devices in catalog order
    Devices {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Build a kernel for the selected devices and run it
    Run {
        /// OpenCL C source file
        #[arg(long, value_name = "FILE")]
        kernel: PathBuf,

        /// Kernel function name
        #[arg(long, value_name = "NAME")]
        name: String,

        /// Device indices to pool (default: all)
        #[arg(long, value_delimiter = ',', value_name = "INDICES")]
        devices: Vec<usize>,

        /// Device index (into the selection) that runs the kernel
        #[arg(long, default_value = "0", value_name = "N")]
        target: usize,

        /// Comma-separated float input buffer; repeat for more inputs
        #[arg(long = "input", value_name = "VALUES", value_parser = parse_float_list)]
        inputs: Vec<FloatList>,

        /// Use an out-of-order queue
        #[arg(long)]
        out_of_order: bool,
    },
}

/// Values of one `--input` occurrence.
#[derive(Debug, Clone, PartialEq)]
struct FloatList(Vec<f64>);

fn parse_float_list(text: &str) -> Result<FloatList, String> {
    text.split(',')
        .map(|item| {
            item.trim()
                .parse::<f64>()
                .map_err(|e| format!("invalid value '{}': {}", item.trim(), e))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(FloatList)
}

#[derive(Serialize)]
struct DeviceRow {
    index: usize,
    handle: u64,
    platform: usize,
    name: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    let config = runtime_config(&cli)?;

    match &cli.simulate {
        Some(path) => {
            let topology: SimulatedTopology = load_json(path)?;
            tracing::info!("Using simulated topology from {}", path.display());
            let runtime = Runtime::new(SimulatedDriver::new(topology), config)?;
            execute(&runtime, cli.command)
        }
        None => run_opencl(config, cli.command),
    }
}

#[cfg(feature = "opencl")]
fn run_opencl(config: RuntimeConfig, command: Commands) -> Result<()> {
    let runtime = Runtime::new(clpool::OpenClDriver::new(), config)?;
    execute(&runtime, command)
}

#[cfg(not(feature = "opencl"))]
fn run_opencl(_config: RuntimeConfig, _command: Commands) -> Result<()> {
    bail!("clpool was built without OpenCL support; rebuild with --features opencl or pass --simulate FILE")
}

fn runtime_config(cli: &Cli) -> Result<RuntimeConfig> {
    let config = match &cli.config {
        Some(path) => load_json::<RuntimeConfig>(path)?,
        None => RuntimeConfig::default(),
    };
    Ok(match &cli.build_options {
        Some(options) => config.with_build_options(options.as_str()),
        None => config,
    })
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn execute<D: Driver>(runtime: &Runtime<D>, command: Commands) -> Result<()> {
    match command {
        Commands::Platforms => handle_platforms(runtime),
        Commands::Devices { json } => handle_devices(runtime, json),
        Commands::Run {
            kernel,
            name,
            devices,
            target,
            inputs,
            out_of_order,
        } => {
            let source = std::fs::read_to_string(&kernel)
                .with_context(|| format!("Failed to read kernel source {}", kernel.display()))?;
            handle_run(
                runtime,
                RunArgs {
                    source,
                    name,
                    devices,
                    target,
                    inputs: inputs.into_iter().map(|list| list.0).collect(),
                    out_of_order,
                },
            )
        }
    }
}

fn handle_platforms<D: Driver>(runtime: &Runtime<D>) -> Result<()> {
    let count = runtime.find_platforms();
    let catalog = runtime.discover();
    let names = runtime.platform_names();

    println!("Platforms ({}):", count);
    println!("─────────────────────────────────────────");
    for (name, devices) in names.iter().zip(catalog.device_counts()) {
        println!("  {:<32} {} device(s)", name, devices);
    }
    println!("\nDiscovery took {:?}", catalog.discovery_time());
    Ok(())
}

fn device_rows<D: Driver>(runtime: &Runtime<D>) -> Result<Vec<DeviceRow>> {
    let catalog = runtime.discover();
    let names = runtime.device_names();
    catalog
        .device_handles()
        .into_iter()
        .zip(names)
        .enumerate()
        .map(|(index, (handle, name))| {
            let entry = catalog.device(handle)?;
            let platform = catalog.platform(entry.platform())?.ordinal();
            Ok(DeviceRow {
                index,
                handle: handle.into(),
                platform,
                name,
            })
        })
        .collect()
}

fn handle_devices<D: Driver>(runtime: &Runtime<D>, json: bool) -> Result<()> {
    let rows = device_rows(runtime)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No devices found.");
        return Ok(());
    }
    println!("{:<6} {:<9} {}", "INDEX", "PLATFORM", "NAME");
    for row in rows {
        println!("{:<6} {:<9} {}", row.index, row.platform, row.name);
    }
    Ok(())
}

struct RunArgs {
    source: String,
    name: String,
    devices: Vec<usize>,
    target: usize,
    inputs: Vec<Vec<f64>>,
    out_of_order: bool,
}

fn select_devices(all: &[DeviceHandle], indices: &[usize]) -> Result<Vec<DeviceHandle>> {
    if indices.is_empty() {
        return Ok(all.to_vec());
    }
    indices
        .iter()
        .map(|&i| {
            all.get(i)
                .copied()
                .with_context(|| format!("No device with index {} ({} found)", i, all.len()))
        })
        .collect()
}

/// Common element count of the input buffers.
fn input_len(inputs: &[Vec<f64>]) -> Result<usize> {
    let Some(first) = inputs.first() else {
        bail!("At least one --input buffer is required");
    };
    if let Some((i, other)) = inputs
        .iter()
        .enumerate()
        .find(|(_, input)| input.len() != first.len())
    {
        bail!(
            "Input {} has {} element(s) but input 0 has {}",
            i,
            other.len(),
            first.len()
        );
    }
    Ok(first.len())
}

fn handle_run<D: Driver>(runtime: &Runtime<D>, args: RunArgs) -> Result<()> {
    let selection = select_devices(&runtime.device_handles(), &args.devices)?;
    let Some(&device) = selection.get(args.target) else {
        bail!("Target {} is outside the selection of {} device(s)", args.target, selection.len());
    };
    let inputs = &args.inputs;
    let len = input_len(inputs)?;

    let session = runtime.init_session();
    let report = runtime.create_contexts(session, &selection)?;
    println!("Created {} context(s)", report.created.len());
    for (platform, err) in &report.failed {
        println!("  context on {} failed: {}", platform, err);
    }

    let context = runtime
        .resolve_context(device, session)
        .context("Target device has no context")?;
    let position = runtime
        .session_contexts(session)?
        .iter()
        .position(|r| r.context == context)
        .context("Target context is not part of the session")?;

    let programs = runtime.build_program(session, &args.source)?;
    let Some(program) = programs.get(position).copied().flatten() else {
        bail!("Program build failed for the target context (run with -v for the build log)");
    };

    let queue = if args.out_of_order {
        runtime.create_out_of_order_queue(device, session)?
    } else {
        runtime.create_in_order_queue(device, session)?
    };

    let mut params = Vec::with_capacity(inputs.len() + 1);
    for input in inputs {
        let buf = runtime.create_buffer(device, session, ElementType::Float, len)?;
        runtime.write_buffer(queue, buf, input)?;
        params.push(buf);
    }
    let output = runtime.create_buffer(device, session, ElementType::Float, len)?;
    params.push(output);

    let kernel = runtime.prepare_kernel(program, &args.name, &params)?;
    runtime.run_kernel(kernel, queue, &[len])?;

    let result: Vec<f64> = runtime.read_buffer(queue, output, len)?;
    println!(
        "{}",
        result
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );

    runtime.end_session(session)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clpool::Handle;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("clpool").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_each_input_flag_is_one_buffer() {
        let cli = parse(&[
            "run", "--kernel", "add.cl", "--name", "vector_add",
            "--input", "1,2,3", "--input", "10,20,30",
        ]);
        let Commands::Run { inputs, .. } = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(
            inputs,
            vec![
                FloatList(vec![1.0, 2.0, 3.0]),
                FloatList(vec![10.0, 20.0, 30.0])
            ]
        );
    }

    #[test]
    fn test_invalid_input_value_is_rejected() {
        let result = Cli::try_parse_from([
            "clpool", "run", "--kernel", "k.cl", "--name", "k", "--input", "1,x",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_input_len() {
        assert_eq!(input_len(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap(), 2);
        assert!(input_len(&[vec![1.0, 2.0], vec![3.0]]).is_err());
        assert!(input_len(&[]).is_err());
    }

    #[test]
    fn test_build_options_override_config() {
        let cli = parse(&["--build-options", "-cl-fast-relaxed-math", "platforms"]);
        assert_eq!(runtime_config(&cli).unwrap().build_options, "-cl-fast-relaxed-math");

        let cli = parse(&["platforms"]);
        assert_eq!(runtime_config(&cli).unwrap().build_options, "");
    }

    #[test]
    fn test_select_devices() {
        let all: Vec<DeviceHandle> = (0..3).map(DeviceHandle::from_index).collect();
        assert_eq!(select_devices(&all, &[]).unwrap(), all);
        assert_eq!(select_devices(&all, &[2]).unwrap(), vec![all[2]]);
        assert!(select_devices(&all, &[5]).is_err());
    }

    #[test]
    fn test_run_on_simulated_topology() {
        let topology: SimulatedTopology = serde_json::from_str(
            r#"{ "platforms": [
                { "name": "Sim A", "devices": [{ "name": "A0" }] },
                { "name": "Sim B", "devices": [{ "name": "B0", "class": "cpu" }] }
            ] }"#,
        )
        .unwrap();
        let runtime = Runtime::new(SimulatedDriver::new(topology), RuntimeConfig::default()).unwrap();

        let rows = device_rows(&runtime).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].platform, 1);

        let args = RunArgs {
            source: "__kernel void twice(__global float* a, __global float* o, ulong n) {}"
                .to_string(),
            name: "twice".to_string(),
            devices: vec![],
            target: 1,
            inputs: vec![vec![1.0, 2.0]],
            out_of_order: false,
        };
        handle_run(&runtime, args).unwrap();
        assert_eq!(runtime.driver().dispatches().len(), 1);
        assert_eq!(runtime.resource_counts().contexts, 0);
    }
}
