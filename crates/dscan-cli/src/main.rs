use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dscan_core::{
	open_scan, write_report, DataScan, DataScanError, DriverTarget, ExtentPhase, FsMap, ScanConfig,
	ScanSummary, Shard, SqliteCluster,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

const EXIT_MALFORMED: u8 = 2;
const EXIT_ROOTS_MISSING: u8 = 3;
const EXIT_IO: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "dscan", version, about = "dscan - rebuild filesystem metadata from data pool backtraces")]
struct Cli {
	#[command(flatten)]
	global: GlobalArgs,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
	/// Cluster database (defaults to ~/.dscan/cluster.db)
	#[arg(long, global = true)]
	store: Option<PathBuf>,
	/// Filesystem name, for logs and reports
	#[arg(long, global = true, default_value = "cephfs")]
	fs_name: String,
	#[arg(long, global = true, default_value_t = 1)]
	metadata_pool: i64,
	#[arg(long, global = true, default_value_t = 2)]
	data_pool: i64,
	/// Export recovered files into this directory instead of the metadata pool
	#[arg(long, global = true)]
	output_dir: Option<PathBuf>,
	/// Write the pass summary as JSON
	#[arg(long, global = true)]
	report: Option<PathBuf>,
	/// This worker's shard (0-based)
	#[arg(long, global = true, default_value_t = 0)]
	worker_n: u32,
	/// Total number of workers
	#[arg(long, global = true, default_value_t = 1)]
	worker_m: u32,
	/// Disable the progress spinner
	#[arg(long, global = true)]
	no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Create missing root inodes (run on a single worker before scanning)
	Init,
	/// Verify the roots exist
	CheckRoots,
	/// Inject every file from the backtrace on its first data object
	#[command(alias = "scan_inodes")]
	BacktraceScan,
	/// Recompute file sizes and mtimes from all data objects
	#[command(alias = "scan_extents")]
	ExtentScan {
		#[arg(long, value_enum, default_value_t = PhaseArg::Both)]
		phase: PhaseArg,
	},
	/// Manage pools in the cluster database
	Pools {
		#[command(subcommand)]
		command: PoolCommands,
	},
}

#[derive(Subcommand, Debug)]
enum PoolCommands {
	/// List pools
	List {
		#[arg(long)]
		json: bool,
	},
	/// Register a pool
	Create {
		id: i64,
		name: String,
	},
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PhaseArg {
	Accumulate,
	Apply,
	Both,
}

impl From<PhaseArg> for ExtentPhase {
	fn from(phase: PhaseArg) -> Self {
		match phase {
			PhaseArg::Accumulate => ExtentPhase::Accumulate,
			PhaseArg::Apply => ExtentPhase::Apply,
			PhaseArg::Both => ExtentPhase::Both,
		}
	}
}

fn main() -> ExitCode {
	// clap exits with 2 on bad arguments, matching EXIT_MALFORMED
	let cli = Cli::parse();

	// Initialize tracing
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	match run(cli) {
		Ok(code) => code,
		Err(e) => {
			eprintln!("❌ {:#}", e);
			ExitCode::from(exit_code_for(&e))
		}
	}
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
	match err.downcast_ref::<DataScanError>() {
		Some(DataScanError::RootsMissing) => EXIT_ROOTS_MISSING,
		Some(e) if e.is_malformed_input() => EXIT_MALFORMED,
		_ => EXIT_IO,
	}
}

fn run(cli: Cli) -> Result<ExitCode> {
	let Cli { global, command } = cli;

	let store_path = match &global.store {
		Some(path) => path.clone(),
		None => SqliteCluster::default_path()?,
	};
	let cluster = SqliteCluster::open(&store_path)?;
	tracing::info!("Using cluster database {}", cluster.path().display());

	match command {
		Commands::Pools { command } => pools(&cluster, command),
		Commands::Init => {
			let mut scan = open_data_scan(&cluster, &global)?;
			scan.init_metadata().context("Failed to initialise roots")?;
			println!("✅ Roots initialised");
			Ok(ExitCode::SUCCESS)
		}
		Commands::CheckRoots => {
			let mut scan = open_data_scan(&cluster, &global)?;
			if scan.check_roots()? {
				println!("✅ All roots present");
				Ok(ExitCode::SUCCESS)
			} else {
				println!("❌ Roots missing: run `dscan init` on a single worker first");
				Ok(ExitCode::from(EXIT_ROOTS_MISSING))
			}
		}
		Commands::BacktraceScan => {
			let mut scan = open_data_scan(&cluster, &global)?;
			let spinner = attach_spinner(&mut scan, &global);
			let result = scan.recover();
			if let Some(bar) = spinner {
				bar.finish_and_clear();
			}
			finish_pass(result?, &global)
		}
		Commands::ExtentScan { phase } => {
			let mut scan = open_data_scan(&cluster, &global)?;
			let spinner = attach_spinner(&mut scan, &global);
			let result = scan.recover_extents(phase.into());
			if let Some(bar) = spinner {
				bar.finish_and_clear();
			}
			finish_pass(result?, &global)
		}
	}
}

/// Reject a `--data-pool` that was never registered in the cluster database
fn ensure_data_pool(cluster: &SqliteCluster, pool: i64) -> Result<()> {
	if cluster.list_pools()?.iter().any(|p| p.id == pool) {
		Ok(())
	} else {
		Err(DataScanError::UnknownDataPool(pool).into())
	}
}

fn open_data_scan(cluster: &SqliteCluster, global: &GlobalArgs) -> Result<DataScan> {
	let shard = Shard::new(global.worker_n, global.worker_m)?;
	ensure_data_pool(cluster, global.data_pool)?;
	let fs_map = FsMap::new(global.fs_name.clone(), global.metadata_pool, vec![global.data_pool]);
	let config = ScanConfig::default()
		.with_shard(shard)
		.with_data_pool(global.data_pool);
	let target = DriverTarget::from_output_dir(global.output_dir.clone());
	let scan = open_scan(cluster, &fs_map, &target, config)?;
	tracing::info!("Worker {} attached to data pool {}", scan.shard(), scan.data_pool_id());
	Ok(scan)
}

fn attach_spinner(scan: &mut DataScan, global: &GlobalArgs) -> Option<ProgressBar> {
	if global.no_progress || !atty::is(atty::Stream::Stderr) {
		return None;
	}

	let bar = ProgressBar::new_spinner();
	let style = ProgressStyle::default_spinner()
		.template("{spinner} [{elapsed_precise}] {msg}")
		.unwrap_or_else(|_| ProgressStyle::default_spinner());
	bar.set_style(style);
	bar.enable_steady_tick(Duration::from_millis(120));

	let handle = bar.clone();
	scan.set_progress_callback(move |progress| {
		handle.set_message(format!(
			"{}: {} listed, {} in shard, {} recovered, {} errored",
			progress.pass,
			progress.objects_listed,
			progress.objects_in_shard,
			progress.recovered,
			progress.errored
		));
	});
	Some(bar)
}

fn finish_pass(summary: ScanSummary, global: &GlobalArgs) -> Result<ExitCode> {
	println!("✅ {} complete", summary.pass);
	println!("🆔 Run ID: {}", summary.run_id);
	println!("🧩 Shard: {}", summary.shard);
	println!("📦 Objects listed: {}", summary.objects_listed);
	println!("📂 Objects in shard: {}", summary.objects_in_shard);
	if summary.accumulated > 0 {
		println!("📏 Extents accumulated: {}", summary.accumulated);
	}
	println!("📥 Injected: {}", summary.injected);
	println!("🔁 Unchanged: {}", summary.unchanged);
	println!("🗃️  Lost+found: {}", summary.lost_and_found);
	println!("⏭️  Skipped: {}", summary.skipped);
	println!("🚫 Ignored: {}", summary.ignored);
	println!("⚠️  Errored: {}", summary.errored);

	if let Some(path) = &global.report {
		write_report(&summary, path)?;
		println!("📝 Report written to {}", path.display());
	}

	if summary.has_errors() {
		Ok(ExitCode::from(EXIT_IO))
	} else {
		Ok(ExitCode::SUCCESS)
	}
}

fn pools(cluster: &SqliteCluster, command: PoolCommands) -> Result<ExitCode> {
	match command {
		PoolCommands::List { json } => {
			let pools = cluster.list_pools()?;
			if json {
				println!("{}", serde_json::to_string_pretty(&pools)?);
			} else if pools.is_empty() {
				println!("No pools in {}", cluster.path().display());
			} else {
				println!("📋 Pools in {}:", cluster.path().display());
				for pool in pools {
					println!("\t{}\t{}\t{} objects", pool.id, pool.name, pool.objects);
				}
			}
		}
		PoolCommands::Create { id, name } => {
			if cluster.create_pool(id, &name)? {
				println!("✅ Created pool {} ({})", id, name);
			} else {
				println!("ℹ️  Pool {} already exists", id);
			}
		}
	}
	Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cluster_with_pools(dir: &tempfile::TempDir) -> SqliteCluster {
		let cluster = SqliteCluster::open(dir.path().join("cluster.db")).unwrap();
		cluster.create_pool(1, "metadata").unwrap();
		cluster.create_pool(2, "data").unwrap();
		cluster
	}

	fn args(argv: &[&str]) -> GlobalArgs {
		Cli::try_parse_from(argv).unwrap().global
	}

	#[test]
	fn test_exit_codes() {
		let roots = anyhow::Error::from(DataScanError::RootsMissing);
		assert_eq!(exit_code_for(&roots), EXIT_ROOTS_MISSING);

		let shard = anyhow::Error::from(DataScanError::InvalidShard { n: 3, m: 2 });
		assert_eq!(exit_code_for(&shard), EXIT_MALFORMED);

		let io = anyhow::anyhow!("disk on fire");
		assert_eq!(exit_code_for(&io), EXIT_IO);
	}

	#[test]
	fn test_unregistered_data_pool_is_malformed_input() {
		let dir = tempfile::tempdir().unwrap();
		let cluster = cluster_with_pools(&dir);

		let global = args(&["dscan", "--data-pool", "9", "init"]);
		let err = open_data_scan(&cluster, &global).err().unwrap();
		assert!(matches!(
			err.downcast_ref::<DataScanError>(),
			Some(DataScanError::UnknownDataPool(9))
		));
		assert_eq!(exit_code_for(&err), EXIT_MALFORMED);
	}

	#[test]
	fn test_registered_pools_open_a_scan() {
		let dir = tempfile::tempdir().unwrap();
		let cluster = cluster_with_pools(&dir);

		let global = args(&["dscan", "--worker-n", "1", "--worker-m", "2", "check-roots"]);
		let mut scan = open_data_scan(&cluster, &global).unwrap();
		assert_eq!(scan.shard(), Shard::new(1, 2).unwrap());
		assert_eq!(scan.data_pool_id(), 2);
		assert!(!scan.check_roots().unwrap());
	}

	#[test]
	fn test_bad_arguments_are_rejected_by_clap() {
		let err = Cli::try_parse_from(["dscan", "extent-scan", "--phase", "sideways"]).unwrap_err();
		assert_eq!(err.exit_code(), i32::from(EXIT_MALFORMED));
	}
}
