use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use roam_lab_abstract::{ExperimentConfig, ExperimentFile, TopologyProvider, TopologySpec, profile_by_name};
use roam_lab_orchestrator::{BatchReport, Clock, RunController, SimulatedClock, SystemClock};
use roam_lab_provider::spec::provider_by_name;
use roam_lab_provider::{ProviderBuilder, ProviderDescriptor};

#[derive(Parser, Debug)]
#[command(author, version, about = "Mobile hand-off experiment orchestrator")]
struct Args {
    /// Experiment description (TOML). Defaults are used for anything missing.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Protocol profile to run (`svs`, `syncps`, `ip`).
    #[arg(long)]
    protocol: Option<String>,

    /// Number of runs in the batch.
    #[arg(long)]
    runs: Option<usize>,

    /// Directory that receives `<protocol>/<run>/` log trees.
    #[arg(long)]
    log_root: Option<PathBuf>,

    /// Network backend hosting the topology.
    #[arg(long, default_value = "emulated")]
    provider: String,

    /// Run against the emulated network on simulated time.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Write a JSON trace of the finished batch.
    #[arg(long)]
    trace_out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();
    info!("roam-lab starting…");

    let config = args.experiment()?;
    let descriptor = if args.dry_run {
        ProviderDescriptor::Emulated
    } else {
        provider_by_name(&args.provider)?
    };
    let topology =
        TopologySpec::platoons(&config.topology).context("Failed to build the platoon topology")?;
    let provider = ProviderBuilder::new().topology(topology).build(descriptor)?;

    let (abort_tx, abort_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current run");
            let _ = abort_tx.send(true);
        }
    });

    let outcome = if args.dry_run {
        run_batch(config, Arc::clone(&provider), SimulatedClock::new(), abort_rx).await
    } else {
        run_batch(config, Arc::clone(&provider), SystemClock::new(), abort_rx).await
    };
    if let Err(e) = provider.shutdown() {
        warn!("provider shutdown failed: {e}");
    }
    let report = outcome?;

    let suspect = report.suspect_runs();
    if !suspect.is_empty() {
        warn!("suspect runs: {suspect:?}");
    }
    if let Some(trace_path) = &args.trace_out {
        write_trace(trace_path, &report)?;
    }

    Ok(())
}

impl Args {
    /// Configuration file first, then command line overrides.
    fn experiment(&self) -> Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => load_experiment(path)?,
            None => ExperimentConfig::default(),
        };
        if let Some(name) = &self.protocol {
            let mut profile = profile_by_name(name)?;
            if profile.name == config.protocol.name {
                profile = config.protocol.clone();
            }
            config.protocol = profile;
        }
        if let Some(runs) = self.runs {
            config.runs.count = runs;
        }
        if let Some(root) = &self.log_root {
            config.log_root = root.clone();
        }
        if self.dry_run {
            let protocol = &mut config.protocol;
            protocol
                .participant_executable
                .get_or_insert_with(|| PathBuf::from("participant"));
            protocol
                .mobile_executable
                .get_or_insert_with(|| PathBuf::from("mobile"));
        }
        config.validate().context("Invalid experiment configuration")?;
        Ok(config)
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_batch<C: Clock>(
    config: ExperimentConfig,
    provider: Arc<dyn TopologyProvider>,
    clock: C,
    abort: watch::Receiver<bool>,
) -> Result<BatchReport> {
    info!(
        "Running {} x {} on {} anchors",
        config.runs.count, config.protocol.name, config.topology.anchors
    );
    let controller = RunController::new(config, provider, clock)
        .context("Experiment cannot start")?
        .with_abort(abort);
    let report = controller.run_batch().await?;
    info!("Batch complete: {} runs", report.runs.len());
    Ok(report)
}

fn load_experiment(path: &Path) -> Result<ExperimentConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read experiment file {}", path.display()))?;
    let file: ExperimentFile =
        toml::from_str(&content).context("Failed to parse experiment file")?;
    if let Some(description) = &file.description {
        info!("{description}");
    }
    Ok(file.into_config()?)
}

fn write_trace(path: &Path, report: &BatchReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize batch trace")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write trace file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "roam-lab",
            "--protocol",
            "ip",
            "--runs",
            "3",
            "--log-root",
            "/tmp/roam",
            "--dry-run",
        ]);
        let config = args.experiment().unwrap();
        assert_eq!(config.protocol.name, "ip");
        assert_eq!(config.runs.count, 3);
        assert_eq!(config.run_dir(2), PathBuf::from("/tmp/roam/ip/2"));
        assert!(config.protocol.participant_executable.is_some());
    }

    #[test]
    fn test_real_run_needs_executables() {
        let args = Args::parse_from(["roam-lab"]);
        assert!(args.experiment().is_err());
    }

    #[test]
    fn test_file_settings_survive_same_protocol_flag() {
        let path = std::env::temp_dir().join(format!("roam-lab-cli-{}.toml", std::process::id()));
        fs::write(
            &path,
            "[protocol]\nname = \"ip\"\nparticipant_executable = \"/opt/dtnd\"\nmobile_executable = \"/opt/uav\"\n",
        )
        .unwrap();
        let args = Args::parse_from([
            "roam-lab",
            "--config",
            path.to_str().unwrap(),
            "--protocol",
            "ip",
        ]);
        let config = args.experiment().unwrap();
        assert_eq!(
            config.protocol.participant_executable,
            Some(PathBuf::from("/opt/dtnd"))
        );
    }

    #[tokio::test]
    async fn test_dry_run_batch() {
        let root = std::env::temp_dir().join(format!("roam-lab-cli-dry-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let args = Args::parse_from([
            "roam-lab",
            "--protocol",
            "ip",
            "--dry-run",
            "--log-root",
            root.to_str().unwrap(),
        ]);
        let mut config = args.experiment().unwrap();
        config.lifecycle.grace_period_ms = 10;
        config.sampling.interval_ms = 10_000;
        let provider = ProviderBuilder::new()
            .topology(TopologySpec::platoons(&config.topology).unwrap())
            .build(ProviderDescriptor::Emulated)
            .unwrap();
        let (_tx, rx) = watch::channel(false);

        let report = run_batch(config, provider, SimulatedClock::new(), rx).await.unwrap();
        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].anchor_sequence.len(), 17);

        let trace = root.join("trace.json");
        write_trace(&trace, &report).unwrap();
        assert!(fs::read_to_string(trace).unwrap().contains("\"protocol\": \"ip\""));
    }
}
