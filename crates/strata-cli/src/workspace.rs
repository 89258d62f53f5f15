use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::engine::{ConvergenceEngine, EngineConfig};
use strata_core::provider::ProviderRegistry;
use strata_core::report::RunReport;
use strata_core::simulator::SimulatedCloud;
use strata_core::state::FileStateStore;
use strata_platform::{topology, PlatformConfig};

const RECORDS_DIR: &str = "records";
const CLOUD_FILE: &str = "cloud.json";
const LAST_RUN_FILE: &str = "last-run.json";

#[derive(Debug, Clone)]
pub(crate) struct Options {
    pub(crate) config: Option<PathBuf>,
    pub(crate) state_dir: PathBuf,
    pub(crate) json: bool,
    pub(crate) max_parallel: usize,
}

/// Configuration, state and provider for one invocation
pub(crate) struct Workspace {
    pub(crate) config: PlatformConfig,
    pub(crate) store: Arc<FileStateStore>,
    pub(crate) cloud: Arc<SimulatedCloud>,
    pub(crate) engine: ConvergenceEngine,
    state_dir: PathBuf,
}

impl Workspace {
    pub(crate) async fn open(options: &Options) -> anyhow::Result<Self> {
        let config = PlatformConfig::load(options.config.as_deref())
            .context("loading platform configuration")?;
        let graph = Arc::new(topology::build(&config).context("building platform topology")?);

        let state_dir = options.state_dir.clone();
        let store = Arc::new(
            FileStateStore::open(state_dir.join(RECORDS_DIR))
                .await
                .context("opening state store")?,
        );
        let cloud = Arc::new(
            SimulatedCloud::open(state_dir.join(CLOUD_FILE))
                .await
                .with_context(|| format!("reading {}", state_dir.join(CLOUD_FILE).display()))?,
        );

        let engine = ConvergenceEngine::new(
            graph,
            store.clone(),
            ProviderRegistry::uniform(cloud.clone()),
        )
        .with_config(EngineConfig {
            max_parallel: options.max_parallel,
        });

        tracing::debug!(state_dir = %state_dir.display(), "workspace opened");
        Ok(Self {
            config,
            store,
            cloud,
            engine,
            state_dir,
        })
    }

    /// Persist the simulated cloud after a mutating command.
    pub(crate) async fn save_cloud(&self) -> anyhow::Result<()> {
        self.cloud
            .save()
            .await
            .with_context(|| format!("writing {}", self.state_dir.join(CLOUD_FILE).display()))
    }

    pub(crate) async fn save_report(&self, report: &RunReport) -> anyhow::Result<()> {
        let path = self.last_run_path();
        tokio::fs::write(&path, report.to_json()?)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Report of the previous `apply` or `destroy`, if one was saved.
    pub(crate) async fn last_report(&self) -> anyhow::Result<Option<RunReport>> {
        let path = self.last_run_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let report = serde_json::from_str(&content)
                    .with_context(|| format!("parsing {}", path.display()))?;
                Ok(Some(report))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn last_run_path(&self) -> PathBuf {
        self.state_dir.join(LAST_RUN_FILE)
    }

    pub(crate) fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}
