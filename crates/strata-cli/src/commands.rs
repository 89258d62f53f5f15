use crate::workspace::{Options, Workspace};
use strata_core::report::RunReport;
use strata_core::state::StateStore;
use strata_core::types::Command;
use strata_platform::StackExports;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    NodeFailures,
}

impl From<&RunReport> for Outcome {
    fn from(report: &RunReport) -> Self {
        if report.success() {
            Outcome::Success
        } else {
            Outcome::NodeFailures
        }
    }
}

pub(crate) async fn run(command: &str, options: Options) -> anyhow::Result<Outcome> {
    let workspace = Workspace::open(&options).await?;
    tracing::info!(
        command,
        state_dir = %workspace.state_dir().display(),
        cluster = %workspace.config.cluster_name,
        "starting"
    );
    match command {
        "preview" => preview(&workspace, options.json).await,
        "apply" => apply(&workspace, options.json).await,
        "destroy" => destroy(&workspace, options.json).await,
        "outputs" => outputs(&workspace, options.json).await,
        other => anyhow::bail!("unknown command `{other}`"),
    }
}

/// Cancels the run on Ctrl-C; in-flight nodes finish or fail as cancelled.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            trigger.cancel();
        }
    });
    token
}

async fn preview(workspace: &Workspace, json: bool) -> anyhow::Result<Outcome> {
    let plan = workspace.engine.preview().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("{}", plan.render_text());
    }
    Ok(Outcome::Success)
}

async fn apply(workspace: &Workspace, json: bool) -> anyhow::Result<Outcome> {
    let result = workspace.engine.apply(cancel_on_interrupt()).await;
    // Resources may exist even when the run aborted.
    workspace.save_cloud().await?;
    let report = result?;
    finish(workspace, &report, json).await
}

async fn destroy(workspace: &Workspace, json: bool) -> anyhow::Result<Outcome> {
    let previous = workspace
        .last_report()
        .await?
        .filter(|report| report.command == Command::Apply);
    let cancel = cancel_on_interrupt();
    let result = match &previous {
        Some(report) => workspace.engine.destroy_after(report, cancel).await,
        None => workspace.engine.destroy(cancel).await,
    };
    workspace.save_cloud().await?;
    let report = result?;
    finish(workspace, &report, json).await
}

async fn finish(workspace: &Workspace, report: &RunReport, json: bool) -> anyhow::Result<Outcome> {
    workspace.save_report(report).await?;
    if json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report.generate_text());
    }
    Ok(Outcome::from(report))
}

async fn outputs(workspace: &Workspace, json: bool) -> anyhow::Result<Outcome> {
    let records = workspace.store.records().await?;
    let exports = StackExports::collect(&workspace.config, &records);
    if json {
        println!("{}", exports.to_json()?);
    } else {
        print!("{}", exports.render_text());
    }
    Ok(Outcome::Success)
}
