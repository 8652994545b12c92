use crate::config::AdminConfig;
use crate::runbook::Runbook;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "clusteradm")]
#[command(about = "Cluster, replica set and cluster set administration", long_about = None)]
pub struct Cli {
    /// Admin configuration (TOML or JSON); replaces the runbook's own settings
    #[arg(short, long, env = "CLUSTERADM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "CLUSTERADM_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a runbook against a simulated fleet and print the step results
    Run {
        runbook: PathBuf,
        /// Pretty-print the JSON report
        #[arg(long)]
        pretty: bool,
    },
    /// Validate a runbook without running it
    Check { runbook: PathBuf },
    /// Print the effective admin configuration as TOML
    Config,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Run {
                ref runbook,
                pretty,
            } => self.run_runbook(runbook, pretty).await,
            Command::Check { ref runbook } => self.check(runbook),
            Command::Config => self.show_config(),
        }
    }

    fn admin_config(&self) -> Result<Option<AdminConfig>> {
        self.config
            .as_deref()
            .map(AdminConfig::from_file)
            .transpose()
    }

    fn load(&self, path: &Path) -> Result<Runbook> {
        let mut runbook = Runbook::from_file(path)?;
        if let Some(config) = self.admin_config()? {
            runbook.config = config;
        }
        Ok(runbook)
    }

    async fn run_runbook(&self, path: &Path, pretty: bool) -> Result<()> {
        let runbook = self.load(path)?;
        let report = runbook.run().await?;
        let rendered = if pretty {
            serde_json::to_string_pretty(&report)?
        } else {
            serde_json::to_string(&report)?
        };
        println!("{}", rendered);
        if !report.passed {
            anyhow::bail!("{} step(s) failed", report.failed());
        }
        Ok(())
    }

    fn check(&self, path: &Path) -> Result<()> {
        let runbook = self.load(path)?;
        let problems = runbook.problems();
        if problems.is_empty() {
            println!(
                "{}: {} instance(s), {} step(s), ok",
                path.display(),
                runbook.instances.len(),
                runbook.steps.len()
            );
            return Ok(());
        }
        for problem in &problems {
            println!("{}: {}", path.display(), problem);
        }
        anyhow::bail!("{} problem(s) found", problems.len())
    }

    fn show_config(&self) -> Result<()> {
        let config = self.admin_config()?.unwrap_or_default();
        print!("{}", toml::to_string_pretty(&config)?);
        Ok(())
    }
}
