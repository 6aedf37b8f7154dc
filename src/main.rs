use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use hostdiff::config::{ConfigOrigin, HostDiffConfig};
use hostdiff::flows::{self, FlowOptions, FlowPlugins, PluginSelection};
use hostdiff::plugins::PluginRegistry;

#[derive(Parser)]
#[command(
    name = "hostdiff",
    about = "Forensic host differencing: baseline a known-good host, collect from a fleet, diff",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $HOSTDIFF_CONFIG, then ./hostdiff.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run without persisting anything
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect a baseline from the first target behind a key
    Baseline {
        /// Target key (group name, host alias, ...)
        target_key: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Collect from every target behind a key and diff against its baseline
    Analysis {
        /// Target key (group name, host alias, ...)
        target_key: String,

        #[command(flatten)]
        run: RunArgs,

        /// Analysis plugin slug
        #[arg(long)]
        analysis_plugin: Option<String>,
    },

    /// Inspect available plugins
    Plugins {
        #[command(subcommand)]
        action: PluginsAction,
    },

    /// Read back persisted items
    Results {
        #[command(subcommand)]
        action: ResultsAction,

        /// Persistence plugin slug
        #[arg(long, global = true)]
        persistence_plugin: Option<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Target plugin slug
    #[arg(long)]
    target_plugin: Option<String>,

    /// Payload plugin slug
    #[arg(long)]
    payload_plugin: Option<String>,

    /// Collection plugin slug
    #[arg(long)]
    collection_plugin: Option<String>,

    /// Persistence plugin slug
    #[arg(long)]
    persistence_plugin: Option<String>,

    /// Incident id attached to remote submissions
    #[arg(long)]
    incident_id: Option<String>,

    /// Plugin option as key=value (repeatable)
    #[arg(short = 'o', long = "option")]
    options: Vec<String>,
}

#[derive(Subcommand)]
enum PluginsAction {
    /// List all registered plugins
    List,
}

#[derive(Subcommand)]
enum ResultsAction {
    /// Print one item
    Get {
        /// Item kind (baseline, instance, analysis)
        kind: String,
        key: String,
    },

    /// Print every item of a kind
    List {
        /// Item kind (baseline, instance, analysis)
        kind: String,
    },
}

impl RunArgs {
    fn selection(&self, config: &HostDiffConfig) -> PluginSelection {
        let mut selection = PluginSelection::from(&config.plugins);
        if let Some(slug) = &self.target_plugin {
            selection.target = slug.clone();
        }
        if let Some(slug) = &self.payload_plugin {
            selection.payload = slug.clone();
        }
        if let Some(slug) = &self.collection_plugin {
            selection.collection = slug.clone();
        }
        if let Some(slug) = &self.persistence_plugin {
            selection.persistence = slug.clone();
        }
        selection
    }

    fn flow_options(&self, dry_run: bool) -> Result<FlowOptions> {
        let mut options = flows::parse_pairs(&self.options)?;
        if let Some(incident_id) = &self.incident_id {
            options.insert("incident_id".to_string(), incident_id.clone().into());
        }
        Ok(FlowOptions { options, dry_run })
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<(HostDiffConfig, ConfigOrigin)> {
    match path {
        Some(path) => Ok((HostDiffConfig::load(path)?, ConfigOrigin::from_path(path))),
        None => Ok(HostDiffConfig::load_or_default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, origin) = load_config(cli.config.as_ref())?;
    hostdiff::logging::init(&config.logging)?;
    origin.log();

    let registry = PluginRegistry::builtin(&config).context("failed to build plugin registry")?;

    match cli.command {
        Commands::Baseline { target_key, run } => {
            tracing::info!(%target_key, "starting baseline");
            let plugins = FlowPlugins::resolve(&registry, &run.selection(&config))?;
            let report =
                flows::baseline(&target_key, &plugins, &run.flow_options(cli.dry_run)?).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Analysis {
            target_key,
            run,
            analysis_plugin,
        } => {
            tracing::info!(%target_key, "starting analysis");
            let mut selection = run.selection(&config);
            if let Some(slug) = analysis_plugin {
                selection.analysis = slug;
            }
            let plugins = FlowPlugins::resolve(&registry, &selection)?;
            let engine = registry.analysis(&selection.analysis)?;
            let report = flows::analysis(
                &target_key,
                &plugins,
                engine.as_ref(),
                &run.flow_options(cli.dry_run)?,
            )
            .await?;

            for item in &report.analysis {
                let instance = item.record.target_id();
                if item.has_differences() {
                    println!("Instance: {instance}");
                    println!("Differences found:");
                    println!("{}", serde_json::to_string_pretty(&item.diff)?);
                } else {
                    println!("Instance: {instance}");
                    println!("No differences found.");
                }
            }
        }
        Commands::Plugins { action } => match action {
            PluginsAction::List => {
                println!(
                    "{:<14} | {:<24} | {:<11} | {:<7} | {:<10} | Description",
                    "Title", "Slug", "Type", "Version", "Author"
                );
                println!(
                    "{:-<14}-|-{:-<24}-|-{:-<11}-|-{:-<7}-|-{:-<10}-|-{:-<40}",
                    "", "", "", "", "", ""
                );
                for meta in registry.all() {
                    println!(
                        "{:<14} | {:<24} | {:<11} | {:<7} | {:<10} | {}",
                        meta.title,
                        meta.slug,
                        meta.kind,
                        meta.version,
                        meta.author,
                        meta.description
                    );
                }
            }
        },
        Commands::Results {
            action,
            persistence_plugin,
        } => {
            let slug = persistence_plugin.unwrap_or_else(|| config.plugins.persistence.clone());
            let store = registry.persistence(&slug)?;
            match action {
                ResultsAction::Get { kind, key } => match store.get(&kind, &key).await? {
                    Some(item) => println!("{}", serde_json::to_string_pretty(&item)?),
                    None => anyhow::bail!("no {kind} item stored under {key}"),
                },
                ResultsAction::List { kind } => {
                    let items = store.get_all(&kind).await?;
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
        }
    }

    Ok(())
}
