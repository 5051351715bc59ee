//! The `glimpse models` command: provider availability and model listing.

use clap::Args;
use glimpse_core::{Config, ProviderKind, ProviderRegistry};
use std::sync::Arc;

/// Arguments for the `models` command.
#[derive(Args, Debug)]
pub struct ModelsArgs {
    /// Provider to inspect (all providers when omitted)
    pub provider: Option<ProviderKind>,

    /// Print as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// What one provider reports about itself.
#[derive(Debug, serde::Serialize)]
struct ProviderReport {
    provider: ProviderKind,
    available: bool,
    default_model: String,
    models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Execute the models command.
pub async fn execute(args: ModelsArgs, config: Config) -> anyhow::Result<()> {
    let registry = ProviderRegistry::new(Arc::new(config));
    let kinds: Vec<ProviderKind> = match args.provider {
        Some(kind) => vec![kind],
        None => ProviderKind::ALL.to_vec(),
    };

    let mut reports = Vec::with_capacity(kinds.len());
    for kind in kinds {
        reports.push(inspect(&registry, kind).await);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_report(report);
        }
    }
    Ok(())
}

async fn inspect(registry: &ProviderRegistry, kind: ProviderKind) -> ProviderReport {
    let default_model = registry.config().default_model(kind).to_string();
    let provider = registry.resolve(kind, "").await;
    let available = provider.is_available().await;
    tracing::debug!(provider = %kind, available, "Checked provider");

    let (models, error) = match registry.list_models(kind).await {
        Ok(models) => (models, None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    };

    ProviderReport {
        provider: kind,
        available,
        default_model,
        models,
        error,
    }
}

fn print_report(report: &ProviderReport) {
    let status = if report.available {
        "available"
    } else {
        "unavailable"
    };
    println!("{} ({status})", report.provider);
    println!("  Default model: {}", report.default_model);
    if let Some(error) = &report.error {
        println!("  Error: {error}");
    }
    if report.models.is_empty() {
        println!("  No models found");
    }
    for model in &report.models {
        let marker = if *model == report.default_model {
            "*"
        } else {
            " "
        };
        println!("  {marker} {model}");
    }
    println!();
}
