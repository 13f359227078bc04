use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rekon_apply::{parse_manifest, Action, ManifestComponent, ManifestStatus, Plan, Reconciler};
use rekon_core::{Gvk, KindRegistry, ObjectBag, Scope};
use rekon_kubehub::KubeStore;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rekonctl", version, about = "Rekon CLI: reconcile manifest sets")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for objects that do not name one; also scopes set lookups
    #[arg(long = "ns", global = true, env = "REKON_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(clap::Args, Debug)]
struct SetArgs {
    /// Manifest file ("-" for stdin)
    #[arg(short = 'f', long = "file")]
    file: String,
    /// Name of the set the manifest objects belong to
    #[arg(long = "set")]
    set: String,
    /// Extra kind to scan for leftovers, e.g. "apps/v1/Deployment" (repeatable)
    #[arg(long = "prune-kind")]
    prune_kinds: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List served kinds (incl. CRDs) and their scope
    Kinds,
    /// Show what apply would do, without writing
    Plan(SetArgs),
    /// Create, update and delete until the cluster matches the manifest set
    Apply(SetArgs),
}

fn init_tracing() {
    let env = std::env::var("REKON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REKON_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut s = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut s).context("reading stdin")?;
        Ok(s)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path))
    }
}

fn parse_kinds(keys: &[String]) -> Result<Vec<Gvk>> {
    keys.iter().map(|k| Gvk::parse_key(k).ok_or_else(|| anyhow!("invalid kind key: {} (want v1/Kind or group/v1/Kind)", k))).collect()
}

async fn connect() -> Result<(Reconciler, Arc<KindRegistry>)> {
    let client = rekon_kubehub::client().await?;
    let registry = Arc::new(rekon_kubehub::discover_registry(client.clone()).await?);
    let store = Arc::new(KubeStore::new(client));
    Ok((Reconciler::new(store, registry.clone()), registry))
}

fn build_component(args: &SetArgs, ns: Option<&str>, registry: &KindRegistry) -> Result<ManifestComponent> {
    let yaml = read_input(&args.file)?;
    let mut manifest = parse_manifest(&yaml, ns)?;
    manifest.normalize(registry);
    let unknown = manifest.unknown_kinds(registry);
    if !unknown.is_empty() {
        let keys: Vec<String> = unknown.iter().map(Gvk::key).collect();
        return Err(anyhow!("kinds not served by the cluster: {}", keys.join(", ")));
    }
    info!(set = %args.set, objects = manifest.objects.len(), "manifest loaded");
    Ok(ManifestComponent::new(&args.set, ns, manifest).with_prune_kinds(parse_kinds(&args.prune_kinds)?))
}

#[derive(Serialize)]
struct PlanLine {
    verb: &'static str,
    id: String,
}

fn plan_lines(plan: &Plan) -> Vec<String> {
    plan.actions
        .iter()
        .map(|a| match a {
            Action::Create(o) => format!("+ {}", o.identity()),
            Action::Update { expected, diff, .. } => {
                format!("~ {} (+{} ~{} -{})", expected.identity(), diff.adds, diff.updates, diff.removes)
            }
            Action::Unchanged(o) => format!("= {}", o.identity()),
            Action::MissingReferenced(id) => format!("! {} (referenced, missing)", id),
            Action::Delete(o) => format!("- {}", o.identity()),
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Kinds => {
            let client = rekon_kubehub::client().await?;
            let registry = rekon_kubehub::discover_registry(client).await?;
            let kinds = registry.kinds();
            match cli.output {
                Output::Human => {
                    for (gvk, scope) in kinds {
                        let scope = match scope { Scope::Namespaced => "namespaced", Scope::Cluster => "cluster" };
                        println!("{} • {} • {}", gvk.api_version(), gvk.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
        }
        Commands::Plan(args) => {
            let (rec, registry) = connect().await?;
            let component = build_component(&args, ns, &registry)?;
            let mut status = ManifestStatus::default();
            let plan = rec.plan_component(&component, &(), &mut status, &ObjectBag::new()).await?;
            match cli.output {
                Output::Human => {
                    for line in plan_lines(&plan) {
                        println!("{}", line);
                    }
                    let s = plan.summary();
                    println!("{} to create, {} to update, {} to delete, {} unchanged, {} missing", s.create, s.update, s.delete, s.unchanged, s.missing);
                }
                Output::Json => {
                    let lines: Vec<PlanLine> =
                        plan.actions.iter().map(|a| PlanLine { verb: a.verb(), id: a.identity().to_string() }).collect();
                    let out = serde_json::json!({ "summary": plan.summary(), "actions": lines });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Apply(args) => {
            let (rec, registry) = connect().await?;
            let component = build_component(&args, ns, &registry)?;
            let mut status = ManifestStatus::default();
            let name = format!("set/{}", component.set_name());
            let res = rec.reconcile_component(&name, &component, &(), &mut status, &mut ObjectBag::new()).await;
            match cli.output {
                Output::Human => {
                    for id in &status.reconciled {
                        println!("✓ {}", id);
                    }
                    for e in &status.errors {
                        println!("✗ {}", e);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&status)?),
            }
            if let Err(e) = res {
                warn!(errors = e.len(), "apply incomplete");
                return Err(anyhow!("apply finished with {} error(s)", e.len()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_apply::plan;
    use rekon_core::Object;

    #[test]
    fn kind_keys_parse_or_explain() {
        let kinds = parse_kinds(&["v1/ConfigMap".to_string(), "apps/v1/Deployment".to_string()]).unwrap();
        assert_eq!(kinds[1], Gvk::new("apps", "v1", "Deployment"));
        let err = parse_kinds(&["Deployment".to_string()]).unwrap_err().to_string();
        assert!(err.contains("invalid kind key"), "{err}");
    }

    #[test]
    fn plan_lines_mark_each_action() {
        let cm = |name: &str| Object::new(Gvk::new("", "v1", "ConfigMap"), Some("a"), name);
        let mut expected = ObjectBag::new();
        expected.add_managed(cm("new"));
        expected.add_referenced(cm("shared"));
        let mut observed = ObjectBag::new();
        observed.add_managed(cm("old"));
        let p = plan(&mut expected, &observed, |_, _| true);
        assert_eq!(
            plan_lines(&p),
            vec!["+ a/ConfigMap/new", "! a/ConfigMap/shared (referenced, missing)", "- a/ConfigMap/old"]
        );
    }
}
