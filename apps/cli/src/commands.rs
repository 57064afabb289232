//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use taxogen_classifier::{OpenAiClassifier, resolve_api_key};
use taxogen_core::tree::{request_all, request_children};
use taxogen_core::{
    Expander, ExpansionProgress, ExpansionRequest, ForestStats, RoundStats, service,
};
use taxogen_shared::{
    AppConfig, Children, Depth, ExpansionConfig, Forest, ForestDocument, Principal, TaxonomyId,
    database_path, init_config, load_config,
};
use taxogen_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// taxogen: grow three-level taxonomies with an LLM classifier.
#[derive(Parser)]
#[command(
    name = "taxogen",
    version,
    about = "Grow category / subcategory / sub-subcategory taxonomies with an LLM classifier.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Principal that owns the taxonomies being worked on.
    #[arg(long, env = "TAXOGEN_OWNER", global = true)]
    pub owner: Option<String>,

    /// Database file (overrides `defaults.database_path`).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Level whose nodes should all be marked for expansion.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum Level {
    Category,
    Subcategory,
}

impl From<Level> for Depth {
    fn from(level: Level) -> Self {
        match level {
            Level::Category => Depth::Category,
            Level::Subcategory => Depth::Subcategory,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Create an empty taxonomy for a domain.
    Create {
        /// Domain name, e.g. "Animals". Seeds the first level.
        domain: String,

        /// Free-text context sent with every classification call.
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// List your taxonomies.
    List,

    /// Print a taxonomy's tree.
    Show {
        id: TaxonomyId,

        /// Print the full record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Mark nodes as wanting children on the next expansion.
    Request {
        id: TaxonomyId,

        /// Slash-separated node path, e.g. "Mammals/Rodentia".
        #[arg(long, conflicts_with = "all_at")]
        path: Option<String>,

        /// Mark every node at this level.
        #[arg(long, value_enum)]
        all_at: Option<Level>,
    },

    /// Run expansion rounds until nothing is pending.
    Expand {
        id: TaxonomyId,

        /// Maximum number of rounds.
        #[arg(long, default_value_t = 1)]
        rounds: u32,

        /// Maximum classification calls in flight (overrides config).
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Replace a taxonomy's tree from a JSON document.
    Import {
        id: TaxonomyId,

        /// File holding `{"categories": [...]}` or a bare category array.
        file: PathBuf,
    },

    /// Write a taxonomy's tree as a JSON document.
    Export {
        id: TaxonomyId,

        /// Output file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Delete a taxonomy.
    Delete { id: TaxonomyId },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "taxogen=info",
        1 => "taxogen=debug",
        _ => "taxogen=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Resolved global options shared by data commands.
struct Context {
    config: AppConfig,
    db: PathBuf,
    owner: Option<Principal>,
}

impl Context {
    fn resolve(cli: &Cli) -> Result<Self> {
        let config = load_config()?;
        let db = match &cli.db {
            Some(path) => path.clone(),
            None => database_path(&config)?,
        };
        let owner = cli
            .owner
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(Principal::new);
        Ok(Self { config, db, owner })
    }

    fn owner(&self) -> Result<&Principal> {
        self.owner
            .as_ref()
            .ok_or_else(|| eyre!("no owner given: pass --owner or set TAXOGEN_OWNER"))
    }

    async fn storage(&self) -> Result<Storage> {
        Ok(Storage::open(&self.db).await?)
    }

    async fn readonly_storage(&self) -> Result<Storage> {
        Ok(Storage::open_readonly(&self.db).await?)
    }
}

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        };
    }

    let ctx = Context::resolve(&cli)?;
    match cli.command {
        Command::Create {
            domain,
            description,
        } => cmd_create(&ctx, &domain, &description).await,
        Command::List => cmd_list(&ctx).await,
        Command::Show { id, json } => cmd_show(&ctx, &id, json).await,
        Command::Request { id, path, all_at } => {
            cmd_request(&ctx, &id, path.as_deref(), all_at).await
        }
        Command::Expand {
            id,
            rounds,
            concurrency,
        } => cmd_expand(&ctx, &id, rounds, concurrency).await,
        Command::Import { id, file } => cmd_import(&ctx, &id, &file).await,
        Command::Export { id, out } => cmd_export(&ctx, &id, out.as_deref()).await,
        Command::Delete { id } => cmd_delete(&ctx, &id).await,
        Command::Config { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_create(ctx: &Context, domain: &str, description: &str) -> Result<()> {
    let owner = ctx.owner()?;
    let storage = ctx.storage().await?;
    let taxonomy = service::create_taxonomy(&storage, owner, domain, description).await?;

    println!();
    println!("  Taxonomy created!");
    println!("  ID:     {}", taxonomy.id);
    println!("  Domain: {}", taxonomy.domain);
    println!();
    println!("  Next: taxogen expand {}", taxonomy.id);
    println!();
    Ok(())
}

async fn cmd_list(ctx: &Context) -> Result<()> {
    let owner = ctx.owner()?;
    if !ctx.db.exists() {
        println!("No taxonomies yet.");
        return Ok(());
    }
    let storage = ctx.readonly_storage().await?;
    let taxonomies = service::list_taxonomies(&storage, owner).await?;
    info!(count = taxonomies.len(), "listed taxonomies");

    if taxonomies.is_empty() {
        println!("No taxonomies yet.");
        return Ok(());
    }

    println!("{:<38}  {:<24}  UPDATED", "ID", "DOMAIN");
    for t in taxonomies {
        println!(
            "{:<38}  {:<24}  {}",
            t.id,
            t.domain,
            t.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_show(ctx: &Context, id: &TaxonomyId, json: bool) -> Result<()> {
    let storage = ctx.readonly_storage().await?;
    let taxonomy = service::get_taxonomy(&storage, ctx.owner()?, id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&taxonomy)?);
        return Ok(());
    }

    let stats = ForestStats::of(&taxonomy.forest);
    println!();
    println!("  {} ({})", taxonomy.domain, taxonomy.id);
    if !taxonomy.description.is_empty() {
        println!("  {}", taxonomy.description);
    }
    println!(
        "  {} categories, {} subcategories, {} sub-subcategories, {} pending",
        stats.categories, stats.subcategories, stats.sub_subcategories, stats.pending
    );
    println!();
    print_forest(&taxonomy.forest);
    println!();
    Ok(())
}

async fn cmd_request(
    ctx: &Context,
    id: &TaxonomyId,
    path: Option<&str>,
    all_at: Option<Level>,
) -> Result<()> {
    let owner = ctx.owner()?;
    let storage = ctx.storage().await?;
    let mut forest = service::get_taxonomy(&storage, owner, id).await?.forest;

    let marked = match (path, all_at) {
        (Some(path), _) => {
            let segments: Vec<&str> = path.split('/').map(str::trim).collect();
            request_children(&mut forest, &segments)?;
            1
        }
        (None, Some(level)) => request_all(&mut forest, level.into()),
        (None, None) => return Err(eyre!("pass --path or --all-at")),
    };

    service::save_forest(&storage, owner, id, forest).await?;
    println!("Marked {marked} node(s) for expansion.");
    Ok(())
}

async fn cmd_expand(
    ctx: &Context,
    id: &TaxonomyId,
    rounds: u32,
    concurrency: Option<usize>,
) -> Result<()> {
    let owner = ctx.owner()?;
    let credential = resolve_api_key(&ctx.config)?;
    let classifier = Arc::new(OpenAiClassifier::new(&ctx.config.classifier)?);
    let storage = Arc::new(ctx.storage().await?);

    let mut expansion = ExpansionConfig::from(&ctx.config);
    if let Some(limit) = concurrency {
        expansion.concurrency = limit.max(1);
    }

    info!(%id, rounds, concurrency = expansion.concurrency, model = classifier.model(), "expanding taxonomy");

    let expander = Expander::new(classifier, storage.clone(), expansion);
    let mut forest = service::get_taxonomy(&storage, owner, id).await?.forest;
    let reporter = CliProgress::new();

    let mut completed = 0;
    for round in 1..=rounds.max(1) {
        if !forest.is_empty() && ForestStats::of(&forest).is_settled() {
            break;
        }
        reporter.phase(&format!("Round {round}"));

        let request = ExpansionRequest {
            taxonomy_id: *id,
            principal: owner.clone(),
            forest,
            credential: credential.clone(),
        };
        let outcome = expander
            .expand_with_shutdown(request, &reporter, shutdown_signal())
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                reporter.finish();
                return Err(e.into());
            }
        };

        reporter.round_done(round, &outcome.stats);
        forest = outcome.forest;
        completed += 1;
    }
    reporter.finish();

    let stats = ForestStats::of(&forest);
    println!();
    println!("  Expansion finished after {completed} round(s).");
    println!(
        "  {} categories, {} subcategories, {} sub-subcategories, {} pending",
        stats.categories, stats.subcategories, stats.sub_subcategories, stats.pending
    );
    println!();
    print_forest(&forest);
    println!();
    Ok(())
}

async fn cmd_import(ctx: &Context, id: &TaxonomyId, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("failed to read {}", file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .wrap_err_with(|| format!("{} is not valid JSON", file.display()))?;

    let forest: Forest = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        serde_json::from_value::<ForestDocument>(value)?.categories
    };

    let owner = ctx.owner()?;
    let storage = ctx.storage().await?;
    let saved = service::save_forest(&storage, owner, id, forest).await?;
    println!(
        "Imported {} categories into {}.",
        saved.forest.len(),
        saved.domain
    );
    Ok(())
}

async fn cmd_export(ctx: &Context, id: &TaxonomyId, out: Option<&Path>) -> Result<()> {
    let storage = ctx.readonly_storage().await?;
    let taxonomy = service::get_taxonomy(&storage, ctx.owner()?, id).await?;

    let document = serde_json::json!({
        "id": taxonomy.id,
        "domain": taxonomy.domain,
        "description": taxonomy.description,
        "categories": taxonomy.forest,
    });
    let rendered = serde_json::to_string_pretty(&document)?;

    match out {
        Some(path) => {
            std::fs::write(path, rendered)
                .wrap_err_with(|| format!("failed to write {}", path.display()))?;
            println!("Exported to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

async fn cmd_delete(ctx: &Context, id: &TaxonomyId) -> Result<()> {
    let owner = ctx.owner()?;
    let storage = ctx.storage().await?;
    service::delete_taxonomy(&storage, owner, id).await?;
    println!("Deleted {id}.");
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn print_forest(forest: &Forest) {
    if forest.is_empty() {
        println!("  (empty; expand to seed the first level)");
        return;
    }
    for category in forest.categories() {
        print_node(&category.name, &category.children, 1);
        for sub in category.children.nodes() {
            print_node(&sub.name, &sub.children, 2);
            for leaf in sub.children.nodes() {
                print_node(&leaf.name, &leaf.children, 3);
            }
        }
    }
}

fn print_node(name: &str, children: &Children, level: usize) {
    let indent = "  ".repeat(level);
    if children.is_requested() {
        println!("{indent}{name}  (pending)");
    } else {
        println!("{indent}{name}");
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn round_done(&self, round: u32, stats: &RoundStats) {
        self.spinner.println(format!(
            "  round {round}: {} calls, {} failed, {:.1}s",
            stats.calls_issued(),
            stats.calls_failed(),
            stats.elapsed.as_secs_f64()
        ));
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ExpansionProgress for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn node_classified(&self, label: &str, succeeded: bool, done: usize, total: usize) {
        if !succeeded {
            self.spinner.println(format!("  ✗ {label} (will retry next round)"));
        }
        self.spinner
            .set_message(format!("Classifying [{done}/{total}] {label}"));
    }
}
