use std::collections::BTreeMap;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_genome_registry::catalog::{self, HttpCatalog};
use kira_genome_registry::config::RegistryConfig;
use kira_genome_registry::domain::AssetRef;
use kira_genome_registry::error::RegistryError;
use kira_genome_registry::fetch::{ArchiveExtractor, HttpFetcher};
use kira_genome_registry::output::{JsonOutput, OutputMode, StderrProgress};
use kira_genome_registry::pull::{
    OverwritePolicy, ProgressSink, PullOptions, PullOutcome, PullReport, Puller,
};
use kira_genome_registry::registry::{Registry, ServerAction, TagEdit, TagMetadata};
use kira_genome_registry::seqcol::Comparison;

#[derive(Parser)]
#[command(name = "kira-gr")]
#[command(about = "Local registry of versioned reference genome assets")]
#[command(version, author)]
struct Cli {
    /// Registry file (defaults to $KIRA_GR_REGISTRY, then ~/.kira-gr/registry.json)
    #[arg(long, short = 'c', global = true)]
    registry: Option<String>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create a new registry file")]
    Init(InitArgs),
    #[command(about = "Print the local path of an asset")]
    Seek(SeekArgs),
    #[command(about = "Print where a remote server hosts an asset")]
    Seekr(SeekrArgs),
    #[command(about = "Replace refgenie:// references in a file with asset paths")]
    Populate(PopulateArgs),
    #[command(about = "Print a sequence or region from a collection's fasta")]
    Getseq(GetseqArgs),
    #[command(about = "List local collections, assets and tags")]
    List(ListArgs),
    #[command(about = "List assets available from remote servers")]
    Listr(ListrArgs),
    #[command(about = "Register an artifact already on disk")]
    Add(AddArgs),
    #[command(about = "Remove a tag, or every tag of an asset")]
    Remove(RemoveArgs),
    #[command(about = "Rename a tag, edit its metadata or make it the default")]
    Tag(TagArgs),
    #[command(about = "Download assets from remote servers")]
    Pull(PullArgs),
    #[command(about = "Manage collection aliases")]
    Alias(AliasArgs),
    #[command(about = "Add servers to the registry")]
    Subscribe(SubscribeArgs),
    #[command(about = "Remove servers from the registry")]
    Unsubscribe(UnsubscribeArgs),
    #[command(about = "Compare the sequence collections of two collections")]
    Compare(CompareArgs),
    #[command(about = "Make asset relationships symmetric")]
    Repair,
    #[command(about = "Delete leftovers of interrupted pulls")]
    Prune,
}

#[derive(Args)]
struct InitArgs {
    #[arg(long = "server", short = 's')]
    servers: Vec<String>,

    #[arg(long)]
    data_dir: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct SeekArgs {
    /// collection/asset.seek_key:tag
    reference: String,

    /// Fail when the path does not exist
    #[arg(long)]
    strict: bool,

    /// Print the enclosing tag directory instead
    #[arg(long)]
    dir: bool,
}

#[derive(Args)]
struct SeekrArgs {
    /// collection/asset.seek_key:tag
    reference: String,

    /// Storage class the server should report, e.g. http or s3
    #[arg(long, default_value = catalog::DEFAULT_REMOTE_CLASS)]
    remote_class: String,
}

#[derive(Args)]
struct PopulateArgs {
    /// Input file, stdin when omitted
    file: Option<Utf8PathBuf>,

    /// Resolve references against remote servers
    #[arg(long)]
    remote: bool,

    #[arg(long, default_value = catalog::DEFAULT_REMOTE_CLASS)]
    remote_class: String,

    /// Treat the input as JSON and populate every string value
    #[arg(long, conflicts_with = "remote")]
    json_input: bool,
}

#[derive(Args)]
struct GetseqArgs {
    collection: String,

    /// name or name:start-end, 0-based and end-exclusive
    locus: String,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long, short = 'g')]
    collection: Option<String>,
}

#[derive(Args)]
struct ListrArgs {
    #[arg(long, short = 's')]
    server: Option<String>,

    /// Key collections by digest instead of alias
    #[arg(long)]
    digests: bool,
}

#[derive(Args)]
struct AddArgs {
    /// collection/asset:tag
    reference: String,

    path: Utf8PathBuf,

    /// Extra seek keys as key=relative/path
    #[arg(long = "seek-key", short = 'k', value_parser = parse_pair)]
    seek_keys: Vec<(String, String)>,

    #[arg(long, short = 'f')]
    force: bool,
}

#[derive(Args)]
struct RemoveArgs {
    /// collection/asset[:tag]
    reference: String,
}

#[derive(Args)]
struct TagArgs {
    /// collection/asset:tag
    reference: String,

    #[arg(long, conflicts_with_all = ["description", "seek_keys", "default"])]
    rename: Option<String>,

    #[arg(long)]
    description: Option<String>,

    #[arg(long = "seek-key", short = 'k', value_parser = parse_pair)]
    seek_keys: Vec<(String, String)>,

    #[arg(long, short = 'd')]
    default: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum OverwriteArg {
    Abort,
    Overwrite,
    Skip,
}

impl From<OverwriteArg> for OverwritePolicy {
    fn from(value: OverwriteArg) -> Self {
        match value {
            OverwriteArg::Abort => OverwritePolicy::Abort,
            OverwriteArg::Overwrite => OverwritePolicy::Overwrite,
            OverwriteArg::Skip => OverwritePolicy::Skip,
        }
    }
}

#[derive(Args)]
struct PullArgs {
    /// collection/asset[:tag], repeatable
    #[arg(required = true)]
    references: Vec<String>,

    #[arg(long, value_enum, default_value = "skip")]
    overwrite: OverwriteArg,

    /// Download archives above the size cutoff
    #[arg(long)]
    force_large: bool,

    #[arg(long)]
    size_cutoff: Option<f64>,

    /// Fail instead of pulling missing parent assets
    #[arg(long)]
    no_parents: bool,
}

#[derive(Args)]
struct AliasArgs {
    #[command(subcommand)]
    command: AliasCommand,
}

#[derive(Subcommand)]
enum AliasCommand {
    #[command(about = "Show the digest of an alias, or every collection")]
    Get { alias: Option<String> },
    #[command(about = "Point aliases at a digest")]
    Set {
        digest: String,
        #[arg(required = true)]
        aliases: Vec<String>,
        /// Drop the collection's other aliases
        #[arg(long)]
        reset: bool,
    },
    #[command(about = "Remove aliases of a collection, or all of them")]
    Remove {
        collection: String,
        aliases: Vec<String>,
    },
}

#[derive(Args)]
struct SubscribeArgs {
    #[arg(required = true)]
    servers: Vec<String>,

    /// Replace the server list instead of appending
    #[arg(long)]
    reset: bool,
}

#[derive(Args)]
struct UnsubscribeArgs {
    #[arg(required = true)]
    servers: Vec<String>,
}

#[derive(Args)]
struct CompareArgs {
    first: String,
    second: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<RegistryError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &RegistryError) -> u8 {
    match error {
        RegistryError::MissingCollection(_)
        | RegistryError::MissingAsset { .. }
        | RegistryError::MissingTag { .. }
        | RegistryError::MissingSeekKey { .. }
        | RegistryError::MissingFile { .. }
        | RegistryError::RegistryNotFound(_) => 2,
        RegistryError::Transport { .. }
        | RegistryError::TransportStatus { .. }
        | RegistryError::IncompatibleServer { .. }
        | RegistryError::AllServersFailed { .. }
        | RegistryError::DigestMismatch { .. }
        | RegistryError::MissingArchiveDigest { .. }
        | RegistryError::Provenance { .. } => 3,
        RegistryError::LockTimeout { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let config = RegistryConfig::resolve(cli.registry.as_deref()).map_err(miette::Report::new)?;

    match cli.command {
        Commands::Init(args) => run_init(args, config),
        command => {
            let registry = Registry::open(config).map_err(miette::Report::new)?;
            run_command(command, registry, output_mode)
        }
    }
}

fn run_populate(args: PopulateArgs, registry: &Registry) -> miette::Result<()> {
    let text = match &args.file {
        Some(path) => std::fs::read_to_string(path).into_diagnostic()?,
        None => std::io::read_to_string(std::io::stdin()).into_diagnostic()?,
    };
    let populated = if args.json_input {
        let value: serde_json::Value = serde_json::from_str(&text).into_diagnostic()?;
        let value = registry.populate_json(value).map_err(miette::Report::new)?;
        serde_json::to_string_pretty(&value).into_diagnostic()?
    } else if args.remote {
        let catalog = HttpCatalog::new().map_err(miette::Report::new)?;
        registry
            .populate_remote(&catalog, &text, &args.remote_class)
            .map_err(miette::Report::new)?
    } else {
        registry.populate(&text).map_err(miette::Report::new)?
    };
    print!("{populated}");
    if args.json_input {
        println!();
    }
    Ok(())
}

fn run_init(args: InitArgs, mut config: RegistryConfig) -> miette::Result<()> {
    if let Some(data_dir) = args.data_dir {
        config = config.with_data_dir(data_dir);
    }
    let servers = if args.servers.is_empty() {
        vec![kira_genome_registry::config::DEFAULT_SERVER.to_string()]
    } else {
        args.servers
    };
    let registry = Registry::initialize(config, servers).map_err(miette::Report::new)?;
    println!("{}", registry.path());
    Ok(())
}

fn run_command(
    command: Commands,
    mut registry: Registry,
    output_mode: OutputMode,
) -> miette::Result<()> {
    match command {
        Commands::Init(_) => Err(miette::Report::msg("registry already opened")),
        Commands::Seek(args) => {
            let reference = parse_reference(&args.reference)?;
            let collection = require_collection(&reference)?;
            let path = if args.dir {
                registry.seek_dir(collection, &reference.asset, reference.tag.as_deref())
            } else {
                registry.seek(
                    collection,
                    &reference.asset,
                    reference.tag.as_deref(),
                    reference.seek_key.as_deref(),
                    args.strict,
                )
            }
            .map_err(miette::Report::new)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_value(&path).into_diagnostic(),
                OutputMode::Human => {
                    println!("{path}");
                    Ok(())
                }
            }
        }
        Commands::Seekr(args) => {
            let reference = parse_reference(&args.reference)?;
            let collection = require_collection(&reference)?;
            let catalog = HttpCatalog::new().map_err(miette::Report::new)?;
            let path = registry
                .seekr(
                    &catalog,
                    collection,
                    &reference.asset,
                    reference.tag.as_deref(),
                    reference.seek_key.as_deref(),
                    &args.remote_class,
                )
                .map_err(miette::Report::new)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_value(&path).into_diagnostic(),
                OutputMode::Human => {
                    println!("{path}");
                    Ok(())
                }
            }
        }
        Commands::Populate(args) => run_populate(args, &registry),
        Commands::Getseq(args) => {
            let sequence = registry
                .get_sequence(&args.collection, &args.locus)
                .map_err(miette::Report::new)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_value(&sequence).into_diagnostic(),
                OutputMode::Human => {
                    println!("{sequence}");
                    Ok(())
                }
            }
        }
        Commands::List(args) => {
            let listing = registry.list(args.collection.as_deref()).map_err(miette::Report::new)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_listing(&listing).into_diagnostic(),
                OutputMode::Human => {
                    print_listing("Local", &listing);
                    Ok(())
                }
            }
        }
        Commands::Listr(args) => {
            let catalog = HttpCatalog::new().map_err(miette::Report::new)?;
            let listings = registry
                .list_remote(&catalog, args.server.as_deref(), args.digests)
                .map_err(miette::Report::new)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_remote(&listings).into_diagnostic(),
                OutputMode::Human => {
                    for listing in &listings {
                        println!("Server: {}", listing.server);
                        for (collection, entries) in &listing.collections {
                            println!("  {collection}: {}", entries.join(", "));
                        }
                    }
                    Ok(())
                }
            }
        }
        Commands::Add(args) => {
            let reference = parse_reference(&args.reference)?;
            let collection = require_collection(&reference)?;
            let seek_keys: BTreeMap<String, String> = args.seek_keys.into_iter().collect();
            let dir = registry
                .add(
                    collection,
                    &reference.asset,
                    reference.tag.as_deref(),
                    &args.path,
                    &seek_keys,
                    args.force,
                )
                .map_err(miette::Report::new)?;
            println!("{dir}");
            Ok(())
        }
        Commands::Remove(args) => {
            let reference = parse_reference(&args.reference)?;
            let collection = require_collection(&reference)?;
            let removed = registry
                .remove(collection, &reference.asset, reference.tag.as_deref())
                .map_err(miette::Report::new)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_value(&removed).into_diagnostic(),
                OutputMode::Human => {
                    for tag in removed {
                        println!("removed {collection}/{}:{tag}", reference.asset);
                    }
                    Ok(())
                }
            }
        }
        Commands::Tag(args) => run_tag(args, &mut registry),
        Commands::Pull(args) => run_pull(args, &mut registry, output_mode),
        Commands::Alias(args) => run_alias(args, &mut registry, output_mode),
        Commands::Subscribe(args) => {
            let action = if args.reset {
                ServerAction::Replace
            } else {
                ServerAction::Add
            };
            let servers = registry
                .update_servers(&args.servers, action)
                .map_err(miette::Report::new)?;
            print_servers(&servers, output_mode)
        }
        Commands::Unsubscribe(args) => {
            let servers = registry
                .update_servers(&args.servers, ServerAction::Remove)
                .map_err(miette::Report::new)?;
            print_servers(&servers, output_mode)
        }
        Commands::Compare(args) => {
            let comparison = registry
                .compare(&args.first, &args.second)
                .map_err(miette::Report::new)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_comparison(&comparison).into_diagnostic(),
                OutputMode::Human => {
                    print_comparison(&args.first, &args.second, &comparison);
                    Ok(())
                }
            }
        }
        Commands::Repair => {
            let repaired = registry.repair_relationships().map_err(miette::Report::new)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_value(&repaired).into_diagnostic(),
                OutputMode::Human => {
                    for (from, to) in &repaired {
                        println!("repaired {from} -> {to}");
                    }
                    println!("{} edge(s) repaired", repaired.len());
                    Ok(())
                }
            }
        }
        Commands::Prune => {
            let report = registry.prune_staging().map_err(miette::Report::new)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_prune(&report).into_diagnostic(),
                OutputMode::Human => {
                    for path in &report.removed {
                        println!("removed {path}");
                    }
                    for path in &report.unregistered {
                        println!("unregistered {path}");
                    }
                    Ok(())
                }
            }
        }
    }
}

fn run_tag(args: TagArgs, registry: &mut Registry) -> miette::Result<()> {
    let reference = parse_reference(&args.reference)?;
    let collection = require_collection(&reference)?;
    let tag = reference
        .tag
        .clone()
        .unwrap_or_else(|| registry.config().default_tag.clone());
    if let Some(new_name) = args.rename {
        registry
            .tag(collection, &reference.asset, &tag, TagEdit::Rename(new_name))
            .map_err(miette::Report::new)?;
        return Ok(());
    }
    if args.description.is_some() || !args.seek_keys.is_empty() {
        let metadata = TagMetadata {
            description: args.description,
            seek_keys: args.seek_keys.into_iter().collect(),
        };
        registry
            .tag(collection, &reference.asset, &tag, TagEdit::Metadata(metadata))
            .map_err(miette::Report::new)?;
    }
    if args.default {
        registry
            .set_default_tag(collection, &reference.asset, &tag)
            .map_err(miette::Report::new)?;
    }
    Ok(())
}

fn run_pull(args: PullArgs, registry: &mut Registry, output_mode: OutputMode) -> miette::Result<()> {
    let puller = Puller::new(
        HttpCatalog::new().map_err(miette::Report::new)?,
        HttpFetcher::new().map_err(miette::Report::new)?,
        ArchiveExtractor,
    );
    let options = PullOptions {
        overwrite: args.overwrite.into(),
        force_large: args.force_large,
        size_cutoff_gb: args
            .size_cutoff
            .unwrap_or(registry.config().size_cutoff_gb),
        pull_parents: !args.no_parents,
        ..PullOptions::default()
    };
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &StderrProgress,
    };

    let mut reports = Vec::new();
    for raw in &args.references {
        let reference = parse_reference(raw)?;
        let collection = require_collection(&reference)?;
        let report = puller
            .pull(
                registry,
                collection,
                &reference.asset,
                reference.tag.as_deref(),
                &options,
                sink,
            )
            .map_err(miette::Report::new)?;
        if matches!(output_mode, OutputMode::Human) {
            print_pull_summary(&report);
        }
        reports.push(report);
    }
    if matches!(output_mode, OutputMode::Json) {
        if let [only] = reports.as_slice() {
            JsonOutput::print_pull(only).into_diagnostic()?;
        } else {
            JsonOutput::print_value(&reports).into_diagnostic()?;
        }
    }
    Ok(())
}

fn run_alias(args: AliasArgs, registry: &mut Registry, output_mode: OutputMode) -> miette::Result<()> {
    match args.command {
        AliasCommand::Get { alias: Some(alias) } => {
            let digest = registry.resolve_alias(&alias).map_err(miette::Report::new)?;
            println!("{digest}");
            Ok(())
        }
        AliasCommand::Get { alias: None } => {
            let collections = registry.list_collections();
            match output_mode {
                OutputMode::Json => JsonOutput::print_value(&collections).into_diagnostic(),
                OutputMode::Human => {
                    for (digest, aliases) in &collections {
                        println!("{digest}: {}", aliases.join(", "));
                    }
                    Ok(())
                }
            }
        }
        AliasCommand::Set {
            digest,
            aliases,
            reset,
        } => {
            let update = registry
                .set_alias(&digest, &aliases, reset)
                .map_err(miette::Report::new)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_aliases(&update).into_diagnostic(),
                OutputMode::Human => {
                    if !update.set.is_empty() {
                        println!("set {} -> {digest}", update.set.join(", "));
                    }
                    if !update.removed.is_empty() {
                        println!("removed {}", update.removed.join(", "));
                    }
                    Ok(())
                }
            }
        }
        AliasCommand::Remove {
            collection,
            aliases,
        } => {
            let wanted = (!aliases.is_empty()).then_some(aliases.as_slice());
            let removed = registry
                .remove_aliases(&collection, wanted)
                .map_err(miette::Report::new)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_value(&removed).into_diagnostic(),
                OutputMode::Human => {
                    println!("removed {}", removed.join(", "));
                    Ok(())
                }
            }
        }
    }
}

fn parse_reference(raw: &str) -> miette::Result<AssetRef> {
    raw.parse::<AssetRef>().map_err(miette::Report::new)
}

fn require_collection(reference: &AssetRef) -> miette::Result<&str> {
    reference.collection.as_deref().ok_or_else(|| {
        miette::Report::new(RegistryError::InvalidRegistryPath(format!(
            "'{reference}' needs a collection, e.g. hg38/{}",
            reference.asset
        )))
    })
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn print_servers(servers: &[String], output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_value(&servers).into_diagnostic(),
        OutputMode::Human => {
            for server in servers {
                println!("{server}");
            }
            Ok(())
        }
    }
}

fn print_listing(label: &str, listing: &kira_genome_registry::registry::Listing) {
    println!("{label} collections: {}", listing.len());
    for (collection, assets) in listing {
        let entries: Vec<String> = assets
            .iter()
            .map(|(asset, tags)| format!("{asset}:[{}]", tags.join(", ")))
            .collect();
        println!("  {collection}: {}", entries.join(", "));
    }
}

fn print_pull_summary(report: &PullReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    let name = report.alias.as_deref().unwrap_or(&report.collection);
    let (label, color) = match report.outcome {
        PullOutcome::Downloaded => ("downloaded", cyan),
        PullOutcome::AlreadyCurrent => ("up to date", green),
        PullOutcome::Skipped => ("kept existing", yellow),
        PullOutcome::SkippedLarge => ("skipped, archive too large", yellow),
    };
    println!("{color}{name}/{}:{} {label}{reset}", report.asset, report.tag);
    if let Some(path) = &report.path {
        println!("{color}   {path}{reset}");
    }
    for warning in &report.warnings {
        println!("{yellow}   warning: {warning}{reset}");
    }
}

fn print_comparison(first: &str, second: &str, comparison: &Comparison) {
    let label = serde_json::to_value(comparison.compatibility)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();
    println!("{first} vs {second}: {label} (flags {:#06x})", comparison.flags);
}
