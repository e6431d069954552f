use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use backlog::builder::{BuildOptions, export_items_markdown};
use backlog::core::{Backlog, BacklogError, BacklogItem};
use backlog::edit::{ItemUpdate, toggle_criterion, update_item};
use backlog::query;
use backlog::surgery::{append_section_to_markdown, remove_section_from_markdown};
use backlog::{format_backlog, parse_backlog};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "backlog",
    about = "Read and edit Markdown backlogs without disturbing untouched text",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Backlog Markdown file to operate on.
    #[arg(short, long, global = true, env = "BACKLOG_FILE")]
    file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse the backlog and print its structure.
    Parse(ParseArgs),

    /// Re-serialize the backlog, keeping unmodified items verbatim.
    Format(WriteArgs),

    /// List backlog items, optionally filtered by type code.
    Items(ItemsArgs),

    /// List the type codes present in the file.
    Types,

    /// Flip one acceptance criterion of an item.
    Toggle(ToggleArgs),

    /// Apply a JSON patch of field updates to an item.
    Update(UpdateArgs),

    /// Print rebuilt Markdown for the given items.
    Export(ExportArgs),

    /// Remove the section hosting a type and renumber the rest.
    RemoveSection(SectionArgs),

    /// Append an empty section for a type.
    AddSection(SectionArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct WriteArgs {
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct ItemsArgs {
    /// Only list items of this type code (e.g. BUG).
    #[arg(long = "type")]
    item_type: Option<String>,
    /// Emit JSON instead of one line per item.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    /// Item id, e.g. BUG-001.
    id: String,
    /// Zero-based criterion index.
    index: usize,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    /// Item id, e.g. BUG-001.
    id: String,
    /// Field updates as a JSON object.
    #[arg(long)]
    json: String,
    #[command(flatten)]
    write: WriteArgs,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Item ids to export.
    #[arg(required = true)]
    ids: Vec<String>,
    /// Prefix for screenshot links.
    #[arg(long, env = "BACKLOG_SCREENSHOT_BASE")]
    base_path: Option<String>,
}

#[derive(Debug, Args)]
struct SectionArgs {
    /// Type code, e.g. BUG or FEAT.
    item_type: String,
    #[command(flatten)]
    write: WriteArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let path = cli
        .file
        .context("no backlog file given (use --file or BACKLOG_FILE)")?;
    match cli.command {
        Commands::Parse(args) => handle_parse(&path, args),
        Commands::Format(args) => handle_format(&path, args),
        Commands::Items(args) => handle_items(&path, args),
        Commands::Types => handle_types(&path),
        Commands::Toggle(args) => handle_toggle(&path, args),
        Commands::Update(args) => handle_update(&path, args),
        Commands::Export(args) => handle_export(&path, args),
        Commands::RemoveSection(args) => handle_remove_section(&path, args),
        Commands::AddSection(args) => handle_add_section(&path, args),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "backlog=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_markdown(path: &Path) -> Result<String> {
    debug!(path = %path.display(), "reading backlog");
    fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
}

fn load(path: &Path) -> Result<Backlog> {
    Ok(parse_backlog(&read_markdown(path)?))
}

/// Write `text` back to `path` or print it.
fn emit(path: &Path, text: &str, in_place: bool) -> Result<()> {
    if in_place {
        fs::write(path, text.as_bytes()).with_context(|| format!("writing {:?}", path))?;
        info!(path = %path.display(), "updated");
    } else {
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn handle_parse(path: &Path, args: ParseArgs) -> Result<()> {
    let backlog = load(path)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&backlog)?);
    } else {
        println!("{:#?}", backlog);
    }
    Ok(())
}

fn handle_format(path: &Path, args: WriteArgs) -> Result<()> {
    let backlog = load(path)?;
    emit(path, &format_backlog(&backlog), args.in_place)
}

fn handle_items(path: &Path, args: ItemsArgs) -> Result<()> {
    let backlog = load(path)?;
    let items = match &args.item_type {
        Some(code) => query::items_by_type(&backlog, &code.to_uppercase()),
        None => query::all_items(&backlog),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    for item in items {
        println!("{}", item_line(item));
    }
    Ok(())
}

fn item_line(item: &BacklogItem) -> String {
    let done = item.criteria.iter().filter(|c| c.checked).count();
    let mut line = format!("{}\t{}", item.id, item.title);
    if let Some(severity) = &item.severity {
        line.push_str(&format!("\t{severity}"));
    }
    if !item.criteria.is_empty() {
        line.push_str(&format!("\t[{done}/{}]", item.criteria.len()));
    }
    line
}

fn handle_types(path: &Path) -> Result<()> {
    for code in query::detect_types_from_markdown(&read_markdown(path)?) {
        println!("{code}");
    }
    Ok(())
}

fn handle_toggle(path: &Path, args: ToggleArgs) -> Result<()> {
    let mut backlog = load(path)?;
    let item = backlog.item(&args.id)?;
    if args.index >= item.criteria.len() {
        return Err(BacklogError::CriterionOutOfRange {
            id: args.id,
            index: args.index,
            len: item.criteria.len(),
        }
        .into());
    }
    let toggled = toggle_criterion(item, args.index);
    debug!(id = %toggled.id, index = args.index, checked = toggled.criteria[args.index].checked, "toggled");
    backlog.replace_item(toggled);
    emit(path, &format_backlog(&backlog), args.write.in_place)
}

fn handle_update(path: &Path, args: UpdateArgs) -> Result<()> {
    let updates: ItemUpdate =
        serde_json::from_str(&args.json).context("parsing --json field updates")?;
    let mut backlog = load(path)?;
    let updated = update_item(backlog.item(&args.id)?, &updates);
    backlog.replace_item(updated);
    emit(path, &format_backlog(&backlog), args.write.in_place)
}

fn handle_export(path: &Path, args: ExportArgs) -> Result<()> {
    let backlog = load(path)?;
    let items = args
        .ids
        .iter()
        .map(|id| backlog.item(id))
        .collect::<Result<Vec<_>, _>>()?;
    let options = BuildOptions {
        base_path: args.base_path,
    };
    print!("{}", export_items_markdown(&items, &options));
    Ok(())
}

fn handle_remove_section(path: &Path, args: SectionArgs) -> Result<()> {
    let markdown = read_markdown(path)?;
    let edited = remove_section_from_markdown(&markdown, &args.item_type);
    if edited == markdown {
        return Err(BacklogError::SectionNotFound(args.item_type).into());
    }
    emit(path, &edited, args.write.in_place)
}

fn handle_add_section(path: &Path, args: SectionArgs) -> Result<()> {
    let markdown = read_markdown(path)?;
    let edited = append_section_to_markdown(&markdown, &args.item_type);
    emit(path, &edited, args.write.in_place)
}
