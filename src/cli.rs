use crate::{
    config::CoreConfig,
    conflicts::ConflictChecker,
    events::{CoreEvent, EventSink},
    extract::{is_archive_file, ArchiveExtractor},
    installer::{InstallOutcome, Installer},
    logging::{self, Verbosity},
    order_file::OrderFileManager,
    pak::PakEntryReader,
    profiles::{ProfilesService, DEFAULT_PROFILE},
    prompt::{Headless, NoticeLevel, Prompt},
    unit::ModUnit,
};
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::{
    io::{self, BufRead, IsTerminal, Write},
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_CONTEXT: &str = "default";

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

struct GlobalOptions {
    config: Option<PathBuf>,
    verbosity: Verbosity,
    format: OutputFormat,
    context: String,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Install(Vec<PathBuf>),
    InstallFolder(PathBuf),
    Update { id: String, archive: PathBuf },
    List,
    Conflicts,
    OrderTracking(bool),
    Consolidate,
    Backup(Option<String>),
    ProfilesList,
    ProfilesSave(String),
    ProfilesApply(String),
    ProfilesDelete(String),
    Rename { id: String, name: String },
    Delete(String),
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, command) = parse_args(&args)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("modwright v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let config_path = match &global.config {
                Some(path) => path.clone(),
                None => CoreConfig::default_location()?,
            };
            let config = CoreConfig::load_or_create(&config_path)?;
            config.ensure_dirs()?;
            logging::init(&config.log_path(), global.verbosity)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("start runtime")?;
            runtime.block_on(async {
                let mut core = Core::open(config, &global)?;
                let result = core.run_command(command).await;
                core.drain_events();
                result
            })
        }
    }
}

fn parse_args(args: &[String]) -> Result<(GlobalOptions, CliCommand)> {
    let (global, tokens) = parse_global_options(args)?;
    let command = parse_command(&tokens)?;
    Ok((global, command))
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut options = GlobalOptions {
        config: None,
        verbosity: Verbosity::Normal,
        format: OutputFormat::Text,
        context: DEFAULT_CONTEXT.to_string(),
    };
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter.next().ok_or_else(|| anyhow!("--config requires a path"))?;
                options.config = Some(PathBuf::from(value));
            }
            value if value.starts_with("--config=") => {
                options.config = Some(PathBuf::from(value.trim_start_matches("--config=")));
            }
            "--context" => {
                let value = iter.next().ok_or_else(|| anyhow!("--context requires a name"))?;
                options.context = value.to_string();
            }
            value if value.starts_with("--context=") => {
                options.context = value.trim_start_matches("--context=").to_string();
            }
            "--json" => options.format = OutputFormat::Json,
            "--format" => {
                let value = iter.next().ok_or_else(|| anyhow!("--format requires a value"))?;
                options.format = OutputFormat::parse(value)
                    .ok_or_else(|| anyhow!("Unknown format: {value} (use 'json' or 'text')"))?;
            }
            "-q" | "--quiet" => options.verbosity = Verbosity::Quiet,
            "--verbose" => options.verbosity = Verbosity::Verbose,
            "--verbosity" => {
                let level = iter.next().ok_or_else(|| anyhow!("--verbosity requires a level"))?;
                options.verbosity = Verbosity::parse(level)
                    .ok_or_else(|| anyhow!("Unknown verbosity: {level}"))?;
            }
            value if value.starts_with("-v") && value.chars().skip(1).all(|ch| ch == 'v') => {
                let count = value.chars().filter(|ch| *ch == 'v').count();
                options.verbosity = if count >= 2 {
                    Verbosity::Debug
                } else {
                    Verbosity::Verbose
                };
            }
            _ => tokens.push(arg.to_string()),
        }
    }
    Ok((options, tokens))
}

fn parse_command(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let rest = &tokens[1..];
    let arg = |index: usize, what: &str| -> Result<String> {
        rest.get(index)
            .cloned()
            .ok_or_else(|| anyhow!("{head} requires {what}"))
    };
    let command = match head.as_str() {
        "help" | "--help" | "-h" => CliCommand::Help,
        "version" | "--version" | "-V" => CliCommand::Version,
        "install" => {
            if rest.is_empty() {
                bail!("install requires one or more archives");
            }
            CliCommand::Install(rest.iter().map(PathBuf::from).collect())
        }
        "install-folder" => CliCommand::InstallFolder(PathBuf::from(arg(0, "a folder")?)),
        "update" => CliCommand::Update {
            id: arg(0, "a unit id")?,
            archive: PathBuf::from(arg(1, "an archive")?),
        },
        "list" => CliCommand::List,
        "conflicts" => CliCommand::Conflicts,
        "order-tracking" => match arg(0, "'on' or 'off'")?.as_str() {
            "on" => CliCommand::OrderTracking(true),
            "off" => CliCommand::OrderTracking(false),
            other => bail!("Unknown order-tracking value: {other} (use 'on' or 'off')"),
        },
        "consolidate" => CliCommand::Consolidate,
        "backup" => {
            let reason = rest.join(" ");
            CliCommand::Backup(if reason.trim().is_empty() {
                None
            } else {
                Some(reason)
            })
        }
        "profiles" => {
            let sub = rest.first().map(String::as_str).unwrap_or("list");
            let name = || {
                let joined = rest.get(1..).unwrap_or(&[]).join(" ");
                if joined.trim().is_empty() {
                    Err(anyhow!("profiles {sub} requires a name"))
                } else {
                    Ok(joined)
                }
            };
            match sub {
                "list" => CliCommand::ProfilesList,
                "save" => CliCommand::ProfilesSave(name()?),
                "apply" => CliCommand::ProfilesApply(name()?),
                "delete" => CliCommand::ProfilesDelete(name()?),
                _ => bail!("Unknown profiles command: {sub} (use 'list', 'save', 'apply' or 'delete')"),
            }
        }
        "rename" => {
            let id = arg(0, "a unit id")?;
            let name = rest.get(1..).unwrap_or(&[]).join(" ");
            if name.trim().is_empty() {
                bail!("rename requires a new name");
            }
            CliCommand::Rename { id, name }
        }
        "delete" => CliCommand::Delete(arg(0, "a unit id")?),
        other => bail!("Unknown command: {other} (see 'modwright help')"),
    };
    Ok(command)
}

/// Asks on the terminal; declines everything when stdin is not a terminal.
struct TerminalPrompt {
    interactive: bool,
}

impl TerminalPrompt {
    fn new() -> Self {
        Self {
            interactive: io::stdin().is_terminal(),
        }
    }

    fn ask(&self, question: &str) -> Option<String> {
        if !self.interactive {
            return None;
        }
        eprint!("{question} ");
        let _ = io::stderr().flush();
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;
        Some(line.trim().to_string())
    }
}

impl Prompt for TerminalPrompt {
    fn confirm(&self, title: &str, message: &str) -> bool {
        match self.ask(&format!("{title}: {message} [y/N]")) {
            Some(answer) => matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"),
            None => Headless.confirm(title, message),
        }
    }

    fn request_number(&self, title: &str, message: &str) -> Option<i64> {
        match self.ask(&format!("{title}: {message}")) {
            Some(answer) => answer.parse().ok(),
            None => Headless.request_number(title, message),
        }
    }

    fn notify(&self, level: NoticeLevel, message: &str) {
        Headless.notify(level, message);
        match level {
            NoticeLevel::Info => {}
            NoticeLevel::Warn => eprintln!("Warning: {message}"),
            NoticeLevel::Error => eprintln!("Error: {message}"),
        }
    }
}

struct Core {
    config: CoreConfig,
    context: String,
    format: OutputFormat,
    orders: Arc<OrderFileManager>,
    installer: Installer,
    profiles: ProfilesService,
    checker: ConflictChecker,
    events: Receiver<CoreEvent>,
    cancel: CancellationToken,
}

impl Core {
    fn open(config: CoreConfig, global: &GlobalOptions) -> Result<Self> {
        let prompt: Arc<dyn Prompt> = Arc::new(TerminalPrompt::new());
        let orders = Arc::new(OrderFileManager::new(&config, prompt.clone()));
        orders
            .consolidate(config.order_tracking_enabled, &config.mods_root)
            .context("repair order files")?;

        let (tx, events) = mpsc::channel();
        let shared = Arc::new(config.clone());
        let installer = Installer::new(
            shared.clone(),
            Arc::new(ArchiveExtractor),
            prompt,
            orders.clone(),
        )
        .with_events(EventSink::new(tx.clone()));
        let profiles = ProfilesService::new(&config, orders.clone(), &global.context)?
            .with_events(EventSink::new(tx));
        let checker = ConflictChecker::new(Arc::new(PakEntryReader), &config);
        Ok(Self {
            config,
            context: global.context.clone(),
            format: global.format,
            orders,
            installer,
            profiles,
            checker,
            events,
            cancel: CancellationToken::new(),
        })
    }

    async fn load(&self) -> Result<Vec<ModUnit>> {
        self.installer.load_async(self.cancel.clone()).await
    }

    async fn run_command(&mut self, command: CliCommand) -> Result<()> {
        match command {
            CliCommand::Install(paths) => {
                for path in paths {
                    if !is_archive_file(&path) {
                        println!("Skipped {}: not a zip, 7z or rar archive", path.display());
                        continue;
                    }
                    let outcome = self
                        .installer
                        .install_archive_async(path.clone(), self.cancel.clone())
                        .await?;
                    self.report_install(&path, outcome).await?;
                }
                Ok(())
            }
            CliCommand::InstallFolder(path) => {
                let outcome = self.installer.install_folder(&path, &self.cancel)?;
                self.report_install(&path, outcome).await
            }
            CliCommand::Update { id, archive } => {
                match self.installer.install_update(&archive, &id, &self.cancel)? {
                    InstallOutcome::Installed(unit) => {
                        println!("Updated {} to {}", unit.id, unit.version)
                    }
                    InstallOutcome::Rejected(reason) => {
                        println!("Skipped {}: {reason}", archive.display())
                    }
                }
                Ok(())
            }
            CliCommand::List => {
                let units = self.load().await?;
                self.print_units(&units)
            }
            CliCommand::Conflicts => {
                let units = self.load().await?;
                let groups = self.checker.analyze_async(units, self.cancel.clone()).await?;
                match self.format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&groups)?),
                    OutputFormat::Text => {
                        if groups.is_empty() {
                            println!("No conflicts.");
                        }
                        for group in groups {
                            println!("{}", group.packed_path);
                            for owner in group.owners {
                                let external = if owner.is_externally_managed {
                                    " (external)"
                                } else {
                                    ""
                                };
                                println!("    {} [{}]{external}", owner.name, owner.id);
                            }
                        }
                    }
                }
                Ok(())
            }
            CliCommand::OrderTracking(enabled) => {
                self.orders.apply_setting(enabled, &self.config.mods_root)?;
                self.config.order_tracking_enabled = enabled;
                self.config.save()?;
                println!(
                    "Order tracking {}",
                    if enabled { "enabled" } else { "disabled" }
                );
                Ok(())
            }
            CliCommand::Consolidate => {
                self.orders
                    .consolidate(self.config.order_tracking_enabled, &self.config.mods_root)?;
                println!(
                    "Order file: {}",
                    self.orders.authoritative_path(&self.config.mods_root).display()
                );
                Ok(())
            }
            CliCommand::Backup(reason) => {
                let path = self.installer.create_backup(reason.as_deref())?;
                println!("Backup written to {}", path.display());
                Ok(())
            }
            CliCommand::ProfilesList => {
                let units = self.load().await?;
                self.profiles.ensure_default_profile(&units)?;
                let profiles = self.profiles.list()?;
                match self.format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&profiles)?)
                    }
                    OutputFormat::Text => {
                        for profile in profiles {
                            println!(
                                "{} ({} of {} enabled)",
                                profile.name,
                                profile.active_ids.len(),
                                profile.load_order.len()
                            );
                        }
                    }
                }
                Ok(())
            }
            CliCommand::ProfilesSave(name) => {
                let units = self.load().await?;
                let profile = self.profiles.create_from_current_state(&name, &units);
                let path = self.profiles.save(&profile)?;
                println!("Saved profile {name} to {}", path.display());
                Ok(())
            }
            CliCommand::ProfilesApply(name) => {
                let profile = self
                    .profiles
                    .load(&name)?
                    .ok_or_else(|| anyhow!("Unknown profile: {name}"))?;
                let mut units = self.load().await?;
                self.profiles.apply(&profile, &mut units);
                self.profiles
                    .write_to_game_folder(&self.config.mods_root, &units)?;
                self.activate_profile(&profile.name)?;
                println!("Applied profile {name}");
                self.print_units(&units)
            }
            CliCommand::ProfilesDelete(name) => {
                if self.profiles.delete(&name)? {
                    if self.profiles.active_name() == name.trim() {
                        self.activate_profile(DEFAULT_PROFILE)?;
                    }
                    println!("Deleted profile {name}");
                } else {
                    println!("Profile {name} was not deleted");
                }
                Ok(())
            }
            CliCommand::Rename { id, name } => {
                let mut units = self.load().await?;
                let renamed = self.installer.rename_unit(&mut units, &id, &name)?;
                if renamed.id != id {
                    let migrated = self.profiles.migrate_id(&id, &renamed.id)?;
                    debug!(migrated, "profiles migrated");
                }
                self.profiles.save_active(&units)?;
                println!("Renamed {id} to {} ({})", renamed.id, renamed.name);
                Ok(())
            }
            CliCommand::Delete(id) => {
                let mut units = self.load().await?;
                let removed = self.installer.delete_unit(&mut units, &id)?;
                self.profiles.save_active(&units)?;
                println!("Deleted {} ({})", removed.id, removed.path.display());
                Ok(())
            }
            CliCommand::Help | CliCommand::Version => Ok(()),
        }
    }

    /// Enables a freshly installed unit and keeps the active profile in step
    /// with the order file.
    async fn report_install(&self, source: &std::path::Path, outcome: InstallOutcome) -> Result<()> {
        match outcome {
            InstallOutcome::Installed(unit) => {
                let mut units = self.load().await?;
                if let Some(index) = units.iter().position(|candidate| candidate.id == unit.id) {
                    let mut installed = units.remove(index);
                    installed.is_enabled = true;
                    let listed = units.iter().filter(|candidate| candidate.number > 0).count();
                    installed.number = listed + 1;
                    units.insert(listed, installed);
                }
                self.installer.save_order(&units)?;
                self.profiles.ensure_default_profile(&units)?;
                self.profiles.save_active(&units)?;
                println!("Installed {} {} as {}", unit.name, unit.version, unit.id);
            }
            InstallOutcome::Rejected(reason) => {
                println!("Skipped {}: {reason}", source.display());
            }
        }
        Ok(())
    }

    fn activate_profile(&mut self, name: &str) -> Result<()> {
        self.profiles.set_active(name)?;
        self.config.set_active_profile(&self.context, name.trim());
        self.config.save()
    }

    fn print_units(&self, units: &[ModUnit]) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let items: Vec<UnitListItem> = units.iter().map(UnitListItem::from).collect();
                println!("{}", serde_json::to_string_pretty(&items)?);
            }
            OutputFormat::Text => {
                for unit in units {
                    let order = if unit.number == 0 {
                        "-".to_string()
                    } else {
                        unit.number.to_string()
                    };
                    let enabled = if unit.is_enabled { "x" } else { " " };
                    let external = if unit.is_externally_managed {
                        " (external)"
                    } else {
                        ""
                    };
                    println!(
                        "{order:>3} [{enabled}] {id:<24} {version:<10} {name}{external}",
                        id = unit.id,
                        version = unit.version,
                        name = unit.display_name()
                    );
                }
            }
        }
        Ok(())
    }

    fn drain_events(&self) {
        while let Ok(event) = self.events.try_recv() {
            debug!(?event, "core event");
        }
    }
}

#[derive(Serialize)]
struct UnitListItem {
    id: String,
    name: String,
    version: String,
    order: Option<usize>,
    enabled: bool,
    upstream_number: i64,
    externally_managed: bool,
    category: Option<u32>,
    note: Option<String>,
}

impl From<&ModUnit> for UnitListItem {
    fn from(unit: &ModUnit) -> Self {
        Self {
            id: unit.id.clone(),
            name: unit.name.clone(),
            version: unit.version.clone(),
            order: (unit.number > 0).then_some(unit.number),
            enabled: unit.is_enabled,
            upstream_number: unit.upstream_number,
            externally_managed: unit.is_externally_managed,
            category: unit.category_id,
            note: unit.note.clone(),
        }
    }
}

fn print_help() {
    println!("modwright v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  modwright install <archive...>         Install archives");
    println!("  modwright install-folder <dir>         Install a loose folder");
    println!("  modwright update <id> <archive>        Lay an archive over an installed unit");
    println!("  modwright list                         List units in load order");
    println!("  modwright conflicts                    List packed paths shipped by several units");
    println!("  modwright order-tracking <on|off>      Switch the live order file");
    println!("  modwright consolidate                  Repair order files after a crash");
    println!("  modwright backup [reason]              Copy units and side tables");
    println!("  modwright profiles list                List profiles");
    println!("  modwright profiles save <name>         Snapshot the current order");
    println!("  modwright profiles apply <name>        Restore a snapshot");
    println!("  modwright profiles delete <name>       Delete a snapshot");
    println!("  modwright rename <id> <new name>       Rename a unit and its id");
    println!("  modwright delete <id>                  Remove a unit");
    println!();
    println!("Global options:");
    println!("  --config <path>                        Config file (default: data dir)");
    println!("  --context <name>                       Profile context (default: {DEFAULT_CONTEXT})");
    println!("  --json, --format <json|text>           Output format for list commands");
    println!("  -q, --quiet                            Errors only");
    println!("  -v, -vv                                Increase verbosity");
    println!("  --verbosity <level>                    quiet | normal | verbose | debug");
    println!("  -h, --help                             Show help");
    println!("  -V, --version                          Show version");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn global_flags_are_pulled_out_anywhere() {
        let (global, command) = parse_args(&args(&[
            "-vv",
            "list",
            "--json",
            "--config=/tmp/c.json",
            "--context",
            "Act 2",
        ]))
        .unwrap();
        assert_eq!(command, CliCommand::List);
        assert!(global.verbosity == Verbosity::Debug);
        assert!(global.format == OutputFormat::Json);
        assert_eq!(global.config, Some(PathBuf::from("/tmp/c.json")));
        assert_eq!(global.context, "Act 2");
    }

    #[test]
    fn commands_and_arguments() {
        let (_, command) = parse_args(&args(&["install", "a.zip", "b.7z"])).unwrap();
        assert_eq!(
            command,
            CliCommand::Install(vec![PathBuf::from("a.zip"), PathBuf::from("b.7z")])
        );
        let (_, command) = parse_args(&args(&["rename", "old_id", "Shiny", "New"])).unwrap();
        assert_eq!(
            command,
            CliCommand::Rename {
                id: "old_id".to_string(),
                name: "Shiny New".to_string()
            }
        );
        let (_, command) = parse_args(&args(&["profiles", "save", "Run", "2"])).unwrap();
        assert_eq!(command, CliCommand::ProfilesSave("Run 2".to_string()));
        let (_, command) = parse_args(&args(&["order-tracking", "off"])).unwrap();
        assert_eq!(command, CliCommand::OrderTracking(false));
        let (_, command) = parse_args(&args(&[])).unwrap();
        assert_eq!(command, CliCommand::Help);
    }

    #[test]
    fn bad_input_is_reported() {
        assert!(parse_args(&args(&["install"])).is_err());
        assert!(parse_args(&args(&["update", "id"])).is_err());
        assert!(parse_args(&args(&["order-tracking", "maybe"])).is_err());
        assert!(parse_args(&args(&["profiles", "apply"])).is_err());
        assert!(parse_args(&args(&["frobnicate"])).is_err());
        assert!(parse_args(&args(&["--verbosity", "loud", "list"])).is_err());
    }
}
