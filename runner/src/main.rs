use clap::{Args, Parser, Subcommand};
use loader_entitlements::codesign::{Codesign, DEFAULT_CODESIGN, SigningIdentity};
use loader_entitlements::entitlements::{Divergence, EntitlementSet, loader_entitlements};
use loader_entitlements::evidence::ExecutableFingerprint;
use loader_entitlements::json_contract::{self, JsonResult};
use loader_entitlements::reader::{ReadError, read_entitlements};
use loader_entitlements::settings::{JsonSettings, MemorySettings, SettingsStore};
use loader_entitlements::target::{SigningTarget, TargetError};
use loader_entitlements::workflow::{
    Reconciler, ReconciliationOutcome, WriteGate, discharge_reapply,
};
use serde::Serialize;
use std::io::{self, BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const EXIT_INTERNAL: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[derive(Parser)]
#[command(
    name = "patch-entitlements",
    version,
    about = "Applies and verifies loader entitlements on an installed app's main executable"
)]
struct Cli {
    /// Signing tool to invoke
    #[arg(
        long,
        global = true,
        env = "LOADER_ENTITLEMENTS_CODESIGN",
        default_value = DEFAULT_CODESIGN
    )]
    codesign: PathBuf,

    /// Settings file holding the force-reapply flag
    #[arg(long, global = true, env = "LOADER_ENTITLEMENTS_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log filter, tracing EnvFilter syntax
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the entitlements currently embedded in an executable
    Show(TargetArgs),
    /// Compare an executable against the loader entitlements without writing
    Check(TargetArgs),
    /// Apply the loader entitlements if they are missing, then verify them
    Reconcile(ReconcileArgs),
    /// Make the next reconcile re-sign even if the entitlements look right
    RequestReapply,
}

#[derive(Args)]
struct TargetArgs {
    /// Main executable, usually <App>.app/Contents/MacOS/<name>
    executable: PathBuf,

    /// Bundle root; derived from the executable path when omitted
    #[arg(long)]
    bundle_root: Option<PathBuf>,
}

#[derive(Args)]
struct ReconcileArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Re-sign even when the entitlements already match
    #[arg(long)]
    force: bool,

    /// Skip the confirmation prompt
    #[arg(long, short = 'y')]
    yes: bool,

    /// Signing identity; `-` signs ad-hoc
    #[arg(long, default_value = "-")]
    identity: String,

    /// Directory for the transient entitlements plist
    #[arg(long)]
    scratch_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct TargetFailure {
    executable: String,
}

#[derive(Serialize)]
struct ShowReport {
    executable: String,
    bundle_root: String,
    has_entitlements: bool,
    entitlements: EntitlementSet,
}

#[derive(Serialize)]
struct CheckReport {
    executable: String,
    bundle_root: String,
    satisfied: bool,
    expected: EntitlementSet,
    divergences: Vec<Divergence>,
}

#[derive(Serialize)]
struct ReconcileReport {
    executable: String,
    bundle_root: String,
    identity: String,
    force: bool,
    expected: EntitlementSet,
    outcome: ReconciliationOutcome,
    reapply_discharged: bool,
    settings_cleared: bool,
    before: Option<ExecutableFingerprint>,
    after: Option<ExecutableFingerprint>,
    divergences: Vec<Divergence>,
}

#[derive(Serialize)]
struct ReapplyReport {
    settings_path: String,
    force_entitlement_reapplication: bool,
}

/// Confirmation on the controlling terminal. Without a terminal the user
/// must pass `--yes`.
struct TerminalConsent {
    assume_yes: bool,
}

impl WriteGate for TerminalConsent {
    fn approve(&self, target: &SigningTarget) -> Result<(), String> {
        if self.assume_yes {
            return Ok(());
        }
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Err("confirmation required; rerun with --yes".to_string());
        }
        eprintln!(
            "\
The loader needs to modify this application's code signature.

File to be modified: {}

Changes: enable DYLD environment variables, allow unsigned executable memory,
disable library validation, allow task port access.

Only this file's signature is replaced; nested frameworks and plugins keep theirs.",
            target.executable().display()
        );
        eprint!("Continue? [y/N] ");
        let mut line = String::new();
        stdin
            .lock()
            .read_line(&mut line)
            .map_err(|e| format!("failed to read confirmation: {e}"))?;
        match line.trim() {
            "y" | "Y" | "yes" | "YES" => Ok(()),
            _ => Err("user declined".to_string()),
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

fn emit_envelope<T: Serialize>(kind: &str, result: &JsonResult, data: &T) -> i32 {
    if let Err(err) = json_contract::print_envelope(kind, result, data) {
        eprintln!("{err}");
        return EXIT_INTERNAL;
    }
    result.exit_code
}

fn resolve_target(args: &TargetArgs) -> Result<SigningTarget, TargetError> {
    if let Some(root) = &args.bundle_root {
        return SigningTarget::new(root, &args.executable);
    }
    match SigningTarget::from_executable(&args.executable) {
        Err(TargetError::UnexpectedLayout(_)) => {
            let parent = args
                .executable
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            tracing::debug!(
                executable = %args.executable.display(),
                "not inside an app bundle; using the containing directory as bundle root"
            );
            SigningTarget::new(parent, &args.executable)
        }
        other => other,
    }
}

fn target_or_exit(kind: &str, args: &TargetArgs) -> Result<SigningTarget, i32> {
    resolve_target(args).map_err(|err| {
        tracing::error!("{err}");
        let data = TargetFailure {
            executable: args.executable.display().to_string(),
        };
        emit_envelope(kind, &JsonResult::failure(EXIT_USAGE, err.to_string()), &data)
    })
}

fn open_settings(path: Option<&Path>) -> Result<JsonSettings, String> {
    match path {
        Some(path) => Ok(JsonSettings::new(path)),
        None => JsonSettings::default_path()
            .map(JsonSettings::new)
            .map_err(|e| e.to_string()),
    }
}

fn run_show(tool: &Codesign, args: &TargetArgs) -> i32 {
    let target = match target_or_exit("entitlements_report", args) {
        Ok(target) => target,
        Err(code) => return code,
    };
    let (entitlements, has_entitlements) = match read_entitlements(tool, target.executable()) {
        Ok(set) => (set, true),
        Err(ReadError::NoData) => (EntitlementSet::new(), false),
        Err(err) => {
            let data = TargetFailure {
                executable: target.executable().display().to_string(),
            };
            let result = JsonResult::from_ok(false)
                .with_outcome(ReconciliationOutcome::ReadFailed.as_str())
                .with_error(err.to_string());
            return emit_envelope("entitlements_report", &result, &data);
        }
    };
    let report = ShowReport {
        executable: target.executable().display().to_string(),
        bundle_root: target.bundle_root().display().to_string(),
        has_entitlements,
        entitlements,
    };
    emit_envelope("entitlements_report", &JsonResult::from_ok(true), &report)
}

fn run_check(tool: &Codesign, args: &TargetArgs) -> i32 {
    let target = match target_or_exit("check_report", args) {
        Ok(target) => target,
        Err(code) => return code,
    };
    let reconciler = Reconciler::new(tool, loader_entitlements());
    let mut report = CheckReport {
        executable: target.executable().display().to_string(),
        bundle_root: target.bundle_root().display().to_string(),
        satisfied: false,
        expected: reconciler.expected().clone(),
        divergences: Vec::new(),
    };
    match reconciler.check(&target) {
        Ok(divergences) => {
            report.satisfied = divergences.is_empty();
            report.divergences = divergences;
            emit_envelope("check_report", &JsonResult::from_ok(report.satisfied), &report)
        }
        Err(err) => {
            let result = JsonResult::from_ok(false)
                .with_outcome(ReconciliationOutcome::ReadFailed.as_str())
                .with_error(err.to_string());
            emit_envelope("check_report", &result, &report)
        }
    }
}

fn run_reconcile(tool: &Codesign, settings_path: Option<&Path>, args: &ReconcileArgs) -> i32 {
    let target = match target_or_exit("reconcile_report", &args.target) {
        Ok(target) => target,
        Err(code) => return code,
    };

    let mut store: Box<dyn SettingsStore> = match open_settings(settings_path) {
        Ok(store) => Box::new(store),
        Err(err) => {
            tracing::warn!("settings unavailable ({err}); force-reapply flag not persisted");
            Box::new(MemorySettings::default())
        }
    };
    let persisted_force = match store.force_reapply() {
        Ok(flag) => flag,
        Err(err) => {
            tracing::error!("{err}");
            let data = TargetFailure {
                executable: target.executable().display().to_string(),
            };
            return emit_envelope(
                "reconcile_report",
                &JsonResult::failure(EXIT_USAGE, err.to_string()),
                &data,
            );
        }
    };
    let force = args.force || persisted_force;

    let mut reconciler = Reconciler::new(tool, loader_entitlements())
        .with_identity(SigningIdentity::new(args.identity.clone()));
    if let Some(dir) = &args.scratch_dir {
        reconciler = reconciler.with_scratch_dir(dir);
    }
    let gate = TerminalConsent {
        assume_yes: args.yes,
    };

    let mut report = ReconcileReport {
        executable: target.executable().display().to_string(),
        bundle_root: target.bundle_root().display().to_string(),
        identity: args.identity.clone(),
        force,
        expected: reconciler.expected().clone(),
        outcome: ReconciliationOutcome::ReadFailed,
        reapply_discharged: false,
        settings_cleared: false,
        before: None,
        after: None,
        divergences: Vec::new(),
    };

    let result = match reconciler.reconcile(&target, force, &gate) {
        Ok(done) => {
            report.outcome = done.outcome;
            report.reapply_discharged = done.reapply_discharged;
            report.settings_cleared = match discharge_reapply(store.as_mut(), &done) {
                Ok(cleared) => cleared,
                Err(err) => {
                    tracing::warn!("failed to clear entitlement re-application flag: {err}");
                    false
                }
            };
            report.before = done.before;
            report.after = done.after;
            JsonResult::from_ok(true).with_outcome(done.outcome.as_str())
        }
        Err(err) => {
            tracing::error!("{err}");
            report.outcome = err.outcome();
            report.divergences = err.divergences().to_vec();
            JsonResult::from_ok(false)
                .with_outcome(err.outcome().as_str())
                .with_error(err.to_string())
        }
    };
    emit_envelope("reconcile_report", &result, &report)
}

fn run_request_reapply(settings_path: Option<&Path>) -> i32 {
    let mut store = match open_settings(settings_path) {
        Ok(store) => store,
        Err(err) => {
            tracing::error!("{err}");
            return emit_envelope(
                "reapply_request",
                &JsonResult::failure(EXIT_USAGE, err),
                &serde_json::Value::Null,
            );
        }
    };
    let settings_path = store.path().display().to_string();
    if let Err(err) = store.set_force_reapply(true) {
        tracing::error!("{err}");
        let data = ReapplyReport {
            settings_path,
            force_entitlement_reapplication: false,
        };
        return emit_envelope(
            "reapply_request",
            &JsonResult::failure(EXIT_USAGE, err.to_string()),
            &data,
        );
    }
    tracing::info!("entitlements will be re-applied on the next reconcile");
    let data = ReapplyReport {
        settings_path,
        force_entitlement_reapplication: true,
    };
    emit_envelope("reapply_request", &JsonResult::from_ok(true), &data)
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let tool = Codesign::new(&cli.codesign);
    let settings_path = cli.settings.as_deref();
    let code = match &cli.command {
        Commands::Show(args) => run_show(&tool, args),
        Commands::Check(args) => run_check(&tool, args),
        Commands::Reconcile(args) => run_reconcile(&tool, settings_path, args),
        Commands::RequestReapply => run_request_reapply(settings_path),
    };
    std::process::exit(code);
}
