//! mycheckpoint - MySQL status sampler.
//!
//! Each invocation takes one sample of the server, stores it, purges
//! expired samples and evaluates alert conditions. Meant to run from cron.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{Level, debug, error, info};
use tracing_subscriber::EnvFilter;

use mycheckpoint_core::Context;
use mycheckpoint_core::collector::{Collector, MysqlSource, OsCollector, RealFs};
use mycheckpoint_core::config::Settings;
use mycheckpoint_core::notify::{LogNotifier, Notifier, SendmailNotifier};

/// MySQL status sampler with hourly/daily rollups and alerts.
#[derive(Parser)]
#[command(name = "mycheckpoint", about = "MySQL status sampler with rollups and alerts", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// TOML config file; command-line options override it.
    #[arg(short, long, env = "MYCHECKPOINT_CONF", value_name = "PATH")]
    conf: Option<PathBuf>,

    /// MySQL host.
    #[arg(short = 'H', long, env = "MYSQL_HOST")]
    host: Option<String>,

    /// MySQL TCP port.
    #[arg(short = 'P', long, env = "MYSQL_TCP_PORT")]
    port: Option<u16>,

    /// MySQL user.
    #[arg(short, long)]
    user: Option<String>,

    /// MySQL password.
    #[arg(short, long, env = "MYSQL_PWD", hide_env_values = true)]
    password: Option<String>,

    /// MySQL unix socket; overrides host and port.
    #[arg(short = 'S', long, env = "MYSQL_UNIX_PORT")]
    socket: Option<String>,

    /// Directory holding samples, alert state and metadata.
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Samples older than this many days are purged.
    #[arg(long)]
    purge_days: Option<u32>,

    /// Do not read master/slave status.
    #[arg(long)]
    skip_check_replication: bool,

    /// Do not evaluate alert conditions.
    #[arg(long)]
    skip_alerts: bool,

    /// Log notifications instead of mailing them.
    #[arg(long)]
    skip_emails: bool,

    /// Notification recipients (comma separated).
    #[arg(long, value_delimiter = ',', value_name = "ADDR")]
    mail_to: Vec<String>,

    /// Notification sender address.
    #[arg(long, value_name = "ADDR")]
    mail_from: Option<String>,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Take one sample (default).
    Collect,
    /// Create or upgrade the data directory.
    Deploy,
    /// Mail a plain-text report of recent activity.
    EmailBriefReport,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.mysql.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.mysql.port = port;
        }
        if let Some(user) = &self.user {
            settings.mysql.user = user.clone();
        }
        if self.password.is_some() {
            settings.mysql.password = self.password.clone();
        }
        if self.socket.is_some() {
            settings.mysql.socket = self.socket.clone();
        }
        if let Some(dir) = &self.data_dir {
            settings.data_dir = dir.clone();
        }
        if let Some(days) = self.purge_days {
            settings.purge_days = days;
        }
        settings.skip_check_replication |= self.skip_check_replication;
        settings.skip_alerts |= self.skip_alerts;
        settings.skip_emails |= self.skip_emails;
        if !self.mail_to.is_empty() {
            settings.mail.to = self.mail_to.clone();
        }
        if let Some(from) = &self.mail_from {
            settings.mail.from = from.clone();
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["mycheckpoint", "mycheckpoint_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn notifier(settings: &Settings) -> Box<dyn Notifier> {
    if settings.skip_emails {
        return Box::new(LogNotifier);
    }
    if settings.mail.to.is_empty() {
        debug!("no mail recipients configured, notifications are logged only");
        return Box::new(LogNotifier);
    }
    Box::new(SendmailNotifier::new(
        &settings.mail.sendmail,
        settings.mail.from.clone(),
        settings.mail.to.clone(),
    ))
}

fn run(args: Args) -> mycheckpoint_core::Result<()> {
    let mut settings = Settings::load(args.conf.as_deref())?;
    args.apply(&mut settings);
    settings.validate()?;

    let now = Utc::now().timestamp();
    let notifier = notifier(&settings);

    match args.command.unwrap_or(Command::Collect) {
        Command::Deploy => {
            let ctx = Context::deploy(settings, now)?;
            info!(
                columns = ctx.store.columns().len(),
                "data directory {} ready",
                ctx.store.base_path().display()
            );
        }
        Command::EmailBriefReport => {
            let ctx = Context::open(settings, now)?;
            ctx.email_brief_report(notifier.as_ref(), now)?;
        }
        Command::Collect => {
            let os_metrics = settings.collect_os_metrics();
            let source = MysqlSource::connect(&settings.mysql)?;
            let mut collector =
                Collector::new(source).skip_replication(settings.skip_check_replication);
            if os_metrics {
                collector = collector.with_os(OsCollector::new(RealFs::new()));
            }

            let mut ctx = Context::open(settings, now)?;
            let summary = ctx.run_cycle(&mut collector, notifier.as_ref(), now)?;
            info!(
                sample = ?summary.sample_id,
                purged = summary.purged,
                notices = summary.notices,
                "cycle complete"
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    debug!("mycheckpoint {} starting", env!("CARGO_PKG_VERSION"));

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("mycheckpoint: {}", e);
            ExitCode::FAILURE
        }
    }
}
