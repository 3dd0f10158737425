//! `swatch` - CLI for safewatch
//!
//! Raises an alert from the terminal and runs the session until the alert is
//! cancelled or resolved, and inspects stored alerts.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use safewatch::alert::{AlertId, AlertStatus, LocationSample, Responder};
use safewatch::armer::{ArmOutcome, ArmPhase};
use safewatch::cli::{
    AlertsCommand, Cli, Command, ConfigCommand, OutputFormat, PasswordCommand, SessionCommand,
    SosCommand, SESSION_HELP,
};
use safewatch::controller::AlertHandle;
use safewatch::services::{LogNotifier, Notifier};
use safewatch::share::ShareOutcome;
use safewatch::{init_logging, message, App, Config, Storage};

/// Prints alert banners and updates to the terminal.
#[derive(Debug)]
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn show_alert(&self, alert: &safewatch::Alert) {
        println!();
        println!("*** ALERT ACTIVE ***");
        println!("{}", alert.message);
        println!();
    }

    fn show_update(&self, _alert_id: AlertId, text: &str) {
        println!("[update] {text}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    match cli.command {
        Command::Sos(sos) => handle_sos(load_config(cli.config)?, sos).await,
        Command::Alerts(alerts) => handle_alerts(&load_config(cli.config)?, &alerts),
        Command::Password(password) => handle_password(load_config(cli.config)?, password).await,
        Command::Config(config_cmd) => handle_config(cli.config, config_cmd),
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    Config::load_from(path).context("loading configuration")
}

async fn handle_sos(config: Config, cmd: SosCommand) -> anyhow::Result<()> {
    let fix = match (cmd.lat, cmd.lng) {
        (Some(lat), Some(lng)) => {
            let sample = LocationSample::new(lat, lng, cmd.accuracy);
            if !sample.is_valid() {
                bail!("({lat}, {lng}) is not a valid coordinate");
            }
            Some(sample)
        }
        _ => None,
    };

    let app = App::open(config, fix, Arc::new(ConsoleNotifier)).await?;
    let mut originator = app.config.originator();
    if let Some(name) = cmd.name {
        originator.name = name;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let dispatched = if cmd.now {
        app.controller.dispatch(&originator, None).await
    } else {
        let handle = app.controller.arm(originator.clone(), cmd.hold)?;
        let mut progress = handle.progress();
        let outcome = handle.outcome();
        tokio::pin!(outcome);

        println!("Alert arming. Type 'cancel' and press Enter to stop it.");
        let mut watching = true;
        let mut reading = true;
        loop {
            tokio::select! {
                result = &mut outcome => match result {
                    ArmOutcome::Dispatched(handle) => break Ok(handle),
                    ArmOutcome::Cancelled => {
                        println!("Alert cancelled before sending. Nothing was sent.");
                        app.shutdown();
                        return Ok(());
                    }
                    ArmOutcome::Failed(e) => break Err(e),
                },
                changed = progress.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let phase = *progress.borrow_and_update();
                    match phase {
                        ArmPhase::Counting { remaining } => println!("Sending in {remaining}..."),
                        ArmPhase::Dispatching => println!("Sending alert..."),
                        ArmPhase::Idle => {}
                    }
                }
                line = lines.next_line(), if reading => {
                    let Ok(Some(line)) = line else {
                        reading = false;
                        continue;
                    };
                    if line.trim().eq_ignore_ascii_case("cancel") {
                        if !app.controller.disarm(&originator.id) {
                            println!("Too late to cancel: the alert is already being sent.");
                        }
                    } else if line.trim().eq_ignore_ascii_case("now") {
                        app.controller.trigger_now(&originator.id);
                    }
                }
            }
        }
    };

    let handle = match dispatched {
        Ok(handle) => handle,
        Err(e) if e.is_permission_error() => {
            app.shutdown();
            bail!("{e}. Grant location access or pass --lat/--lng, then try again.");
        }
        Err(e) => {
            app.shutdown();
            return Err(e.into());
        }
    };

    report_dispatch(&handle);
    let result = run_session(&app, &handle, &mut lines).await;
    app.shutdown();
    result
}

fn report_dispatch(handle: &AlertHandle) {
    match &handle.share {
        ShareOutcome::DeliveredNative => println!("Alert sent."),
        ShareOutcome::DeliveredClipboard => {
            println!("Alert copied to the clipboard. Paste it to your contacts now.");
        }
        ShareOutcome::ManualDisplay { text } => {
            println!("Could not share automatically. Send this message to your contacts:");
            println!("----");
            println!("{text}");
            println!("----");
        }
    }
    for warning in &handle.warnings {
        println!("warning: {warning}");
    }
    println!("Alert {} is active. Type 'help' for commands.", handle.id());
}

async fn run_session<R>(
    app: &App,
    handle: &AlertHandle,
    lines: &mut tokio::io::Lines<R>,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let controller = &app.controller;
    let alert_id = handle.id();

    let (_, _subscription) = controller.responders().subscribe(alert_id, |responses| {
        if let Some(latest) = responses.last() {
            println!("[response] {}", latest.summary());
        }
    })?;
    let mut updates = controller
        .relay_updates(alert_id)
        .context("relay was not started")?;

    let mut relaying = true;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    println!("Input closed. The alert stays active until cancelled or resolved.");
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match line.parse::<SessionCommand>() {
                    Ok(command) => command,
                    Err(e) => {
                        println!("{e}");
                        println!("{SESSION_HELP}");
                        continue;
                    }
                };
                if run_command(app, alert_id, command).await? {
                    return Ok(());
                }
            }
            update = updates.recv(), if relaying => match update {
                Ok(sample) => println!(
                    "[location] {} (+/- {:.0} m)",
                    safewatch::alert::format_coordinates(sample.lat, sample.lng),
                    sample.accuracy
                ),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    // Relay gone: the alert was closed elsewhere (auto-resolve).
                    relaying = false;
                    if controller.status(&handle.alert.originator_id) != AlertStatus::Active {
                        println!("Alert is no longer active.");
                        return Ok(());
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Ctrl-C does not cancel the alert. Type 'cancel <password>' or 'quit'.");
            }
        }
    }
}

/// Returns `true` when the session should end.
async fn run_command(app: &App, alert_id: AlertId, command: SessionCommand) -> anyhow::Result<bool> {
    let controller = &app.controller;
    match command {
        SessionCommand::Cancel(password) => {
            match controller.cancel(alert_id, password.as_deref()).await {
                Ok(alert) => {
                    println!("Alert cancelled. Your contacts have been told you are safe.");
                    let at = alert.resolved_at.unwrap_or(alert.created_at);
                    println!("Cancelled at {}", message::local_time(at));
                    return Ok(true);
                }
                Err(e) if e.is_auth_error() => println!("Not cancelled: {e}"),
                Err(e) => println!("{e}"),
            }
        }
        SessionCommand::Resolve => match controller.resolve(alert_id).await {
            Ok(_) => {
                println!("Alert resolved.");
                return Ok(true);
            }
            Err(e) => println!("{e}"),
        },
        SessionCommand::Status => match controller.alert(alert_id) {
            Some(alert) => {
                println!("Status:     {}", alert.status);
                println!("Priority:   {}", alert.priority);
                println!("Sent:       {}", message::local_time(alert.created_at));
                println!("Location:   {}", alert.location.place_or_coordinates());
                println!("Responses:  {}", alert.responses.len());
                if let Some(relay) = controller.relay_status(alert_id) {
                    println!(
                        "Relay:      {} ({} samples, {} failures)",
                        if relay.running { "running" } else { "stopped" },
                        relay.samples,
                        relay.failures
                    );
                }
                let pending = controller.outbox().pending_for(alert_id);
                if pending > 0 {
                    println!("Unsynced:   {pending} write(s) waiting for the store");
                }
            }
            None => println!("Alert {alert_id} is no longer held."),
        },
        SessionCommand::History => {
            let history = controller.relay_history(alert_id);
            if history.is_empty() {
                println!("No location updates yet.");
            }
            for sample in history {
                println!(
                    "{}  {}",
                    message::local_time(sample.timestamp),
                    safewatch::alert::format_coordinates(sample.lat, sample.lng)
                );
            }
        }
        SessionCommand::Respond {
            responder,
            kind,
            message,
        } => {
            let who = Responder::new(&responder, &responder);
            if let Err(e) = controller
                .responders()
                .respond(alert_id, &who, kind, message, None)
                .await
            {
                println!("{e}");
            }
        }
        SessionCommand::Responses => {
            let responses = controller.responders().responses(alert_id);
            if responses.is_empty() {
                println!("No responses yet.");
            }
            for response in responses {
                println!(
                    "{}  {}",
                    message::local_time(response.timestamp),
                    response.summary()
                );
            }
        }
        SessionCommand::Help => println!("{SESSION_HELP}"),
        SessionCommand::Quit => {
            println!("Leaving the session. The alert stays active.");
            return Ok(true);
        }
    }
    Ok(false)
}

fn handle_alerts(config: &Config, cmd: &AlertsCommand) -> anyhow::Result<()> {
    let storage = Storage::open(config.database_path())?;

    if let Some(id) = &cmd.id {
        let id: AlertId = id.parse().context("invalid alert id")?;
        let Some(mut alert) = storage.load_alert(id)? else {
            bail!("no alert with id {id}");
        };
        alert.responses = storage.load_responses(id)?;
        let trail = storage.trail(id)?;

        match cmd.format {
            OutputFormat::Json => {
                let detail = serde_json::json!({ "alert": alert, "trail": trail });
                println!("{}", serde_json::to_string_pretty(&detail)?);
            }
            OutputFormat::Table => {
                println!("Alert {}", alert.id);
                println!("  Status:    {}", alert.status);
                println!("  From:      {}", alert.originator_name);
                println!("  Sent:      {}", message::local_time(alert.created_at));
                if let Some(at) = alert.resolved_at {
                    println!("  Closed:    {}", message::local_time(at));
                }
                println!("  Location:  {}", alert.location.place_or_coordinates());
                println!("  Responses:");
                for response in &alert.responses {
                    println!("    {}", response.summary());
                }
                println!("  Trail ({} points):", trail.len());
                for sample in &trail {
                    println!(
                        "    {}  {}",
                        message::local_time(sample.timestamp),
                        safewatch::alert::format_coordinates(sample.lat, sample.lng)
                    );
                }
            }
        }
        return Ok(());
    }

    let alerts = storage.load_recent(cmd.limit)?;
    match cmd.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&alerts)?),
        OutputFormat::Table => {
            if alerts.is_empty() {
                println!("No alerts stored.");
                return Ok(());
            }
            println!("{:<36}  {:<9}  {:<19}  LOCATION", "ID", "STATUS", "SENT");
            for alert in alerts {
                println!(
                    "{:<36}  {:<9}  {:<19}  {}",
                    alert.id.to_string(),
                    alert.status.to_string(),
                    message::local_time(alert.created_at),
                    alert.location.place_or_coordinates()
                );
            }
            let stats = storage.stats()?;
            println!();
            println!(
                "{} alerts, {} active, {} responses, {} trail points",
                stats.total_alerts, stats.active_alerts, stats.total_responses, stats.trail_points
            );
        }
    }
    Ok(())
}

async fn handle_password(config: Config, cmd: PasswordCommand) -> anyhow::Result<()> {
    let app = App::open(config, None, Arc::new(LogNotifier)).await?;
    let result = match cmd {
        PasswordCommand::Set { password } => app
            .controller
            .set_password(&password)
            .await
            .map(|()| "Cancellation password set."),
        PasswordCommand::Change { old, new } => app
            .controller
            .change_password(&old, &new)
            .await
            .map(|()| "Cancellation password changed."),
    };
    app.shutdown();
    println!("{}", result?);
    Ok(())
}

fn handle_config(path: Option<PathBuf>, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = Config::load_from(path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Alert]");
                println!("  Hold (seconds):     {}", config.alert.hold_seconds);
                println!("  Grace (seconds):    {}", config.alert.grace_period_seconds);
                println!("  Priority:           {}", config.alert.priority);
                println!("  Originator:         {}", config.alert.originator_name);
                println!("  Contacts:           {}", config.alert.contacts.len());
                println!();
                println!("[Location]");
                println!(
                    "  Relay interval (s): {}",
                    config.location.relay_interval_seconds
                );
                println!("  History capacity:   {}", config.location.history_capacity);
                println!("  Static fix:         {}", config.location.static_fix.is_some());
                println!("  Places:             {}", config.location.places.len());
                println!();
                println!("[Cancellation]");
                println!(
                    "  Require password:   {}",
                    config.cancellation.require_password_on_cancel
                );
                println!(
                    "  Auto-resolve (min): {}",
                    config.cancellation.auto_resolve_after_minutes
                );
                println!();
                println!("[Share]");
                println!(
                    "  Native command:     {}",
                    if config.share.native_command.is_empty() {
                        "(none)".to_string()
                    } else {
                        config.share.native_command.join(" ")
                    }
                );
                println!("  Clipboard:          {}", config.share.clipboard_enabled);
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Max age (days):     {}", config.storage.max_age_days);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.or(path).unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => bail!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
