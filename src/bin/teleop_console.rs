use anyhow::Result;
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use teleop_console::{
    api::RobotApi,
    configuration::AppConfig,
    connection::WebSocketDialer,
    console::{Console, ConsoleEvent},
    error::ErrorWrapper,
    gamepad::start_gamepad_loop,
    logging,
    terminal::{spawn_input_reader, TerminalGuard, TerminalSink},
};
use tracing::*;
use zenoh::prelude::r#async::*;

const DEFAULT_LOG_FILE: &str = "teleop-console.log";

#[derive(Parser, Debug)]
#[command(version, about = "Remote operation console for a mobile robot")]
struct Args {
    /// path to config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Log destination, driving defaults to teleop-console.log
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive the robot from this terminal (default)
    Drive,
    /// Ask the robot to clear its map
    ResetMap,
    /// Points of interest
    Poi {
        #[command(subcommand)]
        action: PoiCommand,
    },
    /// Send the robot to a saved point of interest
    Navigate { target_id: String },
}

#[derive(Subcommand, Debug)]
enum PoiCommand {
    List,
    Add { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Drive);

    let log_file = match (&command, args.log_file) {
        (_, Some(path)) => Some(path),
        (Command::Drive, None) => Some(PathBuf::from(DEFAULT_LOG_FILE)),
        (_, None) => None,
    };
    let _log_guard = logging::setup_tracing(args.verbosity, log_file.as_deref(), args.json_logs)?;

    let app_config = AppConfig::load_config(&args.config)?;

    match command {
        Command::Drive => drive(app_config).await,
        Command::ResetMap => {
            let api = RobotApi::from_config(&app_config.api, &app_config.connection)?;
            let response = api.reset_map().await?;
            println!("{}", response);
            Ok(())
        }
        Command::Poi { action } => {
            let api = RobotApi::from_config(&app_config.api, &app_config.connection)?;
            match action {
                PoiCommand::List => {
                    for poi in api.list_pois().await? {
                        println!(
                            "{}\t{}\t({:.2}, {:.2}, {:.2})",
                            poi.id, poi.name, poi.x, poi.y, poi.theta
                        );
                    }
                }
                PoiCommand::Add { name } => {
                    let response = api.add_poi(&name).await?;
                    println!("{} {}", response.status, response.id.unwrap_or_default());
                }
            }
            Ok(())
        }
        Command::Navigate { target_id } => {
            let api = RobotApi::from_config(&app_config.api, &app_config.connection)?;
            let response = api.navigate(&target_id).await?;
            println!("{}", response.status);
            Ok(())
        }
    }
}

async fn drive(app_config: AppConfig) -> Result<()> {
    info!(endpoint = %app_config.connection.endpoint(), "starting console");

    let guard = TerminalGuard::enter()?;
    let (console, handle) = Console::new(
        app_config.connection.clone(),
        app_config.map,
        app_config.motion.clone(),
        Arc::new(WebSocketDialer),
        Box::<TerminalSink>::default(),
    );

    let input_reader = spawn_input_reader(handle.clone(), guard.release_events());

    if app_config.gamepad.enabled {
        let zenoh_config = app_config.zenoh.get_zenoh_config()?;
        let zenoh_session = zenoh::open(zenoh_config)
            .res()
            .await
            .map_err(ErrorWrapper::ZenohError)?
            .into_arc();
        start_gamepad_loop(zenoh_session, handle.clone()).await?;
    }

    tokio::spawn({
        let handle = handle.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                _ = handle.send(ConsoleEvent::Quit);
            }
        }
    });
    drop(handle);

    let result = console.run().await;
    drop(guard);

    match input_reader.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(?err, "terminal input failed"),
        Err(err) => error!(?err, "terminal input task panicked"),
    }
    result
}
