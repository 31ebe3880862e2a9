//! Lectern terminal participant.
//!
//! Joins a relay session, opens one document and mirrors it to stdout.
//! Every typed line is appended to the document; `:sync`, `:status` and
//! `:quit` are commands.

mod state;

use log::{error, info};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

use state::{AppState, Args, Command, Flow, TermSurface, USAGE};

const DATA_DIR_ENV: &str = "LECTERN_DATA_DIR";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            std::process::exit(2);
        }
    };
    let data_dir = std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".lectern"));

    let state = match AppState::new(args, &data_dir, TermSurface::new()) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let mut connection = state.session().watch_connection_status();
    tokio::spawn(async move {
        while connection.changed().await.is_ok() {
            let status = *connection.borrow_and_update();
            info!("Connection: {status}");
        }
    });

    // Stay up offline so local snapshots remain readable.
    if let Err(e) = state.connect().await {
        error!("Could not join the session: {e}");
    }
    println!("{}", state.status_line());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if state.handle(Command::parse(&line)) == Flow::Exit {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let flushed = state.shutdown();
    info!("Left session; {flushed} snapshot(s) written to {}", data_dir.display());
}
