use clap::{Parser, Subcommand};
use fleetlog::app::App;
use fleetlog::errors::TailError;

#[derive(Parser)]
#[command(
    name = "fleetlog",
    about = "Harvest and page remote log files over pooled SSH sessions"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch new log content from every host in a group
    Fetch {
        group_id: String,
        /// Return the full previous page instead of only the new delta
        #[arg(long)]
        prev_page: bool,
    },
    /// Read already-harvested history for a whole group
    History { group_id: String },
    /// Read the latest page of one mirrored file
    Read {
        group_id: String,
        host: String,
        dir: String,
        file: String,
    },
    /// Page backwards from a recorded boundary
    Older {
        group_id: String,
        host: String,
        dir: String,
        file: String,
        offset: u64,
    },
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, TailError> {
    serde_json::to_string_pretty(value).map_err(|err| TailError::internal(err.to_string()))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let app = match App::initialize() {
        Ok(app) => app,
        Err(err) => {
            eprintln!("fleetlog: {}", err);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Fetch {
            group_id,
            prev_page,
        } => match app.tailer.fetch(&group_id, prev_page).await {
            Ok(outcome) => to_json(&outcome),
            Err(err) => Err(err),
        },
        Command::History { group_id } => match app.tailer.read_full_history(&group_id).await {
            Ok(outcome) => to_json(&outcome),
            Err(err) => Err(err),
        },
        Command::Read {
            group_id,
            host,
            dir,
            file,
        } => match app.tailer.read_single(&group_id, &host, &dir, &file).await {
            Ok(outcome) => to_json(&outcome),
            Err(err) => Err(err),
        },
        Command::Older {
            group_id,
            host,
            dir,
            file,
            offset,
        } => match app
            .tailer
            .read_older_page(&group_id, &file, &host, &dir, offset)
            .await
        {
            Ok(outcome) => to_json(&outcome),
            Err(err) => Err(err),
        },
    };

    app.shutdown().await;

    match result {
        Ok(json) => println!("{}", json),
        Err(err) => {
            eprintln!("fleetlog: {}", err);
            std::process::exit(1);
        }
    }
}
