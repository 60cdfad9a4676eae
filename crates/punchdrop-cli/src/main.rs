//! punchdrop command line: `server`, `send`, `receive`.

mod commands;
mod json;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "punchdrop",
    about = "Encrypted peer-to-peer file transfer through NAT",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination server
    Server {
        /// UDP port to listen on
        #[arg(long, default_value_t = 9000)]
        port: u16,
        /// Pre-shared key peers must authenticate with
        #[arg(long)]
        psk: String,
        /// Idle seconds before a session is swept
        #[arg(long, default_value_t = 300)]
        session_timeout: u64,
    },
    /// Send a file to a peer
    Send {
        /// Session ID shared with the receiver
        #[arg(long, short)]
        session: String,
        /// Pre-shared key
        #[arg(long)]
        psk: String,
        /// Coordination server (host:port)
        #[arg(long)]
        server: String,
        /// File to send
        #[arg(long, short)]
        file: PathBuf,
        /// Emit newline-delimited JSON events instead of human output
        #[arg(long)]
        json: bool,
    },
    /// Receive a file from a peer
    Receive {
        /// Session ID shared with the sender
        #[arg(long, short)]
        session: String,
        /// Pre-shared key
        #[arg(long)]
        psk: String,
        /// Coordination server (host:port)
        #[arg(long)]
        server: String,
        /// Directory to write the received file into
        #[arg(long, short)]
        output: PathBuf,
        /// Emit newline-delimited JSON events instead of human output
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so JSON mode keeps stdout machine-readable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "punchdrop=info".into()),
        )
        .init();

    let json = match &cli.command {
        Commands::Server { .. } => false,
        Commands::Send { json, .. } | Commands::Receive { json, .. } => *json,
    };

    let result = match cli.command {
        Commands::Server {
            port,
            psk,
            session_timeout,
        } => commands::server::run(port, &psk, session_timeout),
        Commands::Send {
            session,
            psk,
            server,
            file,
            json,
        } => commands::send::run(&session, &psk, &server, &file, json),
        Commands::Receive {
            session,
            psk,
            server,
            output,
            json,
        } => commands::receive::run(&session, &psk, &server, &output, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                json::error(&format!("{:#}", e));
            } else {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}
