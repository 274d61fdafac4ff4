use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use invoice_tally::commands::invoices::{self, ExportSource};
use invoice_tally::commands::settings;
use invoice_tally::AppState;

#[derive(Parser)]
#[command(name = "invoice-tally")]
#[command(about = "Extract invoice fields with OCR and an LLM, export Tally vouchers")]
#[command(version)]
struct Cli {
    /// Directory holding the database and saved uploads
    #[arg(long, env = "INVOICE_TALLY_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one invoice image or PDF and print the outcome
    Upload {
        file: PathBuf,
        /// Override the content type guessed from the file extension
        #[arg(long)]
        content_type: Option<String>,
    },
    /// List stored invoices, newest first
    List,
    /// Show one stored invoice with its processing log
    Show { id: String },
    /// Render a Tally purchase voucher
    Export(ExportArgs),
    /// Ingest every invoice dropped into a folder
    Watch { folder: PathBuf },
    /// Read or change stored settings
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args)]
#[command(group(clap::ArgGroup::new("source").required(true).args(["id", "file"])))]
struct ExportArgs {
    /// Stored invoice id
    #[arg(long)]
    id: Option<String>,
    /// JSON file holding an invoice record
    #[arg(long)]
    file: Option<PathBuf>,
    /// Write the XML here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
    SetApiKey { key: String },
    TestKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let state = AppState::initialize(cli.data_dir)?;

    match cli.command {
        Commands::Upload { file, content_type } => {
            let outcome = invoices::upload_file(&state, &file, content_type).await?;
            print_json(&outcome)?;
        }
        Commands::List => print_json(&invoices::list_invoices(&state)?)?,
        Commands::Show { id } => print_json(&invoices::get_invoice_detail(&state, &id)?)?,
        Commands::Export(args) => {
            let source = match (args.id, args.file) {
                (Some(id), _) => ExportSource::Stored(id),
                (None, Some(file)) => ExportSource::File(file),
                (None, None) => anyhow::bail!("Pass --id or --file"),
            };
            let xml = invoices::export_voucher(&state, &source)?;
            match args.output {
                Some(path) => std::fs::write(&path, xml)
                    .with_context(|| format!("Write {}", path.display()))?,
                None => println!("{}", xml),
            }
        }
        Commands::Watch { folder } => invoices::watch_folder(&state, &folder).await?,
        Commands::Config(command) => match command {
            ConfigCommand::Get { key } => println!("{}", settings::get_setting(&state, &key)?),
            ConfigCommand::Set { key, value } => settings::save_setting(&state, &key, &value)?,
            ConfigCommand::SetApiKey { key } => settings::save_api_key(&state, &key)?,
            ConfigCommand::TestKey => {
                let accepted = settings::test_api_key(&state).await?;
                println!("{}", if accepted { "API key accepted" } else { "API key rejected" });
            }
        },
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
