//! Browse local directories through the SMB client stack

use bytes::Bytes;
use clap::{Parser, Subcommand};
use rust_smb_client::session::local::DirectoryConnector;
use rust_smb_client::{ClientConfig, Device, DeviceType, File, FileMode, FileServer, FileStat, Share};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "smb-fs")]
#[command(about = "Browse shares with the Rust SMB client", long_about = None)]
struct Args {
    /// Export a local directory as a share, as NAME=DIR (repeatable)
    #[arg(short = 'e', long = "export", value_parser = parse_export, required = true)]
    exports: Vec<(String, PathBuf)>,

    /// Server host name or address
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// NetBIOS name of the server
    #[arg(short = 'n', long, default_value = "LOCALHOST")]
    netbios_name: String,

    /// Share to operate on
    #[arg(short = 's', long)]
    share: Option<String>,

    /// Username; omit for guest access
    #[arg(short = 'u', long)]
    username: Option<String>,

    /// Password for authentication
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// Chunk size for transfers
    #[arg(short = 'b', long, default_value = "65536")]
    buffer_size: usize,

    /// Include administrative shares in listings
    #[arg(short = 'a', long)]
    all: bool,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List shares
    Shares,

    /// List files in a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Display file information
    Stat { path: String },

    /// Download a file
    Get {
        remote: String,
        /// Local file path (defaults to the remote file name)
        local: Option<PathBuf>,
    },

    /// Upload a file
    Put {
        local: PathBuf,
        /// Remote file path (defaults to the local file name)
        remote: Option<String>,
    },

    /// Create a directory
    Mkdir {
        path: String,
        /// Create missing parent directories
        #[arg(short = 'p', long)]
        parents: bool,
    },

    /// Remove a file or empty directory
    Rm { path: String },

    /// Move or rename a file or directory
    Mv { from: String, to: String },
}

fn parse_export(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((name, dir)) if !name.is_empty() && !dir.is_empty() => {
            Ok((name.to_string(), PathBuf::from(dir)))
        }
        _ => Err(format!("expected NAME=DIR, got {:?}", value)),
    }
}

fn describe(file: &File) -> String {
    match file.stat() {
        Some(FileStat {
            exists: true,
            is_directory: true,
            ..
        }) => format!("{:>12}  {}/", "<DIR>", file.name()),
        Some(stat) => {
            let modified = stat
                .write_time
                .map(|time| time.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            format!("{:>12}  {:16}  {}", stat.size, modified, file.name())
        }
        None => format!("{:>12}  {}", "?", file.name()),
    }
}

async fn run(server: &FileServer, share: Option<String>, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    if let Commands::Shares = command {
        for share in server.list_shares().await? {
            println!("{}", share.name());
        }
        return Ok(());
    }

    let name = share.ok_or("--share is required for this command")?;
    let share = server.find_share(&name).await?;
    share.open().await?;
    let result = run_on_share(&share, command).await;
    share.close().await;
    result
}

async fn run_on_share(share: &Share, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Shares => {}

        Commands::Ls { path } => {
            for file in share.list_files(&path).await? {
                println!("{}", describe(&file));
            }
        }

        Commands::Stat { path } => {
            let stat = share.status(&path).await?;
            if !stat.exists {
                return Err(format!("{}: no such file or directory", path).into());
            }
            println!("Path:        {}", path);
            println!("Type:        {}", if stat.is_directory { "directory" } else { "file" });
            println!("Size:        {}", stat.size);
            for (label, time) in [
                ("Created:", stat.creation_time),
                ("Modified:", stat.modification_time),
                ("Accessed:", stat.access_time),
                ("Written:", stat.write_time),
            ] {
                if let Some(time) = time {
                    println!("{:<12} {}", label, time.to_rfc3339());
                }
            }
        }

        Commands::Get { remote, local } => {
            let mut file = File::new(share, &remote);
            let local_path = local.unwrap_or_else(|| PathBuf::from(file.name()));
            tracing::info!("Downloading {} -> {}", file.path(), local_path.display());

            file.open(FileMode::READ).await?;
            let data = file.read_to_end(None).await;
            file.close().await;
            let data = data?;

            tokio::fs::write(&local_path, &data).await?;
            tracing::info!("Downloaded {} bytes", data.len());
        }

        Commands::Put { local, remote } => {
            let remote_path = remote.unwrap_or_else(|| {
                local
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("upload")
                    .to_string()
            });
            tracing::info!("Uploading {} -> {}", local.display(), remote_path);
            let data = Bytes::from(tokio::fs::read(&local).await?);

            // Opening for write does not truncate
            let mut file = File::new(share, &remote_path);
            if file.update_status().await?.exists {
                file.delete().await?;
            }
            file.open(FileMode::WRITE).await?;
            let written = file.write_all(data).await;
            file.close().await;
            tracing::info!("Uploaded {} bytes", written?);
        }

        Commands::Mkdir { path, parents } => {
            let mut dir = File::new(share, &path);
            if parents {
                dir.create_directories().await?;
            } else {
                dir.create_directory().await?;
            }
        }

        Commands::Rm { path } => share.delete_file(&path).await?,

        Commands::Mv { from, to } => {
            let moved = share.move_file(&from, &to).await?;
            tracing::info!("Moved {} -> {}", from, moved.path());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let connector = args
        .exports
        .iter()
        .fold(DirectoryConnector::new(), |connector, (name, dir)| {
            connector.add_share(name, dir)
        });
    let config = ClientConfig {
        buffer_size: args.buffer_size,
        show_hidden_shares: args.all,
        ..Default::default()
    };
    let device = Device::new(DeviceType::FILE_SERVER, &args.host, &args.netbios_name, "WORKGROUP");
    let server = FileServer::with_config(device, Arc::new(connector), config);

    let guest = server
        .connect(args.username.as_deref(), args.password.as_deref())
        .await?;
    tracing::info!(
        "Connected to {}{}",
        server.device(),
        if guest { " as guest" } else { "" }
    );

    let result = run(&server, args.share, args.command).await;
    server.disconnect().await;
    tracing::info!("Disconnected");
    result
}
