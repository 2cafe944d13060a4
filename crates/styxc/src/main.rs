use {
    clap::Parser,
    std::io::{Read, Write},
    styx::{client::Client, dm, om, srv::srv},
};

mod memfs;

#[derive(Debug, clap::Parser)]
#[command(name = "styxc", about = "9P2000 client operations and an in-memory file server")]
struct Cli {
    /// Address to dial or announce, in scheme!address[!port] form
    #[arg(short, long, default_value = "tcp!127.0.0.1!564")]
    address: String,

    /// User name presented at attach
    #[arg(short, long, default_value = "none")]
    user: String,

    /// File tree requested at attach
    #[arg(long, default_value = "")]
    aname: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Serve an empty in-memory tree on the address
    Serve,
    /// Print the contents of a file to standard output
    Read { path: String },
    /// Write standard input to a file, creating it if needed
    Write { path: String },
    /// Print file metadata
    Stat { path: String },
    /// Create an empty file, or a directory with --dir
    Create {
        path: String,
        #[arg(long)]
        dir: bool,
    },
    /// Remove a file or an empty directory
    Remove { path: String },
}

async fn client_command(client: &Client, command: Command) -> styx::Result<()> {
    match command {
        // handled before the mount
        Command::Serve => Ok(()),

        Command::Read { path } => {
            let mut fid = client.open(&path, om::READ).await?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            loop {
                let data = fid.read(8192).await?;
                if data.is_empty() {
                    break;
                }
                out.write_all(&data).map_err(styx::Error::Io)?;
            }
            fid.clunk().await
        }

        Command::Write { path } => {
            let mut data = Vec::new();
            std::io::stdin()
                .read_to_end(&mut data)
                .map_err(styx::Error::Io)?;

            let mut fid = match client.open(&path, om::WRITE | om::TRUNC).await {
                Ok(fid) => fid,
                Err(_) => client.create(&path, 0o644, om::WRITE).await?,
            };
            fid.write(&data).await?;
            fid.clunk().await
        }

        Command::Stat { path } => {
            let stat = client.stat(&path).await?;
            println!(
                "{} mode {:o} length {} qid ({:#x} {} {:#04x})",
                stat.name,
                stat.mode,
                stat.length,
                stat.qid.path,
                stat.qid.version,
                stat.qid.typ.bits(),
            );
            Ok(())
        }

        Command::Create { path, dir } => {
            let fid = if dir {
                client.create(&path, dm::DIR | 0o755, om::READ).await?
            } else {
                client.create(&path, 0o644, om::WRITE).await?
            };
            fid.clunk().await
        }

        Command::Remove { path } => client.remove(&path).await,
    }
}

async fn run(cli: Cli) -> styx::Result<()> {
    if let Command::Serve = cli.command {
        return srv(memfs::MemFs::new(), &cli.address).await;
    }

    let client = Client::mount(&cli.address, &cli.user, &cli.aname).await?;
    let result = client_command(&client, cli.command).await;
    let _ = client.unmount().await;
    result
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("styxc: {}", e);
        std::process::exit(1);
    }
}
