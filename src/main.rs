use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use procshark::core::process_scanner;
use procshark::{
    FeedEvent, MitmConfig, MitmEngine, PacketFeed, SessionRegistry, SessionRequest,
};

#[derive(Parser)]
#[command(name = "procshark", about = "Per-process network traffic analyzer", version)]
struct Cli {
    /// Target process id; its traffic is captured
    #[arg(short, long, conflicts_with = "list_processes")]
    pid: Option<u32>,

    /// List running processes and exit
    #[arg(long)]
    list_processes: bool,

    /// Comma-separated database ports for traffic classification
    #[arg(long, default_value = procshark::config::DEFAULT_DB_PORTS)]
    db_ports: String,

    /// Comma-separated server IPs to narrow the capture filter
    #[arg(long, default_value = "")]
    server_ips: String,

    /// Capture device name (defaults to the first available device)
    #[arg(long)]
    device: Option<String>,

    /// Also run the HTTPS interception proxy on this port
    #[arg(long)]
    mitm_port: Option<u16>,

    /// Directory holding ca-cert.pem and ca-key.pem for interception
    #[arg(long, default_value = "certs")]
    ca_dir: PathBuf,

    /// Skip upstream certificate validation in the interception proxy
    #[arg(long)]
    ssl_insecure: bool,

    /// Ingest a capture file instead of sniffing live
    #[arg(long, conflicts_with_all = ["pid", "mitm_port"])]
    read_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "procshark=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.list_processes {
        for proc in process_scanner::running_processes() {
            println!("{:>8}  {}", proc.pid, proc.name);
        }
        return Ok(());
    }

    if let Some(path) = &cli.read_file {
        let data = std::fs::read(path)?;
        let result = procshark::offline::ingest_bytes(&data)?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let Some(pid) = cli.pid else {
        anyhow::bail!("either --pid, --list-processes, or --read-file is required");
    };

    let feed = Arc::new(PacketFeed::new());
    let registry = SessionRegistry::new();

    let request = SessionRequest {
        target_pid: pid,
        db_filter: cli.db_ports.clone(),
        server_filter: cli.server_ips.clone(),
    };
    let _session_id = registry.start_session(&request, Arc::clone(&feed))?;

    let mut mitm = match cli.mitm_port {
        Some(port) => {
            let mut config = MitmConfig::new(port, &cli.ca_dir);
            config.ssl_insecure = cli.ssl_insecure;
            let mitm_feed = Arc::clone(&feed);
            Some(MitmEngine::start(config, move |txn| {
                mitm_feed.publish(FeedEvent::Transaction(txn));
            })?)
        }
        None => None,
    };

    // Drain our own subscription to stdout until interrupted.
    let mut subscription = feed.subscribe();
    eprintln!("procshark: capturing PID {pid}; ctrl-c to stop");
    loop {
        tokio::select! {
            event = subscription.rx.recv() => {
                match event {
                    Some(event) => println!("{}", serde_json::to_string(&*event)?),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    registry.stop_all();
    if let Some(engine) = mitm.as_mut() {
        engine.stop();
    }
    Ok(())
}
