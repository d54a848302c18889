use std::{
    fs::{File, OpenOptions},
    io::Write,
    net::IpAddr,
    path::PathBuf,
    process,
    sync::{atomic::Ordering, Mutex},
};

use anyhow::{Context, Result};
use clap::Parser;
use pmrelay_common::{
    config::{self, ClientCertPath, ServerCertPath},
    auth::UserDatabase,
    pdu::SizeLimit,
    SecurityConfig, SecurityProvider,
};
use pmrelay_server::{RelayConfig, RelayEngine};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pmrelay")]
#[command(about = "Relay metrics protocol connections to upstream collectors")]
struct Args {
    /// Address to listen on (repeatable; default all interfaces)
    #[arg(short, long = "interface")]
    interfaces: Vec<IpAddr>,

    /// Port to listen on (repeatable)
    #[arg(short, long = "port")]
    ports: Vec<u16>,

    /// Also listen on this local-domain socket
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Listen backlog
    #[arg(short = 'M', long)]
    max_pending: Option<i32>,

    /// Require certificates from remote clients
    #[arg(short = 'C', long)]
    require_cert: bool,

    /// Refuse remote clients that do not authenticate
    #[arg(short = 'A', long)]
    require_auth: bool,

    /// Do not advertise the relay on the network
    #[arg(short = 'N', long)]
    no_advertise: bool,

    /// Stay in the foreground
    #[arg(short, long)]
    foreground: bool,

    /// Write logs here instead of stderr
    #[arg(short, long)]
    log_file: Option<PathBuf>,

    /// Largest PDU accepted from a client, in bytes (0 for no limit)
    #[arg(short = 'L', long)]
    pdu_limit: Option<usize>,

    /// JSON file mapping user names to secrets
    #[arg(short = 'U', long)]
    users: Option<PathBuf>,

    /// Certificate directory
    #[arg(long, env = "PMRELAY_CERTS_DIR", default_value = "certs")]
    certs_dir: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn security_config(args: &Args) -> Result<SecurityConfig> {
    let mut security = SecurityConfig::default();

    let server = ServerCertPath::in_dir(&args.certs_dir);
    if server.is_present() {
        security.server = Some(server);
    } else {
        warn!(
            "No relay certificate in {:?}; encrypted clients will be refused",
            args.certs_dir
        );
    }
    let client = ClientCertPath::in_dir(&args.certs_dir);
    if client.ca_path.is_file() {
        security.client = Some(client);
    }
    if let Some(path) = &args.users {
        security.users = UserDatabase::load(path)
            .with_context(|| format!("Failed to load user database {:?}", path))?;
        info!("Loaded {} users from {:?}", security.users.len(), path);
    }
    Ok(security)
}

fn relay_config(args: &Args) -> RelayConfig {
    let mut relay = RelayConfig {
        interfaces: args.interfaces.clone(),
        require_cert: args.require_cert,
        require_auth: args.require_auth,
        ..Default::default()
    };
    if !args.ports.is_empty() {
        relay.ports = args.ports.clone();
    }
    if let Some(backlog) = args.max_pending {
        relay.max_pending = backlog;
    }
    if let Some(socket) = &args.socket {
        relay.socket_path = Some(socket.clone());
    }
    match args.pdu_limit {
        Some(0) => relay.pdu_limit = SizeLimit::Any,
        Some(limit) => relay.pdu_limit = SizeLimit::Limit(limit),
        None => {}
    }
    relay
}

fn start(args: &Args) -> Result<RelayEngine> {
    let security = security_config(args)?;
    let relay = relay_config(args);
    info!(
        "Upstream default port {}, connect timeout {:?}, request timeout {:?}",
        config::upstream_port(),
        relay.connect_timeout,
        relay.request_timeout
    );
    if args.no_advertise {
        info!("Service advertisement disabled");
    }
    RelayEngine::bind(relay, SecurityProvider::new(security)).context("Failed to start relay")
}

/// Report a startup failure where an operator will see it.
fn fail(err: &anyhow::Error) -> ! {
    error!("{:#}", err);
    if let Ok(mut tty) = File::options().write(true).open("/dev/tty") {
        let _ = writeln!(tty, "pmrelay: {:#}", err);
    }
    process::exit(1);
}

fn main() -> Result<()> {
    let args = Args::parse();
    if let Err(e) = init_logging(&args) {
        eprintln!("pmrelay: {:#}", e);
        process::exit(1);
    }

    info!("Starting metrics relay...");
    let mut relay = match start(&args) {
        Ok(relay) => relay,
        Err(e) => fail(&e),
    };

    if !args.foreground {
        // keep the working directory so relative certificate paths still resolve
        if let Err(e) = nix::unistd::daemon(true, args.log_file.is_none()) {
            fail(&anyhow::Error::new(e).context("Failed to detach from terminal"));
        }
    }

    let shutdown = relay.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping relay...");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")
    {
        fail(&e);
    }

    relay.run().context("Relay error")?;
    info!("Relay exited cleanly");
    Ok(())
}
