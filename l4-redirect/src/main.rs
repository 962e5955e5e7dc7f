use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use log::{warn, LevelFilter};

use l4_redirect::{
    config::{self, DEFAULT_STATE_DIR},
    dataplane::{self, PinnedPolicy, DEFAULT_PIN_DIR},
    simulate, stats, Controller, PolicyControl, PolicyTable, Route, RouteStore,
};
use l4_redirect_common::POLICY_MAP_CAPACITY;

#[derive(Parser)]
#[command(name = "l4-redirect")]
#[command(about = "Stateless L4 destination rewrite at TC ingress", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct GlobalArgs {
    /// Directory holding agent state
    #[arg(
        long,
        global = true,
        env = "L4_REDIRECT_STATE_DIR",
        default_value = DEFAULT_STATE_DIR
    )]
    state_dir: PathBuf,
    /// Routes file (defaults to <state-dir>/routes.json)
    #[arg(long, global = true, env = "L4_REDIRECT_ROUTES", value_name = "FILE")]
    routes: Option<PathBuf>,
    /// bpffs directory the maps are pinned under
    #[arg(
        long,
        global = true,
        env = "L4_REDIRECT_PIN_DIR",
        default_value = DEFAULT_PIN_DIR
    )]
    pin_dir: PathBuf,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true, env = "L4_REDIRECT_VERBOSE", action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach the classifier at TC ingress and serve until Ctrl+C
    Attach(AttachCommand),
    /// Manage redirect routes
    #[command(subcommand)]
    Route(RouteCommand),
    /// Print per-outcome packet counters of the running classifier
    Stats,
    /// Run the dataplane over a hex-encoded frame without touching the kernel
    Simulate(SimulateCommand),
}

#[derive(Args)]
struct AttachCommand {
    /// Interface to attach to
    #[arg(long, env = "L4_REDIRECT_IFACE", value_name = "IFACE")]
    iface: String,
    /// Maximum number of policy entries
    #[arg(long, env = "L4_REDIRECT_POLICY_CAPACITY", default_value_t = POLICY_MAP_CAPACITY)]
    policy_capacity: u32,
}

#[derive(Subcommand)]
enum RouteCommand {
    /// Add or replace the route for a host port
    Add {
        #[arg(long, default_value = "tcp")]
        protocol: String,
        #[arg(long)]
        port: u16,
        /// Backend as IP:PORT
        #[arg(long, value_name = "IP:PORT")]
        backend: SocketAddrV4,
    },
    /// Remove the route for a host port
    Remove {
        #[arg(long, default_value = "tcp")]
        protocol: String,
        #[arg(long)]
        port: u16,
    },
    /// Print persisted routes as JSON
    List {
        /// Print what is programmed in the policy map instead
        #[arg(long)]
        live: bool,
    },
}

#[derive(Args)]
struct SimulateCommand {
    /// Ethernet frame as hex
    #[arg(long, value_name = "HEX")]
    frame: String,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("l4-redirect error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    let routes = config::routes_path(&cli.global.state_dir, cli.global.routes.as_deref());
    let pin_dir = config::expand_path(&cli.global.pin_dir);

    match cli.command {
        Some(Commands::Attach(cmd)) => {
            let opts = dataplane::AttachOptions {
                iface: cmd.iface,
                routes,
                pin_dir,
                policy_capacity: cmd.policy_capacity,
            };
            dataplane::attach_program(opts).await?;
        }
        Some(Commands::Route(cmd)) => {
            let store = RouteStore::open(&routes)?;
            if dataplane::policy_pin(&pin_dir).exists() {
                let policy = PinnedPolicy::open(&pin_dir, POLICY_MAP_CAPACITY as usize)?;
                run_route_command(Controller::new(store, policy), cmd)?;
            } else {
                if !matches!(cmd, RouteCommand::List { .. }) {
                    warn!(
                        "no policy map pinned under {}, only the routes file is updated",
                        pin_dir.display()
                    );
                }
                run_route_command(Controller::new(store, PolicyTable::new()), cmd)?;
            }
        }
        Some(Commands::Stats) => {
            let outcomes = stats::read_stats(&pin_dir)?;
            print_json(&outcomes)?;
        }
        Some(Commands::Simulate(cmd)) => {
            let table = simulate::policy_from_routes(&RouteStore::open(&routes)?.list())?;
            let result = simulate::simulate(&cmd.frame, &table)?;
            print_json(&result)?;
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn run_route_command<P: PolicyControl>(
    mut controller: Controller<P>,
    cmd: RouteCommand,
) -> Result<()> {
    match cmd {
        RouteCommand::Add {
            protocol,
            port,
            backend,
        } => {
            let route =
                controller.upsert(Route::new(&protocol, port, *backend.ip(), backend.port()))?;
            print_json(&route)
        }
        RouteCommand::Remove { protocol, port } => {
            let route = controller.delete(port, &protocol)?;
            print_json(&route)
        }
        RouteCommand::List { live: false } => print_json(&controller.list()),
        RouteCommand::List { live: true } => print_json(&controller.programmed()?),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(default)
        .parse_default_env()
        .init();
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{out}");
    Ok(())
}
