use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use iscsi::{ChapDirection, LocalInitiator, LunOptions, Options, Settings, TargetStore};
use log::{debug, LevelFilter};
use serde::Serialize;

/// Manage the LIO iSCSI targets and the local open-iscsi initiator of a backup appliance
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Settings file (YAML); built-in defaults are used when absent
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List target names
    List,
    /// Show one target
    Show { target: String },
    /// Create a target; prints the normalized name
    Create { target: String },
    /// Delete a target and the backstores only it uses
    Delete { target: String },
    /// Export a file or block device as a new LUN of a target
    AddLun {
        target: String,
        path: PathBuf,
        #[arg(long)]
        read_only: bool,
        #[arg(long)]
        write_back: bool,
        /// Unit serial number
        #[arg(long)]
        wwn: Option<String>,
        /// Extra backstore attribute, `key=value`; may be repeated
        #[arg(long = "attribute", value_name = "KEY=VALUE")]
        attributes: Vec<String>,
    },
    /// List the LUNs of a target
    Luns { target: String },
    /// List the initiator sessions logged into a target
    Sessions { target: String },
    /// Targets exporting a file or device
    WhoUses { path: PathBuf },
    /// Set a CHAP credential and enable authentication
    ChapAdd {
        target: String,
        #[arg(value_enum)]
        direction: Direction,
        user: String,
        password: String,
        /// Leave the portal group enabled while the credential changes
        #[arg(long)]
        keep_sessions: bool,
    },
    /// Remove a CHAP credential
    ChapRemove {
        target: String,
        #[arg(value_enum)]
        direction: Direction,
        user: String,
    },
    /// Persist the running configuration
    Save,
    /// Load the persisted configuration into the kernel
    Restore,
    /// Tear down the running configuration
    Clear,
    /// Local initiator operations
    #[command(subcommand)]
    Initiator(InitiatorCommand),
}

#[derive(Subcommand, Debug)]
enum InitiatorCommand {
    /// SendTargets discovery against a portal
    Discover {
        ip: String,
        #[arg(long, default_value_t = iscsi::DEFAULT_PORT)]
        port: u16,
    },
    /// List active sessions
    Sessions,
    Login {
        target: String,
        ip: String,
        #[arg(long, default_value_t = iscsi::DEFAULT_PORT)]
        port: u16,
    },
    Logout {
        target: String,
        ip: String,
        #[arg(long, default_value_t = iscsi::DEFAULT_PORT)]
        port: u16,
    },
    /// Log out of every session with a portal on this address
    LogoutAll { ip: String },
    /// Block device a logged-in LUN appeared as
    Device {
        target: String,
        ip: String,
        #[arg(long, default_value_t = iscsi::DEFAULT_PORT)]
        port: u16,
        #[arg(long, default_value_t = 0)]
        lun: u32,
    },
    /// Forget the node and discovery records of a portal
    Forget {
        ip: String,
        #[arg(long, default_value_t = iscsi::DEFAULT_PORT)]
        port: u16,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Direction {
    In,
    Out,
}

impl From<Direction> for ChapDirection {
    fn from(d: Direction) -> Self {
        match d {
            Direction::In => ChapDirection::Incoming,
            Direction::Out => ChapDirection::Outgoing,
        }
    }
}

fn initialize_logging(cli: &Cli) {
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    print!("{}", serde_yml::to_string(value)?);
    Ok(())
}

fn attributes(pairs: &[String]) -> Result<Options> {
    let mut options = Options::new();
    for pair in pairs {
        let (k, v) = pair
            .split_once('=')
            .with_context(|| format!("attribute {} is not key=value", pair))?;
        options.insert(k, v);
    }
    Ok(options)
}

fn run_initiator(settings: &Settings, command: InitiatorCommand) -> Result<()> {
    let initiator = LocalInitiator::system(settings);

    match command {
        InitiatorCommand::Discover { ip, port } => print(&initiator.discover_by_ip(&ip, port)?),
        InitiatorCommand::Sessions => print(&initiator.list_sessions()?),
        InitiatorCommand::Login { target, ip, port } => {
            initiator.login_target(&target, &iscsi::portal(&ip, port))
        }
        InitiatorCommand::Logout { target, ip, port } => {
            initiator.logout_target(&target, &iscsi::portal(&ip, port))
        }
        InitiatorCommand::LogoutAll { ip } => print(&initiator.logout_all_by_ip(&ip)?),
        InitiatorCommand::Device {
            target,
            ip,
            port,
            lun,
        } => {
            let device = initiator.get_block_device_of_target(&target, &iscsi::portal(&ip, port), lun)?;
            match device {
                Some(device) => println!("{}", device.display()),
                None => anyhow::bail!("{} lun {} has no block device", target, lun),
            }
            Ok(())
        }
        InitiatorCommand::Forget { ip, port } => initiator.clear_discovery_entry(&ip, port),
    }
}

fn run(store: &TargetStore, command: Command) -> Result<()> {
    match command {
        Command::List => print(&store.list_targets()?),
        Command::Show { target } => print(&store.get_target(&target)?),
        Command::Create { target } => {
            println!("{}", store.create_target(&target)?);
            Ok(())
        }
        Command::Delete { target } => store.delete_target(&target),
        Command::AddLun {
            target,
            path,
            read_only,
            write_back,
            wwn,
            attributes: pairs,
        } => {
            let options = LunOptions {
                read_only,
                write_back,
                wwn,
                attributes: attributes(&pairs)?,
            };
            println!("{}", store.add_lun(&target, &path, &options)?);
            Ok(())
        }
        Command::Luns { target } => print(&store.list_luns_for_target(&target)?),
        Command::Sessions { target } => print(&store.list_sessions_on_target(&target)?),
        Command::WhoUses { path } => print(&store.get_targets_by_path(&path)?),
        Command::ChapAdd {
            target,
            direction,
            user,
            password,
            keep_sessions,
        } => store.add_chap_user(&target, direction.into(), &user, &password, !keep_sessions),
        Command::ChapRemove {
            target,
            direction,
            user,
        } => store.remove_chap_user(&target, direction.into(), &user),
        Command::Save => {
            if !store.save_configuration()? {
                anyhow::bail!("configuration was never restored; refusing to overwrite it")
            }
            Ok(())
        }
        Command::Restore => store.restore_configuration(),
        Command::Clear => store.clear_configuration(),
        Command::Initiator(command) => run_initiator(store.settings(), command),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    initialize_logging(&cli);

    let settings = match &cli.config {
        Some(path) => Settings::read(path)?,
        None => Settings::default(),
    };
    debug!("using settings:\n{}", settings.to_yml()?);

    run(&TargetStore::system(settings), cli.command)
}
