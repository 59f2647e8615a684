//! `reefd`: the Reef storage node daemon.
//!
//! Binary entrypoint that ties all Reef components together into a running
//! node, plus a small administrative client that talks to a running node
//! over the cluster transport.
//!
//! # Usage
//!
//! ```text
//! reefd start                                   # start the node
//! reefd start -c reef.toml                      # start with a config file
//! reefd start -d ./node2 --attr Country=Germany # second instance
//! reefd start --peer <node_id>@<host:port>      # join an existing cluster
//! reefd status                                  # local metadata summary
//! reefd policy "REP 2 IN X CBF 2 SELECT 2 FROM * AS X"
//! reefd tick --node <id@addr> --secret <s>      # advance the epoch
//! reefd container create --node <id@addr> --owner alice --policy "REP 1"
//! reefd object put --node <id@addr> --owner alice --container <cid> -f file
//! ```

mod config;
mod handler;

use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, SecretKey};
use reef_engine::{ContainerInfo, ReefClient, ReefEngine, ReefNode};
use reef_meta::MetaStore;
use reef_net::{ReefTransport, Transport};
use reef_placement::parse_rule;
use reef_store::{FileStore, MemoryStore, PayloadStore};
use reef_types::{BasicAcl, ClusterEvent, ContainerId, NodeId, NodeRecord, ObjectAddress, OwnerId};
use tracing::{debug, error, info, warn};

use config::CliConfig;
use handler::ReefProtocol;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "reefd", version, about = "Reef distributed object storage daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Reef node.
    Start {
        /// Override data directory (useful for running multiple instances).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Peer node(s) to join through on startup.
        ///
        /// Format: `<node_id>` or `<node_id>@<host:port>`.
        /// Can be specified multiple times.
        #[arg(short, long)]
        peer: Vec<String>,

        /// Cluster secret (nodes must share the same secret).
        ///
        /// Can also be set via REEF_SECRET or `[cluster] secret` in the config
        /// file. If none is provided, a random secret is generated and shown.
        #[arg(long, env = "REEF_SECRET")]
        secret: Option<String>,

        /// Run fully in-memory (no disk persistence).
        #[arg(short, long)]
        memory: bool,

        /// Placement attribute of this node, `KEY=VALUE`. Repeatable.
        #[arg(short, long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
    },

    /// Show the local metadata store: members, epoch and records.
    Status,

    /// Parse a placement policy and print its canonical form.
    Policy {
        /// The policy, e.g. `"REP 2 IN X CBF 1 SELECT 2 FROM * AS X"`.
        rule: String,
    },

    /// Advance the cluster epoch through a running node.
    Tick {
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Print the current epoch of a running node.
    Epoch {
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Container operations.
    Container {
        #[command(subcommand)]
        action: ContainerCommands,
    },

    /// Object operations.
    Object {
        #[command(subcommand)]
        action: ObjectCommands,
    },
}

/// How to reach a running node.
#[derive(Args)]
struct RemoteArgs {
    /// Node to talk to, `<node_id>@<host:port>`.
    #[arg(short, long)]
    node: String,

    /// Cluster secret of the node.
    #[arg(long, env = "REEF_SECRET")]
    secret: Option<String>,
}

#[derive(Subcommand)]
enum ContainerCommands {
    /// Create a container.
    Create {
        #[command(flatten)]
        remote: RemoteArgs,
        /// Owner: a hex id, or any string hashed into one.
        #[arg(long, value_parser = parse_owner)]
        owner: OwnerId,
        /// Placement policy.
        #[arg(long)]
        policy: String,
        /// Basic ACL: a name (`private`, `public-read`, ...) or hex bits.
        #[arg(long, default_value = "private")]
        acl: BasicAcl,
        /// Optional human-readable name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Describe a container.
    Get {
        #[command(flatten)]
        remote: RemoteArgs,
        id: ContainerId,
    },
    /// List the containers of an owner.
    List {
        #[command(flatten)]
        remote: RemoteArgs,
        #[arg(long, value_parser = parse_owner)]
        owner: OwnerId,
    },
    /// Delete a container. Only its owner may do so.
    Delete {
        #[command(flatten)]
        remote: RemoteArgs,
        id: ContainerId,
        #[arg(long, value_parser = parse_owner)]
        owner: OwnerId,
    },
}

#[derive(Subcommand)]
enum ObjectCommands {
    /// Store a file as an object and print its address.
    Put {
        #[command(flatten)]
        remote: RemoteArgs,
        #[arg(long, value_parser = parse_owner)]
        owner: OwnerId,
        #[arg(long)]
        container: ContainerId,
        /// File to upload.
        #[arg(short, long)]
        file: PathBuf,
        /// Last epoch at which the object is readable.
        #[arg(long)]
        expire_at: Option<u64>,
        /// Object attribute, `KEY=VALUE`. Repeatable.
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
    },
    /// Fetch an object by `<container_id>/<object_id>`.
    Get {
        #[command(flatten)]
        remote: RemoteArgs,
        address: ObjectAddress,
        #[arg(long, value_parser = parse_owner)]
        owner: OwnerId,
        /// Write the payload here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level, &config.log.format);

    match cli.command {
        Commands::Start {
            data_dir,
            peer,
            secret,
            memory,
            attributes,
        } => {
            // CLI args override config file values.
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if !peer.is_empty() {
                config.cluster.peers = peer;
            }
            if let Some(s) = secret {
                config.cluster.secret = s;
            }
            if memory {
                config.storage.backend = "memory".to_string();
            }
            config.node.attributes.extend(attributes);
            cmd_start(config).await
        }
        Commands::Status => cmd_status(&config),
        Commands::Policy { rule } => cmd_policy(&rule),
        Commands::Tick { remote } => {
            let client = connect(&config, &remote).await?;
            let epoch = client.tick_epoch().await?;
            println!("{epoch}");
            Ok(())
        }
        Commands::Epoch { remote } => {
            let client = connect(&config, &remote).await?;
            println!("{}", client.current_epoch().await?);
            Ok(())
        }
        Commands::Container { action } => cmd_container(&config, action).await,
        Commands::Object { action } => cmd_object(&config, action).await,
    }
}

/// Initialize the `tracing` subscriber.
///
/// Respects `RUST_LOG` if set, otherwise uses the config level. Logs go to
/// stderr so client commands keep stdout for their output.
fn setup_tracing(level: &str, format: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

// -----------------------------------------------------------------------
// reefd start
// -----------------------------------------------------------------------

async fn cmd_start(mut config: CliConfig) -> Result<()> {
    let memory_mode = config.memory_mode();
    info!(
        data_dir = %config.node.data_dir.display(),
        backend = %config.storage.backend,
        attributes = ?config.node.attributes,
        "starting reefd"
    );

    if !memory_mode {
        std::fs::create_dir_all(&config.node.data_dir)
            .context("failed to create data directory")?;
    }

    // --- Node identity (iroh SecretKey) ---
    let secret_key = if memory_mode {
        info!("generated ephemeral node key (memory mode)");
        random_secret_key()
    } else {
        load_or_create_secret_key(&config.node.data_dir)?
    };
    let node_id = NodeId::from(*secret_key.public().as_bytes());

    // --- Cluster secret ---
    let generated_secret = config.cluster.secret.is_empty();
    if generated_secret {
        config.cluster.secret = hex::encode(rand::random::<[u8; 16]>());
    }
    let alpn = reef_net::cluster_alpn(config.cluster.secret.as_bytes());
    let cluster_hash = blake3::hash(config.cluster.secret.as_bytes()).to_hex();
    info!(
        cluster_id = &cluster_hash[..16],
        "cluster identity derived from secret"
    );

    // --- Network transport (iroh QUIC) ---
    // The Router runs the accept loop; the transport only dials out.
    let endpoint = Endpoint::builder()
        .secret_key(secret_key)
        .alpns(vec![alpn.clone()])
        .relay_mode(iroh::RelayMode::Default)
        .bind()
        .await
        .context("failed to bind iroh endpoint")?;
    let transport = Arc::new(
        ReefTransport::from_endpoint_with_alpn(endpoint.clone(), alpn.clone())
            .with_connect_timeout(config.connect_timeout()),
    );

    let local_addr = endpoint.addr();
    for addr in local_addr.ip_addrs() {
        info!(%addr, "listening on");
    }
    let advertised = match local_addr.ip_addrs().next() {
        Some(addr) => format!("{}@{addr}", endpoint.id()),
        None => endpoint.id().to_string(),
    };

    // --- Stores ---
    let meta = if memory_mode {
        info!("using temporary metadata store");
        Arc::new(MetaStore::open_temporary().context("failed to open metadata store")?)
    } else {
        let path = config.node.data_dir.join("meta");
        Arc::new(MetaStore::open(&path).context("failed to open metadata store")?)
    };
    let store: Arc<dyn PayloadStore> = if memory_mode {
        let max_bytes = config.storage.max_bytes.unwrap_or(u64::MAX);
        info!(max_bytes, "using in-memory payload store");
        Arc::new(MemoryStore::new(max_bytes))
    } else {
        let path = config.node.data_dir.join("objects");
        info!(path = %path.display(), "using file payload store");
        Arc::new(FileStore::new(&path).context("failed to initialize file store")?)
    };

    // --- Node ---
    let mut local = NodeRecord::new(node_id, advertised);
    local.attributes = config.node.attributes.clone();
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let node = ReefNode::new(config.node_config(), local, meta, store, dyn_transport)
        .context("failed to create node")?;
    info!(%node_id, epoch = node.current_epoch(), "node identity");

    let router = Router::builder(endpoint.clone())
        .accept(alpn, ReefProtocol::new(node.clone(), transport.clone()))
        .spawn();

    // Members learned later carry their address in their record.
    spawn_address_learner(&node, transport.clone());

    let restored = node.restore_members().await?;
    for peer in node.cluster().peers().await {
        learn_address(&transport, &peer).await;
    }
    if restored > 0 {
        info!(restored, "restored members from a previous run");
    }

    // --- Join ---
    let mut seeds = Vec::new();
    for peer in &config.cluster.peers {
        match parse_peer(peer) {
            Ok((addr, peer_id)) => {
                transport.add_peer(peer_id, addr).await;
                seeds.push(peer_id);
            }
            Err(e) => warn!(%peer, %e, "invalid peer format, skipping"),
        }
    }
    if !seeds.is_empty() {
        match node.join(&seeds).await {
            Ok(answered) => info!(answered, "joined cluster"),
            Err(e) => warn!(%e, "no seed answered, starting alone"),
        }
    }

    let tasks = node.start();

    if generated_secret {
        info!("cluster secret (generated): {}", config.cluster.secret);
    }
    info!(
        "to join this node: reefd start --secret {} --peer {}",
        config.cluster.secret,
        node.cluster().local_record().endpoint
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    tasks.shutdown();
    router.shutdown().await.context("router shutdown failed")?;
    Ok(())
}

/// Route to members as soon as the cluster learns about them.
fn spawn_address_learner(node: &Arc<ReefNode>, transport: Arc<ReefTransport>) {
    let mut events = node.cluster().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClusterEvent::NodeJoined(record)) => learn_address(&transport, &record).await,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "address learner lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn learn_address(transport: &ReefTransport, record: &NodeRecord) {
    match parse_peer(&record.endpoint) {
        Ok((addr, id)) if id == record.node_id => transport.learn_peer(id, addr).await,
        Ok(_) => warn!(node = %record.node_id, "member advertises another node's endpoint"),
        Err(e) => debug!(node = %record.node_id, %e, "member endpoint is not dialable"),
    }
}

// -----------------------------------------------------------------------
// Client commands
// -----------------------------------------------------------------------

/// Open a client connection to the node named in `remote`.
async fn connect(config: &CliConfig, remote: &RemoteArgs) -> Result<ReefClient> {
    let secret = remote
        .secret
        .clone()
        .unwrap_or_else(|| config.cluster.secret.clone());
    anyhow::ensure!(
        !secret.is_empty(),
        "a cluster secret is required (--secret, REEF_SECRET or the config file)"
    );

    let (addr, node_id) = parse_peer(&remote.node)?;
    let transport = ReefTransport::bind_with_alpn(
        random_secret_key(),
        iroh::RelayMode::Default,
        reef_net::cluster_alpn(secret.as_bytes()),
    )
    .await
    .context("failed to bind client endpoint")?;
    transport.add_peer(node_id, addr).await;

    Ok(ReefClient::new(Arc::new(transport), node_id))
}

async fn cmd_container(config: &CliConfig, action: ContainerCommands) -> Result<()> {
    match action {
        ContainerCommands::Create {
            remote,
            owner,
            policy,
            acl,
            name,
        } => {
            let client = connect(config, &remote).await?;
            let id = client.create_container(owner, &policy, acl, name).await?;
            println!("{id}");
        }
        ContainerCommands::Get { remote, id } => {
            let client = connect(config, &remote).await?;
            let container = client.get_container(id).await?;
            println!("{}", ContainerInfo { container });
        }
        ContainerCommands::List { remote, owner } => {
            let client = connect(config, &remote).await?;
            for id in client.list_containers(owner).await? {
                println!("{id}");
            }
        }
        ContainerCommands::Delete { remote, id, owner } => {
            let client = connect(config, &remote).await?;
            client.delete_container(id, owner).await?;
            println!("deleted {id}");
        }
    }
    Ok(())
}

async fn cmd_object(config: &CliConfig, action: ObjectCommands) -> Result<()> {
    match action {
        ObjectCommands::Put {
            remote,
            owner,
            container,
            file,
            expire_at,
            attributes,
        } => {
            let payload = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let client = connect(config, &remote).await?;
            let attributes: BTreeMap<String, String> = attributes.into_iter().collect();
            let object_id = client
                .put_object(container, owner, Bytes::from(payload), expire_at, attributes)
                .await?;
            println!("{}", ObjectAddress::new(container, object_id));
        }
        ObjectCommands::Get {
            remote,
            address,
            owner,
            out,
        } => {
            let client = connect(config, &remote).await?;
            let (header, payload) = client.get_object(address, owner).await?;
            debug!(%address, size = header.size, "object fetched");
            match out {
                Some(path) => tokio::fs::write(&path, &payload)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => std::io::stdout()
                    .write_all(&payload)
                    .context("failed to write to stdout")?,
            }
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------
// reefd status / policy
// -----------------------------------------------------------------------

fn cmd_status(config: &CliConfig) -> Result<()> {
    let meta_path = config.node.data_dir.join("meta");

    let meta = MetaStore::open(&meta_path).map_err(|e| {
        error!(path = %meta_path.display(), %e, "failed to open metadata store");
        anyhow::anyhow!(
            "cannot open metadata at {}. Is the node running? ({e})",
            meta_path.display(),
        )
    })?;

    println!("Epoch: {}", meta.get_epoch()?);

    let members = meta.list_members()?;
    println!("Known members: {}", members.len());
    for member in &members {
        println!(
            "  {} state={:?} endpoint={} attributes={:?}",
            member.node_id, member.state, member.endpoint, member.attributes,
        );
    }

    let containers = meta.list_containers()?;
    let tombstones = containers.iter().filter(|r| r.is_tombstone()).count();
    println!(
        "Containers: {} live, {tombstones} deleted",
        containers.len() - tombstones
    );
    println!("Objects: {}", meta.list_objects()?.len());
    println!("Pending GC: {}", meta.list_gc_marks()?.len());

    Ok(())
}

fn cmd_policy(rule: &str) -> Result<()> {
    let rule = parse_rule(rule).context("invalid placement policy")?;
    println!("{rule}");
    println!();
    println!("{}", rule.to_multiline());
    Ok(())
}

// -----------------------------------------------------------------------
// Argument helpers
// -----------------------------------------------------------------------

/// Parse a peer node string.
///
/// Formats:
/// - `<node_id>`: hex-encoded 32-byte public key (iroh relay used for discovery)
/// - `<node_id>@<host:port>`: with an explicit direct address
fn parse_peer(s: &str) -> Result<(EndpointAddr, NodeId)> {
    let (id_str, addr_str) = match s.split_once('@') {
        Some((id, addr)) => (id, Some(addr)),
        None => (s, None),
    };

    let endpoint_id: iroh::EndpointId = id_str
        .parse()
        .context("invalid node ID (expected hex-encoded public key)")?;

    let mut endpoint_addr = EndpointAddr::new(endpoint_id);
    if let Some(addr) = addr_str {
        let socket_addr: SocketAddr = addr
            .parse()
            .context("invalid socket address in peer (expected host:port)")?;
        endpoint_addr = endpoint_addr.with_ip_addr(socket_addr);
    }

    Ok((endpoint_addr, reef_net::node_id_of(endpoint_id)))
}

/// Parse `KEY=VALUE`.
fn parse_attribute(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

/// An owner given as 64 hex characters, or any other string hashed into one.
fn parse_owner(s: &str) -> Result<OwnerId, String> {
    if s.is_empty() {
        return Err("owner must not be empty".to_string());
    }
    Ok(s.parse().unwrap_or_else(|_| OwnerId::from_data(s.as_bytes())))
}

// -----------------------------------------------------------------------
// Key management
// -----------------------------------------------------------------------

fn random_secret_key() -> SecretKey {
    SecretKey::from(rand::random::<[u8; 32]>())
}

/// Load or create a persistent iroh secret key from `data_dir/node.key`.
///
/// The key gives each node a stable identity across restarts; different
/// data directories get different identities.
fn load_or_create_secret_key(data_dir: &Path) -> Result<SecretKey> {
    let key_path = data_dir.join("node.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("failed to read node.key")?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("node.key must be exactly 32 bytes"))?;
        let key = SecretKey::from_bytes(&arr);
        info!(endpoint_id = %key.public().fmt_short(), "loaded existing node key");
        Ok(key)
    } else {
        let key = random_secret_key();
        std::fs::write(&key_path, key.to_bytes()).context("failed to write node.key")?;
        info!(
            path = %key_path.display(),
            endpoint_id = %key.public().fmt_short(),
            "generated new node key"
        );
        Ok(key)
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
