//! # Carnelia Counter
//!
//! A standalone CLI that starts several cluster members in one process and
//! walks through replicated counters and sets running on them.
//!
//! ## Replica model
//!
//! ```text
//! member-0 ─┐                      ┌─ replica of "page_views" (max register)
//! member-1 ─┼── memory network ────┼─ replica of "page_views"
//! member-2 ─┘                      └─ replica of "page_views"
//! add(n)   → every holder adds n, nobody waits for the others
//! value()  → the largest count among the replicas that answer
//! ```

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::*;
use mdcs_cluster::prelude::*;
use mdcs_cluster::Result;
use tokio::sync::broadcast::Receiver;
use tracing_subscriber::EnvFilter;

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "carnelia-counter")]
#[command(about = "Replicated counters and sets on an in-process Carnelia cluster")]
#[command(version)]
struct Cli {
    /// Number of cluster members to start
    #[arg(short, long, default_value_t = 3)]
    members: usize,

    /// JSON file with cluster configuration overrides
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Basic demo: create a counter and a set, write from every member, read back
    Demo,
    /// Network partition simulation: isolate a member, write, heal, anti-entropy
    Partition,
    /// Master failover: heartbeats, silence detection, operator picks a new master
    Failover,
}

// ─── Simulation: several members on one memory network ────────────────────

struct Simulation {
    network: Arc<MemoryNetwork>,
    clusters: Vec<Arc<Cluster>>,
}

impl Simulation {
    fn start(members: usize, config: ClusterConfig) -> Result<Self> {
        let mut registry = Registry::new();
        registry
            .register::<GCounterService>()
            .register::<GSetService<String>>();

        let network = MemoryNetwork::new();
        let clusters = network.spawn_cluster(members, config, Arc::new(registry))?;
        Ok(Self { network, clusters })
    }

    fn name(&self, i: usize) -> String {
        self.clusters[i].local_member().id().to_string()
    }

    fn id(&self, i: usize) -> MemberId {
        self.clusters[i].local_member().id().clone()
    }

    fn counter(&self, i: usize, name: &str) -> GCounterHandle {
        GCounterHandle::attach(self.clusters[i].clone(), name)
    }

    fn set(&self, i: usize, name: &str) -> GSetHandle<String> {
        GSetHandle::attach(self.clusters[i].clone(), name)
    }

    fn len(&self) -> usize {
        self.clusters.len()
    }
}

// ─── Pretty printing ──────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn sync_arrow(from: &str, to: &str) {
    println!(
        "  {} {} {} {}",
        from.bright_magenta(),
        "──merge──▶".bright_cyan(),
        to.bright_magenta(),
        "✓".bright_green()
    );
}

fn show_member(sim: &Simulation, i: usize, counter: &str, set: &str) {
    let border = "─".repeat(44);
    println!("  ┌{}┐", border);
    println!(
        "  │ {:^42} │",
        format!("Member: {}", sim.name(i)).bright_yellow().to_string()
    );
    println!("  ├{}┤", border);

    let count = match sim.counter(i, counter).local_value() {
        Ok(value) => value.to_string(),
        Err(_) => "(no replica)".to_string(),
    };
    let size = match sim.set(i, set).local_size() {
        Ok(size) => size.to_string(),
        Err(_) => "(no replica)".to_string(),
    };
    println!("  │ {:<42} │", format!("{:<16} = {}", counter, count));
    println!("  │ {:<42} │", format!("{:<16} = {} entries", set, size));
    println!("  └{}┘", border);
}

fn convergence_check(sim: &Simulation, counter: &str) -> bool {
    let values: Vec<Option<i64>> = (0..sim.len())
        .map(|i| sim.counter(i, counter).local_value().ok())
        .collect();
    values.windows(2).all(|pair| pair[0] == pair[1])
}

fn convergence_result(converged: bool) {
    if converged {
        println!(
            "\n  {} {}",
            "✓".bright_green().bold(),
            "ALL REPLICAS CONVERGED, values are identical!"
                .bright_green()
                .bold()
        );
    } else {
        println!(
            "\n  {} {}",
            "✗".bright_red().bold(),
            "DIVERGENCE DETECTED, replicas differ!".bright_red().bold()
        );
    }
}

fn liveness_line(sim: &Simulation, i: usize) -> String {
    match sim.clusters[i].master_liveness() {
        MasterLiveness::NoMaster => format!("{}: no master", sim.name(i)),
        MasterLiveness::Alive { master, silent_for } => format!(
            "{}: master {} {} (silent {:?})",
            sim.name(i),
            master,
            "alive".bright_green(),
            silent_for
        ),
        MasterLiveness::Unreachable { master, silent_for } => format!(
            "{}: master {} {} (silent {:?})",
            sim.name(i),
            master,
            "UNREACHABLE".bright_red(),
            silent_for
        ),
    }
}

fn drain_events(label: &str, events: &mut Receiver<ClusterEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            ClusterEvent::MasterUnreachable { master, silent_for } => step(&format!(
                "{} saw {} go silent for {:?}",
                label,
                master.to_string().bright_red(),
                silent_for
            )),
            ClusterEvent::MasterClaimed { claimant, recognized } => step(&format!(
                "{} heard {} claim mastership (known member: {})",
                label,
                claimant.id().to_string().bright_magenta(),
                recognized
            )),
            ClusterEvent::MasterChanged(master) => {
                step(&format!("{} now follows {:?}", label, master.map(|m| m.to_string())))
            }
            _ => {}
        }
    }
}

// ─── Demo ──────────────────────────────────────────────────────────────────

async fn run_demo(sim: &Simulation) -> Result<()> {
    header("DEMO: Replicated Counter & Set");

    section("Phase 1: Create services on their replica holders");
    let views = GCounterHandle::create(sim.clusters[0].clone(), "page_views").await?;
    let visitors = GSetHandle::<String>::create(sim.clusters[0].clone(), "visitors").await?;
    let holders: Vec<String> = views
        .replicas()
        .holders()
        .iter()
        .map(|m| m.id().to_string())
        .collect();
    step(&format!("page_views held by [{}]", holders.join(", ")));

    section("Phase 2: Every member writes");
    for i in 0..sim.len() {
        let amount = (i as i64 + 1) * 5;
        let delivered = sim.counter(i, "page_views").add(amount)?.delivered().await;
        step(&format!("{}: page_views += {} (reached {} replicas)", sim.name(i), amount, delivered));

        let visitor = format!("visitor-{}", i % 2);
        sim.set(i, "visitors").add(visitor.clone())?.delivered().await;
        step(&format!("{}: visitors ∪= {{{}}}", sim.name(i), visitor));
    }

    section("Phase 3: Local replica state");
    for i in 0..sim.len() {
        show_member(sim, i, "page_views", "visitors");
    }
    convergence_result(convergence_check(sim, "page_views"));

    section("Final values (read across replicas)");
    step(&format!("page_views = {}", views.value().await?));
    step(&format!("visitors   = {} distinct", visitors.size().await?));
    step(&format!(
        "contains visitor-1: {}",
        visitors.contains(&"visitor-1".to_string()).await?
    ));
    Ok(())
}

// ─── Partition ─────────────────────────────────────────────────────────────

async fn run_partition(sim: &Simulation) -> Result<()> {
    header("PARTITION: Isolate, Write, Heal & Converge");
    let last = sim.len() - 1;

    section("Phase 1: Shared baseline");
    let requests = GCounterHandle::create(sim.clusters[0].clone(), "requests").await?;
    GSetHandle::<String>::create(sim.clusters[0].clone(), "regions").await?;
    requests.add(100)?.delivered().await;
    step("requests = 100 on every replica");

    section(&format!("Phase 2: NETWORK PARTITION, {} is cut off", sim.name(last)));
    sim.network.isolate(&sim.id(last));
    let delivered = requests.add(25)?.delivered().await;
    step(&format!("{}: requests += 25 (reached {} replicas)", sim.name(0), delivered));
    sim.set(0, "regions").add("east".to_string())?.delivered().await;
    sim.set(last, "regions").add("west".to_string())?.delivered().await;
    step(&format!("{}: regions ∪= {{east}}", sim.name(0)));
    step(&format!("{}: regions ∪= {{west}}", sim.name(last)));

    for i in 0..sim.len() {
        show_member(sim, i, "requests", "regions");
    }
    step(&format!(
        "{} reads requests = {} (only its own replica answers)",
        sim.name(last),
        sim.counter(last, "requests").value().await?
    ));
    convergence_result(convergence_check(sim, "requests"));

    section("Phase 3: HEAL and run anti-entropy");
    sim.network.heal(&sim.id(last));
    let counter_round = sim.counter(last, "requests").replicas().anti_entropy().await?;
    let set_round = sim.set(last, "regions").replicas().anti_entropy().await?;
    sync_arrow("peers", &sim.name(last));
    step(&format!(
        "requests: pulled={}, pushed to {} | regions: pulled={}, pushed to {}",
        counter_round.pulled, counter_round.pushed, set_round.pulled, set_round.pushed
    ));
    // Give the pushes a moment to land
    tokio::time::sleep(Duration::from_millis(50)).await;

    for i in 0..sim.len() {
        show_member(sim, i, "requests", "regions");
    }
    convergence_result(convergence_check(sim, "requests"));
    step(&format!("requests = {} (100 + 25)", requests.value().await?));
    Ok(())
}

// ─── Failover ──────────────────────────────────────────────────────────────

async fn run_failover(sim: &Simulation) -> Result<()> {
    header("FAILOVER: Heartbeats & Master Liveness");
    let master = sim.id(0);

    section(&format!("Phase 1: Everyone follows {}", master));
    for cluster in &sim.clusters {
        cluster.set_master(Some(master.clone()));
    }
    let mut events = sim.clusters[1].subscribe();
    let emitters: Vec<_> = sim.clusters.iter().map(|c| c.start_heartbeats()).collect();

    let interval = sim.clusters[0].config().heartbeat_interval();
    let timeout = sim.clusters[0].config().master_timeout();
    tokio::time::sleep(interval * 3).await;
    for i in 1..sim.len() {
        step(&liveness_line(sim, i));
    }

    section(&format!("Phase 2: {} stops answering", master));
    sim.network.isolate(&master);
    tokio::time::sleep(timeout + interval * 2).await;
    for i in 1..sim.len() {
        step(&liveness_line(sim, i));
    }
    drain_events(&sim.name(1), &mut events);

    section(&format!("Phase 3: Operator promotes {}", sim.name(1)));
    let successor = sim.id(1);
    for cluster in &sim.clusters[1..] {
        cluster.set_master(Some(successor.clone()));
    }
    sim.network.heal(&master);
    step(&format!("{} rejoins, still believing it is master", master));
    tokio::time::sleep(interval * 3).await;

    for i in 1..sim.len() {
        step(&liveness_line(sim, i));
    }
    drain_events(&sim.name(1), &mut events);

    for emitter in emitters {
        emitter.abort();
    }
    Ok(())
}

// ─── Main ──────────────────────────────────────────────────────────────────

fn load_config(cli: &Cli) -> Result<ClusterConfig> {
    match &cli.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .map_err(|e| ClusterError::InvalidConfig(format!("cannot read {}: {}", path, e)))?;
            ClusterConfig::from_json(&json)
        }
        None => Ok(ClusterConfig::default()),
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.members < 2 {
        return Err(ClusterError::InvalidArgument(
            "at least 2 members are needed".to_string(),
        ));
    }
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Demo => run_demo(&Simulation::start(cli.members, config)?).await,
        Commands::Partition => run_partition(&Simulation::start(cli.members, config)?).await,
        Commands::Failover => {
            // Short timers so the walkthrough finishes quickly
            let config = ClusterConfigBuilder::new()
                .replication_factor(config.replication_factor)
                .request_timeout(config.request_timeout_ms)
                .heartbeat_interval(100)
                .master_timeout(400)
                .build()?;
            run_failover(&Simulation::start(cli.members, config)?).await
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("{} {}", "error:".bright_red().bold(), err);
        std::process::exit(1);
    }
}
