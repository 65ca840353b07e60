use clap::{Parser, Subcommand};
use rillcast::{
    BridgeConfig, RealtimeBridge, SchemaConfig, SchemaManager, SchemaPlan,
    lease::LeaseStore, metrics::render_prometheus, registry::RegistrationStore,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rillcast", version, about = "Rillcast realtime bridge CLI")]
struct Cli {
    /// Postgres connection string. Falls back to DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// Schema holding the bridge tables
    #[arg(long, env = "RILLCAST_SCHEMA", default_value = "public")]
    schema: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show planned DDL changes without applying
    SchemaPlan,

    /// Apply DDL changes (create schema/tables/indexes as needed)
    SchemaSync,

    /// List instance leases and whether they have expired
    Leases,

    /// List client registrations
    Clients {
        /// Only clients owned by this instance
        #[arg(long)]
        instance: Option<String>,
    },

    /// Run a bridge with the in-memory broker until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> rillcast::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let url = match cli
        .database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
    {
        Some(u) => u,
        None => {
            eprintln!("error: --database-url or env DATABASE_URL is required");
            std::process::exit(2);
        }
    };

    let pool = PgPoolOptions::new().max_connections(8).connect(&url).await?;
    let schema = SchemaConfig::new(cli.schema.clone());
    let mgr = SchemaManager::new(pool.clone());

    match cli.command {
        Commands::SchemaPlan => {
            let plan = mgr.plan(&schema).await?;
            print_plan(&plan);
        }
        Commands::SchemaSync => {
            let plan = mgr.sync(&schema).await?;
            if plan.is_empty() {
                println!("No changes needed.");
            } else {
                println!("Applied changes:");
                print_plan(&plan);
            }
        }
        Commands::Leases => {
            let config = BridgeConfig::from_env()?.with_schema(cli.schema);
            let leases = LeaseStore::new(pool, &config.schema, config.shared_channel.clone());
            let now = chrono::Utc::now();
            let rows = leases.list().await?;
            if rows.is_empty() {
                println!("No live instances.");
            }
            for lease in rows {
                let state = if lease.is_expired_at(now) { "expired" } else { "live" };
                println!("{}  {}  {}", lease.instance_id, lease.valid_until.to_rfc3339(), state);
            }
        }
        Commands::Clients { instance } => {
            let config = BridgeConfig::from_env()?.with_schema(cli.schema);
            let store = RegistrationStore::new(
                pool,
                &config.schema,
                config.shared_channel.clone(),
                config.instance_id.clone().unwrap_or_else(rillcast::InstanceId::generate),
            );
            let rows = match instance {
                Some(id) => store.list_by_instance(&id).await?,
                None => store.list_all().await?,
            };
            println!("Client registrations ({}):", rows.len());
            for reg in rows {
                let topics = reg.subscriptions.iter().cloned().collect::<Vec<_>>().join(",");
                println!(
                    "{}  owner={}  writer={}  auth={}/{}  [{}]",
                    reg.client_id,
                    reg.instance_id,
                    reg.writer_instance_id,
                    reg.auth_collection_ref,
                    reg.auth_record_ref,
                    topics
                );
            }
        }
        Commands::Run => {
            let config = BridgeConfig::from_env()?.with_schema(cli.schema);
            let handle = RealtimeBridge::builder(pool).config(config).start().await?;
            println!("instance {} running; Ctrl-C to stop", handle.instance_id());

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = handle.stopped() => {
                    eprintln!("bridge stopped after a protocol error");
                }
            }

            let faulted = handle.is_faulted();
            handle.shutdown().await?;
            print!("{}", render_prometheus());
            if faulted {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn print_plan(plan: &SchemaPlan) {
    if !plan.warnings().is_empty() {
        eprintln!("Warnings ({}):", plan.warnings().len());
        for w in plan.warnings() {
            eprintln!("  - {}", w);
        }
    }

    if plan.actions().is_empty() {
        println!("No pending DDL actions.");
        return;
    }

    println!("DDL actions ({}):", plan.actions().len());
    for (i, action) in plan.actions().iter().enumerate() {
        println!("{}. {}", i + 1, action.description());
        println!("{}\n", action.sql());
    }
}
