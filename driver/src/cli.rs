use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use common::{
    rpc::BrokerClient,
    wordcount::{join_graph, wordcount_graph},
    DatasetId, FlowGraph, RunConfig, RunOutcome, SourceSpec, StepRegistry,
};
use std::{env, io::Write, sync::Arc};
use tokio::sync::watch;
use tracing::warn;

/// - En Docker: BROKER_URL=http://broker:8080
/// - Local: default http://localhost:8080
fn broker_base_url() -> String {
    env::var("BROKER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "driver")]
#[command(about = "Corre flujos de datos en local o sobre el cluster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Particiones del dataset final
    #[arg(long, default_value_t = 4)]
    partitions: u32,

    /// Corre en el cluster del broker (BROKER_URL) en vez de en este proceso
    #[arg(long)]
    distributed: bool,

    /// Desactiva la fusión de steps
    #[arg(long)]
    no_fuse: bool,

    /// Archivo JSONL de salida; sin él, se imprime en stdout
    #[arg(long)]
    output: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// WordCount sobre archivos de texto (un archivo por partición)
    Wordcount {
        /// Patrón glob de entrada
        #[arg(value_name = "GLOB")]
        input: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Inner join entre dos archivos JSONL
    Join {
        #[arg(value_name = "LEFT_JSONL")]
        left: String,

        #[arg(value_name = "RIGHT_JSONL")]
        right: String,

        /// Clave del lado izquierdo
        #[arg(long)]
        left_key: String,

        /// Clave del lado derecho
        #[arg(long)]
        right_key: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Lista los agentes registrados en el broker
    Agents,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Wordcount { input, run } => {
            let source = SourceSpec::text_glob(&input)?;
            if source.partition_count() == 0 {
                bail!("ningún archivo coincide con {input}");
            }
            let (graph, out) = wordcount_graph(source, run.partitions)?;
            execute(&graph, out, &run).await?;
        }

        Commands::Join {
            left,
            right,
            left_key,
            right_key,
            run,
        } => {
            let (graph, out) = join_graph(
                SourceSpec::TextFiles { paths: vec![left] },
                SourceSpec::TextFiles { paths: vec![right] },
                &left_key,
                &right_key,
                run.partitions,
            )?;
            execute(&graph, out, &run).await?;
        }

        Commands::Agents => {
            let broker = BrokerClient::new(&broker_base_url());
            let agents = broker.list_agents().await?;
            if agents.is_empty() {
                println!("No hay agentes registrados.");
            }
            for a in agents {
                println!("Agente {}", a.agent_id);
                println!("  host           : {} ({})", a.hostname, a.address);
                println!("  datos          : {}", a.data_addr);
                println!("  dead           : {}", a.dead);
                println!("  last_heartbeat : {} s ago", a.last_heartbeat_secs_ago);
                println!("  capacidad      : {}", a.capacity);
                println!("  reservado      : {}", a.reserved);
                println!("  libre          : {}", a.free);
                println!("  executors      : {}", a.running_executors);
                println!(
                    "  uso observado  : {} MB, cpu {:.1}%",
                    a.observed_memory_mb, a.cpu_percent
                );
                println!("  registrado     : {}", a.registered_at);
                println!();
            }
        }
    }

    Ok(())
}

async fn execute(graph: &FlowGraph, out: DatasetId, args: &RunArgs) -> Result<()> {
    let mut config = RunConfig::from_env()?;
    if args.no_fuse {
        config.planner.fuse = false;
    }

    // Ctrl-C cancela el flow en curso
    let (stop_tx, stop) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancelando flow");
            let _ = stop_tx.send(true);
        }
    });

    let outcome = if args.distributed {
        crate::run_distributed_until(graph, &broker_base_url(), &config, stop).await?
    } else {
        crate::run_local_until(
            graph,
            Arc::new(StepRegistry::with_builtins()),
            &config,
            stop,
        )
        .await?
    };

    print_summary(&outcome);
    if let Some(f) = &outcome.failure {
        bail!("el flow terminó {:?}: {:?} {}", outcome.status, f.kind, f.message);
    }
    write_output(&outcome, out, args.output.as_deref())
}

fn print_summary(outcome: &RunOutcome) {
    let s = &outcome.stats;
    eprintln!("Flow {}:", outcome.flow_id);
    eprintln!("  estado    : {:?}", outcome.status);
    eprintln!(
        "  regiones  : {} ({} corridas, {} fallidas, {} recomputadas)",
        s.regions, s.region_runs, s.failed_runs, s.recomputed_regions
    );
    eprintln!("  tareas    : {}", s.tasks);
    eprintln!("  registros : {}", s.records_out);
    eprintln!(
        "  duración  : {} ms",
        (outcome.finished_at - outcome.started_at).num_milliseconds()
    );
}

fn write_output(outcome: &RunOutcome, out: DatasetId, path: Option<&str>) -> Result<()> {
    let mut sink: Box<dyn Write> = match path {
        Some(p) => Box::new(
            std::fs::File::create(p).with_context(|| format!("no se pudo crear {p}"))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    for record in outcome.records(out) {
        sink.write_all(record)?;
        sink.write_all(b"\n")?;
    }
    sink.flush()?;
    if let Some(p) = path {
        eprintln!("Salida escrita en {p}");
    }
    Ok(())
}
