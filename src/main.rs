use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinSet;
use uuid::Uuid;

mod alerts;
mod compare;
mod config;
mod cycle;
mod db;
mod error;
mod models;
mod profile;
mod report;
mod risk;
mod sim;
mod store;

use config::Config;
use cycle::ProgressionEngine;
use models::{CycleResult, LabValues, TreatmentContext};
use store::{InMemoryStorage, Storage};

#[derive(Parser)]
#[command(name = "ckd-progression-monitor")]
#[command(about = "Chronic kidney disease risk staging and progression monitoring", long_about = None)]
struct Cli {
    /// Seed for reproducible simulation (overrides CKD_SIMULATION_SEED)
    #[arg(long, global = true)]
    seed: Option<u64>,
    /// Postgres pool size (overrides CKD_MAX_CONNECTIONS)
    #[arg(long, global = true)]
    max_connections: Option<u32>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demonstration patients and lab results
    Seed,
    /// Import patients and lab results from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Classify a single lab pair and print the result as JSON
    Classify {
        #[arg(long)]
        egfr: f64,
        #[arg(long)]
        uacr: Option<f64>,
    },
    /// Record the baseline cycle for a patient
    Baseline {
        #[arg(long)]
        patient: Uuid,
    },
    /// Generate the cycle after `current-cycle`
    Advance {
        #[arg(long)]
        patient: Uuid,
        #[arg(long)]
        current_cycle: i32,
    },
    /// Advance a patient through several cycles from its latest one
    Simulate {
        #[arg(long)]
        patient: Uuid,
        #[arg(long, default_value_t = 6)]
        cycles: u32,
    },
    /// Advance every patient by one cycle
    AdvanceAll,
    /// Run a simulation for one synthetic patient without a database
    Demo {
        #[arg(long, default_value_t = 62.0)]
        egfr: f64,
        #[arg(long)]
        uacr: Option<f64>,
        #[arg(long, default_value_t = 12)]
        cycles: u32,
    },
    /// Generate a markdown progression report for a patient
    Report {
        #[arg(long)]
        patient: Uuid,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if cli.seed.is_some() {
        config.simulation_seed = cli.seed;
    }
    if let Some(max_connections) = cli.max_connections {
        config.max_connections = max_connections;
    }

    match cli.command {
        Commands::Classify { egfr, uacr } => {
            let classification = risk::classify_labs(Some(egfr), uacr)?;
            println!("{}", serde_json::to_string_pretty(&classification)?);
        }
        Commands::Demo { egfr, uacr, cycles } => {
            let storage = Arc::new(InMemoryStorage::new());
            let patient = Uuid::new_v4();
            storage
                .add_patient(patient, Some(LabValues { egfr, uacr }), TreatmentContext::default())
                .await;
            let engine = ProgressionEngine::new(storage);
            simulate(&engine, patient, cycles, config.simulation_seed).await?;

            let storage = engine.storage();
            let report = report::build_report(
                patient,
                &storage.list_cycles(patient).await?,
                &storage.list_transitions(patient).await?,
                &storage.list_alerts(patient).await?,
                &storage.list_recommendations(patient).await?,
            );
            println!();
            print!("{report}");
        }
        command => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(config.database_url()?)
                .await
                .context("failed to connect to Postgres")?;
            run_with_database(command, pool, &config).await?;
        }
    }

    Ok(())
}

async fn run_with_database(command: Commands, pool: sqlx::PgPool, config: &Config) -> anyhow::Result<()> {
    let seed = config.simulation_seed;
    let engine = ProgressionEngine::new(Arc::new(db::PgStorage::new(pool.clone())));

    match command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} lab results from {}.", csv.display());
        }
        Commands::Baseline { patient } => {
            let result = engine
                .initialize_baseline(patient, &mut sim::call_rng(seed, patient, 0))
                .await?;
            print_result(&result);
        }
        Commands::Advance {
            patient,
            current_cycle,
        } => {
            let mut rng = sim::call_rng(seed, patient, current_cycle.saturating_add(1));
            let result = engine
                .generate_next_cycle(patient, current_cycle, &mut rng)
                .await?;
            print_result(&result);
        }
        Commands::Simulate { patient, cycles } => {
            simulate(&engine, patient, cycles, seed).await?;
        }
        Commands::AdvanceAll => {
            let patients = engine.storage().list_patient_ids().await?;
            let mut tasks = JoinSet::new();
            for patient in patients {
                let engine = engine.clone();
                tasks.spawn(async move { (patient, advance_once(&engine, patient, seed).await) });
            }

            let (mut advanced, mut failed) = (0usize, 0usize);
            while let Some(joined) = tasks.join_next().await {
                match joined.context("advance task panicked")? {
                    (_, Ok(result)) => {
                        advanced += 1;
                        print_result(&result);
                    }
                    (patient, Err(err)) => {
                        failed += 1;
                        if err.is_transient() {
                            log::error!("failed to advance patient {patient} (transient): {err}");
                        } else {
                            log::error!("failed to advance patient {patient}: {err}");
                        }
                    }
                }
            }
            println!("Advanced {advanced} patients ({failed} failed).");
        }
        Commands::Report { patient, out } => {
            let storage = engine.storage();
            let report = report::build_report(
                patient,
                &storage.list_cycles(patient).await?,
                &storage.list_transitions(patient).await?,
                &storage.list_alerts(patient).await?,
                &storage.list_recommendations(patient).await?,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Classify { .. } | Commands::Demo { .. } => unreachable!("handled without a database"),
    }

    Ok(())
}

/// Records the baseline if missing, otherwise generates the cycle after the latest one.
async fn advance_once<S>(
    engine: &ProgressionEngine<S>,
    patient: Uuid,
    seed: Option<u64>,
) -> error::Result<CycleResult>
where
    S: Storage + ?Sized,
{
    let latest = engine.storage().list_cycles(patient).await?.pop();
    match latest {
        None => {
            engine
                .initialize_baseline(patient, &mut sim::call_rng(seed, patient, 0))
                .await
        }
        Some(cycle) => {
            let next = cycle.cycle_number.saturating_add(1);
            engine
                .generate_next_cycle(patient, cycle.cycle_number, &mut sim::call_rng(seed, patient, next))
                .await
        }
    }
}

async fn simulate<S>(
    engine: &ProgressionEngine<S>,
    patient: Uuid,
    cycles: u32,
    seed: Option<u64>,
) -> error::Result<()>
where
    S: Storage + ?Sized,
{
    if engine.storage().get_cycle(patient, 0).await?.is_none() {
        print_result(&advance_once(engine, patient, seed).await?);
    }
    for _ in 0..cycles {
        print_result(&advance_once(engine, patient, seed).await?);
    }
    Ok(())
}

fn print_result(result: &CycleResult) {
    let classification = &result.classification;
    println!(
        "- cycle {} eGFR {:.1} uACR {:.1}: {} ({} risk, stage {}){}",
        result.cycle_number,
        result.egfr_value,
        result.uacr_value,
        classification.health_state,
        classification.risk_level,
        classification.ckd_stage_name,
        if result.replayed { " [existing]" } else { "" }
    );
    if let Some(transition) = &result.transition_details {
        println!(
            "  transition: {}{}",
            transition.change_type,
            transition
                .alert_severity
                .map(|severity| format!(", {severity} alert"))
                .unwrap_or_default()
        );
    }
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
}
