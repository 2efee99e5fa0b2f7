use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

mod aggregate;
mod audit;
mod db;
mod decision;
mod error;
mod evaluate;
mod jobs;
mod models;
mod progression;
mod report;
mod store;
mod trajectory;

use store::ProgressionStore;

#[derive(Parser)]
#[command(name = "adaptive-progression-engine")]
#[command(about = "Adaptive progression decision engine for lesson evaluations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import externally-assessed task results from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Submit and run one lesson evaluation
    Evaluate {
        #[arg(long)]
        enrollment: Uuid,
        #[arg(long)]
        lesson: Uuid,
    },
    /// Submit one lesson evaluation without running it
    Submit {
        #[arg(long)]
        enrollment: Uuid,
        #[arg(long)]
        lesson: Uuid,
    },
    /// Check the status of an evaluation job
    Poll {
        #[arg(long)]
        job: Uuid,
    },
    /// Drain pending evaluation jobs
    Worker,
    /// Re-fit skill trajectories from stored snapshot history
    Recompute {
        #[arg(long)]
        student: Option<Uuid>,
    },
    /// Generate a markdown audit report for one enrollment
    Report {
        #[arg(long)]
        enrollment: Uuid,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
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
            println!("Imported {inserted} task assessments from {}.", csv.display());
        }
        Commands::Evaluate { enrollment, lesson } => {
            let job_id = jobs::submit(&pool, enrollment, lesson).await?;
            let status = jobs::run(&pool, job_id).await?;
            match status.decision_code {
                Some(code) => println!("Job {job_id}: {} -> {code}", status.state.as_str()),
                None => println!(
                    "Job {job_id}: {} ({})",
                    status.state.as_str(),
                    status.error.as_deref().unwrap_or("no detail")
                ),
            }
        }
        Commands::Submit { enrollment, lesson } => {
            let job_id = jobs::submit(&pool, enrollment, lesson).await?;
            println!("Submitted job {job_id}.");
        }
        Commands::Poll { job } => {
            let status = jobs::poll(&pool, job).await?;
            println!(
                "Job {job}: {} (progress {:.0}%{})",
                status.state.as_str(),
                status.progress_estimate * 100.0,
                status
                    .decision_code
                    .map(|code| format!(", decision {code}"))
                    .unwrap_or_default()
            );
        }
        Commands::Worker => {
            let processed = jobs::drain(&pool).await?;
            println!("Processed {processed} jobs.");
        }
        Commands::Recompute { student } => {
            let pg = db::PgStore::new(pool.clone());
            let students = match student {
                Some(id) => vec![id],
                None => db::students_with_snapshots(&pool).await?,
            };

            let mut updated = 0usize;
            for student_id in students {
                let history = pg.snapshot_history(student_id).await?;
                let current = pg.trajectories(student_id).await?;
                let refit = evaluate::recompute_from_history(student_id, &history, &current);
                let mut tx = pool.begin().await?;
                for trajectory in &refit {
                    db::upsert_trajectory(&mut tx, trajectory).await?;
                }
                tx.commit().await?;
                updated += refit.len();
            }
            println!("Recomputed {updated} trajectories.");
        }
        Commands::Report { enrollment, out } => {
            let pg = db::PgStore::new(pool.clone());
            let enrollment_row = pg
                .enrollment(enrollment)
                .await?
                .with_context(|| format!("enrollment {enrollment} not found"))?;
            let records = db::fetch_transition_records(&pool, enrollment).await?;
            let trajectories: Vec<_> = pg
                .trajectories(enrollment_row.student_id)
                .await?
                .into_values()
                .collect();
            let rendered =
                report::build_report(&enrollment.to_string(), &records, &trajectories);
            std::fs::write(&out, rendered)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
