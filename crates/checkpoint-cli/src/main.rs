use anyhow::{Context, Result};
use checkpoint_core::{
    CheckpointConfig, CredentialValidator, CredentialVerdict, Embedding, EuclideanMatcher,
    IdentityGallery, MatchError, MatchMode, Matcher, NewEnrollment,
};
use checkpoint_store::SqliteGallery;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "checkpoint", about = "Checkpoint identity verification CLI")]
struct Cli {
    /// TOML config file (CHECKPOINT_* environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Gallery database path, overriding the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person
    Enroll {
        #[arg(long)]
        name: String,
        #[arg(long)]
        position: String,
        #[arg(long)]
        rank: String,
        #[arg(long)]
        unit_type: String,
        /// Unique printed credential code
        #[arg(long)]
        credential_code: i64,
        /// JSON file holding the face embedding as an array of floats
        #[arg(long)]
        embedding: Option<PathBuf>,
        /// Reference to the enrollment photo
        #[arg(long)]
        image: Option<String>,
    },
    /// List enrollments
    List,
    /// Remove an enrollment
    Remove {
        /// Enrollment ID to remove
        id: Uuid,
    },
    /// Match a probe embedding against the gallery
    Match {
        /// JSON file holding the probe embedding
        embedding: PathBuf,
        /// Compare against every record and report the global best
        #[arg(long)]
        exhaustive: bool,
    },
    /// Validate a credential code
    Validate {
        /// Decoded credential payload
        code: String,
    },
    /// Show configuration and gallery status
    Status,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = CheckpointConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    tracing::info!(
        db_path = %config.db_path.display(),
        embedding_dim = config.embedding_dim,
        "configuration loaded"
    );

    let gallery = SqliteGallery::open(&config.db_path, config.embedding_dim)
        .with_context(|| format!("failed to open gallery {}", config.db_path.display()))?;

    match cli.command {
        Commands::Enroll {
            name,
            position,
            rank,
            unit_type,
            credential_code,
            embedding,
            image,
        } => {
            let embedding = embedding.as_deref().map(read_embedding).transpose()?;
            let id = gallery.insert(NewEnrollment {
                name,
                position,
                rank,
                unit_type,
                embedding,
                credential_code,
                image_ref: image,
            })?;
            tracing::info!(%id, credential_code, "enrolled");
            print_json(&json!({ "id": id }))?;
        }
        Commands::List => {
            let records = gallery.scan_all()?;
            if records.is_empty() {
                eprintln!("No enrollments");
            }
            for record in records {
                print_json(&json!({
                    "id": record.id,
                    "name": record.name,
                    "position": record.position,
                    "rank": record.rank,
                    "unit_type": record.unit_type,
                    "credential_code": record.credential_code,
                    "has_embedding": record.embedding.is_some(),
                    "enrolled_at": record.enrolled_at,
                }))?;
            }
        }
        Commands::Remove { id } => {
            gallery.remove(id)?;
            tracing::info!(%id, "enrollment removed");
            eprintln!("Removed {id}");
        }
        Commands::Match {
            embedding,
            exhaustive,
        } => {
            let probe = read_embedding(&embedding)?;
            let mut policy = config.match_policy();
            if exhaustive {
                policy.mode = MatchMode::Exhaustive;
            }
            let records = gallery.scan_all()?;
            match EuclideanMatcher::new(policy).compare(&probe, &records) {
                Ok(result) => {
                    print_json(&result)?;
                    if !result.matched {
                        return Ok(ExitCode::FAILURE);
                    }
                }
                Err(err @ MatchError::NoEnrollments) => {
                    eprintln!("{err}");
                    return Ok(ExitCode::FAILURE);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Validate { code } => {
            let validator = CredentialValidator::new(config.credential_range());
            let verdict = validator.validate(&code, &gallery).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "credential validation failed");
                CredentialVerdict::from_error(&err)
            });
            print_json(&verdict)?;
            if !verdict.is_valid() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Status => {
            print_json(&json!({
                "db_path": config.db_path,
                "embedding_dim": config.embedding_dim,
                "enrollments": gallery.len()?,
                "strict_threshold": config.matching.strict_threshold,
                "min_match_percent": config.matching.min_match_percent,
                "match_mode": config.matching.mode,
                "pre_authorized_codes": config.credential_range().len(),
            }))?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read embedding {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("embedding {} is not a JSON array of numbers", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
