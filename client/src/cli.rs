use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    ErrorBody, Job, JobInput, JobKind, JobResults, JobStatus, SubmitJobRequest, SubmitJobResponse,
    VersionInfo,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Command line access to the pipeline dispatcher")]
struct Cli {
    /// Dispatcher base URL
    #[arg(long, env = "DISPATCHER_URL", default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job
    Submit {
        /// heritability, indel_primer, nemascan_mapping, ...
        #[arg(value_name = "KIND")]
        kind: JobKind,

        #[arg(long, env = "DISPATCHER_OWNER")]
        owner: String,

        /// Input fields as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,

        /// TSV table sent inline as the `data` field
        #[arg(long, value_name = "FILE")]
        data: Option<PathBuf>,

        /// Container tag; defaults to the dispatcher's configured version
        #[arg(long)]
        container_version: Option<String>,

        /// Always run, even if an identical job already finished
        #[arg(long)]
        no_cache: bool,
    },
    /// Show a job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Ask the dispatcher to re-read the job's operation
    Refresh {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// List an owner's jobs
    List {
        #[arg(long, env = "DISPATCHER_OWNER")]
        owner: String,
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        kind: Option<JobKind>,
    },
    /// List result files, optionally downloading them
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
        #[arg(long, value_name = "DIR")]
        download: Option<PathBuf>,
    },
    Version,
}

fn parse_input(raw: &str, data: Option<String>) -> Result<JobInput> {
    let value: serde_json::Value = serde_json::from_str(raw).context("--input is not valid JSON")?;
    let serde_json::Value::Object(mut input) = value else {
        bail!("--input must be a JSON object");
    };
    if let Some(table) = data {
        input.insert("data".to_string(), serde_json::Value::String(table));
    }
    Ok(input)
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => bail!("{} ({}): {}", status, body.error, body.message),
        Err(_) => bail!("{}: {}", status, text),
    }
}

fn print_job(job: &Job) {
    println!("Job {}", job.id);
    println!("  kind      : {}", job.kind);
    println!("  owner     : {}", job.owner);
    println!("  status    : {}", job.status);
    println!("  container : {}", job.container.uri());
    if let Some(op) = &job.operation_id {
        println!("  operation : {}", op);
    }
    if let Some(err) = &job.error {
        println!("  error     : {}", err);
    }
    println!("  created   : {}", job.created_at);
    println!("  updated   : {}", job.updated_at);
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.url.trim_end_matches('/');

    match cli.command {
        Commands::Submit {
            kind,
            owner,
            input,
            data,
            container_version,
            no_cache,
        } => {
            let table = match data {
                Some(path) => Some(
                    tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                None => None,
            };
            let req = SubmitJobRequest {
                kind,
                owner,
                input: parse_input(&input, table)?,
                container_version,
                no_cache,
            };
            let resp = client
                .post(format!("{base_url}/api/v1/jobs"))
                .json(&req)
                .send()
                .await?;
            let created: SubmitJobResponse = decode(resp).await?;
            if created.deduped {
                println!("Reusing finished job {} ({})", created.job_id, created.status);
            } else {
                println!("Submitted job {} ({})", created.job_id, created.status);
            }
        }

        Commands::Status { id } => {
            let resp = client.get(format!("{base_url}/api/v1/jobs/{id}")).send().await?;
            print_job(&decode(resp).await?);
        }

        Commands::Refresh { id } => {
            let resp = client
                .post(format!("{base_url}/api/v1/jobs/{id}/refresh"))
                .send()
                .await?;
            print_job(&decode(resp).await?);
        }

        Commands::List { owner, status, kind } => {
            let mut query = vec![("owner", owner)];
            if let Some(s) = status {
                query.push(("status", s.to_string()));
            }
            if let Some(k) = kind {
                query.push(("kind", k.to_string()));
            }
            let resp = client
                .get(format!("{base_url}/api/v1/jobs"))
                .query(&query)
                .send()
                .await?;
            let jobs: Vec<Job> = decode(resp).await?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in jobs {
                println!(
                    "{}  {:<18} {:<9} {}",
                    job.id,
                    job.kind.as_str(),
                    job.status.as_str(),
                    job.updated_at
                );
            }
        }

        Commands::Results { id, download } => {
            let resp = client
                .get(format!("{base_url}/api/v1/jobs/{id}/results"))
                .send()
                .await?;
            let results: JobResults = decode(resp).await?;
            println!("Results for job {} ({})", results.job_id, results.status);
            if results.files.is_empty() {
                println!("  (no files yet)");
            }
            for f in &results.files {
                println!("  - {} ({} bytes)", f.name, f.size);
                println!("    {}", f.url);
            }
            println!("Links expire at {}", results.expires_at);

            if let Some(dir) = download {
                tokio::fs::create_dir_all(&dir).await?;
                for f in &results.files {
                    let body = client.get(&f.url).send().await?.error_for_status()?.bytes().await?;
                    let target = dir.join(&f.name);
                    tokio::fs::write(&target, &body)
                        .await
                        .with_context(|| format!("writing {}", target.display()))?;
                    println!("Saved {}", target.display());
                }
            }
        }

        Commands::Version => {
            let resp = client.get(format!("{base_url}/version")).send().await?;
            let info: VersionInfo = decode(resp).await?;
            println!("dispatcher {} ({})", info.version, info.git_commit);
        }
    }

    Ok(())
}
