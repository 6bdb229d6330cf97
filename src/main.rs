//! Diesel and the rpc client are blocking, so every request is handed to the
//! `JobActor` sync pool and awaited without blocking the server's threads.

#[macro_use]
extern crate log;

use actix::{Actor, Addr, SyncArbiter};
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use serde::Deserialize;
use std::sync::Arc;

use revshare_indexer::config::Config;
use revshare_indexer::constants::Group;
use revshare_indexer::db::{self, PgStore};
use revshare_indexer::responses::{bad_request, reply};
use revshare_indexer::store::{MemoryStore, Store};
use revshare_indexer::utils::normalize_address;
use revshare_indexer::worker::{Command, Coordinator, JobActor, Services};

type Jobs = web::Data<Addr<JobActor>>;

#[derive(Deserialize)]
struct RunInfo {
  publish: Option<bool>,
}

#[derive(Deserialize)]
struct ClaimInfo {
  claim_ref: String,
}

fn is_truthy(value: &str) -> bool {
  value == "true" || value == "t" || value == "1"
}

/// Test endpoint.
#[get("/")]
async fn hello() -> impl Responder {
  HttpResponse::Ok().body("Hello revshare!")
}

/// Ingests every source up to the confirmed head.
#[post("/ingest/catch_up")]
async fn catch_up(jobs: Jobs) -> HttpResponse {
  reply(jobs.send(Command::CatchUp).await)
}

#[post("/sources/{source_id}/resume")]
async fn resume_source(path: web::Path<String>, jobs: Jobs) -> HttpResponse {
  reply(jobs.send(Command::Resume(path.into_inner())).await)
}

#[post("/epochs/{epoch_id}/snapshot")]
async fn snapshot_epoch(path: web::Path<u64>, jobs: Jobs) -> HttpResponse {
  reply(jobs.send(Command::Snapshot(path.into_inner())).await)
}

/// Splits the epoch and rebuilds unpublished commitments.
#[post("/epochs/{epoch_id}/merkle")]
async fn build_merkle(path: web::Path<u64>, jobs: Jobs) -> HttpResponse {
  reply(jobs.send(Command::Merkle(path.into_inner())).await)
}

#[post("/epochs/{epoch_id}/run")]
async fn run_epoch(path: web::Path<u64>, query: web::Query<RunInfo>, jobs: Jobs) -> HttpResponse {
  let command = Command::RunEpoch { epoch_id: path.into_inner(), publish: query.publish.unwrap_or(false) };
  reply(jobs.send(command).await)
}

#[post("/publish")]
async fn publish(jobs: Jobs) -> HttpResponse {
  reply(jobs.send(Command::Publish).await)
}

/// Per-source checkpoint lag.
#[get("/status")]
async fn status(jobs: Jobs) -> HttpResponse {
  reply(jobs.send(Command::Status).await)
}

fn claim_key(path: (u64, String, String)) -> Result<(u64, Group, String), HttpResponse> {
  let (epoch_id, group, account) = path;
  let group = group.parse::<Group>().map_err(|e| bad_request(&e))?;
  let account = normalize_address(&account).ok_or_else(|| bad_request("invalid account address"))?;
  Ok((epoch_id, group, account))
}

/// Gets a claim entry with its proof and claimability.
#[get("/epochs/{epoch_id}/claims/{group}/{account}")]
async fn get_claim(path: web::Path<(u64, String, String)>, jobs: Jobs) -> HttpResponse {
  match claim_key(path.into_inner()) {
    Ok((epoch_id, group, account)) => reply(jobs.send(Command::ClaimStatus { epoch_id, group, account }).await),
    Err(response) => response,
  }
}

#[post("/epochs/{epoch_id}/claims/{group}/{account}")]
async fn mark_claimed(path: web::Path<(u64, String, String)>, body: web::Json<ClaimInfo>, jobs: Jobs) -> HttpResponse {
  match claim_key(path.into_inner()) {
    Ok((epoch_id, group, account)) => {
      let claim_ref = body.into_inner().claim_ref;
      reply(jobs.send(Command::MarkClaimed { epoch_id, group, account, claim_ref }).await)
    },
    Err(response) => response,
  }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
  let env_path = std::env::var("ENV_FILE").unwrap_or(String::from("./.env"));
  dotenv::from_path(env_path).ok();
  env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or("revshare_indexer=info,actix_web=info"),
  ).init();

  let config_path = std::env::var("CONFIG_FILE").unwrap_or(String::from("./config.yaml"));
  let config = Arc::new(Config::load(&config_path).expect("Failed to load config."));

  let store: Arc<dyn Store> = match std::env::var("STORE").unwrap_or(String::from("postgres")).as_str() {
    "memory" => {
      warn!("Using the in-memory store, nothing will be persisted.");
      Arc::new(MemoryStore::new())
    },
    "postgres" => {
      // set up database connection pool
      let connspec = std::env::var("DATABASE_URL").expect("DATABASE_URL env var missing.");
      let pool = db::create_pool(&connspec).expect("Failed to create db pool.");
      db::run_migrations(&pool).expect("failed to run migrations.");
      Arc::new(PgStore::new(pool))
    },
    other => panic!("Invalid STORE '{}'", other),
  };
  let services = Services::new(config.clone(), store);

  // run worker
  let run_worker = std::env::var("RUN_WORKER").unwrap_or(String::from("false"));
  let coordinator = if is_truthy(&run_worker) {
    Some(Coordinator::new(services.clone(), 4).start())
  } else {
    None
  };

  let job_services = services.clone();
  let jobs = SyncArbiter::start(2, move || JobActor::new(job_services.clone(), coordinator.clone()));

  let bind = std::env::var("BIND").unwrap_or(String::from("127.0.0.1:3000"));
  info!("Starting server at: {}", &bind);
  HttpServer::new(move || {
    App::new()
      .app_data(web::Data::new(jobs.clone()))
      .service(hello)
      .service(catch_up)
      .service(resume_source)
      .service(snapshot_epoch)
      .service(build_merkle)
      .service(run_epoch)
      .service(publish)
      .service(status)
      .service(get_claim)
      .service(mark_claimed)
  })
  .bind(bind)?
  .run()
  .await
}
