use actix::prelude::*;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::claims::ClaimLedger;
use crate::config::Config;
use crate::constants::Group;
use crate::errors::{Error, ErrorKind, PolicyViolation, Result};
use crate::ingest::{Ingestor, SourceStatus, SourceLocks};
use crate::pipeline::Pipeline;
use crate::publisher::Publisher;
use crate::rpc::{ChainClient, RpcClient};
use crate::store::Store;

/// Shared state handed to every job actor.
#[derive(Clone)]
pub struct Services {
  pub config: Arc<Config>,
  pub store: Arc<dyn Store>,
  pub locks: Arc<SourceLocks>,
  running: Arc<Mutex<HashSet<u64>>>,
}

impl Services {
  pub fn new(config: Arc<Config>, store: Arc<dyn Store>) -> Self {
    Self {
      config,
      store,
      locks: Arc::new(SourceLocks::new()),
      running: Arc::new(Mutex::new(HashSet::new())),
    }
  }

  /// Claims `epoch_id` for the lifetime of the guard.
  fn claim_epoch(&self, epoch_id: u64) -> Result<EpochGuard> {
    if !self.running.lock().insert(epoch_id) {
      return Err(Error::NotReady(format!("epoch {} is already running", epoch_id)))
    }
    Ok(EpochGuard { running: self.running.clone(), epoch_id })
  }
}

struct EpochGuard {
  running: Arc<Mutex<HashSet<u64>>>,
  epoch_id: u64,
}

impl Drop for EpochGuard {
  fn drop(&mut self) {
    self.running.lock().remove(&self.epoch_id);
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Job {
  Ingest(String),
  ScanEpochs,
  RunEpoch(u64),
  PublishPending,
}

pub struct Coordinator {
  services: Services,
  threads: usize,
  arbiter: Option<Addr<JobActor>>,
  in_flight: HashSet<Job>,
  completed: HashSet<u64>,
}

impl Coordinator {
  pub fn new(services: Services, threads: usize) -> Self {
    Coordinator { services, threads, arbiter: None, in_flight: HashSet::new(), completed: HashSet::new() }
  }

  fn dispatch(&mut self, job: Job) {
    if self.in_flight.contains(&job) {
      trace!("{:?} already in flight", job);
      return
    }
    match &job {
      Job::RunEpoch(epoch_id) if self.completed.contains(epoch_id) => return,
      Job::Ingest(source_id) if self.services.locks.halted(source_id).is_some() => {
        warn!("Not scheduling {}: source is halted.", source_id);
        return
      },
      _ => (),
    }
    if let Some(arbiter) = self.arbiter.as_ref() {
      self.in_flight.insert(job.clone());
      arbiter.do_send(RunJob { job });
    }
  }
}

impl Actor for Coordinator {
  type Context = Context<Self>;

  fn started(&mut self, ctx: &mut Self::Context) {
    info!("Coordinator started up.");
    let services = self.services.clone();
    let address = ctx.address();
    info!("Coordinator starting sync with {}.", services.config.rpc.url);

    let arbiter = SyncArbiter::start(self.threads, move || JobActor::new(services.clone(), Some(address.clone())));
    self.arbiter = Some(arbiter);
    let sources: Vec<String> = self.services.config.sources.iter().map(|s| s.id.clone()).collect();
    for source_id in sources {
      self.dispatch(Job::Ingest(source_id));
    }
    self.dispatch(Job::ScanEpochs);
    self.dispatch(Job::PublishPending);
  }

  fn stopped(&mut self, _: &mut Self::Context) {
    warn!("Coordinator died!");
  }
}

/// Schedules `job` after `delay` seconds.
#[derive(Message)]
#[rtype(result = "()")]
pub struct NextJob {
  job: Job,
  delay: u64,
}

impl NextJob {
  pub fn now(job: Job) -> Self {
    Self { job, delay: 0 }
  }

  fn after(job: Job, delay: u64) -> Self {
    Self { job, delay }
  }
}

impl Handler<NextJob> for Coordinator {
  type Result = ();

  fn handle(&mut self, next: NextJob, ctx: &mut Context<Self>) -> Self::Result {
    let NextJob { job, delay } = next;
    ctx.run_later(Duration::from_secs(delay), move |coordinator, _| coordinator.dispatch(job));
  }
}

/// Sent by job actors when a job is over, successful or not.
#[derive(Message)]
#[rtype(result = "()")]
struct JobDone {
  job: Job,
  completed: bool,
}

impl Handler<JobDone> for Coordinator {
  type Result = ();

  fn handle(&mut self, done: JobDone, _ctx: &mut Context<Self>) -> Self::Result {
    self.in_flight.remove(&done.job);
    if let (Job::RunEpoch(epoch_id), true) = (&done.job, done.completed) {
      self.completed.insert(*epoch_id);
    }
  }
}

#[derive(Message)]
#[rtype(result = "()")]
struct RunJob {
  job: Job,
}

/// Operator commands from the HTTP surface. Replies with a JSON report.
#[derive(Message, Debug, Clone)]
#[rtype(result = "Result<Value>")]
pub enum Command {
  CatchUp,
  Snapshot(u64),
  Merkle(u64),
  RunEpoch { epoch_id: u64, publish: bool },
  Publish,
  Status,
  Resume(String),
  ClaimStatus { epoch_id: u64, group: Group, account: String },
  MarkClaimed { epoch_id: u64, group: Group, account: String, claim_ref: String },
}

#[derive(Serialize)]
struct StatusReport {
  sources: Vec<SourceStatus>,
  unpublished: usize,
  running_epochs: Vec<u64>,
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
  serde_json::to_value(value).map_err(|e| Error::Invariant(format!("could not encode report: {}", e)))
}

/// Runs blocking pipeline work: diesel and the blocking rpc client.
pub struct JobActor {
  services: Services,
  coordinator: Option<Addr<Coordinator>>,
  chain: Option<Arc<dyn ChainClient>>,
}

impl JobActor {
  pub fn new(services: Services, coordinator: Option<Addr<Coordinator>>) -> Self {
    Self { services, coordinator, chain: None }
  }

  pub fn with_chain(services: Services, coordinator: Option<Addr<Coordinator>>, chain: Arc<dyn ChainClient>) -> Self {
    Self { services, coordinator, chain: Some(chain) }
  }

  /// The rpc client is built on the actor's own thread on first use.
  fn chain(&mut self) -> Result<Arc<dyn ChainClient>> {
    if let Some(chain) = self.chain.as_ref() {
      return Ok(chain.clone())
    }
    let config = &self.services.config;
    let chain: Arc<dyn ChainClient> = Arc::new(RpcClient::new(&config.rpc, &config.publisher)?);
    self.chain = Some(chain.clone());
    Ok(chain)
  }

  fn ingestor(&mut self) -> Result<Ingestor> {
    let chain = self.chain()?;
    let s = &self.services;
    Ok(Ingestor::new(s.config.clone(), s.store.clone(), chain, s.locks.clone()))
  }

  fn publisher(&mut self) -> Result<Publisher> {
    let chain = self.chain()?;
    Ok(Publisher::new(self.services.config.clone(), self.services.store.clone(), chain))
  }

  fn pipeline(&self) -> Pipeline {
    Pipeline::new(self.services.config.clone(), self.services.store.clone())
  }

  fn run_epoch(&mut self, epoch_id: u64, publish: bool) -> Result<Value> {
    let _guard = self.services.claim_epoch(epoch_id)?;
    let publisher = if publish { Some(self.publisher()?) } else { None };
    to_json(&self.pipeline().run_epoch(epoch_id, publisher.as_ref())?)
  }

  fn command(&mut self, command: Command) -> Result<Value> {
    match command {
      Command::CatchUp => to_json(&self.ingestor()?.catch_up()),
      Command::Snapshot(epoch_id) => {
        let _guard = self.services.claim_epoch(epoch_id)?;
        to_json(&self.pipeline().snapshots().snapshot_all(epoch_id)?)
      },
      Command::Merkle(epoch_id) => {
        let _guard = self.services.claim_epoch(epoch_id)?;
        to_json(&self.pipeline().build_commitments(epoch_id)?)
      },
      Command::RunEpoch { epoch_id, publish } => self.run_epoch(epoch_id, publish),
      Command::Publish => to_json(&self.publisher()?.publish_pending()?),
      Command::Status => {
        let report = StatusReport {
          sources: self.ingestor()?.status()?,
          unpublished: self.services.store.unpublished_commitments()?.len(),
          running_epochs: self.services.running.lock().iter().cloned().collect(),
        };
        to_json(&report)
      },
      Command::Resume(source_id) => {
        let resumed = self.services.locks.resume(&source_id);
        if let (true, Some(coordinator)) = (resumed, self.coordinator.as_ref()) {
          coordinator.do_send(NextJob::now(Job::Ingest(source_id.clone())));
        }
        to_json(&serde_json::json!({ "source_id": source_id, "resumed": resumed }))
      },
      Command::ClaimStatus { epoch_id, group, account } => {
        let ledger = ClaimLedger::new(self.services.store.clone());
        match ledger.status(epoch_id, group, &account)? {
          Some(status) => to_json(&status),
          None => Err(PolicyViolation::ClaimNotFound { epoch_id, group, account }.into()),
        }
      },
      Command::MarkClaimed { epoch_id, group, account, claim_ref } => {
        let ledger = ClaimLedger::new(self.services.store.clone());
        ledger.mark_claimed(epoch_id, group, &account, &claim_ref, chrono::Utc::now().naive_utc())?;
        to_json(&ledger.status(epoch_id, group, &account)?)
      },
    }
  }

  /// Runs one scheduled job. Returns whether it completed and what to
  /// schedule next.
  fn run(&mut self, job: &Job) -> (bool, Vec<NextJob>) {
    let poll = self.services.config.ingest.poll_interval_secs;
    match job {
      Job::Ingest(source_id) => {
        let result = self.ingestor().and_then(|i| i.catch_up_source(source_id));
        match result {
          Ok(Some(report)) => {
            trace!("{:?}", report);
            (true, vec![NextJob::now(job.clone())])
          },
          Ok(None) => (true, vec![NextJob::after(job.clone(), poll)]),
          Err(e) if e.kind() == ErrorKind::DataIntegrity => {
            error!("Ingestion of {} stopped: {}", source_id, e);
            (false, vec![])
          },
          Err(e) => {
            warn!("Ingestion of {} failed, retrying in {} seconds: {}", source_id, poll, e);
            (false, vec![NextJob::after(job.clone(), poll)])
          },
        }
      },
      Job::ScanEpochs => {
        let mut next = vec![NextJob::after(Job::ScanEpochs, poll)];
        match self.ready_epochs() {
          Ok(epochs) => next.extend(epochs.into_iter().map(|e| NextJob::now(Job::RunEpoch(e)))),
          Err(e) => warn!("Could not scan epochs: {}", e),
        }
        (true, next)
      },
      Job::RunEpoch(epoch_id) => match self.run_epoch(*epoch_id, false) {
        Ok(_) => (true, vec![]),
        Err(e) => match e.kind() {
          ErrorKind::Transient | ErrorKind::Storage => {
            warn!("Epoch {} not run yet: {}", epoch_id, e);
            (false, vec![])
          },
          _ => {
            error!("Epoch {} failed and needs an operator: {}", epoch_id, e);
            (true, vec![])
          },
        },
      },
      Job::PublishPending => {
        let interval = self.services.config.publisher.publish_interval_secs;
        match self.publisher().and_then(|p| p.publish_pending()) {
          Ok(run) => {
            if let Some(reason) = run.blocked {
              warn!("Publishing paused at {}", reason);
            }
          },
          Err(e) => warn!("Publishing failed: {}", e),
        }
        (true, vec![NextJob::after(Job::PublishPending, interval)])
      },
    }
  }

  /// Posted epochs without commitments whose boundary every source passed.
  fn ready_epochs(&self) -> Result<Vec<u64>> {
    let pipeline = self.pipeline();
    let mut ready = vec![];
    for epoch in self.services.store.revenue_epochs()? {
      if !self.services.store.commitments(epoch.epoch_id)?.is_empty() {
        continue
      }
      if pipeline.snapshots().boundary(epoch.epoch_id).is_ok() {
        ready.push(epoch.epoch_id);
      }
    }
    Ok(ready)
  }
}

impl Actor for JobActor {
  type Context = SyncContext<Self>;
}

impl Handler<RunJob> for JobActor {
  type Result = ();

  fn handle(&mut self, msg: RunJob, _ctx: &mut SyncContext<Self>) -> () {
    trace!("{:?}: handle", msg.job);
    let (completed, next) = self.run(&msg.job);
    if let Some(coordinator) = self.coordinator.as_ref() {
      coordinator.do_send(JobDone { job: msg.job, completed });
      for n in next {
        coordinator.do_send(n);
      }
    }
  }
}

impl Handler<Command> for JobActor {
  type Result = Result<Value>;

  fn handle(&mut self, msg: Command, _ctx: &mut SyncContext<Self>) -> Self::Result {
    debug!("Command: {:?}", msg);
    self.command(msg)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::events::ChainEvent;
  use crate::store::MemoryStore;
  use crate::testkit::{self, acct, FakeChain, REVENUE};

  #[actix::test]
  async fn commands_run_on_the_job_pool() {
    let services = Services::new(Arc::new(testkit::config()), Arc::new(MemoryStore::new()));
    let chain = Arc::new(FakeChain::new());
    chain.emit(REVENUE, 2, ChainEvent::RevenuePosted { epoch_id: 1, total_revenue: 1_000, posted_at: 1 });
    chain.set_head(5);

    let (s, c) = (services.clone(), chain.clone());
    let jobs = SyncArbiter::start(1, move || JobActor::with_chain(s.clone(), None, c.clone()));

    let report = jobs.send(Command::CatchUp).await.unwrap().unwrap();
    assert_eq!(report["failed"].as_array().map(|f| f.len()), Some(0));

    let status = jobs.send(Command::Status).await.unwrap().unwrap();
    assert_eq!(status["sources"][0]["source_id"], "revenue");
    assert_eq!(status["sources"][0]["last_processed_block"], 5);
    assert_eq!(status["sources"][0]["lag"], 0);

    let run = jobs.send(Command::RunEpoch { epoch_id: 1, publish: false }).await.unwrap().unwrap();
    assert_eq!(run["split"]["alpha"], "200");
    assert_eq!(run["groups"][0]["outcome"]["outcome"], "unallocated");

    let claim = Command::ClaimStatus { epoch_id: 1, group: Group::Alpha, account: acct(1) };
    match jobs.send(claim).await.unwrap() {
      Err(Error::Policy(p)) => assert_eq!(p.code(), "claim_not_found"),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn an_epoch_runs_once_at_a_time() {
    let services = Services::new(Arc::new(testkit::config()), Arc::new(MemoryStore::new()));
    let guard = services.claim_epoch(3).unwrap();
    assert!(matches!(services.claim_epoch(3), Err(Error::NotReady(_))));
    assert!(services.claim_epoch(4).is_ok());
    drop(guard);
    assert!(services.claim_epoch(3).is_ok());
  }
}
