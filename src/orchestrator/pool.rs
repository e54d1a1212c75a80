//! Environment pool: the reservation table and environment lifecycle.
//!
//! The [`EnvironmentPool`] owns every known environment together with its
//! lifecycle state. It is the only shared mutable structure of a run; the
//! table sits behind a mutex and is only changed through atomic
//! operations:
//!
//! | Operation | Transition |
//! |-----------|------------|
//! | [`discover`](EnvironmentPool::discover) | new → Discovered → Preparing → Ready / Failed |
//! | [`provision`](EnvironmentPool::provision) | new → Preparing → Ready / Failed |
//! | [`reserve`](EnvironmentPool::reserve) | Ready → Reserved |
//! | [`mark_in_use`](EnvironmentPool::mark_in_use) | Reserved → InUse |
//! | [`release`](EnvironmentPool::release) (clean) | InUse → Released → Ready |
//! | [`release`](EnvironmentPool::release) (tainted) | InUse → Dirty → torn down → removed |
//!
//! A tainted environment is never handed out again. After teardown the
//! pool provisions a replacement from the same template under a fresh id,
//! so a retry lands on a fresh target.
//!
//! Failed environments are removed immediately.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::capability::{Capabilities, CapabilityProbe};
use crate::config::{ScoringConfig, WaitMode};
use crate::environment::{Environment, EnvironmentId, EnvironmentState, TargetDescriptor, Template};
use crate::matcher::{Matcher, better};
use crate::node::NodeError;
use crate::provider::{EnvironmentProvider, ProvisionError};
use crate::requirement::Requirement;

/// Errors raised by pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No Ready environment satisfies the requirement right now.
    #[error("No ready environment matches the requirement")]
    NoMatch,

    /// Bounded wait elapsed without a matching environment becoming Ready.
    #[error("No matching environment became ready within {0:?}")]
    NoMatchTimeout(Duration),

    /// The template already has as many live environments as it allows.
    #[error("Template '{0}' has no capacity left")]
    TemplateExhausted(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Connecting to or probing a new environment failed.
    #[error("Failed to prepare environment '{name}': {source}")]
    Prepare {
        name: String,
        #[source]
        source: NodeError,
    },
}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub scoring: ScoringConfig,

    /// Retain healthy environments at shutdown instead of tearing them down.
    pub keep_environments: bool,

    /// Upper bound on the time spent retrying a diagnostics collection.
    pub diagnostics_timeout: Duration,

    /// Delay before the first diagnostics retry; doubles on each retry.
    pub diagnostics_backoff: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            scoring: ScoringConfig::default(),
            keep_environments: false,
            diagnostics_timeout: Duration::from_secs(60),
            diagnostics_backoff: Duration::from_secs(1),
        }
    }
}

/// Why a requirement found no Ready environment.
#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
    /// A live or pending environment could satisfy it later.
    Busy,
    /// Provisioning from this template would satisfy it.
    Provisionable(Template),
    /// Nothing current or provisionable ever will.
    Unsatisfiable,
}

/// Exclusive hold on one environment.
///
/// Must be handed back through [`EnvironmentPool::release`].
#[derive(Debug)]
pub struct Reservation {
    id: u64,
    env: Arc<Environment>,
    case: Option<String>,
    diagnostics_dir: Option<PathBuf>,
}

impl Reservation {
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Test case holding the reservation; `None` for warm-pool holds.
    pub fn case(&self) -> Option<&str> {
        self.case.as_deref()
    }

    pub fn bind(&mut self, case_id: impl Into<String>) {
        self.case = Some(case_id.into());
    }

    /// Where diagnostics go if this reservation is released tainted.
    pub fn collect_diagnostics_into(&mut self, dir: impl Into<PathBuf>) {
        self.diagnostics_dir = Some(dir.into());
    }
}

/// Point-in-time view of one environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentSummary {
    pub id: EnvironmentId,
    pub name: String,
    pub template: String,
    pub state: EnvironmentState,
    pub nodes: Vec<String>,
    pub capabilities: Option<Capabilities>,
}

struct PoolEntry {
    env: Arc<Environment>,
    state: EnvironmentState,
    reservation: Option<u64>,
}

#[derive(Default)]
struct Table {
    entries: BTreeMap<EnvironmentId, PoolEntry>,
    /// Provisioning calls in flight, per template.
    provisioning: HashMap<String, usize>,
    /// Node count and inventory of the last environment prepared, per
    /// template.
    probed: HashMap<String, (usize, Capabilities)>,
}

impl Table {
    fn live_from(&self, template: &str) -> usize {
        self.entries
            .values()
            .filter(|e| e.env.template() == template)
            .count()
    }

    fn pending(&self, template: &str) -> usize {
        self.provisioning.get(template).copied().unwrap_or(0)
    }
}

/// The set of known environments and their reservations.
pub struct EnvironmentPool {
    provider: Arc<dyn EnvironmentProvider>,
    probe: Arc<dyn CapabilityProbe>,
    matcher: Matcher,
    options: PoolOptions,
    templates: Vec<Template>,
    table: Mutex<Table>,
    ready: Notify,
    next_env: AtomicU64,
    next_reservation: AtomicU64,
    closing: AtomicBool,
}

impl EnvironmentPool {
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        probe: Arc<dyn CapabilityProbe>,
        options: PoolOptions,
    ) -> Self {
        let templates = provider.templates();
        Self {
            provider,
            probe,
            matcher: Matcher::new(options.scoring),
            options,
            templates,
            table: Mutex::new(Table::default()),
            ready: Notify::new(),
            next_env: AtomicU64::new(1),
            next_reservation: AtomicU64::new(1),
            closing: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    fn template(&self, name: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.name == name)
    }

    fn insert(table: &mut Table, id: EnvironmentId, descriptor: TargetDescriptor) -> Arc<Environment> {
        let env = Arc::new(Environment::new(id, descriptor));
        table.entries.insert(
            id,
            PoolEntry {
                env: env.clone(),
                state: EnvironmentState::Discovered,
                reservation: None,
            },
        );
        env
    }

    fn allocate_id(&self) -> EnvironmentId {
        EnvironmentId(self.next_env.fetch_add(1, Ordering::Relaxed))
    }

    fn set_state(&self, id: EnvironmentId, state: EnvironmentState) {
        if let Some(entry) = self.lock().entries.get_mut(&id) {
            entry.state = state;
        }
    }

    /// Connects and probes a new environment, then marks it Ready. On
    /// failure it is marked Failed, handed back to its provider and removed.
    async fn prepare(&self, env: Arc<Environment>) -> Result<EnvironmentId, PoolError> {
        self.set_state(env.id(), EnvironmentState::Preparing);
        debug!("Preparing {} ({})", env.id(), env.name());

        match env.prepare(self.probe.as_ref()).await {
            Ok(()) => {
                {
                    let mut table = self.lock();
                    if let Some(caps) = env.capabilities() {
                        table
                            .probed
                            .insert(env.template().to_string(), (env.node_count(), caps.clone()));
                    }
                    if let Some(entry) = table.entries.get_mut(&env.id()) {
                        entry.state = EnvironmentState::Ready;
                    }
                }
                self.ready.notify_waiters();
                Ok(env.id())
            }
            Err(source) => {
                warn!("{} ({}) failed to prepare: {}", env.id(), env.name(), source);
                self.set_state(env.id(), EnvironmentState::Failed);
                if let Err(e) = self.provider.teardown(env.descriptor()).await {
                    warn!("Teardown of failed {} ({}): {}", env.id(), env.name(), e);
                }
                env.disconnect().await;
                self.lock().entries.remove(&env.id());
                self.ready.notify_waiters();
                Err(PoolError::Prepare {
                    name: env.name().to_string(),
                    source,
                })
            }
        }
    }

    /// Asks the provider for existing targets and prepares those not known
    /// yet. Returns how many became Ready.
    pub async fn discover(&self) -> Result<usize, PoolError> {
        let targets = self.provider.discover().await?;

        let fresh: Vec<Arc<Environment>> = {
            let mut table = self.lock();
            let mut fresh = Vec::new();
            for target in targets {
                let known = table.entries.values().any(|e| e.env.name() == target.id);
                if known {
                    continue;
                }
                let id = self.allocate_id();
                fresh.push(Self::insert(&mut table, id, target));
            }
            fresh
        };

        info!("Discovered {} environment(s)", fresh.len());
        let results =
            futures::future::join_all(fresh.into_iter().map(|env| self.prepare(env))).await;
        Ok(results.iter().filter(|r| r.is_ok()).count())
    }

    /// Provisions and prepares a new environment from `template`.
    ///
    /// # Errors
    ///
    /// [`PoolError::TemplateExhausted`] when the template is at its
    /// instance limit, counting provisioning already in flight.
    pub async fn provision(&self, template: &Template) -> Result<EnvironmentId, PoolError> {
        {
            let mut table = self.lock();
            let taken = table.live_from(&template.name) + table.pending(&template.name);
            if taken >= template.max_instances {
                return Err(PoolError::TemplateExhausted(template.name.clone()));
            }
            *table.provisioning.entry(template.name.clone()).or_insert(0) += 1;
        }

        let result = self.provider.provision(template).await;

        let env = {
            let mut table = self.lock();
            if let Some(pending) = table.provisioning.get_mut(&template.name) {
                *pending = pending.saturating_sub(1);
            }
            match result {
                Ok(mut descriptor) => {
                    if descriptor.template.is_empty() {
                        descriptor.template = template.name.clone();
                    }
                    let id = self.allocate_id();
                    Self::insert(&mut table, id, descriptor)
                }
                Err(e) => {
                    drop(table);
                    warn!("Provisioning from '{}' failed: {}", template.name, e);
                    self.ready.notify_waiters();
                    return Err(e.into());
                }
            }
        };

        info!("Provisioned {} ({}) from '{}'", env.id(), env.name(), template.name);
        self.prepare(env).await
    }

    /// Reserves the best Ready environment satisfying `requirement`.
    ///
    /// Atomic across concurrent callers: two callers never get the same
    /// environment.
    pub fn reserve(&self, requirement: &Requirement) -> Result<Reservation, PoolError> {
        let mut table = self.lock();

        let mut best: Option<(f64, EnvironmentId)> = None;
        for (id, entry) in &table.entries {
            if entry.state != EnvironmentState::Ready {
                continue;
            }
            if let Some(score) = self.matcher.score(requirement, &entry.env)
                && best.is_none_or(|(s, b)| better(score, *id, s, b))
            {
                best = Some((score, *id));
            }
        }

        let (score, id) = best.ok_or(PoolError::NoMatch)?;
        let entry = table.entries.get_mut(&id).ok_or(PoolError::NoMatch)?;
        let reservation = self.next_reservation.fetch_add(1, Ordering::Relaxed);
        entry.state = EnvironmentState::Reserved;
        entry.reservation = Some(reservation);
        debug!("Reserved {} (score {})", id, score);

        Ok(Reservation {
            id: reservation,
            env: entry.env.clone(),
            case: None,
            diagnostics_dir: None,
        })
    }

    /// Like [`reserve`](Self::reserve), but waits up to `timeout` for a
    /// matching environment to become Ready.
    pub async fn reserve_wait(
        &self,
        requirement: &Requirement,
        timeout: Duration,
    ) -> Result<Reservation, PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.reserve(requirement) {
                Err(PoolError::NoMatch) => {}
                other => return other,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PoolError::NoMatchTimeout(timeout));
            }
        }
    }

    /// Reserves according to the configured wait mode.
    pub async fn reserve_with(
        &self,
        requirement: &Requirement,
        mode: WaitMode,
    ) -> Result<Reservation, PoolError> {
        match mode {
            WaitMode::NoWait => self.reserve(requirement),
            WaitMode::BoundedWait(timeout) => self.reserve_wait(requirement, timeout).await,
        }
    }

    /// Marks a reserved environment as running a case.
    pub fn mark_in_use(&self, reservation: &Reservation) {
        let mut table = self.lock();
        if let Some(entry) = table.entries.get_mut(&reservation.env.id())
            && entry.reservation == Some(reservation.id)
        {
            entry.state = EnvironmentState::InUse;
        }
    }

    /// Hands an environment back.
    ///
    /// Clean environments return to Ready. Tainted ones become Dirty, get
    /// their diagnostics collected, are torn down and removed, and a
    /// replacement is provisioned from the same template.
    pub async fn release(&self, reservation: Reservation, taint: bool) {
        let env = reservation.env.clone();
        {
            let mut table = self.lock();
            let Some(entry) = table.entries.get_mut(&env.id()) else {
                warn!("Release of unknown environment {}", env.id());
                return;
            };
            if entry.reservation != Some(reservation.id) {
                warn!("Release of {} with a stale reservation", env.id());
                return;
            }
            entry.reservation = None;

            if !taint {
                entry.state = EnvironmentState::Released;
                debug!("{} released", env.id());
                entry.state = EnvironmentState::Ready;
                drop(table);
                self.ready.notify_waiters();
                return;
            }
            entry.state = EnvironmentState::Dirty;
        }

        info!("{} ({}) is dirty, tearing it down", env.id(), env.name());
        if let Some(dir) = &reservation.diagnostics_dir {
            self.collect_diagnostics(&env, dir).await;
        }
        self.discard(&env).await;

        if self.closing.load(Ordering::SeqCst) {
            debug!("Pool is closing, not replacing {}", env.id());
        } else if let Some(template) = self.template(env.template()).cloned() {
            match self.provision(&template).await {
                Ok(id) => info!("{} replaces {}", id, env.id()),
                Err(e) => warn!("Could not replace {}: {}", env.id(), e),
            }
        }
        self.ready.notify_waiters();
    }

    async fn discard(&self, env: &Arc<Environment>) {
        if let Err(e) = self.provider.teardown(env.descriptor()).await {
            warn!("Teardown of {} ({}) failed: {}", env.id(), env.name(), e);
        }
        env.disconnect().await;
        self.lock().entries.remove(&env.id());
    }

    /// Fetches provider diagnostics into `dir`, retrying with exponential
    /// backoff until `diagnostics_timeout` would be exceeded.
    async fn collect_diagnostics(&self, env: &Environment, dir: &Path) {
        let started = Instant::now();
        let mut delay = self.options.diagnostics_backoff;
        loop {
            match self.provider.diagnostics(env.descriptor()).await {
                Ok(Some(text)) => {
                    let file = dir.join(format!(
                        "{}-diagnostics.log",
                        env.name().replace(['/', '\\'], "_")
                    ));
                    let written = match tokio::fs::create_dir_all(dir).await {
                        Ok(()) => tokio::fs::write(&file, text).await,
                        Err(e) => Err(e),
                    };
                    match written {
                        Ok(()) => debug!("Diagnostics for {} saved to {}", env.id(), file.display()),
                        Err(e) => warn!("Failed to save diagnostics for {}: {}", env.id(), e),
                    }
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    if started.elapsed() + delay > self.options.diagnostics_timeout {
                        warn!("Giving up on diagnostics for {}: {}", env.id(), e);
                        return;
                    }
                    debug!("Diagnostics for {} failed, retrying in {:?}: {}", env.id(), delay, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    /// Classifies a requirement that found no Ready environment.
    ///
    /// Provisioning is preferred over waiting while a template has spare
    /// capacity. At most one provisioning call per template is in flight
    /// on behalf of waiting cases.
    pub fn assess(&self, requirement: &Requirement) -> Assessment {
        let table = self.lock();

        let mut busy = false;
        let mut best: Option<(f64, &Template)> = None;
        for template in &self.templates {
            let (node_count, inventory) = match table.probed.get(&template.name) {
                Some((nodes, probed)) => (*nodes, probed.clone().merge(&template.capabilities)),
                None => (
                    template.node_count,
                    Capabilities::from(template.capabilities.clone()),
                ),
            };
            let Some(score) = self
                .matcher
                .score_inventory(requirement, node_count, &inventory)
            else {
                continue;
            };

            let pending = table.pending(&template.name);
            if pending > 0 || table.live_from(&template.name) + pending >= template.max_instances {
                busy = true;
                continue;
            }
            if best.is_none_or(|(s, _)| score > s) {
                best = Some((score, template));
            }
        }

        if let Some((_, template)) = best {
            return Assessment::Provisionable(template.clone());
        }

        for entry in table.entries.values() {
            match entry.state {
                EnvironmentState::Discovered | EnvironmentState::Preparing => busy = true,
                EnvironmentState::Failed => {}
                _ => {
                    if self.matcher.matches(requirement, &entry.env) {
                        busy = true;
                    }
                }
            }
        }

        if busy {
            Assessment::Busy
        } else {
            Assessment::Unsatisfiable
        }
    }

    /// Environment a requirement would land on if everything were idle.
    pub fn best_match(&self, requirement: &Requirement) -> Option<(EnvironmentId, String, f64)> {
        let table = self.lock();
        let mut best: Option<(f64, EnvironmentId, &Arc<Environment>)> = None;
        for (id, entry) in &table.entries {
            if let Some(score) = self.matcher.score(requirement, &entry.env)
                && best.is_none_or(|(s, b, _)| better(score, *id, s, b))
            {
                best = Some((score, *id, &entry.env));
            }
        }
        best.map(|(score, id, env)| (id, env.name().to_string(), score))
    }

    /// Stops replacing tainted environments; the run is winding down.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Environments not yet removed, in any state.
    pub fn live_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn state_of(&self, id: EnvironmentId) -> Option<EnvironmentState> {
        self.lock().entries.get(&id).map(|e| e.state)
    }

    /// Number of outstanding reservations.
    pub fn reserved_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.reservation.is_some())
            .count()
    }

    pub fn snapshot(&self) -> Vec<EnvironmentSummary> {
        self.lock()
            .entries
            .values()
            .map(|e| EnvironmentSummary {
                id: e.env.id(),
                name: e.env.name().to_string(),
                template: e.env.template().to_string(),
                state: e.state,
                nodes: e.env.nodes().iter().map(|n| n.address()).collect(),
                capabilities: e.env.capabilities().cloned(),
            })
            .collect()
    }

    /// Tears down every remaining environment.
    ///
    /// With `keep_environments`, Ready environments are retained by their
    /// provider instead.
    pub async fn shutdown(&self) {
        let entries: Vec<PoolEntry> = {
            let mut table = self.lock();
            std::mem::take(&mut table.entries).into_values().collect()
        };

        futures::future::join_all(entries.into_iter().map(|entry| async move {
            let env = entry.env;
            if entry.reservation.is_some() {
                warn!("{} is still reserved at shutdown", env.id());
            }
            let keep = self.options.keep_environments && entry.state == EnvironmentState::Ready;
            let result = if keep {
                self.provider.retain(env.descriptor()).await
            } else {
                self.provider.teardown(env.descriptor()).await
            };
            if let Err(e) = result {
                warn!("Shutdown of {} ({}) failed: {}", env.id(), env.name(), e);
            }
            env.disconnect().await;
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityValue, StaticProbe};
    use crate::config::{EnvironmentConfig, LocalNodeConfig, NodeConfig};
    use crate::provider::ProvisionResult;
    use crate::provider::static_hosts::StaticProvider;
    use crate::requirement::Predicate;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn env_config(name: &str, nodes: usize, cores: i64) -> EnvironmentConfig {
        let mut capabilities = BTreeMap::new();
        capabilities.insert("os".to_string(), CapabilityValue::from("linux"));
        capabilities.insert("cores".to_string(), CapabilityValue::Integer(cores));
        EnvironmentConfig {
            name: name.to_string(),
            nodes: vec![NodeConfig::Local(LocalNodeConfig::default()); nodes],
            capabilities,
        }
    }

    async fn pool_with(envs: Vec<EnvironmentConfig>) -> Arc<EnvironmentPool> {
        let pool = Arc::new(EnvironmentPool::new(
            Arc::new(StaticProvider::new(envs)),
            Arc::new(StaticProbe),
            PoolOptions::default(),
        ));
        pool.discover().await.unwrap();
        pool
    }

    fn linux() -> Requirement {
        Requirement::any().with(Predicate::eq("os", "linux"))
    }

    #[tokio::test]
    async fn test_at_most_one_reservation_per_environment() {
        let pool = pool_with(vec![env_config("only", 1, 4)]).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.reserve(&linux()).ok() })
            })
            .collect();

        let mut won = Vec::new();
        for handle in handles {
            if let Some(res) = handle.await.unwrap() {
                won.push(res);
            }
        }
        assert_eq!(won.len(), 1);
        assert_eq!(pool.reserved_count(), 1);

        pool.release(won.pop().unwrap(), false).await;
        assert_eq!(pool.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_reserve_prefers_tightest_fit() {
        let pool = pool_with(vec![env_config("big", 1, 16), env_config("small", 1, 2)]).await;
        let req = linux().with(Predicate::uses("cores", 2.0));
        let res = pool.reserve(&req).unwrap();
        assert_eq!(res.environment().name(), "small");
        assert_eq!(pool.state_of(res.environment().id()), Some(EnvironmentState::Reserved));
        pool.mark_in_use(&res);
        assert_eq!(pool.state_of(res.environment().id()), Some(EnvironmentState::InUse));
        pool.release(res, false).await;
    }

    #[tokio::test]
    async fn test_clean_release_returns_to_ready() {
        let pool = pool_with(vec![env_config("only", 1, 4)]).await;
        let res = pool.reserve(&linux()).unwrap();
        let id = res.environment().id();
        assert!(matches!(pool.reserve(&linux()), Err(PoolError::NoMatch)));

        pool.release(res, false).await;
        assert_eq!(pool.state_of(id), Some(EnvironmentState::Ready));
        tokio_test::assert_ok!(pool.reserve(&linux()));
    }

    #[tokio::test]
    async fn test_tainted_release_replaces_environment() {
        let pool = pool_with(vec![env_config("only", 1, 4)]).await;
        let res = pool.reserve(&linux()).unwrap();
        let old = res.environment().id();
        pool.mark_in_use(&res);

        pool.release(res, true).await;
        assert_eq!(pool.state_of(old), None);

        let fresh = pool.reserve(&linux()).unwrap();
        assert_ne!(fresh.environment().id(), old);
        assert_eq!(fresh.environment().name(), "only");
        pool.release(fresh, false).await;
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test]
    async fn test_assess() {
        let pool = pool_with(vec![env_config("only", 1, 4)]).await;
        let windows = Requirement::any().with(Predicate::eq("os", "windows"));
        assert_eq!(pool.assess(&windows), Assessment::Unsatisfiable);
        assert_eq!(pool.assess(&Requirement::any().nodes(2)), Assessment::Unsatisfiable);

        let res = pool.reserve(&linux()).unwrap();
        assert_eq!(pool.assess(&linux()), Assessment::Busy);
        pool.release(res, false).await;
    }

    #[tokio::test]
    async fn test_bounded_wait_gets_released_environment() {
        let pool = pool_with(vec![env_config("only", 1, 4)]).await;
        let held = pool.reserve(&linux()).unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.reserve_wait(&linux(), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held, false).await;

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.environment().name(), "only");
        pool.release(got, false).await;
    }

    #[tokio::test]
    async fn test_bounded_wait_times_out() {
        let pool = pool_with(vec![env_config("only", 1, 4)]).await;
        let _held = pool.reserve(&linux()).unwrap();
        let err = pool
            .reserve_with(&linux(), WaitMode::BoundedWait(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NoMatchTimeout(_)));
    }

    #[tokio::test]
    async fn test_failed_preparation_is_removed() {
        let mut broken = env_config("broken", 1, 4);
        broken.nodes = vec![NodeConfig::Local(LocalNodeConfig {
            working_dir: Some("/nonexistent/lisa".into()),
            ..Default::default()
        })];
        let pool = Arc::new(EnvironmentPool::new(
            Arc::new(StaticProvider::new(vec![broken, env_config("ok", 1, 4)])),
            Arc::new(StaticProbe),
            PoolOptions::default(),
        ));
        assert_eq!(pool.discover().await.unwrap(), 1);
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.snapshot()[0].name, "ok");
    }

    /// Static provider whose diagnostics fail a few times first.
    struct FlakyDiagnostics {
        inner: StaticProvider,
        failures_left: AtomicUsize,
        teardowns: AtomicUsize,
    }

    #[async_trait]
    impl EnvironmentProvider for FlakyDiagnostics {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn discover(&self) -> ProvisionResult<Vec<TargetDescriptor>> {
            self.inner.discover().await
        }
        fn templates(&self) -> Vec<Template> {
            self.inner.templates()
        }
        async fn provision(&self, template: &Template) -> ProvisionResult<TargetDescriptor> {
            self.inner.provision(template).await
        }
        async fn teardown(&self, _target: &TargetDescriptor) -> ProvisionResult<()> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn diagnostics(&self, target: &TargetDescriptor) -> ProvisionResult<Option<String>> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ProvisionError::CommandFailed("console not ready".to_string()));
            }
            Ok(Some(format!("serial log of {}", target.id)))
        }
    }

    #[tokio::test]
    async fn test_tainted_release_collects_diagnostics_with_retries() {
        let provider = Arc::new(FlakyDiagnostics {
            inner: StaticProvider::new(vec![env_config("vm", 1, 4)]),
            failures_left: AtomicUsize::new(2),
            teardowns: AtomicUsize::new(0),
        });
        let pool = EnvironmentPool::new(
            provider.clone(),
            Arc::new(StaticProbe),
            PoolOptions {
                diagnostics_backoff: Duration::from_millis(10),
                ..Default::default()
            },
        );
        pool.discover().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut res = pool.reserve(&linux()).unwrap();
        res.collect_diagnostics_into(dir.path());
        pool.release(res, true).await;

        let log = std::fs::read_to_string(dir.path().join("vm-diagnostics.log")).unwrap();
        assert_eq!(log, "serial log of vm");
        assert_eq!(provider.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_diagnostics_give_up_after_timeout() {
        let provider = Arc::new(FlakyDiagnostics {
            inner: StaticProvider::new(vec![env_config("vm", 1, 4)]),
            failures_left: AtomicUsize::new(usize::MAX),
            teardowns: AtomicUsize::new(0),
        });
        let pool = EnvironmentPool::new(
            provider.clone(),
            Arc::new(StaticProbe),
            PoolOptions {
                diagnostics_backoff: Duration::from_millis(10),
                diagnostics_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );
        pool.discover().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut res = pool.reserve(&linux()).unwrap();
        res.collect_diagnostics_into(dir.path());
        let started = Instant::now();
        pool.release(res, true).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!dir.path().join("vm-diagnostics.log").exists());
        assert_eq!(provider.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_tears_everything_down() {
        let provider = Arc::new(FlakyDiagnostics {
            inner: StaticProvider::new(vec![env_config("a", 1, 4), env_config("b", 2, 4)]),
            failures_left: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
        });
        let pool = EnvironmentPool::new(provider.clone(), Arc::new(StaticProbe), PoolOptions::default());
        pool.discover().await.unwrap();
        assert_eq!(pool.live_count(), 2);

        pool.shutdown().await;
        assert_eq!(pool.live_count(), 0);
        assert_eq!(provider.teardowns.load(Ordering::SeqCst), 2);
    }
}
