//! Per-profile connection registry.
//!
//! The registry hands out one shared [`ConnectionHandle`] per profile name. Each
//! name moves through a two-state machine:
//!
//! ```text
//! UNINITIALIZED --create--> LIVE --probe fails / close--> UNINITIALIZED
//! ```
//!
//! Every name has its own async gate (a slot). `get_handle` holds the slot for
//! the whole probe-or-create sequence, so concurrent callers for the same name
//! share one creation and never leave two live handles behind. Callers for
//! different names never wait on each other.
//!
//! Each published topology carries a generation number and every cached handle
//! remembers the generation it was created under. A handle from an older
//! generation is never reused.

use super::connection::{ConnectionHandle, Connector, MySqlConnector, SessionIdentity};
use crate::config::{
    ConfigResolver, ConnectionProfile, ProfileSummary, RegistryConfig, Resolution, Topology,
};
use crate::error::ServerError;
use crate::telemetry::{
    new_shared_metrics, EventSink, RegistryEvent, SharedMetrics, TracingEventSink,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

type Slot = Arc<Mutex<Option<Cached>>>;

/// A cached handle and the topology generation it was created under.
struct Cached {
    handle: Arc<ConnectionHandle>,
    generation: u64,
}

/// A published topology.
type Published = (u64, Arc<Resolution>);

/// Outcome of testing one profile.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileTestResult {
    pub profile: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Profile parameters (password excluded), on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionProfile>,
    pub tested_at: DateTime<Utc>,
}

impl ProfileTestResult {
    fn passed(profile: &ConnectionProfile) -> Self {
        Self {
            profile: profile.name.clone(),
            success: true,
            message: format!("Connection '{}' tested successfully", profile.name),
            error: None,
            connection: Some(profile.clone()),
            tested_at: Utc::now(),
        }
    }

    fn failed(profile: &str, err: &ServerError) -> Self {
        Self {
            profile: profile.to_string(),
            success: false,
            message: format!("Connection '{}' test failed: {}", profile, err),
            error: Some(err.to_string()),
            connection: None,
            tested_at: Utc::now(),
        }
    }
}

/// Status of one configured profile.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<SessionIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProfileStatus {
    fn inactive() -> Self {
        Self {
            active: false,
            handle_id: None,
            info: None,
            error: None,
        }
    }
}

/// Hands out validated, reusable connection handles per profile name.
pub struct ConnectionRegistry {
    resolver: ConfigResolver,
    connector: Arc<dyn Connector>,
    config: RegistryConfig,
    resolution: parking_lot::RwLock<Option<Published>>,
    slots: parking_lot::Mutex<HashMap<String, Slot>>,
    next_handle_id: AtomicU64,
    metrics: SharedMetrics,
    sink: Arc<dyn EventSink>,
}

impl ConnectionRegistry {
    /// Create a registry. The topology is resolved lazily on first use.
    pub fn new(resolver: ConfigResolver, connector: Arc<dyn Connector>, config: RegistryConfig) -> Self {
        Self {
            resolver,
            connector,
            config,
            resolution: parking_lot::RwLock::new(None),
            slots: parking_lot::Mutex::new(HashMap::new()),
            next_handle_id: AtomicU64::new(1),
            metrics: new_shared_metrics(),
            sink: Arc::new(TracingEventSink),
        }
    }

    /// Registry for real MySQL targets configured from the process environment.
    pub fn from_env() -> Self {
        Self::new(
            ConfigResolver::new(),
            Arc::new(MySqlConnector),
            RegistryConfig::from_env(),
        )
    }

    /// Forward lifecycle events to `sink` instead of the tracing sink.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Registry counters.
    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn emit(&self, event: RegistryEvent) {
        self.metrics.record(&event);
        self.sink.record(&event);
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// The resolved configuration, resolving it on first call.
    pub fn resolution(&self) -> Result<Arc<Resolution>, ServerError> {
        Ok(self.published()?.1)
    }

    /// The current topology and its generation.
    ///
    /// Resolution reads files, so it runs without the lock held. Concurrent
    /// first callers may each resolve; the first result installed wins and
    /// only it is reported.
    fn published(&self) -> Result<Published, ServerError> {
        if let Some(published) = self.resolution.read().as_ref() {
            return Ok(published.clone());
        }

        let resolution = Arc::new(self.resolver.resolve()?);

        let published = {
            let mut guard = self.resolution.write();
            if let Some(published) = guard.as_ref() {
                return Ok(published.clone());
            }
            let published = (1, resolution);
            *guard = Some(published.clone());
            published
        };
        self.emit_resolved(&published.1);
        Ok(published)
    }

    /// The resolved topology.
    pub fn topology(&self) -> Result<Arc<Resolution>, ServerError> {
        self.resolution()
    }

    /// Re-run resolution and close every handle cached under the previous
    /// topology.
    ///
    /// Handles created after the new topology is published are left open. The
    /// previous topology stays in place if resolution fails.
    pub async fn reload(&self) -> Result<Arc<Resolution>, ServerError> {
        let resolution = Arc::new(self.resolver.resolve()?);

        let generation = {
            let mut guard = self.resolution.write();
            let generation = guard.as_ref().map_or(1, |(generation, _)| generation + 1);
            *guard = Some((generation, resolution.clone()));
            generation
        };
        self.emit_resolved(&resolution);

        let sweeps = self.existing_slots().into_iter().map(|(_, slot)| async move {
            let mut cached = slot.lock().await;
            let stale = cached
                .as_ref()
                .is_some_and(|entry| entry.generation < generation);
            if stale {
                cached.take().map(|entry| entry.handle)
            } else {
                None
            }
        });
        let stale: Vec<_> = join_all(sweeps).await.into_iter().flatten().collect();

        info!(generation, closing = stale.len(), "Topology reloaded");
        join_all(stale.into_iter().map(|handle| self.close_and_report(handle))).await;
        Ok(resolution)
    }

    fn emit_resolved(&self, resolution: &Resolution) {
        let topology = resolution.topology();
        self.emit(RegistryEvent::TopologyResolved {
            source: resolution.selected(),
            profiles: topology.len(),
            default_profile: topology.default_profile_name().to_string(),
        });
    }

    /// Name of the default profile.
    pub fn default_profile_name(&self) -> Result<String, ServerError> {
        Ok(self
            .resolution()?
            .topology()
            .default_profile_name()
            .to_string())
    }

    /// The profile `name` refers to (the default when `None`). No I/O.
    pub fn profile(&self, name: Option<&str>) -> Result<ConnectionProfile, ServerError> {
        let resolution = self.resolution()?;
        lookup(resolution.topology(), name).cloned()
    }

    /// Every profile name with its descriptive metadata. No connection attempt.
    pub fn list_profiles(&self) -> Result<Vec<ProfileSummary>, ServerError> {
        Ok(self
            .resolution()?
            .topology()
            .profiles()
            .map(ConnectionProfile::summary)
            .collect())
    }

    // =========================================================================
    // Handles
    // =========================================================================

    fn slot(&self, name: &str) -> Slot {
        self.slots
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn existing_slots(&self) -> Vec<(String, Slot)> {
        self.slots
            .lock()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect()
    }

    /// Return a live handle for `name` (the default profile when `None`).
    ///
    /// A cached handle is probed first; if the probe fails it is evicted and a
    /// new one is created in its place. A handle whose session another caller
    /// is using counts as live and is returned without waiting. Creation
    /// failures are returned to the caller and are not retried here.
    pub async fn get_handle(&self, name: Option<&str>) -> Result<Arc<ConnectionHandle>, ServerError> {
        let name = self.profile(name)?.name;
        let slot = self.slot(&name);
        let mut cached = slot.lock().await;

        // Read the topology only once the slot is held so a concurrent reload
        // either sweeps this handle or sees it created under the new topology.
        let (generation, resolution) = self.published()?;
        let profile = lookup(resolution.topology(), Some(name.as_str()))?.clone();

        let mut previous_handle_id = None;
        if let Some(entry) = cached.take() {
            if entry.generation != generation {
                debug!(profile = %name, handle_id = entry.handle.id(), "discarding handle from previous topology");
                self.close_and_report(entry.handle).await;
            } else {
                match entry.handle.probe_if_idle(self.config.probe_timeout).await {
                    Ok(answered) => {
                        let handle = entry.handle.clone();
                        debug!(profile = %name, handle_id = handle.id(), busy = !answered, "reusing cached handle");
                        *cached = Some(entry);
                        return Ok(handle);
                    }
                    Err(e) => {
                        let handle = entry.handle;
                        self.emit(RegistryEvent::ProbeFailed {
                            profile: name.clone(),
                            handle_id: handle.id(),
                            error: e.to_string(),
                        });
                        previous_handle_id = Some(handle.id());
                        if let Err(e) = handle.close(self.config.close_timeout).await {
                            debug!(profile = %name, "discarding dead handle: {}", e);
                        }
                    }
                }
            }
        }

        let handle = self.create_handle(&profile).await?;
        *cached = Some(Cached {
            handle: handle.clone(),
            generation,
        });

        match previous_handle_id {
            Some(previous_handle_id) => self.emit(RegistryEvent::HandleRecreated {
                profile: profile.name.clone(),
                handle_id: handle.id(),
                previous_handle_id,
            }),
            None => self.emit(RegistryEvent::HandleCreated {
                profile: profile.name.clone(),
                handle_id: handle.id(),
            }),
        }
        Ok(handle)
    }

    async fn create_handle(&self, profile: &ConnectionProfile) -> Result<Arc<ConnectionHandle>, ServerError> {
        let timeout = self.config.connect_timeout;
        let result = tokio::time::timeout(timeout, self.connector.connect(profile))
            .await
            .unwrap_or_else(|_| Err(ServerError::timeout("connect", timeout.as_secs())));

        match result {
            Ok(session) => {
                let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
                Ok(Arc::new(ConnectionHandle::new(
                    id,
                    &profile.name,
                    session,
                    self.config.query_timeout,
                )))
            }
            Err(e) => {
                self.emit(RegistryEvent::CreationFailed {
                    profile: profile.name.clone(),
                    error: e.to_string(),
                });
                Err(match e {
                    e if e.is_connection_failure() => e,
                    other => ServerError::connection(format!(
                        "Failed to connect '{}': {}",
                        profile.name, other
                    )),
                })
            }
        }
    }

    /// Close and forget the cached handle for `name`. No-op when absent.
    pub async fn close_handle(&self, name: &str) {
        let slot = self.slots.lock().get(name).cloned();
        let Some(slot) = slot else {
            return;
        };
        let entry = slot.lock().await.take();
        if let Some(entry) = entry {
            self.close_and_report(entry.handle).await;
        }
    }

    /// Close every cached handle concurrently and empty the cache.
    ///
    /// Close failures are logged and reported as events, never returned.
    pub async fn close_all(&self) {
        let slots = self.existing_slots();
        let closes = slots.into_iter().map(|(_, slot)| async move {
            let entry = slot.lock().await.take();
            if let Some(entry) = entry {
                self.close_and_report(entry.handle).await;
            }
        });
        join_all(closes).await;
        info!("All connections closed");
    }

    async fn close_and_report(&self, handle: Arc<ConnectionHandle>) {
        let profile = handle.profile_name().to_string();
        match handle.close(self.config.close_timeout).await {
            Ok(()) => self.emit(RegistryEvent::HandleClosed {
                profile,
                handle_id: handle.id(),
            }),
            Err(e) => {
                error!("{}", e);
                self.emit(RegistryEvent::CloseFailed {
                    profile,
                    handle_id: handle.id(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Names of profiles that currently have a cached handle.
    pub async fn cached_profile_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (name, slot) in self.existing_slots() {
            if slot.lock().await.is_some() {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Obtain a handle for `name`, run a probe, and report the outcome.
    ///
    /// Connection failures become a failed result; configuration and unknown
    /// profile errors are returned as errors. A passing test keeps the handle
    /// cached.
    pub async fn test_profile(&self, name: &str) -> Result<ProfileTestResult, ServerError> {
        let profile = self.profile(Some(name))?;

        let outcome = match self.get_handle(Some(name)).await {
            Ok(handle) => handle.probe(self.config.probe_timeout).await,
            Err(e) => Err(e),
        };

        Ok(match outcome {
            Ok(()) => ProfileTestResult::passed(&profile),
            Err(e) => {
                warn!(profile = %name, "Connection test failed: {}", e);
                ProfileTestResult::failed(name, &e)
            }
        })
    }

    /// Test every configured profile. One failure never hides another result.
    pub async fn test_all_profiles(&self) -> Result<BTreeMap<String, ProfileTestResult>, ServerError> {
        let resolution = self.resolution()?;
        let names: Vec<String> = resolution
            .topology()
            .profile_names()
            .map(str::to_string)
            .collect();

        let tests = names.into_iter().map(|name| async move {
            let result = match self.test_profile(&name).await {
                Ok(result) => result,
                Err(e) => ProfileTestResult::failed(&name, &e),
            };
            (name, result)
        });

        Ok(join_all(tests).await.into_iter().collect())
    }

    /// Status of every configured profile.
    ///
    /// Profiles with a cached handle run the session identity query; the rest
    /// are reported inactive without connecting.
    pub async fn status_snapshot(&self) -> Result<BTreeMap<String, ProfileStatus>, ServerError> {
        let resolution = self.resolution()?;
        let mut status: BTreeMap<String, ProfileStatus> = resolution
            .topology()
            .profile_names()
            .map(|name| (name.to_string(), ProfileStatus::inactive()))
            .collect();

        let mut cached = Vec::new();
        for (name, slot) in self.existing_slots() {
            if let Some(entry) = slot.lock().await.as_ref() {
                cached.push((name, entry.handle.clone()));
            }
        }

        let queries = cached.into_iter().map(|(name, handle)| async move {
            let entry = match handle.identity(self.config.probe_timeout).await {
                Ok(identity) => ProfileStatus {
                    active: true,
                    handle_id: Some(handle.id()),
                    info: Some(identity),
                    error: None,
                },
                Err(e) => ProfileStatus {
                    active: false,
                    handle_id: Some(handle.id()),
                    info: None,
                    error: Some(e.to_string()),
                },
            };
            (name, entry)
        });

        for (name, entry) in join_all(queries).await {
            status.insert(name, entry);
        }
        Ok(status)
    }
}

fn lookup<'a>(topology: &'a Topology, name: Option<&str>) -> Result<&'a ConnectionProfile, ServerError> {
    let name = name.unwrap_or_else(|| topology.default_profile_name());
    topology
        .profile(name)
        .ok_or_else(|| ServerError::unknown_profile(name))
}
