/*!
 * Status synchronization for one remote device.
 *
 * A [`StatusSyncEngine`] keeps the device's [`SharedPropertyCache`] fresh
 * with as few requests as the device allows. The fetch strategy is picked
 * once, as soon as `supportedactions` answers: `devicestate` if the device
 * has it, `readall` otherwise, and one property at a time as a last resort.
 * Until the device answers, every pass asks again first.
 *
 * A pass either succeeds as a whole and lands in the cache in one write, or
 * fails as a whole: the cache keeps its values but marks them stale, the
 * endpoint goes offline, and the next tick tries again.
 */
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use starflow_core::config::SyncConfig;
use starflow_core::runtime::ShutdownSignal;
use starflow_core::types::Value;
use starflow_core::utils::{with_retry, with_retry_if, with_timeout};
use starflow_devices::device::COMMON_STARTUP_PROPERTIES;
use starflow_devices::registry::RegistryNotifier;
use starflow_devices::{
    DeviceError, EndpointCapabilities, PropertyReading, RemoteDeviceEndpoint, SharedPropertyCache, StatusFetcher,
    StatusRequest,
};

use crate::scheduler::CooperativeTask;

/// How a pass reads the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FetchStrategy {
    /// One `devicestate` request
    DeviceState,
    /// One `readall` request
    ReadAll,
    /// `connected`, then each status property on its own
    OneAtATime,
}

impl FetchStrategy {
    /// Best strategy the capabilities allow
    pub fn for_capabilities(capabilities: &EndpointCapabilities) -> Self {
        if capabilities.device_state {
            FetchStrategy::DeviceState
        } else if capabilities.read_all {
            FetchStrategy::ReadAll
        } else {
            FetchStrategy::OneAtATime
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchStrategy::DeviceState => "devicestate",
            FetchStrategy::ReadAll => "readall",
            FetchStrategy::OneAtATime => "one-at-a-time",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct SyncShared {
    endpoint: RwLock<RemoteDeviceEndpoint>,
    cache: SharedPropertyCache,
    force: AtomicBool,
}

impl SyncShared {
    fn strategy(&self) -> FetchStrategy {
        let endpoint = self.endpoint.read().unwrap_or_else(PoisonError::into_inner);
        FetchStrategy::for_capabilities(&endpoint.capabilities)
    }
}

/// Cloneable reader and refresh trigger for one engine
#[derive(Debug, Clone)]
pub struct SyncHandle(Arc<SyncShared>);

impl SyncHandle {
    /// Make the next tick run a pass regardless of the update interval
    pub fn force_refresh(&self) {
        self.0.force.store(true, Ordering::Release);
    }

    /// Every cached property with its freshness
    pub fn snapshot(&self) -> Vec<PropertyReading> {
        self.0.cache.snapshot()
    }

    /// Value of `name` if it is currently valid
    pub fn value(&self, name: &str) -> Option<Value> {
        self.0.cache.valid_value(name)
    }

    /// The shared cache
    pub fn cache(&self) -> &SharedPropertyCache {
        &self.0.cache
    }

    /// Copy of the endpoint bookkeeping
    pub fn endpoint(&self) -> RemoteDeviceEndpoint {
        self.0.endpoint.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether the last pass succeeded
    pub fn is_online(&self) -> bool {
        self.0.endpoint.read().unwrap_or_else(PoisonError::into_inner).online
    }

    /// Current strategy; one property at a time until capabilities are known
    pub fn strategy(&self) -> FetchStrategy {
        self.0.strategy()
    }
}

#[derive(Debug, Clone)]
struct PassPlan {
    strategy: FetchStrategy,
    query_capabilities: bool,
    poll_list: Vec<String>,
    startup: Vec<String>,
    timeout: Duration,
    retries: usize,
}

#[derive(Debug)]
struct PassOutcome {
    capabilities: Option<EndpointCapabilities>,
    result: Result<Vec<(String, Value)>, DeviceError>,
    rejected: Vec<String>,
    startup: Option<Vec<(String, Value)>>,
}

async fn fetch_bounded(
    fetcher: &dyn StatusFetcher,
    request: &StatusRequest,
    timeout: Duration,
) -> Result<Vec<(String, Value)>, DeviceError> {
    with_timeout(timeout, fetcher.fetch(request)).await
}

async fn fetch_property(
    fetcher: &dyn StatusFetcher,
    name: &str,
    timeout: Duration,
    retries: usize,
) -> Result<Vec<(String, Value)>, DeviceError> {
    let request = StatusRequest::property(name);
    with_retry_if(
        retries,
        Duration::ZERO,
        || fetch_bounded(fetcher, &request, timeout),
        |e: &DeviceError| !e.is_not_implemented(),
    )
    .await
}

/// One synchronization pass; never touches shared state
async fn run_pass(fetcher: Arc<dyn StatusFetcher>, plan: PassPlan) -> PassOutcome {
    let fetcher = &*fetcher;
    let mut rejected = Vec::new();

    let mut strategy = plan.strategy;
    let mut capabilities = None;
    if plan.query_capabilities {
        match with_timeout(plan.timeout, fetcher.supported_actions()).await {
            Ok(actions) => {
                let found = EndpointCapabilities::from_actions(&actions);
                strategy = FetchStrategy::for_capabilities(&found);
                capabilities = Some(found);
            }
            Err(e) => debug!("supportedactions still unanswered: {}", e),
        }
    }

    let result = match strategy {
        FetchStrategy::DeviceState => fetch_bounded(fetcher, &StatusRequest::DeviceState, plan.timeout).await,
        FetchStrategy::ReadAll => fetch_bounded(fetcher, &StatusRequest::ReadAll, plan.timeout).await,
        FetchStrategy::OneAtATime => match fetch_property(fetcher, "connected", plan.timeout, plan.retries).await {
            Ok(mut values) => {
                let mut failure = None;
                for name in &plan.poll_list {
                    match fetch_property(fetcher, name, plan.timeout, plan.retries).await {
                        Ok(pairs) => values.extend(pairs),
                        Err(e) if e.is_not_implemented() => rejected.push(name.clone()),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                match failure {
                    Some(e) => Err(e),
                    None => Ok(values),
                }
            }
            Err(e) => Err(e),
        },
    };

    let startup = match &result {
        Ok(_) if !plan.startup.is_empty() => fetch_startup(fetcher, &plan).await,
        _ => None,
    };

    PassOutcome {
        capabilities,
        result,
        rejected,
        startup,
    }
}

/// Startup properties the device answers; `None` if the link failed midway
async fn fetch_startup(fetcher: &dyn StatusFetcher, plan: &PassPlan) -> Option<Vec<(String, Value)>> {
    let mut values = Vec::with_capacity(plan.startup.len());
    for name in &plan.startup {
        match fetch_bounded(fetcher, &StatusRequest::property(name.as_str()), plan.timeout).await {
            Ok(pairs) => values.extend(pairs),
            Err(e) if e.is_link_failure() => {
                debug!(property = %name, "Startup fetch interrupted: {}", e);
                return None;
            }
            Err(e) => debug!(property = %name, "Startup property skipped: {}", e),
        }
    }
    Some(values)
}

/// Keeps one device's property cache fresh
pub struct StatusSyncEngine {
    name: String,
    shared: Arc<SyncShared>,
    fetcher: Arc<dyn StatusFetcher>,
    notifier: RegistryNotifier,
    tick_period: Duration,
    update_interval: Duration,
    timeout: Duration,
    retries: usize,
    poll_list: Vec<String>,
    startup: Vec<String>,
    startup_pending: bool,
    last_success: Option<Instant>,
    in_flight: Option<JoinHandle<PassOutcome>>,
}

impl fmt::Debug for StatusSyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusSyncEngine")
            .field("name", &self.name)
            .field("strategy", &self.shared.strategy())
            .field("poll_list", &self.poll_list)
            .field("in_flight", &self.in_flight.is_some())
            .finish()
    }
}

impl StatusSyncEngine {
    /// Attach to `endpoint`, probing `supportedactions` unless capabilities are known
    ///
    /// If `supportedactions` fails, every later pass asks again first.
    pub async fn attach(
        mut endpoint: RemoteDeviceEndpoint,
        fetcher: Arc<dyn StatusFetcher>,
        config: &SyncConfig,
        notifier: RegistryNotifier,
    ) -> Self {
        if !endpoint.capabilities_known {
            let timeout = config.request_timeout();
            let answer = with_retry(config.property_retries, Duration::ZERO, || {
                with_timeout(timeout, fetcher.supported_actions())
            })
            .await;
            match answer {
                Ok(actions) => {
                    endpoint.capabilities = EndpointCapabilities::from_actions(&actions);
                    endpoint.capabilities_known = true;
                }
                Err(e) => warn!(device = %endpoint.name, "supportedactions failed, will ask again on the next pass: {}", e),
            }
        }
        Self::new(endpoint, fetcher, config, notifier)
    }

    /// Create an engine without touching the network
    ///
    /// Unknown capabilities are queried by the first pass.
    pub fn new(
        endpoint: RemoteDeviceEndpoint,
        fetcher: Arc<dyn StatusFetcher>,
        config: &SyncConfig,
        notifier: RegistryNotifier,
    ) -> Self {
        let strategy = FetchStrategy::for_capabilities(&endpoint.capabilities);
        let device_type = endpoint.device_type;
        let poll_list = device_type
            .status_properties()
            .iter()
            .filter(|name| **name != "connected")
            .map(|name| name.to_string())
            .collect();
        let startup = COMMON_STARTUP_PROPERTIES
            .iter()
            .chain(device_type.startup_properties())
            .map(|name| name.to_string())
            .collect();
        info!(device = %endpoint, %strategy, "Attached");

        Self {
            name: endpoint.name.clone(),
            shared: Arc::new(SyncShared {
                endpoint: RwLock::new(endpoint),
                cache: SharedPropertyCache::new(config.stale_after()),
                force: AtomicBool::new(false),
            }),
            fetcher,
            notifier,
            tick_period: config.tick_period(),
            update_interval: config.update_interval(),
            timeout: config.request_timeout(),
            retries: config.property_retries,
            poll_list,
            startup,
            startup_pending: true,
            last_success: None,
            in_flight: None,
        }
    }

    /// A reader and refresh trigger
    pub fn handle(&self) -> SyncHandle {
        SyncHandle(self.shared.clone())
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Properties still polled one at a time
    pub fn poll_list(&self) -> &[String] {
        &self.poll_list
    }

    fn is_due(&self, now: Instant) -> bool {
        let interval_elapsed = self
            .last_success
            .map_or(true, |last| now.saturating_duration_since(last) >= self.update_interval);
        let forced = self.shared.force.swap(false, Ordering::AcqRel);
        interval_elapsed || forced
    }

    fn plan(&self) -> PassPlan {
        let (online, query_capabilities, strategy) = {
            let endpoint = self.shared.endpoint.read().unwrap_or_else(PoisonError::into_inner);
            (
                endpoint.online,
                !endpoint.capabilities_known,
                FetchStrategy::for_capabilities(&endpoint.capabilities),
            )
        };
        let startup = if self.startup_pending || !online {
            self.startup.clone()
        } else {
            Vec::new()
        };
        PassPlan {
            strategy,
            query_capabilities,
            poll_list: self.poll_list.clone(),
            startup,
            timeout: self.timeout,
            retries: self.retries,
        }
    }

    fn apply(&mut self, outcome: PassOutcome, now: Instant) {
        let name = self.name.clone();
        if !outcome.rejected.is_empty() {
            info!(device = %name, properties = ?outcome.rejected, "Dropping properties the device does not implement");
            self.poll_list.retain(|p| !outcome.rejected.contains(p));
        }

        if let Some(capabilities) = outcome.capabilities {
            let strategy = FetchStrategy::for_capabilities(&capabilities);
            let mut endpoint = self.shared.endpoint.write().unwrap_or_else(PoisonError::into_inner);
            endpoint.capabilities = capabilities;
            endpoint.capabilities_known = true;
            info!(device = %name, %strategy, "Capabilities resolved");
        }

        let wall_time = Utc::now();
        match outcome.result {
            Ok(values) => {
                let startup_done = outcome.startup.is_some();
                self.shared.cache.write(|cache| {
                    let count = cache.apply(values, now, wall_time);
                    let startup = outcome.startup.map_or(0, |s| cache.apply(s, now, wall_time));
                    debug!(device = %name, count, startup, "Pass applied");
                });
                if startup_done {
                    self.startup_pending = false;
                }

                let came_online = self
                    .shared
                    .endpoint
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_success(wall_time);
                if came_online {
                    info!(device = %name, "Device online");
                    self.notifier.online_changed(true);
                    if !startup_done {
                        self.startup_pending = true;
                    }
                }
                self.last_success = Some(now);
            }
            Err(e) => {
                self.shared.cache.write(|cache| cache.mark_all_stale());
                let (was_online, failures) = {
                    let mut endpoint = self.shared.endpoint.write().unwrap_or_else(PoisonError::into_inner);
                    let was_online = endpoint.online;
                    endpoint.record_failure(&e, wall_time);
                    (was_online, endpoint.consecutive_failures)
                };
                warn!(device = %name, consecutive_failures = failures, "Status pass failed: {}", e);
                if was_online {
                    self.notifier.online_changed(false);
                    self.startup_pending = true;
                }
            }
        }
    }

    /// Run a pass if one is due; returns whether a pass ran
    pub async fn tick(&mut self, now: Instant) -> bool {
        if !self.is_due(now) {
            return false;
        }
        let outcome = run_pass(self.fetcher.clone(), self.plan()).await;
        self.apply(outcome, now);
        true
    }

    /// Tick every `sync.tick_period_ms` until shutdown
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let mut ticker = time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    self.tick(Instant::now()).await;
                }
            }
        }
        debug!(device = %self.name, "Status sync stopped");
    }
}

impl CooperativeTask for StatusSyncEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_step(&mut self, now: Instant) {
        if let Some(task) = self.in_flight.take() {
            if !task.is_finished() {
                self.in_flight = Some(task);
                return;
            }
            let outcome = match task.now_or_never() {
                Some(Ok(outcome)) => outcome,
                _ => PassOutcome {
                    capabilities: None,
                    result: Err(DeviceError::transport("status pass aborted")),
                    rejected: Vec::new(),
                    startup: None,
                },
            };
            self.apply(outcome, now);
            return;
        }

        if self.is_due(now) {
            self.in_flight = Some(tokio::spawn(run_pass(self.fetcher.clone(), self.plan())));
        }
    }
}
