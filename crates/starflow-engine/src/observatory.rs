/*!
 * Observatory assembly.
 *
 * [`Observatory::start`] turns a [`Config`] into running components:
 * - a status sync engine and a command queue per remote Alpaca device
 * - an actuator state machine and a command queue per local dome
 * - a command queue with periodic status queries per serial or socket mount
 *
 * Every controller is attached to one [`DeviceRegistry`]. In the threaded
 * execution model each component gets its own task or thread; in the
 * cooperative model one [`CooperativeLoop`] drives them all.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, Instrument};

use starflow_core::config::{Config, DomeConfig, ExecutionModel, MountConfig};
use starflow_core::logging::component_span;
use starflow_core::runtime::ServiceHandle;
use starflow_core::types::Value;
use starflow_devices::discovery::{EndpointDiscoverer, StaticEndpoints};
use starflow_devices::hardware::{DigitalIo, SimulatedIo};
use starflow_devices::protocols::{open_transport, AlpacaClient, AlpacaTransport};
use starflow_devices::{
    CommandRequest, DeviceRegistry, DeviceStatus, DeviceType, Framing, RegisteredDevice, RemoteDeviceEndpoint,
    SharedDeviceRegistry,
};

use crate::actuator::{
    ActuatorHandle, ActuatorKind, ActuatorLines, ActuatorService, ActuatorStateMachine, ActuatorTimings, Intent,
    LocalActuatorTransport,
};
use crate::command_queue::{Command, CommandHandle, DeviceCommandQueue, LinkState, PeriodicCommand, QueueSender};
use crate::error::{Error, Result};
use crate::scheduler::{CooperativeLoop, TaskScheduler};
use crate::sync::{StatusSyncEngine, SyncHandle};

/// ASCOM `ShutterStatus` opening
const SHUTTER_OPENING: i32 = 2;
/// ASCOM `ShutterStatus` closing
const SHUTTER_CLOSING: i32 = 3;

/// Where a dome controller reads the shutter state from
#[derive(Debug, Clone)]
pub enum ShutterSource {
    /// A local actuator state machine
    Local(ActuatorHandle),
    /// The cached `shutterstatus` of a remote dome
    Remote(SyncHandle),
}

impl ShutterSource {
    /// ASCOM shutter status, if known
    pub fn shutter_status(&self) -> Option<i32> {
        match self {
            ShutterSource::Local(handle) => Some(handle.status().shutter_status()),
            ShutterSource::Remote(sync) => sync
                .value("shutterstatus")
                .and_then(|value| value.as_i64())
                .and_then(|code| i32::try_from(code).ok()),
        }
    }
}

/// Dome front end; refuses reversals before they reach the queue
#[derive(Debug)]
pub struct DomeController {
    name: String,
    kind: String,
    source: ShutterSource,
    commands: QueueSender,
}

impl DomeController {
    /// Create a controller over a queue and a shutter state source
    pub fn new<S: Into<String>, K: Into<String>>(name: S, kind: K, source: ShutterSource, commands: QueueSender) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            source,
            commands,
        }
    }

    fn check(&self, intent: Intent) -> Result<()> {
        match (intent, self.source.shutter_status()) {
            (Intent::Open, Some(SHUTTER_CLOSING)) => {
                Err(Error::rejected(format!("{}: cannot open while closing", self.name)))
            }
            (Intent::Close, Some(SHUTTER_OPENING)) => {
                Err(Error::rejected(format!("{}: cannot close while opening", self.name)))
            }
            _ => Ok(()),
        }
    }

    fn submit(&self, intent: Intent, command: &str) -> Result<CommandHandle> {
        self.check(intent)?;
        info!(dome = %self.name, ?intent, "Dome command");
        Ok(self.commands.enqueue(Command::named(command))?)
    }

    /// Open the shutter or roof
    pub fn open(&self) -> Result<CommandHandle> {
        self.submit(Intent::Open, "openshutter")
    }

    /// Close the shutter or roof
    pub fn close(&self) -> Result<CommandHandle> {
        self.submit(Intent::Close, "closeshutter")
    }

    /// Halt any motion
    pub fn abort(&self) -> Result<CommandHandle> {
        self.submit(Intent::Stop, "abortslew")
    }

    /// Clear an actuator fault
    pub fn reset(&self) -> Result<CommandHandle> {
        self.submit(Intent::Reset, "reset")
    }

    /// ASCOM shutter status, if known
    pub fn shutter_status(&self) -> Option<i32> {
        self.source.shutter_status()
    }

    /// The command queue
    pub fn commands(&self) -> &QueueSender {
        &self.commands
    }
}

impl RegisteredDevice for DomeController {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn status(&self) -> DeviceStatus {
        let mut detail = BTreeMap::new();
        if let Some(code) = self.shutter_status() {
            detail.insert("shutterstatus".to_string(), Value::from(i64::from(code)));
        }
        detail.insert("pending".to_string(), Value::from(self.commands.pending() as i64));

        let online = match &self.source {
            ShutterSource::Local(handle) => {
                let status = handle.status();
                detail.insert("phase".to_string(), Value::from(status.phase.to_string()));
                detail.insert("openlimit".to_string(), Value::from(status.open_limit));
                detail.insert("closelimit".to_string(), Value::from(status.close_limit));
                if let Some(fault) = status.fault {
                    detail.insert("fault".to_string(), Value::from(fault));
                }
                if let Some(at) = status.last_completed {
                    detail.insert("lastcompleted".to_string(), Value::from(at.to_rfc3339()));
                }
                status.running
            }
            ShutterSource::Remote(sync) => sync.is_online(),
        };

        DeviceStatus {
            name: self.name.clone(),
            kind: self.kind.clone(),
            online,
            detail,
        }
    }
}

/// A remote Alpaca device: its status cache and its command queue
#[derive(Debug)]
pub struct RemoteDeviceController {
    name: String,
    device_type: DeviceType,
    sync: SyncHandle,
    commands: QueueSender,
}

impl RemoteDeviceController {
    /// Pair a sync handle with a command queue
    pub fn new<S: Into<String>>(name: S, device_type: DeviceType, sync: SyncHandle, commands: QueueSender) -> Self {
        Self {
            name: name.into(),
            device_type,
            sync,
            commands,
        }
    }

    /// Status cache access
    pub fn sync(&self) -> &SyncHandle {
        &self.sync
    }

    /// The command queue
    pub fn commands(&self) -> &QueueSender {
        &self.commands
    }

    /// Enqueue an Alpaca method with form parameters
    pub fn command(&self, method: &str, parameters: &[(String, String)]) -> Result<CommandHandle> {
        let request = parameters
            .iter()
            .fold(CommandRequest::new(method), |request, (key, value)| {
                request.with_parameter(key.clone(), value)
            });
        Ok(self.commands.enqueue(Command::new(request))?)
    }
}

impl RegisteredDevice for RemoteDeviceController {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        self.device_type.as_str()
    }

    fn status(&self) -> DeviceStatus {
        let endpoint = self.sync.endpoint();
        let mut detail: BTreeMap<String, Value> = self
            .sync
            .snapshot()
            .into_iter()
            .filter(|reading| reading.valid)
            .map(|reading| (reading.name, reading.value))
            .collect();
        detail.insert("strategy".to_string(), Value::from(self.sync.strategy().to_string()));
        detail.insert(
            "consecutivefailures".to_string(),
            Value::from(i64::from(endpoint.consecutive_failures)),
        );
        if let Some(error) = &endpoint.last_error {
            detail.insert("lasterror".to_string(), Value::from(error.message.clone()));
        }

        DeviceStatus {
            name: self.name.clone(),
            kind: self.device_type.as_str().to_string(),
            online: endpoint.online,
            detail,
        }
    }
}

/// A serial or socket mount driven by raw commands
#[derive(Debug)]
pub struct MountController {
    name: String,
    framing: Framing,
    periodic: Vec<String>,
    commands: QueueSender,
}

impl MountController {
    /// Wrap a mount queue
    pub fn new<S: Into<String>>(name: S, framing: Framing, periodic: Vec<String>, commands: QueueSender) -> Self {
        Self {
            name: name.into(),
            framing,
            periodic,
            commands,
        }
    }

    /// Enqueue a raw command using the mount's framing
    pub fn send(&self, command: &str) -> Result<CommandHandle> {
        let request = CommandRequest::new(command).with_framing(self.framing);
        Ok(self.commands.enqueue(Command::new(request))?)
    }

    /// The command queue
    pub fn commands(&self) -> &QueueSender {
        &self.commands
    }
}

impl RegisteredDevice for MountController {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "mount"
    }

    fn status(&self) -> DeviceStatus {
        let detail = self
            .periodic
            .iter()
            .filter_map(|command| {
                self.commands
                    .periodic_reading(command)
                    .map(|reading| (command.clone(), reading.value))
            })
            .collect();
        DeviceStatus {
            name: self.name.clone(),
            kind: "mount".to_string(),
            online: self.commands.link_state() == LinkState::Connected,
            detail,
        }
    }
}

enum Driver {
    Threaded,
    Cooperative(CooperativeLoop),
}

/// Every running component of one deployment
pub struct Observatory {
    registry: SharedDeviceRegistry,
    scheduler: Arc<TaskScheduler>,
    driver: Driver,
    services: Vec<ServiceHandle>,
    actuators: Vec<ActuatorService>,
    devices: BTreeMap<String, Arc<RemoteDeviceController>>,
    domes: BTreeMap<String, Arc<DomeController>>,
    mounts: BTreeMap<String, Arc<MountController>>,
}

impl fmt::Debug for Observatory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observatory")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("domes", &self.domes.keys().collect::<Vec<_>>())
            .field("mounts", &self.mounts.keys().collect::<Vec<_>>())
            .field("services", &self.services.len())
            .field("actuators", &self.actuators.len())
            .finish()
    }
}

impl Observatory {
    /// Build and start everything `config` describes
    ///
    /// Must be called from inside the runtime built for
    /// `config.runtime.execution_model`.
    pub async fn start(config: &Config) -> Result<Self> {
        config.validate()?;
        let scheduler = Arc::new(TaskScheduler::new());
        let driver = match config.runtime.execution_model {
            ExecutionModel::Threaded => Driver::Threaded,
            ExecutionModel::Cooperative => Driver::Cooperative(CooperativeLoop::new(
                scheduler.clone(),
                Duration::from_millis(config.runtime.cooperative_period_ms),
            )),
        };
        let mut observatory = Self {
            registry: SharedDeviceRegistry::new(),
            scheduler,
            driver,
            services: Vec::new(),
            actuators: Vec::new(),
            devices: BTreeMap::new(),
            domes: BTreeMap::new(),
            mounts: BTreeMap::new(),
        };

        for dome in &config.domes {
            observatory.attach_dome(dome, config)?;
        }
        for mount in &config.mounts {
            observatory.attach_mount(mount, config)?;
        }
        let mut discoverer = EndpointDiscoverer::new();
        discoverer.add_source(StaticEndpoints::from_config(&config.devices)?);
        for endpoint in discoverer.discover().await {
            observatory.attach_remote(endpoint, config)?;
        }

        if let Driver::Cooperative(cooperative) = std::mem::replace(&mut observatory.driver, Driver::Threaded) {
            if !cooperative.is_empty() {
                let span = component_span("cooperative", None);
                observatory
                    .services
                    .push(ServiceHandle::spawn("cooperative", move |shutdown| {
                        cooperative.run(shutdown).instrument(span)
                    }));
            }
        }

        info!(
            site = %config.general.site_name,
            model = ?config.runtime.execution_model,
            devices = observatory.registry().len(),
            "Observatory started"
        );
        Ok(observatory)
    }

    /// Does no I/O; capabilities are queried by the engine's first pass.
    fn attach_remote(&mut self, endpoint: RemoteDeviceEndpoint, config: &Config) -> Result<()> {
        let notifier = self.registry().reserve();
        let id = notifier.id().clone();
        let name = endpoint.name.clone();
        let device_type = endpoint.device_type;

        let link_timeout = config.sync.request_timeout();
        let client = AlpacaClient::new(&endpoint, config.general.client_id, link_timeout)?;
        let transport = AlpacaTransport::new(client.for_commands(link_timeout)?).with_link_timeout(link_timeout);
        let engine = StatusSyncEngine::new(endpoint, Arc::new(client), &config.sync, notifier);
        let queue = DeviceCommandQueue::new(name.clone(), Box::new(transport), &config.queue);

        let sync = engine.handle();
        let controller = Arc::new(RemoteDeviceController::new(
            name.clone(),
            device_type,
            sync.clone(),
            queue.sender(),
        ));
        if device_type == DeviceType::Dome {
            let dome = DomeController::new(name.clone(), "dome", ShutterSource::Remote(sync), queue.sender());
            self.domes.insert(name.clone(), Arc::new(dome));
        }

        match &mut self.driver {
            Driver::Threaded => {
                let span = component_span("sync", Some(&name));
                self.services.push(ServiceHandle::spawn(format!("sync:{}", name), move |shutdown| {
                    engine.run(shutdown).instrument(span)
                }));
            }
            Driver::Cooperative(cooperative) => {
                cooperative.add(Box::new(engine));
            }
        }
        self.run_queue(queue, &name);

        self.registry().attach(id, controller.clone())?;
        self.devices.insert(name, controller);
        Ok(())
    }

    fn attach_dome(&mut self, config: &DomeConfig, root: &Config) -> Result<()> {
        let kind = ActuatorKind::from_config(config)?;
        let lines = ActuatorLines {
            open_output: config.open_line,
            close_output: config.close_line,
            open_limit: config.open_limit_line,
            close_limit: config.close_limit_line,
        };
        let timings = ActuatorTimings::from_config(&root.actuator, config);
        let io = open_io(config, &timings)?;
        let machine = ActuatorStateMachine::new(config.name.clone(), kind, lines, timings, io);
        let handle = machine.handle();
        let kind_tag = handle.status().kind;

        match &mut self.driver {
            Driver::Threaded => self.actuators.push(ActuatorService::spawn(machine)?),
            Driver::Cooperative(cooperative) => {
                cooperative.add(Box::new(machine));
            }
        }

        let queue = DeviceCommandQueue::new(
            config.name.clone(),
            Box::new(LocalActuatorTransport::new(handle.clone())),
            &root.queue,
        );
        let controller = Arc::new(DomeController::new(
            config.name.clone(),
            kind_tag,
            ShutterSource::Local(handle),
            queue.sender(),
        ));
        self.run_queue(queue, &config.name);

        let id = self.registry().reserve().id().clone();
        self.registry().attach(id, controller.clone())?;
        self.domes.insert(config.name.clone(), controller);
        Ok(())
    }

    fn attach_mount(&mut self, config: &MountConfig, root: &Config) -> Result<()> {
        let framing = Framing::from_name(&config.framing)?;
        let transport = open_transport(&config.connection, root.sync.request_timeout())?;
        let periodic: Vec<_> = config
            .periodic
            .iter()
            .map(|entry| PeriodicCommand::from_config(entry, framing))
            .collect();
        let names = config.periodic.iter().map(|entry| entry.command.clone()).collect();

        let queue = DeviceCommandQueue::new(config.name.clone(), transport, &root.queue).with_periodic(periodic);
        let controller = Arc::new(MountController::new(config.name.clone(), framing, names, queue.sender()));
        self.run_queue(queue, &config.name);

        let id = self.registry().reserve().id().clone();
        self.registry().attach(id, controller.clone())?;
        self.mounts.insert(config.name.clone(), controller);
        Ok(())
    }

    fn run_queue(&mut self, queue: DeviceCommandQueue, name: &str) {
        match &mut self.driver {
            Driver::Threaded => {
                let span = component_span("queue", Some(name));
                self.services.push(ServiceHandle::spawn(format!("queue:{}", name), move |shutdown| {
                    queue.run(shutdown).instrument(span)
                }));
            }
            Driver::Cooperative(cooperative) => {
                cooperative.add(Box::new(queue));
            }
        }
    }

    /// The device registry
    pub fn registry(&self) -> &DeviceRegistry {
        self.registry.registry()
    }

    /// A cloneable registry handle
    pub fn shared_registry(&self) -> SharedDeviceRegistry {
        self.registry.clone()
    }

    /// Task timing
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// A remote Alpaca device by name
    pub fn device(&self, name: &str) -> Option<Arc<RemoteDeviceController>> {
        self.devices.get(name).cloned()
    }

    /// A local or remote dome by name
    pub fn dome(&self, name: &str) -> Option<Arc<DomeController>> {
        self.domes.get(name).cloned()
    }

    /// A serial or socket mount by name
    pub fn mount(&self, name: &str) -> Option<Arc<MountController>> {
        self.mounts.get(name).cloned()
    }

    /// Status of every attached device
    pub fn statuses(&self) -> Vec<DeviceStatus> {
        self.registry()
            .statuses()
            .into_iter()
            .map(|(_, status)| status)
            .collect()
    }

    /// Stop every loop and thread, then detach everything
    pub async fn shutdown(mut self) {
        for service in self.services.drain(..) {
            service.shutdown().await;
        }
        for actuator in self.actuators.drain(..) {
            actuator.shutdown();
        }
        let detached = self.registry().clear();
        self.scheduler.log_report();
        info!(detached, "Observatory stopped");
    }
}

fn open_io(config: &DomeConfig, timings: &ActuatorTimings) -> Result<Box<dyn DigitalIo>> {
    match config.io.to_ascii_lowercase().as_str() {
        "simulated" => Ok(Box::new(SimulatedIo::with_roof(
            config.open_line,
            config.close_line,
            config.open_limit_line,
            config.close_limit_line,
            timings.open_timeout.min(timings.close_timeout) / 2,
        ))),
        #[cfg(feature = "gpio")]
        "gpio" => {
            let mut outputs = vec![config.open_line, config.close_line];
            outputs.extend(config.power_line);
            let inputs = [config.open_limit_line, config.close_limit_line];
            Ok(Box::new(starflow_devices::gpio::GpioIo::new(&outputs, &inputs, true)?))
        }
        other => Err(Error::validation(format!(
            "dome {}: unsupported io backend '{}'",
            config.name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::ActuatorPhase;
    use crate::command_queue::CommandStatus;
    use starflow_core::config::{PeriodicCommandConfig, QueueConfig};
    use starflow_devices::DeviceError;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WAIT: Duration = Duration::from_secs(3);

    fn dome_config(name: &str) -> DomeConfig {
        DomeConfig {
            name: name.to_string(),
            kind: "rolloffroof".to_string(),
            io: "simulated".to_string(),
            open_line: 17,
            close_line: 27,
            power_line: Some(22),
            open_limit_line: 5,
            close_limit_line: 6,
            open_timeout_ms: Some(600),
            close_timeout_ms: Some(600),
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_close_while_opening_rejected_before_enqueue() {
        let io = SimulatedIo::new();
        io.set_input(6, true);
        let machine = ActuatorStateMachine::new(
            "roof",
            ActuatorKind::RollOffRoof { power_line: Some(22) },
            ActuatorLines {
                open_output: 17,
                close_output: 27,
                open_limit: 5,
                close_limit: 6,
            },
            ActuatorTimings {
                open_timeout: Duration::from_secs(30),
                close_timeout: Duration::from_secs(30),
                tick_period: Duration::from_millis(10),
            },
            Box::new(io.clone()),
        );
        let service = ActuatorService::spawn(machine).unwrap();
        let handle = service.handle().clone();
        let queue = DeviceCommandQueue::new(
            "roof",
            Box::new(LocalActuatorTransport::new(handle.clone())),
            &QueueConfig::default(),
        );
        let sender = queue.sender();
        let dispatch = ServiceHandle::spawn("roof-queue", |shutdown| queue.run(shutdown));
        let dome = DomeController::new("roof", "ror", ShutterSource::Local(handle.clone()), sender.clone());

        let opened = dome.open().unwrap().wait(WAIT).await.unwrap();
        assert_eq!(opened, CommandStatus::Succeeded(Value::from("opening")));
        wait_for(|| handle.status().phase == ActuatorPhase::Opening).await;

        assert!(matches!(dome.close(), Err(Error::Rejected(_))));

        let raw = sender.enqueue(Command::named("closeshutter")).unwrap();
        match raw.wait(WAIT).await.unwrap() {
            CommandStatus::Failed(DeviceError::InvalidTransition(_)) => {}
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(handle.status().phase, ActuatorPhase::Opening);

        let status = dome.status();
        assert_eq!(status.detail.get("shutterstatus"), Some(&Value::Integer(2)));
        assert!(status.online);

        dispatch.shutdown().await;
        service.shutdown();
        assert!(!io.output(17));
    }

    #[tokio::test]
    async fn test_cooperative_deployment_with_simulated_roof() {
        let mut config = Config::default();
        config.runtime.execution_model = ExecutionModel::Cooperative;
        config.runtime.cooperative_period_ms = 10;
        config.actuator.tick_period_ms = 10;
        config.domes.push(dome_config("roof"));

        let observatory = Observatory::start(&config).await.unwrap();
        let dome = observatory.dome("roof").unwrap();
        wait_for(|| dome.shutter_status() == Some(1)).await;
        wait_for(|| dome.commands().link_state() == LinkState::Connected).await;

        let handle = dome.open().unwrap();
        assert!(matches!(handle.wait(WAIT).await.unwrap(), CommandStatus::Succeeded(_)));
        wait_for(|| dome.shutter_status() == Some(0)).await;

        let statuses = observatory.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].kind, "ror");
        assert_eq!(statuses[0].detail.get("phase"), Some(&Value::from("idle")));
        assert!(statuses[0].detail.contains_key("lastcompleted"));

        observatory.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_threaded_deployment_with_unreachable_device() {
        let mut config = Config::default();
        config.sync.request_timeout_ms = 500;
        config.sync.property_retries = 0;
        config.devices.push(starflow_core::config::DeviceConfig {
            name: "focuser".to_string(),
            address: "127.0.0.1".to_string(),
            port: 9,
            device_type: "focuser".to_string(),
            device_number: 0,
            supports_read_all: None,
            supports_device_state: None,
        });
        config.domes.push(dome_config("roof"));

        let observatory = Observatory::start(&config).await.unwrap();
        let device = observatory.device("focuser").unwrap();
        wait_for(|| device.sync().endpoint().consecutive_failures > 0).await;

        let status = device.status();
        assert!(!status.online);
        assert_eq!(status.kind, "focuser");
        assert_eq!(status.detail.get("strategy"), Some(&Value::from("one-at-a-time")));
        assert!(status.detail.contains_key("lasterror"));
        assert_eq!(observatory.registry().len(), 2);

        let roof = observatory.dome("roof").unwrap();
        wait_for(|| roof.commands().link_state() == LinkState::Connected).await;
        assert!(roof.open().is_ok());

        observatory.shutdown().await;
    }

    fn remote_device(name: &str, port: u16, device_type: &str) -> starflow_core::config::DeviceConfig {
        starflow_core::config::DeviceConfig {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            device_type: device_type.to_string(),
            device_number: 0,
            supports_read_all: None,
            supports_device_state: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slew_outlasts_status_request_timeout() {
        let server = MockServer::start().await;
        let envelope = json!({"Value": null, "ErrorNumber": 0, "ErrorMessage": ""});
        Mock::given(method("PUT"))
            .and(path("/api/v1/dome/0/connected"))
            .respond_with(ResponseTemplate::new(200).set_body_json(envelope.clone()))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/dome/0/slewtoazimuth"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(envelope)
                    .set_delay(Duration::from_millis(1500)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut config = Config::default();
        config.sync.request_timeout_ms = 500;
        config.sync.property_retries = 0;
        config.devices.push(remote_device("dome", server.address().port(), "dome"));

        let observatory = Observatory::start(&config).await.unwrap();
        let device = observatory.device("dome").unwrap();
        wait_for(|| device.commands().link_state() == LinkState::Connected).await;

        let parameters = [("Azimuth".to_string(), "90".to_string())];
        let handle = device.command("slewtoazimuth", &parameters).unwrap();
        let status = handle.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(status, CommandStatus::Succeeded(Value::Null));
        assert_eq!(device.commands().link_state(), LinkState::Connected);

        observatory.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silent_remote_does_not_delay_local_dome() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = Config::default();
        config.sync.request_timeout_ms = 2_000;
        config.sync.property_retries = 2;
        config.actuator.tick_period_ms = 10;
        config.devices.push(remote_device("silent", port, "focuser"));
        config.domes.push(dome_config("roof"));

        let started = tokio::time::Instant::now();
        let observatory = Observatory::start(&config).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let roof = observatory.dome("roof").unwrap();
        wait_for(|| roof.shutter_status() == Some(1)).await;
        wait_for(|| roof.commands().link_state() == LinkState::Connected).await;
        let opened = roof.open().unwrap().wait(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(opened, CommandStatus::Succeeded(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!observatory.device("silent").unwrap().sync().endpoint().capabilities_known);

        observatory.shutdown().await;
    }

    #[tokio::test]
    async fn test_mount_periodic_status_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 64];
            loop {
                let read = match socket.read(&mut buffer).await {
                    Ok(0) | Err(_) => return,
                    Ok(read) => read,
                };
                let reply: &[u8] = match &buffer[..read] {
                    b":GR#" => b"05:35:17#",
                    _ => b"0#",
                };
                if socket.write_all(reply).await.is_err() {
                    return;
                }
            }
        });

        let mut config = Config::default();
        config.mounts.push(MountConfig {
            name: "mount".to_string(),
            connection: format!("tcp://{}", address),
            framing: "hash".to_string(),
            periodic: vec![PeriodicCommandConfig {
                command: ":GR#".to_string(),
                interval_ms: 100,
            }],
        });

        let observatory = Observatory::start(&config).await.unwrap();
        let mount = observatory.mount("mount").unwrap();
        wait_for(|| mount.commands().periodic_reading(":GR#").is_some()).await;

        let status = mount.status();
        assert!(status.online);
        assert_eq!(status.detail.get(":GR#"), Some(&Value::from("05:35:17")));

        let reply = mount.send(":Q#").unwrap().wait(WAIT).await.unwrap();
        assert_eq!(reply, CommandStatus::Succeeded(Value::from("0")));
        observatory.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_io_backend_rejected() {
        let mut config = Config::default();
        let mut dome = dome_config("roof");
        dome.io = "parallelport".to_string();
        config.domes.push(dome);
        assert!(matches!(Observatory::start(&config).await, Err(Error::Validation(_))));
    }
}
