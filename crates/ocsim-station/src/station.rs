//! Station runtime
//!
//! Lifecycle: Stopped -> Starting -> Connecting -> Registering -> Operating
//! -> Stopping -> Stopped. The runtime owns the connector model, the
//! configuration store, the engine, and every timer handle; collaborators
//! reach back through the shared state and the runtime command channel.

use crate::atg::{NoopGenerator, TransactionGenerator};
use crate::cache::DocumentCache;
use crate::config_store::keys;
use crate::engine::{CallOptions, Engine, DEFAULT_FLUSH_INTERVAL};
use crate::error::{StationError, StationResult};
use crate::events::{EventBus, StationEvent};
use crate::lock::KeyedMutex;
use crate::persist::{self, PersistedConfiguration};
use crate::reconcile::{self, boot_connector_status};
use crate::reservation::{self, ReservationTerminationReason};
use crate::services::v16::{V16IncomingService, V16RequestService};
use crate::services::v201::{V201IncomingService, V201RequestService};
use crate::services::{
    IncomingRequestService, MeterSample, RequestService, RuntimeCommand, SampleContext,
};
use crate::smart_charging::resolve_power_limit;
use crate::state::SharedState;
use async_trait::async_trait;
use chrono::Utc;
use ocsim_messages::v16::MessageTrigger;
use ocsim_transport::websocket::{station_endpoint, WebSocketChannel};
use ocsim_transport::{
    ChannelConfig, ChannelEvent, ChannelEvents, MessageChannel, TransportResult,
};
use ocsim_types::{
    AvailabilityType, ConnectorId, ConnectorStatus, FirmwareStatus, OcppVersion,
    RegistrationStatus, TransactionId,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

/// Opens channels to the Central System; swapped for an in-memory double in
/// tests.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Url,
        subprotocol: &str,
        credentials: Option<(String, String)>,
    ) -> TransportResult<(Arc<dyn MessageChannel>, ChannelEvents)>;
}

/// Production factory backed by the WebSocket channel.
pub struct WebSocketFactory {
    pub config: ChannelConfig,
}

#[async_trait]
impl ChannelFactory for WebSocketFactory {
    async fn connect(
        &self,
        endpoint: &Url,
        subprotocol: &str,
        credentials: Option<(String, String)>,
    ) -> TransportResult<(Arc<dyn MessageChannel>, ChannelEvents)> {
        let credentials = credentials.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
        let (channel, events) =
            WebSocketChannel::connect(endpoint, subprotocol, credentials, self.config.clone())
                .await?;
        Ok((Arc::new(channel) as Arc<dyn MessageChannel>, events))
    }
}

/// Lifecycle state of a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Starting,
    Connecting,
    Registering,
    Operating,
    Stopping,
}

/// Construction parameters.
pub struct StationOptions {
    pub index: u32,
    pub template_path: PathBuf,
    pub configuration_dir: PathBuf,
    pub cache: DocumentCache,
    pub locks: KeyedMutex,
    pub channel_factory: Arc<dyn ChannelFactory>,
    pub generator: Arc<dyn TransactionGenerator>,
    pub credentials: Option<(String, String)>,
    pub flush_interval: Duration,
    pub reservation_sweep_interval: Duration,
}

impl StationOptions {
    pub fn new(
        index: u32,
        template_path: impl Into<PathBuf>,
        configuration_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            index,
            template_path: template_path.into(),
            configuration_dir: configuration_dir.into(),
            cache: DocumentCache::default(),
            locks: KeyedMutex::new(),
            channel_factory: Arc::new(WebSocketFactory {
                config: ChannelConfig::default(),
            }),
            generator: Arc::new(NoopGenerator::new()),
            credentials: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            reservation_sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Timers {
    heartbeat: Option<tokio::task::JoinHandle<()>>,
    heartbeat_period: Option<Duration>,
    ws_ping: Option<tokio::task::JoinHandle<()>>,
    meter_values: HashMap<ConnectorId, tokio::task::JoinHandle<()>>,
    reservation_sweep: Option<tokio::task::JoinHandle<()>>,
    channel_pump: Option<tokio::task::JoinHandle<()>>,
    command_pump: Option<tokio::task::JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in self
            .heartbeat
            .take()
            .into_iter()
            .chain(self.ws_ping.take())
            .chain(self.reservation_sweep.take())
            .chain(self.channel_pump.take())
            .chain(self.command_pump.take())
            .chain(std::mem::take(&mut self.meter_values).into_values())
        {
            handle.abort();
        }
        self.heartbeat_period = None;
    }
}

struct StationInner {
    index: u32,
    template_path: PathBuf,
    configuration_path: PathBuf,
    state: Arc<SharedState>,
    engine: Arc<Engine>,
    request_service: Arc<dyn RequestService>,
    events: EventBus,
    channel_factory: Arc<dyn ChannelFactory>,
    generator: Arc<dyn TransactionGenerator>,
    locks: KeyedMutex,
    credentials: Option<(String, String)>,
    run_state: StdMutex<RunState>,
    accepted: AtomicBool,
    registration_retry_count: AtomicU32,
    reconnect_retry_count: AtomicU32,
    timers: StdMutex<Timers>,
    persisted: Mutex<PersistedConfiguration>,
    atg_configuration: StdMutex<Option<crate::template::AtgConfiguration>>,
    reservation_sweep_interval: Duration,
}

/// A simulated charging station.
pub struct Station {
    inner: Arc<StationInner>,
}

impl Station {
    /// Build a station from its template file, reconciling against the
    /// persisted configuration when one exists.
    pub async fn from_template(options: StationOptions) -> StationResult<Self> {
        let path_display = options.template_path.display().to_string();
        let content = match tokio::fs::read_to_string(&options.template_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StationError::TemplateNotFound(path_display))
            }
            Err(e) => return Err(StationError::ConfigurationFile(e)),
        };
        if content.trim().is_empty() {
            return Err(StationError::EmptyTemplate(path_display));
        }

        let content_hash = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(content.as_bytes());
            hex::encode(hasher.finalize())
        };
        let doc = match options.cache.get_template(&content_hash) {
            Some(doc) => doc,
            None => {
                let parsed: serde_json::Value =
                    serde_json::from_str(&content).map_err(|e| StationError::InvalidTemplate {
                        path: path_display.clone(),
                        reason: e.to_string(),
                    })?;
                let doc = Arc::new(parsed);
                options.cache.put_template(content_hash, Arc::clone(&doc));
                doc
            }
        };

        // The configuration file is addressed by the station's hash id,
        // which only depends on the template and the instance index.
        let template: crate::template::StationTemplate = serde_json::from_value((*doc).clone())
            .map_err(|e| StationError::InvalidTemplate {
                path: path_display.clone(),
                reason: e.to_string(),
            })?;
        let template_hash = reconcile::canonical_hash(&doc);
        let station_id = reconcile::station_id(&template, options.index);
        let hash_id = reconcile::hash_id(&template_hash, &station_id);
        let configuration_path = options.configuration_dir.join(format!("{hash_id}.json"));

        let persisted = persist::load(&configuration_path).await?;
        let reconciled = reconcile::reconcile(&doc, persisted.as_ref(), options.index)?;
        info!(
            station_id = %reconciled.info.station_id,
            ocpp_version = %reconciled.info.ocpp_version,
            connectors = reconciled.model.number_of_connectors(),
            "station initialized"
        );

        let version = reconciled.info.ocpp_version;
        let request_service: Arc<dyn RequestService> = match version {
            OcppVersion::V16 => Arc::new(V16RequestService),
            OcppVersion::V201 => Arc::new(V201RequestService::new()),
        };

        let inner = Arc::new(StationInner {
            index: options.index,
            template_path: options.template_path,
            configuration_path,
            state: Arc::new(SharedState::new(
                reconciled.info,
                reconciled.model,
                reconciled.config_store,
            )),
            engine: Engine::with_flush_interval(version, options.flush_interval),
            request_service,
            events: EventBus::default(),
            channel_factory: options.channel_factory,
            generator: options.generator,
            locks: options.locks,
            credentials: options.credentials,
            run_state: StdMutex::new(RunState::Stopped),
            accepted: AtomicBool::new(false),
            registration_retry_count: AtomicU32::new(0),
            reconnect_retry_count: AtomicU32::new(0),
            timers: StdMutex::new(Timers::default()),
            persisted: Mutex::new(persisted.unwrap_or_default()),
            atg_configuration: StdMutex::new(reconciled.atg_configuration),
            reservation_sweep_interval: options.reservation_sweep_interval,
        });
        Ok(Self { inner })
    }

    pub fn run_state(&self) -> RunState {
        StationInner::get_run_state(&self.inner)
    }

    pub fn is_accepted(&self) -> bool {
        self.inner.accepted.load(Ordering::SeqCst)
    }

    pub fn registration_retry_count(&self) -> u32 {
        self.inner.registration_retry_count.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.inner.state
    }

    pub async fn station_id(&self) -> String {
        self.inner.state.info.read().await.station_id.clone()
    }

    /// Heartbeat period currently programmed, when the timer runs.
    pub fn heartbeat_period(&self) -> Option<Duration> {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .heartbeat_period
    }

    /// Start the station: connect, register, begin operating.
    pub async fn start(&self) -> StationResult<()> {
        StationInner::start_flow(&self.inner).await
    }

    /// Stop the station, optionally ending running transactions first.
    pub async fn stop(&self, stop_transactions: Option<bool>) -> StationResult<()> {
        StationInner::stop_flow(&self.inner, stop_transactions).await
    }

    /// Stop, wait the configured reset time, reinitialize from disk, start.
    pub async fn reset(&self) -> StationResult<()> {
        StationInner::reset_flow(&self.inner).await
    }

    /// Drive a transaction start, as the ATG or a local cable plug would.
    pub async fn start_transaction(
        &self,
        connector_id: ConnectorId,
        id_tag: &str,
    ) -> StationResult<()> {
        StationInner::start_transaction(&self.inner, connector_id, id_tag, false).await
    }

    /// Drive a transaction stop.
    pub async fn stop_transaction(
        &self,
        transaction_id: TransactionId,
        reason: Option<&str>,
    ) -> StationResult<()> {
        StationInner::stop_transaction(&self.inner, transaction_id, reason).await
    }
}

impl StationInner {
    fn set_run_state(inner: &Arc<Self>, next: RunState) {
        *inner.run_state.lock().unwrap_or_else(|p| p.into_inner()) = next;
    }

    fn get_run_state(inner: &Arc<Self>) -> RunState {
        *inner.run_state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn station_id(inner: &Arc<Self>) -> String {
        inner.state.info.read().await.station_id.clone()
    }

    async fn start_flow(inner: &Arc<Self>) -> StationResult<()> {
        {
            let mut run_state = inner.run_state.lock().unwrap_or_else(|p| p.into_inner());
            match *run_state {
                RunState::Stopped => *run_state = RunState::Starting,
                RunState::Starting => return Err(StationError::InvalidLifecycle("starting")),
                _ => return Err(StationError::InvalidLifecycle("started")),
            }
        }
        let station_id = Self::station_id(inner).await;
        info!(%station_id, "starting station");
        inner.events.emit(StationEvent::Started {
            station_id: station_id.clone(),
        });

        match Self::bring_up(inner).await {
            Ok(()) => {
                Self::set_run_state(inner, RunState::Operating);
                info!(%station_id, "station operating");
                Ok(())
            }
            Err(e) => {
                error!(%station_id, error = %e, "start failed");
                inner
                    .timers
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .abort_all();
                inner.engine.close_channel().await;
                Self::set_run_state(inner, RunState::Stopped);
                Err(e)
            }
        }
    }

    fn bring_up<'a>(
        inner: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = StationResult<()>> + Send + 'a>> {
        Box::pin(async move {
            // Wire the inbound dispatch before any frame can arrive.
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let incoming: Arc<dyn IncomingRequestService> = match inner.engine.version() {
                OcppVersion::V16 => Arc::new(V16IncomingService::new(
                    Arc::clone(&inner.state),
                    commands_tx,
                )),
                OcppVersion::V201 => Arc::new(V201IncomingService::new(
                    Arc::clone(&inner.state),
                    commands_tx,
                )),
            };
            inner.engine.set_incoming_service(incoming).await;
            {
                let mut timers = inner.timers.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(handle) = timers.command_pump.take() {
                    handle.abort();
                }
                timers.command_pump = Some(tokio::spawn(command_pump(
                    Arc::clone(inner),
                    commands_rx,
                )));
            }

            Self::set_run_state(inner, RunState::Connecting);
            Self::open_channel(inner).await?;
            inner.events.emit(StationEvent::Connected {
                station_id: Self::station_id(inner).await,
            });

            Self::set_run_state(inner, RunState::Registering);
            Self::register(inner).await?;
            Self::on_accepted(inner).await?;
            Ok(())
        })
    }

    async fn stop_flow(inner: &Arc<Self>, stop_transactions: Option<bool>) -> StationResult<()> {
        {
            let mut run_state = inner.run_state.lock().unwrap_or_else(|p| p.into_inner());
            match *run_state {
                RunState::Stopped | RunState::Stopping => {
                    return Err(StationError::InvalidLifecycle("stopped"))
                }
                _ => *run_state = RunState::Stopping,
            }
        }
        let station_id = Self::station_id(inner).await;
        info!(%station_id, "stopping station");

        if inner.generator.started() {
            if let Err(e) = inner.generator.stop(None).await {
                warn!(error = %e, "transaction generator stop failed");
            }
        }

        let stop_transactions = {
            let info = inner.state.info.read().await;
            stop_transactions.unwrap_or(info.stop_transactions_on_stopped)
        };
        if stop_transactions {
            let running: Vec<TransactionId> = {
                let model = inner.state.model.read().await;
                model.iter().filter_map(|(_, c)| c.transaction.id).collect()
            };
            for transaction_id in running {
                if let Err(e) =
                    Self::stop_transaction(inner, transaction_id, Some("SoftReset")).await
                {
                    warn!(transaction_id, error = %e, "failed to stop transaction on shutdown");
                }
            }
        }

        // Announce connectors as going away; never buffer shutdown traffic.
        let connector_ids = {
            let model = inner.state.model.read().await;
            model.chargeable_ids()
        };
        for connector_id in connector_ids {
            let _ = Self::send_status_notification_with_options(
                inner,
                connector_id,
                ConnectorStatus::Unavailable,
                CallOptions {
                    skip_buffering_on_error: true,
                    ..Default::default()
                },
            )
            .await;
        }

        inner
            .timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .abort_all();
        inner.engine.stop_flush_task();
        inner.engine.set_registered(false);
        inner.accepted.store(false, Ordering::SeqCst);
        inner.engine.fail_pending("station stopping");
        inner.engine.close_channel().await;

        if let Err(e) = Self::persist_configuration(inner).await {
            warn!(error = %e, "failed to persist configuration on stop");
        }

        Self::set_run_state(inner, RunState::Stopped);
        inner.events.emit(StationEvent::Stopped {
            station_id: station_id.clone(),
        });
        info!(%station_id, "station stopped");
        Ok(())
    }

    async fn reset_flow(inner: &Arc<Self>) -> StationResult<()> {
        let reset_time = {
            let info = inner.state.info.read().await;
            Duration::from_secs(info.reset_time)
        };
        Self::stop_flow(inner, None).await?;
        tokio::time::sleep(reset_time).await;
        Self::reinitialize(inner).await?;
        Self::start_flow(inner).await
    }

    /// Reload the template and persisted configuration into the shared state.
    async fn reinitialize(inner: &Arc<Self>) -> StationResult<()> {
        let content = tokio::fs::read_to_string(&inner.template_path).await?;
        let doc: serde_json::Value =
            serde_json::from_str(&content).map_err(StationError::Serialization)?;
        let persisted = persist::load(&inner.configuration_path).await?;
        let reconciled = reconcile::reconcile(&doc, persisted.as_ref(), inner.index)?;

        *inner.state.info.write().await = reconciled.info;
        *inner.state.model.write().await = reconciled.model;
        *inner.state.config.write().await = reconciled.config_store;
        *inner.persisted.lock().await = persisted.unwrap_or_default();
        *inner
            .atg_configuration
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = reconciled.atg_configuration;
        inner.registration_retry_count.store(0, Ordering::SeqCst);
        inner.reconnect_retry_count.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn open_channel<'a>(
        inner: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = StationResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let (url, subprotocol, station_id) = {
                let info = inner.state.info.read().await;
                let url = info
                    .supervision_urls
                    .first()
                    .cloned()
                    .ok_or(StationError::MissingSupervisionUrl)?;
                (url, info.ocpp_version.subprotocol(), info.station_id.clone())
            };
            let endpoint = station_endpoint(&url, &station_id)?;
            let (channel, events) = inner
                .channel_factory
                .connect(&endpoint, subprotocol, inner.credentials.clone())
                .await?;
            inner.engine.attach_channel(channel).await;
            inner.reconnect_retry_count.store(0, Ordering::SeqCst);

            let mut timers = inner.timers.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(handle) = timers.channel_pump.take() {
                handle.abort();
            }
            timers.channel_pump = Some(tokio::spawn(channel_pump(Arc::clone(inner), events)));
            Ok(())
        })
    }

    /// BootNotification loop per the registration state machine.
    async fn register(inner: &Arc<Self>) -> StationResult<()> {
        let (auto_register, max_retries, connection_timeout, station_id) = {
            let info = inner.state.info.read().await;
            (
                info.auto_register,
                info.registration_max_retries,
                info.connection_timeout,
                info.station_id.clone(),
            )
        };

        let mut retries: u32 = 0;
        loop {
            let (action, payload) = {
                let info = inner.state.info.read().await;
                inner.request_service.boot_notification(&info)
            };
            let response = inner
                .engine
                .call(action.as_str(), payload, CallOptions::default())
                .await;

            match response.and_then(|payload| inner.request_service.parse_boot_response(&payload))
            {
                Ok(boot) => {
                    inner.events.emit(StationEvent::Registered {
                        station_id: station_id.clone(),
                        status: boot.status,
                    });
                    match boot.status {
                        RegistrationStatus::Accepted => {
                            Self::apply_heartbeat_interval(inner, boot.interval_secs).await;
                            return Ok(());
                        }
                        status @ (RegistrationStatus::Pending | RegistrationStatus::Rejected) => {
                            if auto_register {
                                warn!(%station_id, ?status, "auto-register overrides status");
                                return Ok(());
                            }
                            let wait = if boot.interval_secs > 0 {
                                boot.interval_secs as u64
                            } else {
                                connection_timeout
                            };
                            debug!(%station_id, ?status, wait, "registration not accepted yet");
                            tokio::time::sleep(Duration::from_secs(wait)).await;
                        }
                    }
                }
                Err(e) => {
                    if auto_register {
                        warn!(%station_id, error = %e, "auto-register despite boot failure");
                        return Ok(());
                    }
                    warn!(%station_id, error = %e, "boot notification failed");
                    tokio::time::sleep(Duration::from_secs(connection_timeout)).await;
                }
            }

            retries += 1;
            inner
                .registration_retry_count
                .store(retries, Ordering::SeqCst);
            if max_retries >= 0 && retries > max_retries as u32 {
                return Err(StationError::RegistrationFailed { retries });
            }
        }
    }

    async fn apply_heartbeat_interval(inner: &Arc<Self>, interval_secs: i64) {
        if interval_secs <= 0 {
            return;
        }
        let mut config = inner.state.config.write().await;
        let outcome = config.set_value(keys::HEARTBEAT_INTERVAL, interval_secs.to_string());
        if outcome == crate::config_store::SetValueOutcome::NotSupported {
            config.add(
                crate::config_store::ConfigurationKey {
                    key: keys::HEARTBEAT_INTERVAL.into(),
                    value: interval_secs.to_string(),
                    readonly: false,
                    visible: true,
                    reboot: false,
                },
                true,
            );
        }
    }

    /// Post-registration bring-up: boot status sequence, firmware status,
    /// timers, ATG, buffered frames.
    async fn on_accepted(inner: &Arc<Self>) -> StationResult<()> {
        inner.accepted.store(true, Ordering::SeqCst);
        inner.engine.set_registered(true);
        inner.events.emit(StationEvent::Accepted {
            station_id: Self::station_id(inner).await,
        });

        // Per-connector boot StatusNotification. Connector 0 carries the
        // station-wide availability.
        let boot_statuses: Vec<(ConnectorId, ConnectorStatus)> = {
            let model = inner.state.model.read().await;
            let station_unavailable = model
                .connector(0)
                .is_some_and(|c| c.availability == AvailabilityType::Inoperative);
            model
                .iter()
                .filter(|(id, _)| *id > 0)
                .map(|(id, connector)| (id, boot_connector_status(station_unavailable, connector)))
                .collect()
        };
        for (connector_id, status) in boot_statuses {
            {
                let mut model = inner.state.model.write().await;
                model.set_status(connector_id, status);
            }
            if let Err(e) = Self::send_status_notification(inner, connector_id, status).await {
                warn!(connector_id, error = %e, "boot status notification failed");
            }
        }

        // A firmware upgrade that survived the restart finishes now.
        let installing = {
            let info = inner.state.info.read().await;
            info.firmware_status == FirmwareStatus::Installing
        };
        if installing {
            let (action, payload) = inner
                .request_service
                .firmware_status_notification(FirmwareStatus::Installed);
            if inner
                .engine
                .call(action.as_str(), payload, CallOptions::default())
                .await
                .is_ok()
            {
                inner.state.info.write().await.firmware_status = FirmwareStatus::Installed;
            }
        }

        Self::start_heartbeat(inner).await;
        Self::start_ws_ping(inner).await;
        Self::start_reservation_sweep(inner);

        let atg_enabled = inner
            .atg_configuration
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|atg| atg.enable);
        if atg_enabled.unwrap_or(false) && !inner.generator.started() {
            if let Err(e) = inner.generator.start(None).await {
                warn!(error = %e, "transaction generator start failed");
            }
        }

        inner.engine.flush_buffer().await;
        Self::persist_configuration(inner).await?;
        Ok(())
    }

    async fn start_heartbeat(inner: &Arc<Self>) {
        let interval_secs = {
            let config = inner.state.config.read().await;
            config.get_as::<u64>(keys::HEARTBEAT_INTERVAL).unwrap_or(300)
        };
        let period = Duration::from_secs(interval_secs.max(1));

        let mut timers = inner.timers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = timers.heartbeat.take() {
            handle.abort();
        }
        let task_inner = Arc::clone(inner);
        timers.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (action, payload) = task_inner.request_service.heartbeat();
                if let Err(e) = task_inner
                    .engine
                    .call(action.as_str(), payload, CallOptions::default())
                    .await
                {
                    // Send errors never abort the timer.
                    warn!(error = %e, "heartbeat failed");
                }
            }
        }));
        timers.heartbeat_period = Some(period);
        debug!(?period, "heartbeat timer started");
    }

    async fn start_ws_ping(inner: &Arc<Self>) {
        let interval_secs = {
            let config = inner.state.config.read().await;
            config
                .get_as::<u64>(keys::WEB_SOCKET_PING_INTERVAL)
                .unwrap_or(0)
        };
        let mut timers = inner.timers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = timers.ws_ping.take() {
            handle.abort();
        }
        if interval_secs == 0 {
            return;
        }
        let task_inner = Arc::clone(inner);
        timers.ws_ping = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !task_inner.engine.channel_open().await {
                    continue;
                }
                if let Err(e) = task_inner.engine.ping_channel().await {
                    warn!(error = %e, "websocket ping failed");
                }
            }
        }));
    }

    fn start_reservation_sweep(inner: &Arc<Self>) {
        let mut timers = inner.timers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = timers.reservation_sweep.take() {
            handle.abort();
        }
        let task_inner = Arc::clone(inner);
        let period = inner.reservation_sweep_interval;
        timers.reservation_sweep = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                Self::sweep_expired_reservations(&task_inner).await;
            }
        }));
    }

    async fn sweep_expired_reservations(inner: &Arc<Self>) {
        let now = Utc::now();
        let expired: Vec<(i32, ConnectorId, chrono::DateTime<Utc>)> = {
            let model = inner.state.model.read().await;
            model
                .iter()
                .filter_map(|(id, c)| c.reservation.as_ref().map(|r| (r, id)))
                .filter(|(r, _)| r.expiry_date < now)
                .map(|(r, id)| (r.reservation_id, id, r.expiry_date))
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        let station_id = Self::station_id(inner).await;
        for (reservation_id, connector_id, expiry_date) in expired {
            info!(reservation_id, connector_id, "reservation expired");
            let changes = {
                let mut model = inner.state.model.write().await;
                reservation::remove_reservation(
                    &mut model,
                    reservation_id,
                    ReservationTerminationReason::Expired,
                )
            };
            inner.events.emit(StationEvent::ReservationExpired {
                station_id: station_id.clone(),
                connector_id,
                reservation_id,
                expiry_date,
            });
            for change in changes {
                if let Err(e) =
                    Self::send_status_notification(inner, change.connector_id, change.status).await
                {
                    warn!(error = %e, "expiry status notification failed");
                }
            }
        }
    }

    async fn send_status_notification(
        inner: &Arc<Self>,
        connector_id: ConnectorId,
        status: ConnectorStatus,
    ) -> StationResult<()> {
        Self::send_status_notification_with_options(
            inner,
            connector_id,
            status,
            CallOptions::default(),
        )
        .await
    }

    async fn send_status_notification_with_options(
        inner: &Arc<Self>,
        connector_id: ConnectorId,
        status: ConnectorStatus,
        options: CallOptions,
    ) -> StationResult<()> {
        let evse_id = {
            let model = inner.state.model.read().await;
            model.evse_of(connector_id)
        };
        let (action, payload) =
            inner
                .request_service
                .status_notification(connector_id, evse_id, status);
        inner.engine.call(action.as_str(), payload, options).await?;
        inner.events.emit(StationEvent::ConnectorStatusChanged {
            station_id: Self::station_id(inner).await,
            connector_id,
            status,
        });
        Ok(())
    }

    /// Start a transaction on a connector, driven remotely or locally.
    async fn start_transaction(
        inner: &Arc<Self>,
        connector_id: ConnectorId,
        id_tag: &str,
        remote: bool,
    ) -> StationResult<()> {
        let (meter_start, reservation_id) = {
            let model = inner.state.model.read().await;
            let connector =
                model
                    .connector(connector_id)
                    .ok_or(StationError::InvalidLifecycle("unknown connector"))?;
            if connector.transaction.started {
                return Err(StationError::InvalidLifecycle("transaction running"));
            }
            let reservation_id = connector
                .reservation
                .as_ref()
                .filter(|r| r.id_tag == id_tag)
                .map(|r| r.reservation_id);
            (connector.transaction.energy_register, reservation_id)
        };

        let begin_end = {
            let info = inner.state.info.read().await;
            info.begin_end_meter_values
                && info.ocpp_strict_compliance
                && !info.out_of_order_end_meter_values
        };

        let timestamp = Utc::now();
        let (action, payload) = inner.request_service.start_transaction(
            connector_id,
            id_tag,
            meter_start,
            timestamp,
            reservation_id,
        );
        let response = inner
            .engine
            .call(action.as_str(), payload, CallOptions::default())
            .await?;
        let outcome = inner.request_service.parse_start_response(&response)?;
        if !outcome.accepted {
            warn!(connector_id, id_tag, "start transaction not authorized");
            return Ok(());
        }

        {
            let mut model = inner.state.model.write().await;
            if let Some(connector) = model.connector_mut(connector_id) {
                connector
                    .transaction
                    .begin(outcome.transaction_id, id_tag, timestamp, remote);
                connector.id_tag_authorized = true;
            }
            if let Some(reservation_id) = reservation_id {
                reservation::remove_reservation(
                    &mut model,
                    reservation_id,
                    ReservationTerminationReason::TransactionStarted,
                );
            }
            model.set_status(connector_id, ConnectorStatus::Charging);
        }

        if begin_end {
            let sample = MeterSample {
                energy_register_wh: meter_start,
                power_w: 0.0,
                context: SampleContext::TransactionBegin,
                include_power: false,
            };
            let (action, payload) = inner.request_service.meter_values(
                connector_id,
                Some(outcome.transaction_id),
                sample,
            );
            let _ = inner
                .engine
                .call(action.as_str(), payload, CallOptions::default())
                .await;
        }

        Self::send_status_notification(inner, connector_id, ConnectorStatus::Charging).await?;
        Self::start_meter_values(inner, connector_id).await;

        inner.events.emit(StationEvent::TransactionStarted {
            station_id: Self::station_id(inner).await,
            connector_id,
            transaction_id: outcome.transaction_id,
            id_tag: id_tag.to_string(),
        });
        Ok(())
    }

    async fn stop_transaction(
        inner: &Arc<Self>,
        transaction_id: TransactionId,
        reason: Option<&str>,
    ) -> StationResult<()> {
        let found = {
            let model = inner.state.model.read().await;
            let result = model
                .iter()
                .find(|(_, c)| c.transaction.id == Some(transaction_id))
                .map(|(id, c)| {
                    (
                        id,
                        c.transaction.energy_register,
                        c.transaction.id_tag.clone(),
                    )
                });
            result
        };
        let Some((connector_id, meter_stop, id_tag)) = found else {
            warn!(transaction_id, "stop requested for unknown transaction");
            return Ok(());
        };

        let begin_end = {
            let info = inner.state.info.read().await;
            info.begin_end_meter_values
                && info.ocpp_strict_compliance
                && !info.out_of_order_end_meter_values
        };
        if begin_end {
            let sample = MeterSample {
                energy_register_wh: meter_stop,
                power_w: 0.0,
                context: SampleContext::TransactionEnd,
                include_power: false,
            };
            let (action, payload) =
                inner
                    .request_service
                    .meter_values(connector_id, Some(transaction_id), sample);
            let _ = inner
                .engine
                .call(action.as_str(), payload, CallOptions::default())
                .await;
        }

        let (action, payload) = inner.request_service.stop_transaction(
            transaction_id,
            id_tag.as_deref(),
            meter_stop,
            Utc::now(),
            reason,
        );
        inner
            .engine
            .call(action.as_str(), payload, CallOptions::default())
            .await?;

        {
            let mut model = inner.state.model.write().await;
            if let Some(connector) = model.connector_mut(connector_id) {
                connector.transaction.end();
                connector.id_tag_authorized = false;
            }
            model.set_status(connector_id, ConnectorStatus::Available);
        }
        Self::stop_meter_values(inner, connector_id);
        Self::send_status_notification(inner, connector_id, ConnectorStatus::Available).await?;

        inner.events.emit(StationEvent::TransactionStopped {
            station_id: Self::station_id(inner).await,
            connector_id,
            transaction_id,
        });
        Ok(())
    }

    /// Per-connector meter sampler, active only while a transaction runs.
    async fn start_meter_values(inner: &Arc<Self>, connector_id: ConnectorId) {
        let interval_secs = {
            let config = inner.state.config.read().await;
            config
                .get_as::<u64>(keys::METER_VALUE_SAMPLE_INTERVAL)
                .unwrap_or(60)
        };
        if interval_secs == 0 {
            return;
        }
        let mut timers = inner.timers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = timers.meter_values.remove(&connector_id) {
            handle.abort();
        }
        let task_inner = Arc::clone(inner);
        timers.meter_values.insert(
            connector_id,
            tokio::spawn(async move {
                let period = Duration::from_secs(interval_secs);
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    Self::sample_meter(&task_inner, connector_id, period).await;
                }
            }),
        );
    }

    fn stop_meter_values(inner: &Arc<Self>, connector_id: ConnectorId) {
        let mut timers = inner.timers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = timers.meter_values.remove(&connector_id) {
            handle.abort();
        }
    }

    async fn sample_meter(inner: &Arc<Self>, connector_id: ConnectorId, period: Duration) {
        let include_power = {
            let config = inner.state.config.read().await;
            config
                .get(keys::METER_VALUES_SAMPLED_DATA)
                .map(|k| k.value.contains("Power.Active.Import"))
                .unwrap_or(false)
        };
        let (transaction_id, power_w, energy) = {
            let info = inner.state.info.read().await;
            let mut model = inner.state.model.write().await;
            let divider = model.power_divider(info.power_shared_by_connectors) as f64;
            let power_w = resolve_power_limit(&info, &model, connector_id, Utc::now())
                .map(|limit| limit.limit_watts)
                .unwrap_or(info.maximum_power / divider);
            let Some(connector) = model.connector_mut(connector_id) else {
                return;
            };
            if !connector.transaction.started {
                return;
            }
            let delta_wh = (power_w * period.as_secs_f64() / 3600.0).round() as i64;
            connector.transaction.energy_register += delta_wh;
            (
                connector.transaction.id,
                power_w,
                connector.transaction.energy_register,
            )
        };

        let sample = MeterSample {
            energy_register_wh: energy,
            power_w,
            context: SampleContext::Periodic,
            include_power,
        };
        let (action, payload) = inner
            .request_service
            .meter_values(connector_id, transaction_id, sample);
        if let Err(e) = inner
            .engine
            .call(action.as_str(), payload, CallOptions::default())
            .await
        {
            warn!(connector_id, error = %e, "meter values failed");
        }
    }

    /// Handle an abnormal channel close: bounded retry with exponential or
    /// constant delay, then re-register.
    async fn reconnect(inner: &Arc<Self>) {
        match Self::get_run_state(inner) {
            RunState::Operating | RunState::Registering => {}
            _ => return,
        }
        let (max_retries, exponential, connection_timeout, stop_on_failure, station_id) = {
            let info = inner.state.info.read().await;
            (
                info.auto_reconnect_max_retries,
                info.reconnect_exponential_delay,
                info.connection_timeout,
                info.stop_on_connection_failure,
                info.station_id.clone(),
            )
        };
        inner.accepted.store(false, Ordering::SeqCst);
        inner.engine.set_registered(false);
        {
            let mut timers = inner.timers.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(handle) = timers.heartbeat.take() {
                handle.abort();
            }
            timers.heartbeat_period = None;
            if let Some(handle) = timers.ws_ping.take() {
                handle.abort();
            }
        }
        if stop_on_failure && inner.generator.started() {
            if let Err(e) = inner.generator.stop(None).await {
                warn!(error = %e, "transaction generator stop failed");
            }
        }

        loop {
            let retry = inner.reconnect_retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            if max_retries >= 0 && retry > max_retries as u32 {
                error!(%station_id, retry, "reconnect retries exhausted");
                return;
            }
            let delay = if exponential {
                exponential_delay(retry)
            } else {
                Duration::from_secs(connection_timeout)
            };
            info!(%station_id, retry, ?delay, "reconnecting after channel loss");
            tokio::time::sleep(delay).await;

            match Self::open_channel(inner).await {
                Ok(()) => break,
                Err(e) => warn!(%station_id, error = %e, "reconnect attempt failed"),
            }
        }

        Self::set_run_state(inner, RunState::Registering);
        match Self::register(inner).await {
            Ok(()) => {
                if let Err(e) = Self::on_accepted(inner).await {
                    error!(%station_id, error = %e, "post-reconnect bring-up failed");
                }
                Self::set_run_state(inner, RunState::Operating);
            }
            Err(e) => error!(%station_id, error = %e, "re-registration failed"),
        }
    }

    /// Snapshot the station into its configuration file.
    async fn persist_configuration(inner: &Arc<Self>) -> StationResult<()> {
        let info = inner.state.info.read().await.clone();
        let mut persisted = inner.persisted.lock().await;

        if info.station_info_persistent_configuration {
            persisted.station_info = Some(info.clone());
        }
        if info.ocpp_persistent_configuration {
            let config = inner.state.config.read().await;
            persisted.configuration_key = Some(config.keys().to_vec());
        }
        if info.automatic_transaction_generator_persistent_configuration {
            let atg = inner
                .atg_configuration
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            if atg.is_some() {
                persisted.automatic_transaction_generator = atg;
                persisted.automatic_transaction_generator_statuses =
                    Some(vec![crate::persist::AtgStatus {
                        started: inner.generator.started(),
                        start_date: None,
                        stop_date: None,
                    }]);
            }
        }
        {
            let model = inner.state.model.read().await;
            if model.uses_evses() {
                let mut evses: BTreeMap<u32, BTreeMap<ConnectorId, ConnectorStatus>> =
                    BTreeMap::new();
                for (id, connector) in model.iter() {
                    if let Some(status) = connector.status {
                        let evse_id = model.evse_of(id).unwrap_or(id);
                        evses.entry(evse_id).or_default().insert(id, status);
                    }
                }
                persisted.evses_status = Some(evses);
                persisted.connectors_status = None;
            } else {
                let statuses: BTreeMap<ConnectorId, ConnectorStatus> = model
                    .iter()
                    .filter_map(|(id, c)| c.status.map(|status| (id, status)))
                    .collect();
                persisted.connectors_status = Some(statuses);
                persisted.evses_status = None;
            }
        }

        match persist::save(&inner.configuration_path, &mut persisted, &inner.locks).await {
            Ok(true) => {
                inner.events.emit(StationEvent::Updated {
                    station_id: info.station_id.clone(),
                });
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn handle_trigger(
        inner: &Arc<Self>,
        message: MessageTrigger,
        connector_id: Option<ConnectorId>,
    ) {
        match message {
            MessageTrigger::Heartbeat => {
                let (action, payload) = inner.request_service.heartbeat();
                let _ = inner
                    .engine
                    .call(action.as_str(), payload, CallOptions::default())
                    .await;
            }
            MessageTrigger::BootNotification => {
                let (action, payload) = {
                    let info = inner.state.info.read().await;
                    inner.request_service.boot_notification(&info)
                };
                let _ = inner
                    .engine
                    .call(action.as_str(), payload, CallOptions::default())
                    .await;
            }
            MessageTrigger::StatusNotification => {
                let targets: Vec<(ConnectorId, ConnectorStatus)> = {
                    let model = inner.state.model.read().await;
                    model
                        .iter()
                        .filter(|(id, _)| *id > 0)
                        .filter(|(id, _)| connector_id.is_none() || connector_id == Some(*id))
                        .map(|(id, c)| (id, c.status.unwrap_or(ConnectorStatus::Available)))
                        .collect()
                };
                for (connector_id, status) in targets {
                    let _ = Self::send_status_notification(inner, connector_id, status).await;
                }
            }
            MessageTrigger::MeterValues => {
                let targets: Vec<ConnectorId> = {
                    let model = inner.state.model.read().await;
                    model
                        .iter()
                        .filter(|(_, c)| c.transaction.started)
                        .filter(|(id, _)| connector_id.is_none() || connector_id == Some(*id))
                        .map(|(id, _)| id)
                        .collect()
                };
                for connector_id in targets {
                    Self::sample_meter(inner, connector_id, Duration::from_secs(0)).await;
                }
            }
            MessageTrigger::FirmwareStatusNotification => {
                let status = {
                    let info = inner.state.info.read().await;
                    info.firmware_status
                };
                let (action, payload) = inner.request_service.firmware_status_notification(status);
                let _ = inner
                    .engine
                    .call(action.as_str(), payload, CallOptions::default())
                    .await;
            }
            MessageTrigger::DiagnosticsStatusNotification => {}
        }
    }
}

/// Exponential backoff with a one-minute cap.
fn exponential_delay(retry: u32) -> Duration {
    let secs = 2u64.saturating_pow(retry.min(16)).min(60);
    Duration::from_secs(secs)
}

/// Forwards channel events into the engine; an unclean close triggers the
/// reconnect path.
async fn channel_pump(inner: Arc<StationInner>, mut events: ChannelEvents) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Opened { subprotocol } => {
                debug!(?subprotocol, "channel opened");
            }
            ChannelEvent::MessageReceived(text) => {
                inner.engine.handle_frame(&text).await;
            }
            ChannelEvent::PongReceived => {
                debug!("pong received");
            }
            ChannelEvent::Closed { reason, clean } => {
                inner.events.emit(StationEvent::Disconnected {
                    station_id: StationInner::station_id(&inner).await,
                    reason: reason.clone(),
                });
                if !clean {
                    let reconnect_inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        StationInner::reconnect(&reconnect_inner).await;
                    });
                }
                break;
            }
        }
    }
}

/// Executes runtime commands queued by the incoming request service.
async fn command_pump(
    inner: Arc<StationInner>,
    mut commands: mpsc::UnboundedReceiver<RuntimeCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            RuntimeCommand::Reset { hard } => {
                info!(hard, "reset command received");
                // The reset flow aborts this very pump; run it detached, and
                // give the CALLRESULT time to leave before the channel goes.
                let reset_inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    if let Err(e) = StationInner::reset_flow(&reset_inner).await {
                        error!(error = %e, "reset failed");
                    }
                });
                break;
            }
            RuntimeCommand::NotifyStatus {
                connector_id,
                status,
            } => {
                if let Err(e) =
                    StationInner::send_status_notification(&inner, connector_id, status).await
                {
                    warn!(connector_id, error = %e, "status notification failed");
                }
            }
            RuntimeCommand::RemoteStartTransaction {
                connector_id,
                id_tag,
            } => {
                if let Err(e) =
                    StationInner::start_transaction(&inner, connector_id, &id_tag, true).await
                {
                    warn!(connector_id, error = %e, "remote start failed");
                }
            }
            RuntimeCommand::RemoteStopTransaction { transaction_id } => {
                if let Err(e) =
                    StationInner::stop_transaction(&inner, transaction_id, Some("Remote")).await
                {
                    warn!(transaction_id, error = %e, "remote stop failed");
                }
            }
            RuntimeCommand::ApplyConfiguration { key } => match key.as_str() {
                keys::HEARTBEAT_INTERVAL => StationInner::start_heartbeat(&inner).await,
                keys::WEB_SOCKET_PING_INTERVAL => StationInner::start_ws_ping(&inner).await,
                keys::METER_VALUE_SAMPLE_INTERVAL => {
                    let running: Vec<ConnectorId> = {
                        let model = inner.state.model.read().await;
                        model
                            .iter()
                            .filter(|(_, c)| c.transaction.started)
                            .map(|(id, _)| id)
                            .collect()
                    };
                    for connector_id in running {
                        StationInner::start_meter_values(&inner, connector_id).await;
                    }
                }
                _ => {}
            },
            RuntimeCommand::Trigger {
                message,
                connector_id,
            } => {
                StationInner::handle_trigger(&inner, message, connector_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_doubles_and_caps() {
        assert_eq!(exponential_delay(1), Duration::from_secs(2));
        assert_eq!(exponential_delay(2), Duration::from_secs(4));
        assert_eq!(exponential_delay(5), Duration::from_secs(32));
        assert_eq!(exponential_delay(6), Duration::from_secs(60));
        assert_eq!(exponential_delay(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn missing_template_is_fatal() {
        let options = StationOptions::new(1, "/nonexistent/station.json", "/tmp/ocsim-none");
        match Station::from_template(options).await {
            Err(StationError::TemplateNotFound(path)) => {
                assert!(path.contains("station.json"));
            }
            Err(other) => panic!("expected TemplateNotFound, got {other:?}"),
            Ok(_) => panic!("expected TemplateNotFound, got a station"),
        }
    }

    #[tokio::test]
    async fn empty_template_is_fatal() {
        let dir = std::env::temp_dir().join(format!("ocsim-empty-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("station.json");
        tokio::fs::write(&path, "  \n").await.unwrap();

        let options = StationOptions::new(1, &path, dir.join("configurations"));
        assert!(matches!(
            Station::from_template(options).await,
            Err(StationError::EmptyTemplate(_))
        ));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
