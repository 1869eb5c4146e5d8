use std::sync::Arc;
use std::time::Duration;

use rover_events::Bus;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::availability::{AvailabilityTracker, DEFAULT_SWEEP_INTERVAL, DEFAULT_UNAVAILABLE_AFTER};
use crate::client::{DeviceClient, DEFAULT_REQUEST_TIMEOUT};
use crate::coordinator::{ConfigCoordinator, CoordinatorPolicy, HttpDocumentStore, WriteMethod};
use crate::error::ConfigurationError;
use crate::pipeline::{Pipeline, PipelineStats};
use crate::poller::{PollPolicy, Poller, DEFAULT_POLL_INTERVAL};
use crate::throttle::{ThrottleEngine, ThrottlePolicy, DEFAULT_RATE_HZ};
use crate::transport::{
    ConnectionState, Connector, Endpoint, SessionOptions, SocketIoConnector, TransportSession,
};

/// Everything needed to run one device bridge.
#[derive(Clone, Debug)]
pub struct BridgeSettings {
    pub endpoint: String,
    pub socketio_path: String,
    pub session: SessionOptions,
    pub throttle: ThrottlePolicy,
    pub unavailable_after: Duration,
    pub stale_after: Option<Duration>,
    pub sweep_interval: Duration,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_policy: PollPolicy,
    pub poll_resources: Vec<String>,
    pub coordinator: CoordinatorPolicy,
    pub write_method: WriteMethod,
    pub bus_capacity: usize,
}

impl BridgeSettings {
    /// Defaults for `endpoint`, with the default exempt topics.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ConfigurationError> {
        Ok(Self {
            endpoint: endpoint.into(),
            socketio_path: rover_topics::SOCKETIO_DEFAULT_PATH.to_string(),
            session: SessionOptions::default(),
            throttle: ThrottlePolicy::new(DEFAULT_RATE_HZ)?
                .exempt(rover_topics::DEFAULT_EXEMPT_TOPICS.iter().copied()),
            unavailable_after: DEFAULT_UNAVAILABLE_AFTER,
            stale_after: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_policy: PollPolicy::default(),
            poll_resources: rover_topics::DEFAULT_POLL_RESOURCES
                .iter()
                .map(|r| r.to_string())
                .collect(),
            coordinator: CoordinatorPolicy::default(),
            write_method: WriteMethod::default(),
            bus_capacity: 1024,
        })
    }
}

pub struct Bridge;

impl Bridge {
    /// Starts streaming, polling and the configuration coordinator against
    /// the device's Socket.IO endpoint. Must run inside a tokio runtime.
    pub fn start(settings: BridgeSettings) -> Result<BridgeHandle, ConfigurationError> {
        let connector = SocketIoConnector::new(settings.socketio_path.clone());
        Self::start_with_connector(settings, Arc::new(connector))
    }

    pub fn start_with_connector(
        settings: BridgeSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<BridgeHandle, ConfigurationError> {
        let endpoint = Endpoint::parse(&settings.endpoint)?;
        let mut tracker = AvailabilityTracker::new(settings.unavailable_after)?;
        if let Some(stale_after) = settings.stale_after {
            tracker = tracker.with_stale_after(stale_after)?;
        }
        let client = DeviceClient::new(endpoint.clone(), settings.request_timeout)?;
        let bus = Bus::new(settings.bus_capacity);

        let session = TransportSession::with_connector(connector, settings.session.clone());
        let events = session
            .take_events()
            .ok_or_else(|| ConfigurationError::Client("session events already taken".into()))?;
        let pipeline = Pipeline::new(
            bus.clone(),
            ThrottleEngine::new(settings.throttle.clone()),
            tracker,
            settings.sweep_interval,
        );
        let cancel = CancellationToken::new();
        let pipeline_task = tokio::spawn(pipeline.run(events, cancel.child_token()));

        let poller = Poller::new(bus.clone(), settings.poll_policy);
        for resource in &settings.poll_resources {
            if let Err(err) = poller.schedule(
                resource.clone(),
                settings.poll_interval,
                client.fetcher(resource.clone()),
            ) {
                cancel.cancel();
                return Err(err);
            }
        }

        let coordinator = ConfigCoordinator::new(
            HttpDocumentStore::new(&client, settings.write_method),
            settings.coordinator.clone(),
        );

        if let Err(err) = session.connect(&settings.endpoint) {
            cancel.cancel();
            return Err(err);
        }
        info!(
            target: "rover::bridge",
            endpoint = %endpoint,
            resources = settings.poll_resources.len(),
            "bridge started"
        );
        Ok(BridgeHandle {
            bus,
            client,
            coordinator,
            poller,
            session,
            cancel,
            pipeline: pipeline_task,
        })
    }
}

pub struct BridgeHandle {
    bus: Bus,
    client: DeviceClient,
    coordinator: ConfigCoordinator,
    poller: Poller,
    session: TransportSession,
    cancel: CancellationToken,
    pipeline: JoinHandle<PipelineStats>,
}

impl BridgeHandle {
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn client(&self) -> &DeviceClient {
        &self.client
    }

    pub fn coordinator(&self) -> &ConfigCoordinator {
        &self.coordinator
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.watch_state()
    }

    /// Stops polling and streaming. The pipeline drains the final
    /// disconnect, so every stream topic ends unavailable.
    pub async fn shutdown(self) -> PipelineStats {
        let BridgeHandle {
            poller,
            session,
            pipeline,
            cancel,
            ..
        } = self;
        poller.shutdown().await;
        session.disconnect().await;
        drop(session);
        let stats = match pipeline.await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(target: "rover::bridge", error = %err, "pipeline task failed");
                PipelineStats::default()
            }
        };
        cancel.cancel();
        info!(target: "rover::bridge", "bridge stopped");
        stats
    }
}

