//! One scan → connect → subscribe → wait → disconnect exchange with the sensor.
//!
//! Every phase runs under its own timeout, and a link that was opened is
//! always released before [`DeviceSession::read_once`] returns.

use std::{fmt, future::Future, pin::Pin, time::Duration};

use anyhow::Result;
use chrono::Utc;
use chrono_tz::Tz;
use macaddr::MacAddr6;
use thiserror::Error;
use tokio::time::timeout;
use tokio_stream::{Stream, StreamExt as _};
use tracing::{debug, error, info, warn};
use uuid::{Uuid, uuid};

use crate::sensor::{DecodedPayload, DeviceIdentity, SensorReading, decode_payload};

/// Characteristic the sensor pushes temperature/humidity notifications on.
pub const DATA_CHARACTERISTIC_UUID: Uuid = uuid!("ebe0ccc1-7a0a-4b0c-8a1a-6ff2997da3a6");

/// Raw notification payloads from a subscribed characteristic.
pub type Notifications = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Wireless stack able to find a peripheral by its hardware address.
pub trait Transport: Send + Sync {
    type Link: Link;

    /// Resolves once the peripheral has been seen. Callers bound the wait.
    fn discover(
        &self,
        address: MacAddr6,
    ) -> impl Future<Output = Result<Option<Self::Link>>> + Send;
}

/// A discovered peripheral.
pub trait Link: Send + Sync {
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    fn is_connected(&self) -> impl Future<Output = Result<bool>> + Send;

    fn subscribe(&self, characteristic: Uuid) -> impl Future<Output = Result<Notifications>> + Send;

    fn unsubscribe(&self, characteristic: Uuid) -> impl Future<Output = Result<()>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("device not found")]
    DeviceNotFound,

    #[error("connect failure")]
    ConnectFailure,

    #[error("notification timeout")]
    NotificationTimeout,

    #[error("protocol error")]
    ProtocolError,

    #[error("unexpected error")]
    UnexpectedError,
}

/// Result of a single session: a reading, or why there is none.
pub type CollectionOutcome = Result<SensorReading, FailureReason>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scanning,
    Connecting,
    Subscribing,
    AwaitingNotification,
    Disconnecting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Scanning => "scanning",
            Phase::Connecting => "connecting",
            Phase::Subscribing => "subscribing",
            Phase::AwaitingNotification => "awaiting-notification",
            Phase::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub scan: Duration,
    pub connect: Duration,
    pub subscribe: Duration,
    pub notification: Duration,
    /// Applies to unsubscribe and disconnect each.
    pub release: Duration,
}

impl SessionTimeouts {
    /// Upper bound on how long one session can take.
    pub fn total(&self) -> Duration {
        // connect and is_connected are bounded separately
        self.scan + self.connect * 2 + self.subscribe + self.notification + self.release * 2
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            scan: Duration::from_secs(10),
            connect: Duration::from_secs(20),
            subscribe: Duration::from_secs(10),
            notification: Duration::from_secs(10),
            release: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub struct DeviceSession<T> {
    transport: T,
    device: DeviceIdentity,
    timezone: Tz,
    timeouts: SessionTimeouts,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(transport: T, device: DeviceIdentity, timezone: Tz) -> Self {
        Self {
            transport,
            device,
            timezone,
            timeouts: SessionTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn device(&self) -> DeviceIdentity {
        self.device
    }

    /// Runs one complete attempt against the configured device.
    pub async fn read_once(&self) -> CollectionOutcome {
        let address = self.device;

        info!(%address, phase = %Phase::Scanning, "scanning for device");
        let discovery = self.transport.discover(address.address());
        let link = match timeout(self.timeouts.scan, discovery).await {
            Ok(Ok(Some(link))) => link,
            Ok(Ok(None)) | Err(_) => {
                warn!(
                    %address,
                    timeout_secs = self.timeouts.scan.as_secs_f64(),
                    "device not found"
                );
                return Err(FailureReason::DeviceNotFound);
            }
            Ok(Err(e)) => {
                error!(%address, phase = %Phase::Scanning, error = %format!("{e:#}"), "discovery failed");
                return Err(FailureReason::UnexpectedError);
            }
        };

        self.connect(&link).await?;

        // From here on the link counts as open and must be released.
        let mut subscribed = false;
        let outcome = self.exchange(&link, &mut subscribed).await;
        self.release(&link, subscribed).await;

        if let Ok(reading) = &outcome {
            info!(
                %address,
                temperature_celsius = %format!("{:.2}", reading.temperature_celsius),
                humidity_percent = reading.humidity_percent,
                "received reading"
            );
        }

        outcome
    }

    async fn connect(&self, link: &T::Link) -> Result<(), FailureReason> {
        let address = self.device;

        info!(%address, phase = %Phase::Connecting, "connecting");
        match timeout(self.timeouts.connect, link.connect()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                error!(%address, error = %format!("{e:#}"), "failed to connect");
            }
            Err(_) => {
                error!(
                    %address,
                    timeout_secs = self.timeouts.connect.as_secs_f64(),
                    "connect timed out"
                );
            }
        }

        // A failed or abandoned connect can still bring the link up underneath.
        match timeout(self.timeouts.connect, link.is_connected()).await {
            Ok(Ok(false)) => {}
            Ok(Ok(true)) => {
                warn!(%address, "link came up after a failed connect");
                self.release(link, false).await;
            }
            Ok(Err(_)) | Err(_) => {
                warn!(%address, "connection state unknown after a failed connect");
                self.release(link, false).await;
            }
        }

        Err(FailureReason::ConnectFailure)
    }

    /// Confirm the link, subscribe and wait for the first decodable payload.
    /// The caller releases the link afterwards whatever happens here.
    async fn exchange(&self, link: &T::Link, subscribed: &mut bool) -> CollectionOutcome {
        let address = self.device;

        match timeout(self.timeouts.connect, link.is_connected()).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                error!(%address, "link reports not connected after connect");
                return Err(FailureReason::ConnectFailure);
            }
            Ok(Err(e)) => {
                error!(%address, error = %format!("{e:#}"), "failed to query connection state");
                return Err(FailureReason::UnexpectedError);
            }
            Err(_) => {
                error!(%address, "connection state query timed out");
                return Err(FailureReason::ConnectFailure);
            }
        }

        info!(
            %address,
            phase = %Phase::Subscribing,
            characteristic = %DATA_CHARACTERISTIC_UUID,
            "starting notifications"
        );
        let notifications = match timeout(
            self.timeouts.subscribe,
            link.subscribe(DATA_CHARACTERISTIC_UUID),
        )
        .await
        {
            Ok(Ok(n)) => {
                *subscribed = true;
                n
            }
            Ok(Err(e)) => {
                error!(%address, error = %format!("{e:#}"), "failed to subscribe");
                return Err(FailureReason::ProtocolError);
            }
            Err(_) => {
                error!(%address, "subscribe timed out");
                return Err(FailureReason::ProtocolError);
            }
        };

        debug!(%address, phase = %Phase::AwaitingNotification, "waiting for notification");
        match timeout(self.timeouts.notification, first_reading(notifications)).await {
            Ok(Some(payload)) => Ok(SensorReading {
                captured_at: Utc::now().with_timezone(&self.timezone),
                temperature_celsius: payload.temperature_celsius,
                humidity_percent: payload.humidity_percent,
            }),
            Ok(None) => {
                error!(%address, "notification stream closed before any reading arrived");
                Err(FailureReason::ProtocolError)
            }
            Err(_) => {
                warn!(
                    %address,
                    timeout_secs = self.timeouts.notification.as_secs_f64(),
                    "timed out waiting for notification"
                );
                Err(FailureReason::NotificationTimeout)
            }
        }
    }

    /// Unsubscribe if needed, then disconnect. Failures are logged only.
    async fn release(&self, link: &T::Link, subscribed: bool) {
        let address = self.device;

        if subscribed {
            let unsubscribe = link.unsubscribe(DATA_CHARACTERISTIC_UUID);
            match timeout(self.timeouts.release, unsubscribe).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(%address, error = %format!("{e:#}"), "failed to stop notifications")
                }
                Err(_) => warn!(%address, "stopping notifications timed out"),
            }
        }

        info!(%address, phase = %Phase::Disconnecting, "disconnecting");
        match timeout(self.timeouts.release, link.disconnect()).await {
            Ok(Ok(())) => info!(%address, "disconnected"),
            Ok(Err(e)) => error!(%address, error = %format!("{e:#}"), "failed to disconnect"),
            Err(_) => error!(%address, "disconnect timed out"),
        }
    }
}

/// First payload that decodes wins; short payloads are skipped.
async fn first_reading(mut notifications: Notifications) -> Option<DecodedPayload> {
    while let Some(payload) = notifications.next().await {
        match decode_payload(&payload) {
            Ok(decoded) => return Some(decoded),
            Err(e) => debug!(error = %e, "ignoring notification"),
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use anyhow::bail;
    use tokio::time::Instant;
    use tokio_stream::StreamExt as _;

    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Ok,
        Fail,
        Hang,
    }

    #[derive(Debug, Clone)]
    struct MockTransport {
        found: Step,
        discover_error: bool,
        link: MockLink,
    }

    #[derive(Debug, Clone)]
    struct MockLink {
        connect: Step,
        connected: bool,
        state_query: Step,
        subscribe: Step,
        payloads: Vec<Vec<u8>>,
        close_stream: bool,
        disconnect: Step,
        disconnects: Arc<AtomicUsize>,
        unsubscribes: Arc<AtomicUsize>,
    }

    impl MockTransport {
        fn new(payloads: Vec<Vec<u8>>) -> Self {
            Self {
                found: Step::Ok,
                discover_error: false,
                link: MockLink {
                    connect: Step::Ok,
                    connected: true,
                    state_query: Step::Ok,
                    subscribe: Step::Ok,
                    payloads,
                    close_stream: false,
                    disconnect: Step::Ok,
                    disconnects: Arc::new(AtomicUsize::new(0)),
                    unsubscribes: Arc::new(AtomicUsize::new(0)),
                },
            }
        }

        fn disconnects(&self) -> usize {
            self.link.disconnects.load(Ordering::SeqCst)
        }
    }

    async fn run(step: Step) -> Result<()> {
        match step {
            Step::Ok => Ok(()),
            Step::Fail => bail!("mock failure"),
            Step::Hang => std::future::pending().await,
        }
    }

    impl Transport for MockTransport {
        type Link = MockLink;

        async fn discover(&self, _address: MacAddr6) -> Result<Option<MockLink>> {
            if self.discover_error {
                bail!("adapter powered off");
            }

            match self.found {
                Step::Ok => Ok(Some(self.link.clone())),
                Step::Fail => Ok(None),
                Step::Hang => std::future::pending().await,
            }
        }
    }

    impl Link for MockLink {
        async fn connect(&self) -> Result<()> {
            run(self.connect).await
        }

        async fn is_connected(&self) -> Result<bool> {
            run(self.state_query).await?;
            Ok(self.connected)
        }

        async fn subscribe(&self, characteristic: Uuid) -> Result<Notifications> {
            assert_eq!(characteristic, DATA_CHARACTERISTIC_UUID);
            run(self.subscribe).await?;

            let payloads = tokio_stream::iter(self.payloads.clone());
            if self.close_stream {
                Ok(Box::pin(payloads))
            } else {
                Ok(Box::pin(payloads.chain(tokio_stream::pending())))
            }
        }

        async fn unsubscribe(&self, _characteristic: Uuid) -> Result<()> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            run(self.disconnect).await
        }
    }

    fn session(transport: MockTransport) -> DeviceSession<MockTransport> {
        DeviceSession::new(transport, "A4:C1:38:0E:7F:2B".parse().unwrap(), Tz::UTC)
    }

    #[tokio::test(start_paused = true)]
    async fn completes_with_first_valid_payload() {
        let transport = MockTransport::new(vec![
            vec![0x01],
            vec![0xE8, 0x00, 0x2D],
            vec![0x66, 0x08, 0x37],
        ]);
        let session = session(transport.clone());

        let reading = session.read_once().await.unwrap();

        assert_eq!(reading.temperature_celsius, 2.32);
        assert_eq!(reading.humidity_percent, 45);
        assert_eq!(transport.disconnects(), 1);
        assert_eq!(transport.link.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn short_payloads_keep_waiting_until_timeout() {
        let transport = MockTransport::new(vec![vec![0xE8, 0x00], vec![0x2D]]);
        let session = session(transport.clone());
        let started = Instant::now();

        let outcome = session.read_once().await;

        assert_eq!(outcome, Err(FailureReason::NotificationTimeout));
        let waited = started.elapsed();
        assert!(waited >= SessionTimeouts::default().notification);
        assert!(waited < SessionTimeouts::default().notification + Duration::from_secs(1));
        assert_eq!(transport.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn device_not_found_when_discovery_times_out() {
        let mut transport = MockTransport::new(vec![]);
        transport.found = Step::Hang;
        let started = Instant::now();

        let outcome = session(transport.clone()).read_once().await;

        assert_eq!(outcome, Err(FailureReason::DeviceNotFound));
        let waited = started.elapsed();
        assert!(waited >= SessionTimeouts::default().scan);
        assert!(waited < SessionTimeouts::default().scan + Duration::from_secs(1));
        assert_eq!(transport.disconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn device_not_found_when_discovery_returns_none() {
        let mut transport = MockTransport::new(vec![]);
        transport.found = Step::Fail;

        let outcome = session(transport.clone()).read_once().await;

        assert_eq!(outcome, Err(FailureReason::DeviceNotFound));
        assert_eq!(transport.disconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_with_link_down_does_not_disconnect() {
        for step in [Step::Fail, Step::Hang] {
            let mut transport = MockTransport::new(vec![vec![0xE8, 0x00, 0x2D]]);
            transport.link.connect = step;
            transport.link.connected = false;

            let outcome = session(transport.clone()).read_once().await;

            assert_eq!(outcome, Err(FailureReason::ConnectFailure));
            assert_eq!(transport.disconnects(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_with_link_up_disconnects_once() {
        for step in [Step::Fail, Step::Hang] {
            let mut transport = MockTransport::new(vec![vec![0xE8, 0x00, 0x2D]]);
            transport.link.connect = step;

            let outcome = session(transport.clone()).read_once().await;

            assert_eq!(outcome, Err(FailureReason::ConnectFailure));
            assert_eq!(transport.disconnects(), 1);
            assert_eq!(transport.link.unsubscribes.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_with_unknown_link_state_disconnects_once() {
        for state_query in [Step::Fail, Step::Hang] {
            let mut transport = MockTransport::new(vec![vec![0xE8, 0x00, 0x2D]]);
            transport.link.connect = Step::Hang;
            transport.link.connected = false;
            transport.link.state_query = state_query;

            let outcome = session(transport.clone()).read_once().await;

            assert_eq!(outcome, Err(FailureReason::ConnectFailure));
            assert_eq!(transport.disconnects(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_error_is_unexpected_and_never_connects() {
        let mut transport = MockTransport::new(vec![vec![0xE8, 0x00, 0x2D]]);
        transport.discover_error = true;

        let outcome = session(transport.clone()).read_once().await;

        assert_eq!(outcome, Err(FailureReason::UnexpectedError));
        assert_eq!(transport.disconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn state_query_error_after_connect_is_unexpected_and_disconnects() {
        let mut transport = MockTransport::new(vec![vec![0xE8, 0x00, 0x2D]]);
        transport.link.state_query = Step::Fail;

        let outcome = session(transport.clone()).read_once().await;

        assert_eq!(outcome, Err(FailureReason::UnexpectedError));
        assert_eq!(transport.disconnects(), 1);
        assert_eq!(transport.link.unsubscribes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn not_connected_after_connect_is_a_connect_failure() {
        let mut transport = MockTransport::new(vec![vec![0xE8, 0x00, 0x2D]]);
        transport.link.connected = false;

        let outcome = session(transport.clone()).read_once().await;

        assert_eq!(outcome, Err(FailureReason::ConnectFailure));
        assert_eq!(transport.disconnects(), 1);
        assert_eq!(transport.link.unsubscribes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_failure_is_a_protocol_error_and_disconnects() {
        for step in [Step::Fail, Step::Hang] {
            let mut transport = MockTransport::new(vec![vec![0xE8, 0x00, 0x2D]]);
            transport.link.subscribe = step;

            let outcome = session(transport.clone()).read_once().await;

            assert_eq!(outcome, Err(FailureReason::ProtocolError));
            assert_eq!(transport.disconnects(), 1);
            assert_eq!(transport.link.unsubscribes.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_is_a_protocol_error() {
        let mut transport = MockTransport::new(vec![vec![0x01]]);
        transport.link.close_stream = true;

        let outcome = session(transport.clone()).read_once().await;

        assert_eq!(outcome, Err(FailureReason::ProtocolError));
        assert_eq!(transport.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_failure_keeps_the_reading() {
        for step in [Step::Fail, Step::Hang] {
            let mut transport = MockTransport::new(vec![vec![0x66, 0x08, 0x37]]);
            transport.link.disconnect = step;

            let reading = session(transport.clone()).read_once().await.unwrap();

            assert_eq!(reading.temperature_celsius, 21.5);
            assert_eq!(reading.humidity_percent, 55);
            assert_eq!(transport.disconnects(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn every_session_finishes_within_the_total_budget() {
        let mut transport = MockTransport::new(vec![]);
        transport.link.disconnect = Step::Hang;
        let started = Instant::now();

        let outcome = session(transport).read_once().await;

        assert_eq!(outcome, Err(FailureReason::NotificationTimeout));
        assert!(started.elapsed() <= SessionTimeouts::default().total());
    }
}
