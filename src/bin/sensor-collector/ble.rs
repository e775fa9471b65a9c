use anyhow::{Context as _, Result, anyhow};
use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter},
    platform::{Adapter, Manager, Peripheral},
};
use macaddr::MacAddr6;
use sensor_collector::session::{Link, Notifications, Transport};
use tokio::time::{Duration, sleep};
use tokio_stream::StreamExt as _;
use uuid::Uuid;

const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Bluetooth LE transport on the first local adapter.
pub struct BleTransport {
    adapter: Adapter,
}

impl BleTransport {
    /// Opens the first adapter and starts a scan that runs for the lifetime of
    /// the process.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("failed to initialize Bluetooth manager")?;

        let adapters = manager
            .adapters()
            .await
            .context("failed to get Bluetooth adapters")?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no Bluetooth adapters found"))?;

        adapter
            .start_scan(ScanFilter::default())
            .await
            .context("failed to start BLE scan")?;

        Ok(Self { adapter })
    }
}

impl Transport for BleTransport {
    type Link = BleLink;

    async fn discover(&self, address: MacAddr6) -> Result<Option<BleLink>> {
        loop {
            let peripherals = self
                .adapter
                .peripherals()
                .await
                .context("failed to get BLE peripherals")?;

            let found = peripherals.into_iter().find(|p| {
                let mac_address: MacAddr6 = p.address().into_inner().into();
                mac_address == address
            });

            if let Some(peripheral) = found {
                return Ok(Some(BleLink { peripheral }));
            }

            sleep(DISCOVERY_POLL_INTERVAL).await;
        }
    }
}

#[derive(Debug)]
pub struct BleLink {
    peripheral: Peripheral,
}

impl BleLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| anyhow!("characteristic not found: {uuid}"))
    }
}

impl Link for BleLink {
    async fn connect(&self) -> Result<()> {
        self.peripheral
            .connect()
            .await
            .context("failed to connect to BLE peripheral")
    }

    async fn is_connected(&self) -> Result<bool> {
        self.peripheral
            .is_connected()
            .await
            .context("failed to get BLE connection state")
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<Notifications> {
        self.peripheral
            .discover_services()
            .await
            .context("failed to discover BLE services")?;

        let target = self.characteristic(characteristic)?;

        // Open the stream before subscribing so the first notification is not lost.
        let notifications = self
            .peripheral
            .notifications()
            .await
            .context("failed to open BLE notification stream")?;

        self.peripheral
            .subscribe(&target)
            .await
            .with_context(|| format!("failed to subscribe to {characteristic}"))?;

        let payloads = notifications
            .filter(move |n| n.uuid == characteristic)
            .map(|n| n.value);

        Ok(Box::pin(payloads))
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let target = self.characteristic(characteristic)?;

        self.peripheral
            .unsubscribe(&target)
            .await
            .with_context(|| format!("failed to unsubscribe from {characteristic}"))
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral
            .disconnect()
            .await
            .context("failed to disconnect from BLE peripheral")
    }
}
