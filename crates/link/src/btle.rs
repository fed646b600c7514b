//! Bluetooth LE transport backed by `btleplug`.
//!
//! Peripherals are looked up among the adapter's known devices, which on
//! BlueZ include the bonded ones. No scanning is performed.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{BondSource, Transport, TransportFuture};
use crate::types::{
    BondedPeripheral, CharacteristicHandle, ServiceMap, TransportSignal, WriteMode,
};

const SIGNAL_CAPACITY: usize = 8;

type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// Latest open per peripheral address. A link watcher only tears down a
/// connection that no newer open has taken over.
#[derive(Debug, Default)]
struct Owners {
    next: u64,
    latest: HashMap<String, u64>,
}

type SharedOwners = Arc<Mutex<Owners>>;

fn claim(owners: &SharedOwners, address: &str) -> u64 {
    let mut owners = owners.lock().unwrap_or_else(PoisonError::into_inner);
    owners.next += 1;
    let epoch = owners.next;
    owners.latest.insert(address.to_ascii_uppercase(), epoch);
    epoch
}

fn is_owner(owners: &SharedOwners, address: &str, epoch: u64) -> bool {
    let owners = owners.lock().unwrap_or_else(PoisonError::into_inner);
    owners.latest.get(&address.to_ascii_uppercase()) == Some(&epoch)
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => Self::LinkDown,
            other => Self::Rejected(other.to_string()),
        }
    }
}

/// [`Transport`] over a platform Bluetooth adapter.
#[derive(Clone)]
pub struct BtleTransport {
    adapter: Adapter,
    owners: SharedOwners,
}

impl BtleTransport {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            owners: SharedOwners::default(),
        }
    }

    /// Opens the first Bluetooth adapter on the system.
    pub async fn first_adapter() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;
        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "using Bluetooth adapter");
        }
        Ok(Self::new(adapter))
    }

    async fn find(&self, address: &str) -> Result<Option<Peripheral>, TransportError> {
        Ok(self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address)))
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral, TransportError> {
        self.find(address)
            .await?
            .ok_or_else(|| TransportError::UnknownPeripheral(address.to_string()))
    }
}

impl Transport for BtleTransport {
    fn open(&self, address: &str) -> TransportFuture<'_, mpsc::Receiver<TransportSignal>> {
        let address = address.to_string();
        Box::pin(async move {
            let peripheral = self.peripheral(&address).await?;
            // Subscribe before connecting so an early disconnect is not missed.
            let events = self.adapter.events().await?;
            let (tx, rx) = mpsc::channel(SIGNAL_CAPACITY);
            let epoch = claim(&self.owners, &address);
            tokio::spawn(watch_link(peripheral, events, tx, self.owners.clone(), epoch));
            Ok(rx)
        })
    }

    fn discover(&self, address: &str) -> TransportFuture<'_, ServiceMap> {
        let address = address.to_string();
        Box::pin(async move {
            let peripheral = self.peripheral(&address).await?;
            peripheral.discover_services().await?;

            let mut services = ServiceMap::new();
            for service in peripheral.services() {
                services.insert(
                    service.uuid,
                    service.characteristics.iter().map(|c| c.uuid),
                );
            }
            Ok(services)
        })
    }

    fn write(
        &self,
        handle: &CharacteristicHandle,
        payload: &[u8],
        mode: WriteMode,
    ) -> TransportFuture<'_, ()> {
        let handle = handle.clone();
        let payload = payload.to_vec();
        Box::pin(async move {
            let peripheral = self.peripheral(&handle.address).await?;
            let characteristic = peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == handle.characteristic && c.service_uuid == handle.service)
                .ok_or(TransportError::CharacteristicNotFound(handle.characteristic))?;

            let write_type = match mode {
                WriteMode::WithResponse => WriteType::WithResponse,
                WriteMode::WithoutResponse => WriteType::WithoutResponse,
            };
            peripheral.write(&characteristic, &payload, write_type).await?;
            Ok(())
        })
    }

    fn release(&self, address: &str) -> TransportFuture<'_, ()> {
        let address = address.to_string();
        Box::pin(async move {
            let Some(peripheral) = self.find(&address).await? else {
                return Ok(());
            };
            if peripheral.is_connected().await? {
                peripheral.disconnect().await?;
            }
            Ok(())
        })
    }
}

impl BondSource for BtleTransport {
    fn bonded(&self) -> TransportFuture<'_, Vec<BondedPeripheral>> {
        Box::pin(async move {
            let mut bonded = Vec::new();
            for peripheral in self.adapter.peripherals().await? {
                let name = peripheral.properties().await?.and_then(|p| p.local_name);
                bonded.push(BondedPeripheral {
                    name,
                    address: peripheral.address().to_string(),
                });
            }
            Ok(bonded)
        })
    }
}

/// Connects and forwards link state for one peripheral until the receiver
/// goes away or the link drops.
///
/// The connect is always awaited to completion: a connect that lands after
/// the receiver was dropped is undone here, since the session's release may
/// already have run.
async fn watch_link(
    peripheral: Peripheral,
    mut events: EventStream,
    tx: mpsc::Sender<TransportSignal>,
    owners: SharedOwners,
    epoch: u64,
) {
    let id = peripheral.id();
    if let Err(e) = peripheral.connect().await {
        warn!(address = %peripheral.address(), error = %e, "connect failed");
        let _ = tx.send(TransportSignal::LinkDown).await;
        return;
    }
    if tx.send(TransportSignal::LinkUp).await.is_err() {
        abandon(&peripheral, &owners, epoch).await;
        return;
    }

    loop {
        tokio::select! {
            _ = tx.closed() => {
                abandon(&peripheral, &owners, epoch).await;
                break;
            }
            event = events.next() => match event {
                Some(CentralEvent::DeviceDisconnected(pid)) if pid == id => {
                    debug!(address = %peripheral.address(), "peripheral disconnected");
                    let _ = tx.send(TransportSignal::LinkDown).await;
                    break;
                }
                Some(_) => {}
                None => break,
            },
        }
    }
}

/// Disconnects a peripheral whose session went away, unless a newer open
/// owns it.
async fn abandon(peripheral: &Peripheral, owners: &SharedOwners, epoch: u64) {
    let address = peripheral.address().to_string();
    if !is_owner(owners, &address, epoch) {
        debug!(address = %address, "link taken over by a newer open");
        return;
    }
    match peripheral.is_connected().await {
        Ok(true) => {
            if let Err(e) = peripheral.disconnect().await {
                warn!(address = %address, error = %e, "failed to drop abandoned link");
            } else {
                debug!(address = %address, "dropped abandoned link");
            }
        }
        Ok(false) => {}
        Err(e) => warn!(address = %address, error = %e, "failed to query abandoned link"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_open_takes_ownership() {
        let owners = SharedOwners::default();
        let first = claim(&owners, "aa:bb:cc:dd:ee:ff");
        assert!(is_owner(&owners, "AA:BB:CC:DD:EE:FF", first));

        let second = claim(&owners, "AA:BB:CC:DD:EE:FF");
        assert!(!is_owner(&owners, "AA:BB:CC:DD:EE:FF", first));
        assert!(is_owner(&owners, "aa:bb:cc:dd:ee:ff", second));
        assert!(!is_owner(&owners, "11:22:33:44:55:66", second));
    }
}
