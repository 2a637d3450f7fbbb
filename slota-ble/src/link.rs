//! [`PeripheralLink`] over btleplug
//!
//! Every request spawns a task and reports back on the event sink. One
//! writer task per connection drains the data queue so frames go out in
//! order; a full queue is how backpressure reaches the uploader.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use slota_ota::{EventSink, Generation, LinkConfig, LinkError, LinkEvent, PeripheralLink, ServiceMap};
use slota_proto::{CONTROL_UUID, ControlCommand, DATA_UUID, DeviceAddress};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::{adapter_error, find_peripheral};

#[derive(Clone)]
struct Connection {
    peripheral: Peripheral,
    control: Option<Characteristic>,
    data_tx: Option<mpsc::Sender<Vec<u8>>>,
}

struct Inner {
    adapter: Adapter,
    sink: EventSink,
    config: LinkConfig,
    connections: Mutex<HashMap<Generation, Connection>>,
    pending: Mutex<HashMap<Generation, JoinHandle<()>>>,
}

pub struct BleLink {
    inner: Arc<Inner>,
    watcher: JoinHandle<()>,
}

impl BleLink {
    /// Start watching `adapter` for disconnects. Events go to `sink`.
    pub async fn new(adapter: Adapter, sink: EventSink, config: LinkConfig) -> Result<Self, LinkError> {
        let events = adapter.events().await.map_err(adapter_error)?;
        let inner = Arc::new(Inner {
            adapter,
            sink,
            config,
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        });

        let watcher = tokio::spawn({
            let inner = inner.clone();
            async move {
                let mut events = events;
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        inner.peripheral_gone(&id);
                    }
                }
                debug!("adapter event stream ended");
            }
        });

        Ok(Self { inner, watcher })
    }

    fn connection(&self, generation: Generation) -> Result<Connection, LinkError> {
        lock(&self.inner.connections)
            .get(&generation)
            .cloned()
            .ok_or(LinkError::NotConnected(generation))
    }
}

impl Inner {
    async fn open(&self, address: DeviceAddress, generation: Generation) -> Result<Option<String>, LinkError> {
        let peripheral = find_peripheral(&self.adapter, address, &self.config).await?;
        peripheral.connect().await.map_err(adapter_error)?;
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|props| props.local_name);

        lock(&self.connections).insert(
            generation,
            Connection {
                peripheral,
                control: None,
                data_tx: None,
            },
        );
        Ok(name)
    }

    fn peripheral_gone(&self, id: &btleplug::platform::PeripheralId) {
        let gone: Vec<Generation> = {
            let mut connections = lock(&self.connections);
            let gone: Vec<_> = connections
                .iter()
                .filter(|(_, c)| &c.peripheral.id() == id)
                .map(|(generation, _)| *generation)
                .collect();
            for generation in &gone {
                connections.remove(generation);
            }
            gone
        };
        for generation in gone {
            info!(%generation, "peripheral disconnected");
            let _ = self.sink.send(LinkEvent::Disconnected { generation });
        }
    }

    /// Record the OTA characteristics of a freshly discovered connection.
    fn attach(&self, generation: Generation, characteristics: &[Characteristic]) {
        let mut connections = lock(&self.connections);
        let Some(connection) = connections.get_mut(&generation) else {
            return;
        };
        let find = |uuid: Uuid| characteristics.iter().find(|c| c.uuid == uuid).cloned();
        connection.control = find(CONTROL_UUID);
        if let Some(data) = find(DATA_UUID) {
            let (tx, rx) = mpsc::channel(self.config.data_queue_depth.max(1));
            spawn_writer(
                connection.peripheral.clone(),
                data,
                rx,
                self.sink.clone(),
                generation,
            );
            connection.data_tx = Some(tx);
        }
    }
}

/// Write queued frames in order until the connection drops its sender. The
/// first failed write is reported and ends the writer; the frames behind it
/// are already lost to the transfer.
fn spawn_writer(
    peripheral: Peripheral,
    data: Characteristic,
    mut rx: mpsc::Receiver<Vec<u8>>,
    sink: EventSink,
    generation: Generation,
) {
    tokio::spawn(async move {
        let (peripheral, data) = (&peripheral, &data);
        let result = drain_frames(&mut rx, move |frame| async move {
            peripheral.write(data, &frame, WriteType::WithoutResponse).await
        })
        .await;
        match result {
            Ok(frames) => debug!(%generation, frames, "ota data writer done"),
            Err(err) => {
                error!(%generation, "ota data write failed: {err}");
                let _ = sink.send(LinkEvent::DataWriteFailed {
                    generation,
                    reason: err.to_string(),
                });
            }
        }
    });
}

/// Hand every queued frame to `write`, in order. Returns the number written,
/// or the first error.
async fn drain_frames<W, F, E>(rx: &mut mpsc::Receiver<Vec<u8>>, mut write: W) -> Result<usize, E>
where
    W: FnMut(Vec<u8>) -> F,
    F: Future<Output = Result<(), E>>,
{
    let mut written = 0;
    while let Some(frame) = rx.recv().await {
        write(frame).await?;
        written += 1;
    }
    Ok(written)
}

impl PeripheralLink for BleLink {
    fn connect(&self, address: DeviceAddress, generation: Generation) -> Result<(), LinkError> {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let event = match inner.open(address, generation).await {
                Ok(name) => LinkEvent::Connected { generation, name },
                Err(err) => {
                    warn!(%address, %generation, "connect failed: {err}");
                    LinkEvent::Disconnected { generation }
                }
            };
            lock(&inner.pending).remove(&generation);
            let _ = inner.sink.send(event);
        });
        let mut pending = lock(&self.inner.pending);
        pending.retain(|_, task| !task.is_finished());
        pending.insert(generation, task);
        Ok(())
    }

    fn discover_services(&self, generation: Generation) -> Result<(), LinkError> {
        let connection = self.connection(generation)?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let services = match connection.peripheral.discover_services().await {
                Ok(()) => {
                    let characteristics: Vec<_> =
                        connection.peripheral.characteristics().into_iter().collect();
                    inner.attach(generation, &characteristics);
                    ServiceMap::from_characteristics(
                        characteristics.iter().map(|c| (c.service_uuid, c.uuid)),
                    )
                }
                Err(err) => {
                    warn!(%generation, "service discovery failed: {err}");
                    ServiceMap::default()
                }
            };
            debug!(%generation, ?services, "services discovered");
            let _ = inner.sink.send(LinkEvent::ServicesDiscovered { generation, services });
        });
        Ok(())
    }

    fn write_control(&self, generation: Generation, command: ControlCommand) -> Result<(), LinkError> {
        let connection = self.connection(generation)?;
        let control = connection
            .control
            .clone()
            .ok_or(LinkError::MissingCharacteristic("control"))?;
        let sink = self.inner.sink.clone();
        tokio::spawn(async move {
            let value = command.byte();
            let success = match connection
                .peripheral
                .write(&control, &[value], WriteType::WithResponse)
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    warn!(%command, %generation, "control write failed: {err}");
                    false
                }
            };
            let _ = sink.send(LinkEvent::WriteComplete {
                generation,
                value,
                success,
            });
        });
        Ok(())
    }

    fn write_data(&self, generation: Generation, frame: &[u8]) -> bool {
        let data_tx = lock(&self.inner.connections)
            .get(&generation)
            .and_then(|c| c.data_tx.clone());
        match data_tx {
            Some(tx) => tx.try_send(frame.to_vec()).is_ok(),
            None => false,
        }
    }

    fn request_mtu(&self, generation: Generation, mtu: u16) -> Result<(), LinkError> {
        self.connection(generation)?;
        // the OS negotiates the ATT MTU on connect; btleplug cannot ask for one
        debug!(%generation, mtu, "mtu request acknowledged locally");
        let _ = self.inner.sink.send(LinkEvent::MtuChanged {
            generation,
            mtu,
            success: true,
        });
        Ok(())
    }

    fn negotiates_mtu(&self) -> bool {
        false
    }

    fn disconnect(&self, generation: Generation) {
        if let Some(task) = lock(&self.inner.pending).remove(&generation) {
            task.abort();
        }
        let Some(connection) = lock(&self.inner.connections).remove(&generation) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = connection.peripheral.disconnect().await {
                debug!(%generation, "disconnect: {err}");
            }
        });
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.watcher.abort();
        for (_, task) in lock(&self.inner.pending).drain() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
