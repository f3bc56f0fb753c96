//! btleplug 기반 BLE 링크
//!
//! 디바이스 검색과 연결, characteristic 매핑, 알림 전달을 맡는다.
//! 전송 로직은 없다.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::link::{deliver, Channel, Link, Notification, NotificationSink};
use crate::{Config, Error, Result};

/// DOTT 서비스
pub const DOTT_SERVICE: Uuid = Uuid::from_u128(0x0483dadd_6c9d_6ca9_5d41_03ad4fff4bcc);

pub const TRIGGER_CHAR: Uuid = Uuid::from_u128(0x00001528_0000_1000_8000_00805f9b34fb);
pub const DATA_CHAR: Uuid = Uuid::from_u128(0x00001525_0000_1000_8000_00805f9b34fb);
pub const STATUS_CHAR: Uuid = Uuid::from_u128(0x00001529_0000_1000_8000_00805f9b34fb);
pub const RESPONSE_CHAR: Uuid = Uuid::from_u128(0x00001530_0000_1000_8000_00805f9b34fb);

/// MCUmgr SMP characteristic
pub const SMP_CHAR: Uuid = Uuid::from_u128(0xda2e7828_fbce_4e01_ae9e_261174997c48);

/// 이름에 이 문자열이 들어간 장치만 대상 (대소문자 무시)
pub const NAME_FILTER: &str = "dott";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// 채널 → characteristic UUID
pub fn channel_uuid(channel: Channel) -> Uuid {
    match channel {
        Channel::Trigger => TRIGGER_CHAR,
        Channel::Data => DATA_CHAR,
        Channel::Status => STATUS_CHAR,
        Channel::Response => RESPONSE_CHAR,
        Channel::Smp => SMP_CHAR,
    }
}

fn uuid_channel(uuid: Uuid) -> Option<Channel> {
    [
        Channel::Trigger,
        Channel::Data,
        Channel::Status,
        Channel::Response,
        Channel::Smp,
    ]
    .into_iter()
    .find(|&c| channel_uuid(c) == uuid)
}

fn transport_error(e: btleplug::Error) -> Error {
    match e {
        btleplug::Error::NotConnected => Error::Disconnected,
        other => Error::Transport(other.to_string()),
    }
}

/// 검색된 장치
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    pub peripheral: Peripheral,
}

/// 첫 번째 BLE 어댑터
pub async fn adapter() -> Result<Adapter> {
    let manager = Manager::new().await.map_err(transport_error)?;
    manager
        .adapters()
        .await
        .map_err(transport_error)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Transport("BLE 어댑터 없음".into()))
}

/// `duration` 동안 스캔해서 DOTT 장치 목록을 돌려준다
pub async fn scan(adapter: &Adapter, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
    // CoreBluetooth는 128비트 UUID 필터가 불안정해서 필터 없이 스캔
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(transport_error)?;
    info!("BLE 스캔 중 ({:?})...", duration);
    tokio::time::sleep(duration).await;
    if let Err(e) = adapter.stop_scan().await {
        warn!("스캔 중지 실패: {}", e);
    }

    let mut devices = Vec::new();
    for peripheral in adapter.peripherals().await.map_err(transport_error)? {
        let props = match peripheral.properties().await {
            Ok(Some(props)) => props,
            _ => continue,
        };
        let name = props.local_name.unwrap_or_default();
        let is_dott = name.to_lowercase().contains(NAME_FILTER)
            || props.services.contains(&DOTT_SERVICE);
        if !is_dott {
            continue;
        }
        debug!("발견: {} ({}) RSSI={:?}", name, props.address, props.rssi);
        devices.push(DiscoveredDevice {
            name,
            address: props.address.to_string(),
            rssi: props.rssi,
            peripheral,
        });
    }
    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    Ok(devices)
}

type SinkMap = Arc<Mutex<HashMap<Channel, Vec<NotificationSink>>>>;

/// 연결된 DOTT 장치
pub struct BleLink {
    peripheral: Peripheral,
    characteristics: HashMap<Channel, Characteristic>,
    sinks: SinkMap,
    subscribed: Mutex<HashSet<Channel>>,
    default_mtu: usize,
    forwarder: JoinHandle<()>,
}

impl BleLink {
    /// 주소(없으면 신호가 가장 센 장치)로 찾아서 연결
    pub async fn find(address: Option<&str>, scan_time: Duration, config: &Config) -> Result<Self> {
        let adapter = adapter().await?;
        let devices = scan(&adapter, scan_time).await?;
        let device = match address {
            Some(addr) => devices
                .into_iter()
                .find(|d| d.address.eq_ignore_ascii_case(addr)),
            None => devices.into_iter().next(),
        }
        .ok_or_else(|| Error::Transport("DOTT 장치를 찾지 못함".into()))?;

        info!("연결 대상: {} ({})", device.name, device.address);
        Self::connect(device.peripheral, config).await
    }

    /// 연결 + 서비스 탐색 + 알림 전달 태스크 시작
    pub async fn connect(peripheral: Peripheral, config: &Config) -> Result<Self> {
        match tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(transport_error(e)),
            Err(_) => {
                let _ = peripheral.disconnect().await;
                return Err(Error::Timeout {
                    stage: "connect",
                    offset: 0,
                });
            }
        }

        match tokio::time::timeout(DISCOVER_TIMEOUT, peripheral.discover_services()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = peripheral.disconnect().await;
                return Err(transport_error(e));
            }
            Err(_) => {
                let _ = peripheral.disconnect().await;
                return Err(Error::Timeout {
                    stage: "service discovery",
                    offset: 0,
                });
            }
        }

        let characteristics: HashMap<Channel, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .filter_map(|c| uuid_channel(c.uuid).map(|channel| (channel, c)))
            .collect();
        if characteristics.is_empty() {
            let _ = peripheral.disconnect().await;
            return Err(Error::Transport("DOTT characteristic 없음".into()));
        }
        debug!("characteristic: {:?}", characteristics.keys().collect::<Vec<_>>());

        let sinks: SinkMap = Arc::new(Mutex::new(HashMap::new()));
        let mut stream = peripheral.notifications().await.map_err(transport_error)?;
        let forward_sinks = sinks.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let Some(channel) = uuid_channel(event.uuid) else {
                    continue;
                };
                let notification = Notification::new(channel, event.value);
                let mut sinks = forward_sinks.lock();
                if let Some(list) = sinks.get_mut(&channel) {
                    list.retain(|s| !s.is_closed());
                    for sink in list.iter() {
                        deliver(sink, notification.clone());
                    }
                }
            }
            // 스트림 종료 = 연결 끊김. sink를 닫아 세션에 알린다
            debug!("알림 스트림 종료");
            forward_sinks.lock().clear();
        });

        info!("연결 완료");
        Ok(Self {
            peripheral,
            characteristics,
            sinks,
            subscribed: Mutex::new(HashSet::new()),
            default_mtu: config.default_mtu,
            forwarder,
        })
    }

    fn characteristic(&self, channel: Channel) -> Result<&Characteristic> {
        self.characteristics
            .get(&channel)
            .ok_or_else(|| Error::Transport(format!("{} characteristic 없음", channel)))
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await.map_err(transport_error)
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[async_trait]
impl Link for BleLink {
    async fn negotiate_mtu(&self) -> Result<usize> {
        if !self.peripheral.is_connected().await.map_err(transport_error)? {
            return Err(Error::Disconnected);
        }
        // btleplug는 협상된 ATT MTU를 노출하지 않는다
        Ok(self.default_mtu)
    }

    async fn write(&self, channel: Channel, data: &[u8], needs_ack: bool) -> Result<()> {
        let characteristic = self.characteristic(channel)?;
        let write_type = if needs_ack
            || !characteristic
                .properties
                .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.peripheral
            .write(characteristic, data, write_type)
            .await
            .map_err(|e| match e {
                btleplug::Error::NotConnected => Error::Disconnected,
                other => Error::LinkWriteFailed {
                    channel,
                    reason: other.to_string(),
                },
            })
    }

    async fn subscribe(&self, channel: Channel, sink: NotificationSink) -> Result<()> {
        let characteristic = self.characteristic(channel)?.clone();
        self.sinks.lock().entry(channel).or_default().push(sink);

        let first = self.subscribed.lock().insert(channel);
        if first {
            if let Err(e) = self.peripheral.subscribe(&characteristic).await {
                self.subscribed.lock().remove(&channel);
                return Err(transport_error(e));
            }
            debug!("알림 구독: {}", channel);
        }
        Ok(())
    }

    async fn read(&self, channel: Channel) -> Result<Bytes> {
        let characteristic = self.characteristic(channel)?;
        let value = self
            .peripheral
            .read(characteristic)
            .await
            .map_err(transport_error)?;
        Ok(Bytes::from(value))
    }
}
