//! End-to-end slave tests over a real TCP socket: a raw Modbus client
//! against the full plane + reflector + command pipeline stack.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use heatlink_control::CommandDispatcher;
use heatlink_core::config::{DeviceTopics, RegulatorGains, SafetyLimits};
use heatlink_core::{
    Clock, CommandBus, CoreError, DeviceConfig, DeviceRegistry, EventKind, ManualClock, Mutation,
    StateStore, TelemetryPublisher, ValveState,
};
use heatlink_modbus::{ModbusServer, Reflector, RegisterPlane};
use heatlink_storage::MemorySettingsStore;

const NOW_MS: i64 = 1_000_000;

struct RecordingPublisher {
    published: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl TelemetryPublisher for RecordingPublisher {
    async fn publish(&self, _broker: &str, topic: &str, payload: Vec<u8>) -> Result<(), CoreError> {
        self.published
            .lock()
            .await
            .push((topic.to_string(), String::from_utf8(payload).unwrap()));
        Ok(())
    }
}

fn device(device_id: &str, unit_id: u8) -> DeviceConfig {
    DeviceConfig {
        device_id: device_id.to_string(),
        unit_id,
        broker: "plant".to_string(),
        topics: DeviceTopics {
            temperature_in: format!("{device_id}/temp"),
            valve_relay_out: format!("{device_id}/valve"),
            fan_dimmer_out: format!("{device_id}/fan"),
            alarm_in: None,
        },
        gains: RegulatorGains {
            kp: 10.0,
            ki: 0.0,
            kd: 0.0,
            out_min: 0.0,
            out_max: 100.0,
            integral_decay: 0.95,
        },
        safety: SafetyLimits::default(),
        setpoint_min: 5.0,
        setpoint_max: 35.0,
        stale_threshold_ms: 30_000,
    }
}

struct Harness {
    store: Arc<StateStore>,
    addr: std::net::SocketAddr,
}

async fn harness() -> Harness {
    harness_with_timeout(Duration::from_secs(60)).await
}

async fn harness_with_timeout(idle_timeout: Duration) -> Harness {
    let configs = (1..=5).map(|unit| device(&format!("zone-{unit}"), unit)).collect();
    let registry = Arc::new(DeviceRegistry::new(configs).unwrap());
    let store = Arc::new(StateStore::new(registry.clone()));
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW_MS, 12));

    let publisher = Arc::new(RecordingPublisher {
        published: Mutex::new(Vec::new()),
    });
    let (commands, rx) = CommandBus::channel(64);
    let dispatcher = CommandDispatcher::new(
        store.clone(),
        publisher,
        Arc::new(MemorySettingsStore::new()),
    );
    tokio::spawn(dispatcher.run(rx));

    let plane = Arc::new(RegisterPlane::new(registry.max_unit_id() as usize));
    let running = Arc::new(AtomicBool::new(true));
    Reflector::new(plane.clone(), store.clone(), clock).spawn(running);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ModbusServer::new(plane, store.clone(), commands, idle_timeout);
    tokio::spawn(server.serve(listener));

    Harness { store, addr }
}

/// Raw Modbus TCP client speaking bytes, independent of the crate's codec.
struct Client {
    stream: TcpStream,
    transaction_id: u16,
}

impl Client {
    async fn connect(harness: &Harness) -> Self {
        Self {
            stream: TcpStream::connect(harness.addr).await.unwrap(),
            transaction_id: 0,
        }
    }

    async fn request_with_unit(&mut self, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let mut adu = Vec::new();
        adu.extend_from_slice(&self.transaction_id.to_be_bytes());
        adu.extend_from_slice(&[0, 0]);
        adu.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        adu.push(unit_id);
        adu.extend_from_slice(pdu);
        self.stream.write_all(&adu).await.unwrap();

        let mut header = [0u8; 7];
        self.stream.read_exact(&mut header).await.unwrap();
        assert_eq!(
            u16::from_be_bytes([header[0], header[1]]),
            self.transaction_id,
            "transaction id echo"
        );
        assert_eq!(header[6], unit_id, "unit id echo");
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; length - 1];
        self.stream.read_exact(&mut pdu).await.unwrap();
        pdu
    }

    async fn request(&mut self, pdu: &[u8]) -> Vec<u8> {
        self.request_with_unit(1, pdu).await
    }

    async fn read_registers(&mut self, fc: u8, address: u16, quantity: u16) -> Result<Vec<u16>, u8> {
        let mut pdu = vec![fc];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&quantity.to_be_bytes());
        let response = self.request(&pdu).await;
        if response[0] == fc | 0x80 {
            return Err(response[1]);
        }
        assert_eq!(response[0], fc);
        assert_eq!(response[1] as usize, quantity as usize * 2);
        Ok(response[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    async fn read_holding(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>, u8> {
        self.read_registers(0x03, address, quantity).await
    }

    async fn read_input(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>, u8> {
        self.read_registers(0x04, address, quantity).await
    }

    async fn read_bits(&mut self, fc: u8, address: u16, quantity: u16) -> Result<Vec<u8>, u8> {
        let mut pdu = vec![fc];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&quantity.to_be_bytes());
        let response = self.request(&pdu).await;
        if response[0] == fc | 0x80 {
            return Err(response[1]);
        }
        Ok(response[2..].to_vec())
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), u8> {
        let mut pdu = vec![0x06];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());
        let response = self.request(&pdu).await;
        if response[0] == 0x86 {
            return Err(response[1]);
        }
        assert_eq!(response, pdu, "FC06 echoes the request");
        Ok(())
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<(), u8> {
        let mut pdu = vec![0x05];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(if value { &[0xFF, 0x00] } else { &[0x00, 0x00] });
        let response = self.request(&pdu).await;
        if response[0] == 0x85 {
            return Err(response[1]);
        }
        assert_eq!(response, pdu);
        Ok(())
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), u8> {
        let mut pdu = vec![0x10];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
        pdu.push((values.len() * 2) as u8);
        for value in values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        let response = self.request(&pdu).await;
        if response[0] == 0x90 {
            return Err(response[1]);
        }
        Ok(())
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn s1_setpoint_round_trip_unit_2() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    client.write_register(30, 0x00E1).await.unwrap();

    let store = harness.store.clone();
    wait_until(
        || store.snapshot("zone-2").unwrap().setpoint_temperature == 22.5,
        "setpoint applied",
    )
    .await;

    assert_eq!(client.read_holding(30, 1).await.unwrap(), vec![225]);
}

#[tokio::test]
async fn s2_negative_temperature_reads_as_twos_complement() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    harness
        .store
        .apply(
            "zone-1",
            Mutation::UpdateTemperature {
                celsius: -5.2,
                at_ms: NOW_MS,
            },
        )
        .unwrap();

    let mut last = 0;
    for _ in 0..200 {
        last = client.read_input(0, 1).await.unwrap()[0];
        if last == 0xFFCC {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last, 0xFFCC);
}

#[tokio::test]
async fn s3_command_word_enables_unit_5() {
    let harness = harness().await;
    let mut events = harness.store.subscribe();
    let mut client = Client::connect(&harness).await;

    client.write_register(130, 2).await.unwrap();

    let store = harness.store.clone();
    wait_until(
        || store.snapshot("zone-5").unwrap().auto_enabled,
        "auto enabled on device 5",
    )
    .await;

    assert_eq!(client.read_holding(130, 1).await.unwrap(), vec![0]);

    let mut saw_auto_enabled = false;
    while let Ok(event) = events.try_recv() {
        if event.device_id == "zone-5" && event.kind == EventKind::AutoEnabled {
            saw_auto_enabled = true;
        }
    }
    assert!(saw_auto_enabled, "AutoEnabled event observed");
}

#[tokio::test]
async fn s4_disable_wins_when_both_command_bits_set() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;
    let store = harness.store.clone();

    client.write_register(10, 2).await.unwrap();
    wait_until(
        || store.snapshot("zone-1").unwrap().auto_enabled,
        "auto enabled",
    )
    .await;

    client.write_register(10, 6).await.unwrap();
    wait_until(
        || !store.snapshot("zone-1").unwrap().auto_enabled,
        "auto disabled by priority",
    )
    .await;

    assert_eq!(client.read_holding(10, 1).await.unwrap(), vec![0]);
}

#[tokio::test]
async fn s7_contiguous_read_spans_three_devices() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    for (device_id, celsius) in [("zone-1", 21.0), ("zone-2", 22.0), ("zone-3", 23.0)] {
        harness
            .store
            .apply(
                device_id,
                Mutation::UpdateTemperature {
                    celsius,
                    at_ms: NOW_MS,
                },
            )
            .unwrap();
    }

    let mut values = Vec::new();
    for _ in 0..200 {
        values = client.read_input(0, 60).await.unwrap();
        if values[0] == 210 && values[20] == 220 && values[40] == 230 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(values.len(), 60);
    assert_eq!(values[0], 210);
    assert_eq!(values[20], 220);
    assert_eq!(values[40], 230);
}

#[tokio::test]
async fn coil_zero_drives_auto_control() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;
    let store = harness.store.clone();

    client.write_coil(0, true).await.unwrap();
    wait_until(
        || store.snapshot("zone-1").unwrap().auto_enabled,
        "auto enabled via coil",
    )
    .await;

    let bits = client.read_bits(0x01, 0, 8).await.unwrap();
    assert_eq!(bits[0] & 0x01, 0x01);

    client.write_coil(0, false).await.unwrap();
    wait_until(
        || !store.snapshot("zone-1").unwrap().auto_enabled,
        "auto disabled via coil",
    )
    .await;
}

#[tokio::test]
async fn reserved_coil_write_has_no_command_effect() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    client.write_coil(1, true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snap = harness.store.snapshot("zone-1").unwrap();
    assert!(!snap.auto_enabled);
    assert!(!snap.emergency_stop);
}

#[tokio::test]
async fn discrete_inputs_pack_status_bits_lsb_first() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    harness
        .store
        .apply(
            "zone-1",
            Mutation::UpdateTemperature {
                celsius: 20.0,
                at_ms: NOW_MS,
            },
        )
        .unwrap();
    harness
        .store
        .apply(
            "zone-1",
            Mutation::SetActuators {
                fan: Some(50.0),
                pid: Some(50.0),
                valve: Some(ValveState::Closed),
            },
        )
        .unwrap();

    let mut bits = Vec::new();
    for _ in 0..200 {
        bits = client.read_bits(0x02, 0, 8).await.unwrap();
        // IS_ONLINE | IS_WORKING
        if bits == vec![0b0000_0011] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(bits, vec![0b0000_0011]);
}

#[tokio::test]
async fn reserved_holding_registers_round_trip_and_survive_the_sweep() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    client.write_register(7, 0xBEEF).await.unwrap();
    assert_eq!(client.read_holding(7, 1).await.unwrap(), vec![0xBEEF]);

    // Let at least one reflector sweep pass.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(client.read_holding(7, 1).await.unwrap(), vec![0xBEEF]);
}

#[tokio::test]
async fn out_of_range_setpoint_write_is_illegal_data_value() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    // 50.0 degC encoded as 500: outside [5, 35].
    assert_eq!(client.write_register(0, 500).await.unwrap_err(), 0x03);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.store.snapshot("zone-1").unwrap().setpoint_temperature,
        20.0
    );
}

#[tokio::test]
async fn bad_command_word_is_illegal_data_value() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    assert_eq!(client.write_register(10, 1).await.unwrap_err(), 0x03);
    assert_eq!(client.write_register(10, 8).await.unwrap_err(), 0x03);
    // NOP is fine.
    client.write_register(10, 0).await.unwrap();
}

#[tokio::test]
async fn multi_register_write_validates_before_applying() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    // Register 0 carries an invalid setpoint; register 1 would be stored.
    assert_eq!(
        client.write_registers(0, &[500, 0x0042]).await.unwrap_err(),
        0x03
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let values = client.read_holding(0, 2).await.unwrap();
    assert_ne!(values[1], 0x0042, "nothing applied from the rejected write");

    // A valid batch lands: setpoint 22.5 plus a reserved register.
    client.write_registers(0, &[225, 0x0042]).await.unwrap();
    let store = harness.store.clone();
    wait_until(
        || store.snapshot("zone-1").unwrap().setpoint_temperature == 22.5,
        "batch setpoint applied",
    )
    .await;
}

#[tokio::test]
async fn reads_past_the_plane_are_illegal_data_address() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    // 5 units: holding plane ends at address 149.
    assert_eq!(client.read_holding(149, 2).await.unwrap_err(), 0x02);
    assert_eq!(client.read_input(100, 1).await.unwrap_err(), 0x02);
    assert_eq!(client.write_register(150, 1).await.unwrap_err(), 0x02);
    assert_eq!(client.read_bits(0x01, 80, 1).await.unwrap_err(), 0x02);
}

#[tokio::test]
async fn unsupported_function_is_illegal_function() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    let response = client.request(&[0x2B, 0x0E, 0x01, 0x00]).await;
    assert_eq!(response, vec![0x2B | 0x80, 0x01]);
}

#[tokio::test]
async fn invalid_coil_value_is_illegal_data_value() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    let response = client.request(&[0x05, 0x00, 0x00, 0x00, 0x01]).await;
    assert_eq!(response, vec![0x85, 0x03]);
}

#[tokio::test]
async fn mbap_unit_byte_is_echoed_but_addressing_wins() {
    let harness = harness().await;
    let mut client = Client::connect(&harness).await;

    // Unit byte says 7; the address says unit 2. The write lands on zone-2.
    let mut pdu = vec![0x06];
    pdu.extend_from_slice(&30u16.to_be_bytes());
    pdu.extend_from_slice(&225u16.to_be_bytes());
    let response = client.request_with_unit(7, &pdu).await;
    assert_eq!(response[0], 0x06);

    let store = harness.store.clone();
    wait_until(
        || store.snapshot("zone-2").unwrap().setpoint_temperature == 22.5,
        "write landed on the derived unit",
    )
    .await;
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let harness = harness_with_timeout(Duration::from_millis(100)).await;
    let mut client = Client::connect(&harness).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut buf = [0u8; 1];
    let read = client.stream.read(&mut buf).await.unwrap();
    assert_eq!(read, 0, "server closed the idle socket");
}

#[tokio::test]
async fn multiple_clients_are_served_concurrently() {
    let harness = harness().await;
    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(Client::connect(&harness).await);
    }
    for client in &mut clients {
        let values = client.read_holding(0, 30).await.unwrap();
        assert_eq!(values.len(), 30);
    }
}
