//! End-to-end tests over real TCP sockets against mock devices.

mod common;

use bytes::Bytes;
use common::{mock_device, test_config, Client, TestGateway};
use serde_json::json;
use serial_gateway::config::{DeviceConfig, FramingConfig, TelegramConfig};
use serial_gateway::error::ErrorKind;
use serial_gateway::hardware::MockDriver;
use serial_gateway::protocol::PayloadEncoding;
use serial_gateway::session::DeviceState;
use serial_gateway::telegram::crc16;
use std::time::Duration;
use tokio::time::Instant;

/// Answers PONG to PING, echoes everything else
fn pong_driver() -> MockDriver {
    MockDriver::new(|frame| {
        if frame.payload.as_ref() == b"PING\n" {
            Some(Bytes::from_static(b"PONG\n"))
        } else {
            Some(frame.payload.clone())
        }
    })
}

#[tokio::test]
async fn test_ping_pong_round_trip() {
    let gateway = TestGateway::start(pong_driver(), test_config(vec![mock_device("d1")])).await;
    let mut client = Client::connect(gateway.addr).await;

    let started = Instant::now();
    let response = client
        .call(json!({"id": 1, "device": "d1", "payload": "PING\n"}))
        .await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(response.ok, "unexpected error: {:?}", response.error);
    assert_eq!(response.id, Some(json!(1)));
    assert_eq!(response.payload.as_deref(), Some("PONG\n"));
    assert_eq!(response.encoding, Some(PayloadEncoding::Utf8));

    gateway.stop().await;
}

#[tokio::test]
async fn test_same_device_requests_answer_in_accept_order() {
    let driver = pong_driver();
    driver.set_response_delay(Duration::from_millis(100));
    let gateway = TestGateway::start(driver, test_config(vec![mock_device("d1")])).await;

    let mut first = Client::connect(gateway.addr).await;
    let mut second = Client::connect(gateway.addr).await;

    let a = tokio::spawn(async move {
        let response = first
            .call(json!({"device": "d1", "payload": "A\n", "deadline_ms": 2000}))
            .await;
        (response, Instant::now())
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    let b = tokio::spawn(async move {
        let response = second
            .call(json!({"device": "d1", "payload": "B\n", "deadline_ms": 2000}))
            .await;
        (response, Instant::now())
    });

    let (a_response, a_done) = a.await.unwrap();
    let (b_response, b_done) = b.await.unwrap();
    assert_eq!(a_response.payload.as_deref(), Some("A\n"));
    assert_eq!(b_response.payload.as_deref(), Some("B\n"));
    assert!(a_done < b_done, "A must be answered before B");

    gateway.stop().await;
}

#[tokio::test]
async fn test_malformed_client_does_not_disturb_others() {
    let gateway = TestGateway::start(pong_driver(), test_config(vec![mock_device("d1")])).await;
    let mut good = Client::connect(gateway.addr).await;
    let mut bad = Client::connect(gateway.addr).await;

    bad.send_raw("{not json").await;
    let response = bad.next_response().await.expect("protocol error response");
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().kind, ErrorKind::Protocol);
    assert!(bad.next_response().await.is_none(), "connection should close");

    let response = good.call(json!({"device": "d1", "payload": "PING\n"})).await;
    assert_eq!(response.payload.as_deref(), Some("PONG\n"));

    gateway.stop().await;
}

#[tokio::test]
async fn test_oversized_request_is_rejected() {
    let mut config = test_config(vec![mock_device("d1")]);
    config.server.max_request_bytes = 256;
    let gateway = TestGateway::start(pong_driver(), config).await;
    let mut client = Client::connect(gateway.addr).await;

    let payload = "x".repeat(1000);
    client
        .send_raw(&json!({"device": "d1", "payload": payload}).to_string())
        .await;
    let response = client.next_response().await.expect("protocol error response");
    assert_eq!(response.error.unwrap().kind, ErrorKind::Protocol);

    gateway.stop().await;
}

#[tokio::test]
async fn test_error_kinds_reach_client() {
    let driver = pong_driver();
    let gateway = TestGateway::start(driver.clone(), test_config(vec![mock_device("d1")])).await;
    let mut client = Client::connect(gateway.addr).await;

    let response = client.call(json!({"device": "d9", "payload": "x"})).await;
    assert_eq!(response.error.unwrap().kind, ErrorKind::DeviceNotFound);

    driver.set_silent(true);
    let started = Instant::now();
    let response = client
        .call(json!({"device": "d1", "payload": "PING\n", "deadline_ms": 100}))
        .await;
    assert_eq!(response.error.unwrap().kind, ErrorKind::DeviceTimeout);
    assert!(started.elapsed() < Duration::from_millis(600));

    // A timed-out exchange leaves the device usable.
    driver.set_silent(false);
    let response = client.call(json!({"device": "d1", "payload": "PING\n"})).await;
    assert_eq!(response.payload.as_deref(), Some("PONG\n"));

    gateway.stop().await;
}

#[tokio::test]
async fn test_device_down_at_startup_is_unavailable() {
    let driver = pong_driver();
    driver.block_opens(true);
    let gateway = TestGateway::start(
        driver.clone(),
        test_config(vec![mock_device("d1"), mock_device("d2")]),
    )
    .await;
    let mut client = Client::connect(gateway.addr).await;

    let started = Instant::now();
    let response = client
        .call(json!({"device": "d1", "payload": "PING\n", "deadline_ms": 3000}))
        .await;
    assert_eq!(response.error.unwrap().kind, ErrorKind::Unavailable);
    assert!(started.elapsed() < Duration::from_secs(1), "must not wait out the deadline");

    let response = client.call(json!({"op": "devices"})).await;
    let devices = response.devices.unwrap();
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().all(|d| d.state == DeviceState::Reopening));
    assert!(devices[0].last_error.is_some());

    driver.block_opens(false);
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let response = client.call(json!({"device": "d1", "payload": "PING\n"})).await;
        if response.ok {
            assert_eq!(response.payload.as_deref(), Some("PONG\n"));
            break;
        }
        assert!(Instant::now() < deadline, "device never recovered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    gateway.stop().await;
}

#[tokio::test]
async fn test_ping_and_binary_payloads() {
    let gateway = TestGateway::start(
        MockDriver::echo(),
        test_config(vec![DeviceConfig {
            framing: FramingConfig::LengthPrefixed {
                prefix_bytes: 1,
                max_frame_bytes: 64,
            },
            ..mock_device("bin")
        }]),
    )
    .await;
    let mut client = Client::connect(gateway.addr).await;

    let response = client.call(json!({"op": "ping"})).await;
    assert_eq!(response.payload.as_deref(), Some("pong"));

    let response = client
        .call(json!({"device": "bin", "payload": "00ff10", "encoding": "hex"}))
        .await;
    assert_eq!(response.payload.as_deref(), Some("00ff10"));
    assert_eq!(response.encoding, Some(PayloadEncoding::Hex));

    gateway.stop().await;
}

#[tokio::test]
async fn test_shutdown_completes_with_idle_clients() {
    let gateway = TestGateway::start(pong_driver(), test_config(vec![mock_device("d1")])).await;
    let mut client = Client::connect(gateway.addr).await;
    let response = client.call(json!({"device": "d1", "payload": "PING\n"})).await;
    assert!(response.ok);

    let started = Instant::now();
    gateway.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(client.next_response().await.is_none());
}

#[tokio::test]
async fn test_malformed_device_reply_then_resync() {
    let driver = MockDriver::new(|frame| {
        if frame.payload.as_ref() == b"BIG\n" {
            Some(Bytes::from_static(b"0123456789ABCDEF\n"))
        } else {
            Some(frame.payload.clone())
        }
    });
    let device = DeviceConfig {
        framing: FramingConfig::Delimiter {
            delimiter: "\n".to_string(),
            max_frame_bytes: 8,
        },
        ..mock_device("d1")
    };
    let gateway = TestGateway::start(driver, test_config(vec![device])).await;
    let mut client = Client::connect(gateway.addr).await;

    let response = client.call(json!({"device": "d1", "payload": "BIG\n"})).await;
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().kind, ErrorKind::MalformedFrame);

    let response = client.call(json!({"device": "d1", "payload": "OK\n"})).await;
    assert!(response.ok, "unexpected error: {:?}", response.error);
    assert_eq!(response.payload.as_deref(), Some("OK\n"));

    gateway.stop().await;
}

const METER_BODY: &str = "/ISK5\\2M550T-1012\r\n\r\n1-0:1.8.1(001234.567*kWh)\r\n0-0:96.14.0(0001)\r\n!";

fn meter_telegram(body: &str) -> String {
    format!("{}{:04X}\r\n", body, crc16(body.as_bytes()))
}

async fn meter_gateway(heartbeat: String) -> TestGateway {
    let driver = MockDriver::echo();
    driver.set_heartbeat(heartbeat, Duration::from_millis(50));
    let meter = DeviceConfig {
        framing: FramingConfig::Delimiter {
            delimiter: "\r\n".to_string(),
            max_frame_bytes: 1024,
        },
        telegram: Some(TelegramConfig::default()),
        ..mock_device("meter")
    };
    TestGateway::start(driver, test_config(vec![meter])).await
}

#[tokio::test]
async fn test_read_returns_whole_telegram() {
    let telegram = meter_telegram(METER_BODY);
    let gateway = meter_gateway(telegram.clone()).await;
    let mut client = Client::connect(gateway.addr).await;

    let response = client
        .call(json!({"op": "read", "device": "meter", "deadline_ms": 2000}))
        .await;
    assert!(response.ok, "unexpected error: {:?}", response.error);
    assert_eq!(response.payload.as_deref(), Some(telegram.as_str()));

    gateway.stop().await;
}

#[tokio::test]
async fn test_read_rejects_corrupted_telegram() {
    let corrupted = meter_telegram(METER_BODY).replace("001234.567", "001234.568");
    let gateway = meter_gateway(corrupted).await;
    let mut client = Client::connect(gateway.addr).await;

    let response = client
        .call(json!({"op": "read", "device": "meter", "deadline_ms": 2000}))
        .await;
    assert!(!response.ok);
    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::MalformedFrame);
    assert!(error.message.contains("checksum"), "{}", error.message);

    gateway.stop().await;
}
