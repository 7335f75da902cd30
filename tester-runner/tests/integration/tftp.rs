// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::{Result, bail, ensure, eyre};
use pretty_assertions::assert_eq;
use rtems_tester_runner::{
    backend::{Backend, TftpBootBackend},
    capture::OutputSink,
    config::{TftpSettings, Timeouts},
    monitor::MonitorEvent,
    tftp::{ErrorCode, Packet, TftpOption},
};
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use test_case::test_case;

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|idx| (idx % 251) as u8).collect()
}

fn expect_error(packet: Packet, expected: ErrorCode) -> Result<String> {
    match packet {
        Packet::Error { code, message } if code == expected as u16 => Ok(message),
        other => bail!("expected ERROR {expected:?}, got {other}"),
    }
}

#[test_case(0, 1 ; "empty image")]
#[test_case(511, 1 ; "one short block")]
#[test_case(512, 2 ; "exact block gets an empty last block")]
#[test_case(1024, 3 ; "two exact blocks")]
#[test_case(1500, 3 ; "partial last block")]
fn transfers_whole_image(len: usize, blocks: usize) -> Result<()> {
    test_init();

    let contents = image(len);
    let server = ServerFixture::forced(&contents, 3, Some(1))?;
    let client = TftpClient::new()?;
    // The forced image is served whatever the client asks for.
    let (received, received_blocks) = client.fetch(server.addr, "anything.img", 512)?;

    assert_eq!(received_blocks, blocks, "DATA blocks sent");
    ensure!(received == contents, "received image matches");

    let stats = server.wait_for_stats(|stats| stats.sessions_completed == 1)?;
    assert_eq!(stats.blocks_sent, blocks as u64);
    assert_eq!(stats.resends, 0);
    Ok(())
}

#[test]
fn negotiates_options() -> Result<()> {
    test_init();

    let contents = image(3000);
    let server = ServerFixture::forced(&contents, 3, None)?;
    let client = TftpClient::new()?;
    client.read_request(
        server.addr,
        "hello.exe",
        vec![
            TftpOption::new("blksize", "1024"),
            TftpOption::new("tsize", "0"),
            TftpOption::new("windowsize", "4"),
        ],
    )?;

    let (oack, session) = client.recv()?;
    let Packet::OptionAck { options } = oack else {
        bail!("expected OACK, got {oack}");
    };
    assert_eq!(
        options,
        vec![
            TftpOption::new("blksize", "1024"),
            TftpOption::new("tsize", "3000"),
        ]
    );
    client.send(session, &Packet::Ack { block: 0 })?;
    let (received, blocks) = client.receive_blocks(1024, 1)?;

    assert_eq!(blocks, 3);
    ensure!(received == contents, "received image matches");
    Ok(())
}

#[test]
fn duplicate_acks_resend_until_limit() -> Result<()> {
    test_init();

    let server = ServerFixture::forced(&image(2000), 3, None)?;
    let client = TftpClient::new()?;
    client.read_request(server.addr, "hello.exe", Vec::new())?;
    let (first, session) = client.recv()?;
    assert!(matches!(first, Packet::Data { block: 1, .. }));

    // Each stale ACK below the limit resends the current block.
    for _ in 0..2 {
        client.send(session, &Packet::Ack { block: 0 })?;
        let (packet, _) = client.recv()?;
        assert!(
            matches!(packet, Packet::Data { block: 1, .. }),
            "block 1 resent, got {packet}"
        );
    }
    client.send(session, &Packet::Ack { block: 0 })?;
    let (packet, _) = client.recv()?;
    expect_error(packet, ErrorCode::NotDefined)?;

    let stats = server.wait_for_stats(|stats| stats.sessions_failed == 1)?;
    assert_eq!(stats.resends, 2);
    assert_eq!(stats.sessions_completed, 0);
    Ok(())
}

#[test]
fn resend_recovers_below_limit() -> Result<()> {
    test_init();

    let contents = image(700);
    let server = ServerFixture::forced(&contents, 3, None)?;
    let client = TftpClient::new()?;
    client.read_request(server.addr, "hello.exe", Vec::new())?;
    let (_, session) = client.recv()?;

    client.send(session, &Packet::Ack { block: 0 })?;
    let (packet, _) = client.recv()?;
    assert!(matches!(packet, Packet::Data { block: 1, .. }));
    client.send(session, &Packet::Ack { block: 1 })?;
    let (rest, blocks) = client.receive_blocks(512, 2)?;

    assert_eq!(blocks, 1);
    assert_eq!(rest.len(), 700 - 512);
    server.wait_for_stats(|stats| stats.sessions_completed == 1)?;
    Ok(())
}

#[test]
fn unknown_transfer_id_is_refused() -> Result<()> {
    test_init();

    let contents = image(1000);
    let server = ServerFixture::forced(&contents, 3, None)?;
    let client = TftpClient::new()?;
    let intruder = TftpClient::new()?;

    client.read_request(server.addr, "hello.exe", Vec::new())?;
    let (first, session) = client.recv()?;
    let Packet::Data { block: 1, data } = first else {
        bail!("expected DATA 1, got {first}");
    };

    intruder.send(session, &Packet::Ack { block: 1 })?;
    let (packet, _) = intruder.recv()?;
    expect_error(packet, ErrorCode::UnknownTransferId)?;

    // The real client's transfer is undisturbed.
    client.send(session, &Packet::Ack { block: 1 })?;
    let (rest, _) = client.receive_blocks(512, 2)?;
    let mut received = data.to_vec();
    received.extend(rest);
    ensure!(received == contents, "received image matches");
    Ok(())
}

#[test]
fn write_request_is_refused() -> Result<()> {
    test_init();

    let server = ServerFixture::forced(&image(10), 3, None)?;
    let client = TftpClient::new()?;
    client.send(
        server.addr,
        &Packet::WriteRequest {
            filename: "upload.bin".to_owned(),
            mode: "octet".to_owned(),
            options: Vec::new(),
        },
    )?;
    let (packet, _) = client.recv()?;
    expect_error(packet, ErrorCode::IllegalOperation)?;
    Ok(())
}

#[test]
fn serves_armed_sessions_only() -> Result<()> {
    test_init();

    let contents = image(100);
    let server = ServerFixture::forced(&contents, 3, Some(1))?;
    let client = TftpClient::new()?;
    client.fetch(server.addr, "hello.exe", 512)?;
    server.wait_for_stats(|stats| stats.sessions_completed == 1)?;

    client.read_request(server.addr, "hello.exe", Vec::new())?;
    let (packet, _) = client.recv()?;
    expect_error(packet, ErrorCode::NotDefined)?;

    // A target restart allows one more boot.
    server.handle.arm();
    let (received, _) = client.fetch(server.addr, "hello.exe", 512)?;
    ensure!(received == contents, "received image matches");

    let stats = server.wait_for_stats(|stats| stats.sessions_completed == 2)?;
    assert_eq!(stats.requests_refused, 1);
    Ok(())
}

#[test]
fn root_mode_resolves_requests() -> Result<()> {
    test_init();

    let server = ServerFixture::root()?;
    std::fs::create_dir(server.root_path().join("erc32"))?;
    std::fs::write(server.root_path().join("erc32/ticker.exe"), b"ticker")?;
    let client = TftpClient::new()?;

    let (received, _) = client.fetch(server.addr, "erc32/ticker.exe", 512)?;
    assert_eq!(received, b"ticker");

    client.read_request(server.addr, "../etc/passwd", Vec::new())?;
    let (packet, _) = client.recv()?;
    expect_error(packet, ErrorCode::AccessViolation)?;

    client.read_request(server.addr, "erc32/missing.exe", Vec::new())?;
    let (packet, _) = client.recv()?;
    let message = expect_error(packet, ErrorCode::FileNotFound)?;
    assert!(message.contains("missing.exe"), "message: {message}");
    Ok(())
}

#[test]
fn malformed_request_gets_an_error() -> Result<()> {
    test_init();

    let server = ServerFixture::forced(&image(10), 3, None)?;
    let client = TftpClient::new()?;
    // A read request with no terminating NUL after the mode.
    let mut datagram = vec![0, 1];
    datagram.extend_from_slice(b"hello.exe\0octet");
    std::net::UdpSocket::bind("127.0.0.1:0")?.send_to(&datagram, server.addr)?;
    client.read_request(server.addr, "hello.exe", Vec::new())?;

    // The server keeps serving after a malformed request.
    let (packet, _) = client.recv()?;
    assert!(matches!(packet, Packet::Data { block: 1, .. }), "got {packet}");
    Ok(())
}

#[test]
fn boot_backend_serves_one_transfer_per_arm() -> Result<()> {
    test_init();

    let dir = Utf8TempDir::new()?;
    let image_path = dir.path().join("hello.exe");
    let contents = image(1300);
    std::fs::write(&image_path, &contents)?;

    let backend = TftpBootBackend::new(
        image_path,
        TftpSettings {
            port: 0,
            resend_limit: 3,
            timeout: Duration::from_secs(1),
        },
        Timeouts {
            idle: Duration::from_millis(500),
            max: Duration::from_secs(60),
        },
    )
    .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
    .with_monitor_step(Duration::from_millis(10));
    let sink = Arc::new(ConsoleSink::default());
    let console_quiet = AtomicBool::new(false);

    std::thread::scope(|s| -> Result<()> {
        let open = s.spawn(|| backend.open(sink.clone()));
        // The booted board's console keeps the run alive; transfers don't count.
        s.spawn(|| {
            while !console_quiet.load(Ordering::Acquire) {
                sink.note_activity(16);
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        let boots = boot_twice(&backend, &sink, &contents);
        // Once the console goes quiet, the idle timeout ends the run.
        console_quiet.store(true, Ordering::Release);
        let opened = open.join().map_err(|_| eyre!("open panicked"))?;
        boots?;
        opened.map_err(|err| eyre!("open failed: {err}"))
    })?;

    assert_eq!(sink.events(), vec![MonitorEvent::Idle]);
    assert_eq!(backend.local_addr(), None);
    Ok(())
}

fn boot_twice(backend: &TftpBootBackend, sink: &ConsoleSink, contents: &[u8]) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let addr = loop {
        if let Some(addr) = backend.local_addr() {
            break addr;
        }
        ensure!(Instant::now() < deadline, "backend never started its server");
        std::thread::sleep(Duration::from_millis(10));
    };
    let client = TftpClient::new()?;

    // The board asks for its boot loader's usual name and gets the test image.
    let (received, _) = client.fetch(addr, "pxelinux.0", 512)?;
    ensure!(received == contents, "forced image served");

    client.read_request(addr, "pxelinux.0", Vec::new())?;
    let (packet, _) = client.recv()?;
    expect_error(packet, ErrorCode::NotDefined)?;

    // A restart before the test began allows one more boot.
    backend.target_restart(false);
    let (received, _) = client.fetch(addr, "pxelinux.0", 512)?;
    ensure!(received == contents, "forced image served after restart");

    // Once the test has begun, a restart doesn't.
    backend.target_restart(true);
    client.read_request(addr, "pxelinux.0", Vec::new())?;
    let (packet, _) = client.recv()?;
    expect_error(packet, ErrorCode::NotDefined)?;

    // Well past the idle timeout, but the console has kept talking.
    std::thread::sleep(Duration::from_millis(1200));
    let events = sink.events();
    ensure!(events.is_empty(), "monitor fired while the console was active: {events:?}");
    ensure!(backend.local_addr().is_some(), "server still running");
    Ok(())
}
