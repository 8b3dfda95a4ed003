//! End-to-end tests of the synchronous engine against the simulated port.

use botcore_i2c::{
    HealthStatus, HeartbeatAction, I2cEngine, I2cEngineBuilder, I2cError, ReadMode, ReadWindow,
    WaitControl,
};
use botcore_port::{I2cAddress, I2cPort, PortKind, SimulatedPort};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn addr() -> I2cAddress {
    I2cAddress::from_8bit(0x28)
}

fn window(first: u8, count: usize, mode: ReadMode) -> ReadWindow {
    ReadWindow::new(first, count, mode).unwrap()
}

/// Engine on an armed, delivering port.
fn armed_engine(port: &SimulatedPort) -> I2cEngine<SimulatedPort> {
    init_tracing();
    let engine = I2cEngineBuilder::new(port.clone(), addr()).tag("test").build();
    port.arm();
    engine.engage();
    engine
}

#[test]
fn test_write_then_read_observes_post_write_state() {
    let port = SimulatedPort::new(PortKind::Standard);
    let engine = armed_engine(&port);

    engine.write8_with_control(0x10, 0x42, WaitControl::None).unwrap();
    // causality: the read must see the write, even with no wait control
    assert_eq!(engine.read8(0x10).unwrap(), 0x42);
    assert_eq!(port.device_read(0x10, 1), vec![0x42]);
    assert_eq!(engine.health_status(), HealthStatus::Healthy);
}

#[test]
fn test_written_wait_lands_on_device_before_returning() {
    let port = SimulatedPort::new(PortKind::Standard);
    let engine = armed_engine(&port);

    engine.write8_with_control(0x21, 0x5a, WaitControl::Written).unwrap();
    assert_eq!(port.device_read(0x21, 1), vec![0x5a]);
}

#[test]
fn test_switching_port_reads_through_mode_switch() {
    let port = SimulatedPort::new(PortKind::Switching);
    port.device_write(0x04, &[1, 2, 3, 4]);
    let engine = armed_engine(&port);

    engine.set_read_window(&window(0x04, 4, ReadMode::Repeat));
    assert_eq!(engine.read(0x04, 4).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn test_covering_window_is_not_replaced() {
    let port = SimulatedPort::new(PortKind::Standard);
    port.device_write(0x00, &[10, 11, 12, 13, 14, 15, 16, 17, 18, 19]);
    let engine = armed_engine(&port);

    engine.set_read_window(&window(0x00, 10, ReadMode::Repeat));
    assert_eq!(engine.read(0x02, 4).unwrap(), vec![12, 13, 14, 15]);

    // let the repeat window settle into its flag-only refresh rhythm
    thread::sleep(Duration::from_millis(20));
    let enables = port.read_mode_enables();
    let installed = engine.read_window().unwrap();

    engine.ensure_read_window(
        &window(0x02, 4, ReadMode::Repeat),
        &window(0x00, 10, ReadMode::Repeat),
    );
    assert_eq!(engine.read(0x02, 4).unwrap(), vec![12, 13, 14, 15]);

    // same window object, no new mode switch
    assert!(Arc::ptr_eq(&installed, &engine.read_window().unwrap()));
    assert_eq!(port.read_mode_enables(), enables);
}

#[test]
fn test_only_once_window_is_exhausted_by_one_read() {
    let port = SimulatedPort::new(PortKind::Standard);
    port.device_write(0x10, &[9, 8, 7, 6]);
    let engine = armed_engine(&port);

    engine.set_read_window(&window(0x10, 4, ReadMode::OnlyOnce));
    assert_eq!(engine.read(0x10, 4).unwrap(), vec![9, 8, 7, 6]);

    let transactions = port.transaction_count();
    port.device_write(0x10, &[5, 5, 5, 5]);

    // the exhausted window cannot serve cached data again; the second read
    // installs a fresh window and transacts anew
    assert_eq!(engine.read(0x10, 4).unwrap(), vec![5, 5, 5, 5]);
    assert!(port.transaction_count() > transactions);
}

#[test]
fn test_oversize_requests_are_rejected_without_touching_hardware() {
    let port = SimulatedPort::new(PortKind::Standard);
    let engine = armed_engine(&port);
    let transactions = port.transaction_count();

    assert_eq!(
        engine.write(0x00, &[0u8; 27]),
        Err(I2cError::WriteTooLarge { requested: 27, max: 26 })
    );
    assert_eq!(
        engine.read(0x00, 27).unwrap_err(),
        I2cError::WindowTooLarge { requested: 27, max: 26 }
    );

    thread::sleep(Duration::from_millis(20));
    assert_eq!(port.transaction_count(), transactions);
}

#[test]
fn test_disengage_drains_inflight_operations() {
    let port = SimulatedPort::new(PortKind::Standard);
    port.device_write(0x00, &[1, 2, 3, 4]);
    let engine = Arc::new(armed_engine(&port));
    engine.set_read_window(&window(0x00, 4, ReadMode::Repeat));
    assert_eq!(engine.read(0x00, 4).unwrap(), vec![1, 2, 3, 4]);

    let started = Arc::new(Barrier::new(2));
    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let engine = engine.clone();
        let started = started.clone();
        let done = done.clone();
        thread::spawn(move || {
            started.wait();
            let data = engine.read(0x00, 4).unwrap();
            done.store(true, Ordering::Release);
            data
        })
    };

    started.wait();
    thread::sleep(Duration::from_millis(2));
    engine.disengage();

    // disengage has drained: the in-flight read has its result
    let mut waited = Duration::ZERO;
    while !done.load(Ordering::Acquire) && waited < Duration::from_millis(10) {
        thread::sleep(Duration::from_millis(1));
        waited += Duration::from_millis(1);
    }
    assert!(done.load(Ordering::Acquire));
    assert_eq!(reader.join().unwrap().len(), 4);
    assert!(!engine.is_engaged());

    // the port is unbound now; reads degrade instead of touching the device
    assert_eq!(engine.read(0x00, 4).unwrap(), vec![0, 0, 0, 0]);
    assert_eq!(engine.health_status(), HealthStatus::Unhealthy);
}

#[test]
fn test_callbacks_ending_mid_read_degrades_to_fake_data() {
    let port = SimulatedPort::new(PortKind::Standard);
    port.device_write(0x40, &[1, 2, 3, 4]);
    let engine = Arc::new(armed_engine(&port));
    engine.set_read_window(&window(0x40, 4, ReadMode::Repeat));
    assert_eq!(engine.read(0x40, 4).unwrap(), vec![1, 2, 3, 4]);

    // stop ready callbacks so the next read's window is never serviced and
    // the reader stays blocked
    port.deregister_ready_callback();
    let reader = {
        let engine = engine.clone();
        thread::spawn(move || engine.read(0x10, 2).unwrap())
    };
    thread::sleep(Duration::from_millis(20));

    // ending the session drains the blocked reader by fabrication; the data
    // on hand belongs to the old window, so the reader must get fake data,
    // not a panic or a misread
    port.disarm();
    assert_eq!(reader.join().unwrap(), vec![0, 0]);
    assert_eq!(engine.health_status(), HealthStatus::Unhealthy);
}

#[test]
fn test_heartbeat_prefers_reread_when_port_is_in_read_mode() {
    let port = SimulatedPort::new(PortKind::Standard);
    port.device_write(0x10, &[3, 4]);

    init_tracing();
    let engine = I2cEngineBuilder::new(port.clone(), addr())
        .tag("hb")
        .heartbeat(Duration::from_millis(40), HeartbeatAction::refresh_last_transaction())
        .build();
    port.arm();
    engine.engage();

    // leave the port in write mode first, then put it in read mode with a
    // one-shot read that goes quiet afterwards
    engine.write8(0x20, 0x11).unwrap();
    engine.set_read_window(&window(0x10, 2, ReadMode::OnlyOnce));
    assert_eq!(engine.read(0x10, 2).unwrap(), vec![3, 4]);

    thread::sleep(Duration::from_millis(10));
    let transactions = port.transaction_count();
    let write_enables = port.write_mode_enables();
    let read_enables = port.read_mode_enables();

    thread::sleep(Duration::from_millis(150));

    // heartbeats re-fired the last read: transactions grew with no new mode
    // switches in either direction
    assert!(port.transaction_count() > transactions);
    assert_eq!(port.write_mode_enables(), write_enables);
    assert_eq!(port.read_mode_enables(), read_enables);
}

#[test]
fn test_heartbeat_window_reads_keep_device_polled() {
    let port = SimulatedPort::new(PortKind::Standard);
    port.device_write(0x30, &[0xaa, 0xbb]);

    init_tracing();
    let engine = I2cEngineBuilder::new(port.clone(), addr())
        .tag("hb-window")
        .heartbeat(
            Duration::from_millis(30),
            HeartbeatAction::read_window(window(0x30, 2, ReadMode::OnlyOnce)),
        )
        .history_capacity(8)
        .build();
    port.arm();
    engine.engage();

    thread::sleep(Duration::from_millis(150));

    let history = engine.read_history();
    assert!(!history.is_empty());
    assert!(history.iter().all(|entry| entry.register == 0x30));
    assert_eq!(history[0].data.as_slice(), &[0xaa, 0xbb]);
}

#[test]
fn test_history_retains_most_recent_reads_in_order() {
    let port = SimulatedPort::new(PortKind::Standard);
    for register in 0u8..6 {
        port.device_write(register, &[register + 100]);
    }
    let engine = armed_engine(&port);
    engine.set_history_capacity(3);

    for register in 0u8..6 {
        assert_eq!(engine.read8(register).unwrap(), register + 100);
    }

    let registers: Vec<u8> = engine.read_history().iter().map(|d| d.register).collect();
    assert_eq!(registers, vec![3, 4, 5]);
    assert_eq!(engine.history_capacity(), 3);
}

#[test]
fn test_adjacent_writes_coalesce_while_cache_is_dirty() {
    let port = SimulatedPort::new(PortKind::Standard);
    init_tracing();
    let engine = I2cEngineBuilder::new(port.clone(), addr())
        .write_coalescing(true)
        .build();

    // engaged but the module is not delivering yet, so the first write sits
    // dirty and the rest must merge into it
    engine.engage();
    engine.write8_with_control(0x40, 1, WaitControl::None).unwrap();
    engine.write8_with_control(0x41, 2, WaitControl::None).unwrap();
    engine.write8_with_control(0x3f, 9, WaitControl::None).unwrap();

    assert_eq!(port.write_cache(), vec![9, 1, 2]);
}

#[test]
fn test_pretending_module_degrades_reads_and_drops_writes() {
    let port = SimulatedPort::new(PortKind::Standard);
    port.device_write(0x10, &[7, 7]);

    init_tracing();
    let engine = I2cEngineBuilder::new(port.clone(), addr()).build();
    port.pretend();
    engine.engage();

    assert_eq!(engine.read(0x10, 2).unwrap(), vec![0, 0]);
    assert_eq!(engine.health_status(), HealthStatus::Unhealthy);

    engine.write8_with_control(0x10, 0x55, WaitControl::Written).unwrap();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(port.device_read(0x10, 2), vec![7, 7]);
}

#[test]
fn test_set_address_survives_and_rebinds() {
    let port = SimulatedPort::new(PortKind::Standard);
    port.device_write(0x00, &[0x77]);
    let engine = armed_engine(&port);
    assert_eq!(engine.read8(0x00).unwrap(), 0x77);

    let new_address = I2cAddress::from_7bit(0x29).unwrap();
    engine.set_address(new_address);
    assert_eq!(engine.address(), new_address);
    assert!(engine.is_engaged());

    // still operational on the new address
    assert_eq!(engine.read8(0x00).unwrap(), 0x77);
}

#[test]
fn test_close_is_idempotent_and_terminal() {
    let port = SimulatedPort::new(PortKind::Standard);
    let engine = armed_engine(&port);
    assert!(engine.is_armed());

    engine.close();
    engine.close();
    assert_eq!(engine.health_status(), HealthStatus::Closed);
    assert!(!engine.is_engaged());
    assert!(!engine.is_armed());

    // operations after close degrade, and health stays closed
    assert_eq!(engine.read8(0x00).unwrap(), 0);
    assert_eq!(engine.health_status(), HealthStatus::Closed);
}

#[test]
fn test_windowed_reads_match_device_memory() {
    let port = SimulatedPort::new(PortKind::Standard);
    let mut image = [0u8; 16];
    rand::thread_rng().fill(&mut image);
    port.device_write(0x40, &image);
    let engine = armed_engine(&port);

    engine.set_read_window(&window(0x40, 16, ReadMode::Repeat));
    let mut rng = rand::thread_rng();
    for _ in 0..32 {
        let offset = rng.gen_range(0..16usize);
        let count = rng.gen_range(1..=16 - offset);
        let data = engine.read(0x40 + offset as u8, count).unwrap();
        assert_eq!(data, image[offset..offset + count].to_vec());
    }
}

#[test]
fn test_read_timestamped_windowed_installs_given_window() {
    let port = SimulatedPort::new(PortKind::Standard);
    port.device_write(0x08, &[1, 2, 3, 4, 5, 6]);
    let engine = armed_engine(&port);

    let data = engine
        .read_timestamped_windowed(
            0x0a,
            2,
            &window(0x0a, 2, ReadMode::Repeat),
            &window(0x08, 6, ReadMode::Repeat),
        )
        .unwrap();
    assert_eq!(data.register, 0x0a);
    assert_eq!(data.data.as_slice(), &[3, 4]);

    let installed = engine.read_window().unwrap();
    assert_eq!(installed.first_register(), 0x08);
    assert_eq!(installed.register_count(), 6);
}
