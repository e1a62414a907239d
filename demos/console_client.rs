// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Console client exercising the whole service stack against the in-memory
//! transport: a simulated Polar H10 streams heart-rate notifications from a
//! background thread while the main loop ticks the service, lists sensors
//! and prints the latest heart rate and HRV statistics.

use anyhow::Result;
use pulseplug::api::{HrvFilter, HrvFilters, SensorCaps};
use pulseplug::sensors::polar::{PMD_CONTROL_POINT, PMD_DATA, PMD_SERVICE};
use pulseplug::sensors::{
    HEART_RATE_CONTROL_POINT, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE,
};
use pulseplug::service::{Service, ServiceEvent, ServiceListener, ServiceSettings};
use pulseplug::transport::mock::{characteristic, service, MockPeripheral, MockTransport};
use pulseplug::transport::{CharPropFlags, GattProfile, PeripheralEntry};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct PrintListener;

impl ServiceListener for PrintListener {
    fn handle_event(&mut self, event: &ServiceEvent) {
        println!("event: {:?}", event);
    }
}

fn simulated_h10(transport: &MockTransport) -> MockPeripheral {
    let profile = GattProfile {
        services: vec![
            service(
                HEART_RATE_SERVICE,
                vec![
                    characteristic(
                        HEART_RATE_SERVICE,
                        HEART_RATE_MEASUREMENT,
                        CharPropFlags::NOTIFY,
                    ),
                    characteristic(
                        HEART_RATE_SERVICE,
                        HEART_RATE_CONTROL_POINT,
                        CharPropFlags::WRITE,
                    ),
                ],
            ),
            service(
                PMD_SERVICE,
                vec![
                    characteristic(
                        PMD_SERVICE,
                        PMD_CONTROL_POINT,
                        CharPropFlags::READ | CharPropFlags::WRITE | CharPropFlags::INDICATE,
                    ),
                    characteristic(PMD_SERVICE, PMD_DATA, CharPropFlags::NOTIFY),
                ],
            ),
        ],
    };

    let entry = PeripheralEntry {
        path: "mock/polar-h10".to_string(),
        unique_id: "mock-h10-0".to_string(),
        friendly_name: "Polar H10 DEMO".to_string(),
        address: [0x7c, 0xd7, 0x3f, 0x00, 0x00, 0x42].into(),
        services: vec![HEART_RATE_SERVICE, PMD_SERVICE],
    };

    let peripheral = transport.add_peripheral(entry, profile);
    // Feature read: ECG and ACC supported, like a real H10.
    peripheral.set_read_value(PMD_CONTROL_POINT, vec![0x0f, 0x05, 0x00]);
    peripheral.set_write_responder(PMD_CONTROL_POINT, |request| {
        vec![
            0xf0,
            request.first().copied().unwrap_or(0),
            request.get(1).copied().unwrap_or(0),
            0x00,
        ]
    });
    peripheral
}

/// Emit a Heart Rate Measurement notification with one jittered RR interval.
fn notify_heart_beat(peripheral: &MockPeripheral) {
    let mut rng = rand::rng();
    let rr: u16 = 900 + rng.random_range(0..120);
    let bpm = (60_000 / rr as u32) as u8;

    // Flags: contact detected + supported, RR intervals present.
    let mut payload = vec![0x16, bpm];
    payload.extend_from_slice(&rr.to_le_bytes());
    peripheral.notify(HEART_RATE_MEASUREMENT, &payload);
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let transport = MockTransport::new();
    let peripheral = simulated_h10(&transport);

    let config_dir = std::env::temp_dir().join("pulseplug-demo");
    let settings = ServiceSettings::new(Arc::new(transport.clone()), &config_dir)
        .with_log_level(log::LevelFilter::Info);
    let mut service = Service::initialize(settings)?;
    service.set_listener(Box::new(PrintListener));
    println!("pulseplug v{}", service.version());

    // First tick discovers the simulated strap.
    service.update();
    for sensor in &service.sensor_list().sensors {
        println!("found {}", sensor);
    }

    service.set_active_sensor_data_streams(
        0,
        SensorCaps::HEART_RATE,
        HrvFilters::SDNN | HrvFilters::RMSSD,
    )?;

    // Heart beats arrive on their own thread, like a transport would
    // deliver them.
    let running = Arc::new(AtomicBool::new(true));
    let beat_thread = {
        let running = Arc::clone(&running);
        let peripheral = peripheral.clone();
        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                notify_heart_beat(&peripheral);
                thread::sleep(Duration::from_millis(250));
            }
        })
    };

    for _ in 0..20 {
        service.update();

        if let Some(sensor) = service.sensor_list().sensors.first() {
            let sdnn = service
                .heart_hrv_buffer(sensor.sensor_id, HrvFilter::Sdnn)
                .ok()
                .and_then(|mut iter| {
                    let mut last = None;
                    while iter.is_valid() {
                        last = iter.hrv_data().map(|f| f.hrv_value);
                        iter.next();
                    }
                    last
                });
            println!(
                "hr: {:>3} bpm   sdnn: {}",
                sensor.beats_per_minute,
                sdnn.map(|v| format!("{:6.2} ms", v))
                    .unwrap_or_else(|| "   n/a".to_string()),
            );
        }

        thread::sleep(Duration::from_millis(250));
    }

    running.store(false, Ordering::Release);
    beat_thread.join().expect("beat thread panicked");
    service.shutdown();
    Ok(())
}
