mod support;

use anyhow::Result;
use image::{Rgb, RgbImage};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lpr_edge::config::AiServiceSettings;
use lpr_edge::frame::Frame;
use lpr_edge::gateway::{GatewayCallbacks, InferenceGateway};
use support::{MockService, Reply, PLATE_BODY};

fn settings(host: String, retry_count: u32) -> AiServiceSettings {
    AiServiceSettings {
        host,
        timeout: Duration::from_secs(2),
        retry_count,
        retry_delay: Duration::from_millis(10),
        ..AiServiceSettings::default()
    }
}

fn frame() -> Frame {
    Frame::new(RgbImage::from_pixel(64, 48, Rgb([90, 110, 130])), "CAM01", 7)
}

#[test]
fn succeeds_after_k_minus_one_failures() -> Result<()> {
    let service = MockService::start(
        vec![Reply::status(500), Reply::status(502)],
        Reply::ok(PLATE_BODY),
    )?;
    let gateway = InferenceGateway::new(settings(service.url(), 3));

    let result = gateway.infer(&frame())?;
    assert_eq!(result.plate_text, "KA01AB1234");
    assert!((result.confidence - 0.92).abs() < 1e-9);
    assert_eq!((result.bbox.x, result.bbox.y), (10, 20));
    assert_eq!((result.bbox.width, result.bbox.height), (100, 40));
    assert_eq!(result.vehicle_type.as_deref(), Some("car"));
    assert_eq!(result.source_id, "CAM01");
    assert_eq!(result.sequence, 7);

    let stats = gateway.stats();
    assert_eq!(stats.failed_requests, 2);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.total_requests, 3);
    assert!(stats.last_success.is_some());
    assert!(gateway.is_healthy());
    assert_eq!(service.infer_calls(), 3);
    Ok(())
}

#[test]
fn exhausted_retries_fail_and_flip_health() -> Result<()> {
    let service = MockService::start(Vec::new(), Reply::status(503))?;
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&transitions);
    let callbacks = GatewayCallbacks {
        on_health_change: Some(Box::new(move |healthy| seen.lock().unwrap().push(healthy))),
        on_error: None,
    };
    let gateway = InferenceGateway::with_callbacks(settings(service.url(), 2), callbacks);
    assert!(gateway.is_healthy(), "construction probe sees a healthy service");

    let err = gateway.infer(&frame()).unwrap_err();
    assert!(format!("{:#}", err).contains("3 attempts"));
    assert!(!gateway.is_healthy());
    assert_eq!(gateway.stats().failed_requests, 3);
    assert_eq!(service.infer_calls(), 3);
    assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
    Ok(())
}

#[test]
fn health_probe_tracks_service() -> Result<()> {
    let service = MockService::healthy_plate_reader()?;
    let gateway = InferenceGateway::new(settings(service.url(), 0));
    assert!(gateway.is_healthy());

    service.set_healthy(false);
    assert!(!gateway.check_health());
    assert!(!gateway.is_healthy());

    service.set_healthy(true);
    assert!(gateway.check_health());
    assert!(service.health_calls() >= 3);
    Ok(())
}

#[test]
fn error_callback_sees_each_failed_attempt() -> Result<()> {
    let service = MockService::start(vec![Reply::status(500)], Reply::ok(PLATE_BODY))?;
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen = Arc::clone(&errors);
    let callbacks = GatewayCallbacks {
        on_health_change: None,
        on_error: Some(Box::new(move |msg| seen.lock().unwrap().push(msg.to_string()))),
    };
    let gateway = InferenceGateway::with_callbacks(settings(service.url(), 1), callbacks);

    gateway.infer(&frame())?;
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("HTTP 500"));
    Ok(())
}

#[test]
fn slow_service_times_out() -> Result<()> {
    let service = MockService::start(
        Vec::new(),
        Reply::ok(PLATE_BODY).delayed(Duration::from_millis(800)),
    )?;
    let mut cfg = settings(service.url(), 0);
    cfg.timeout = Duration::from_millis(200);
    let gateway = InferenceGateway::new(cfg);

    assert!(gateway.infer(&frame()).is_err());
    assert_eq!(gateway.stats().failed_requests, 1);
    Ok(())
}
