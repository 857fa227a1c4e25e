use chrono::{Local, TimeDelta};
use imagegen_gateway::clock::{Clock, ManualClock};
use imagegen_gateway::rate_limit::{
    Admission, AdmissionController, AdmissionLimits, ClientFingerprint, LimitReason, RequestMeta,
};
use std::sync::Arc;
use std::thread;

fn controller(minute: Option<u32>, hour: Option<u32>) -> (Arc<AdmissionController>, ManualClock) {
    let clock = ManualClock::new(Local::now());
    let limits = AdmissionLimits::new(minute, hour).unwrap();
    (Arc::new(AdmissionController::new(true, limits, Arc::new(clock.clone()))), clock)
}

fn browser(ip: &str) -> RequestMeta {
    RequestMeta::new(None, ip, "Mozilla/5.0 (X11; Linux x86_64)")
}

#[test]
fn test_minute_limit_plus_one_is_denied() {
    let (ctl, clock) = controller(Some(10), Some(100));
    let client = browser("198.51.100.1");

    for i in 0..10 {
        assert!(ctl.admit(&client).is_allowed(), "request {i} should pass");
        clock.advance(TimeDelta::seconds(1));
    }
    assert_eq!(ctl.admit(&client), Admission::Denied(LimitReason::PerMinute));

    // 61s after the first request that hit has slid out
    clock.set(clock.now() - TimeDelta::seconds(10) + TimeDelta::seconds(61));
    assert!(ctl.admit(&client).is_allowed());
}

#[test]
fn test_hour_denial_only_when_minute_passes() {
    let (ctl, clock) = controller(Some(5), Some(8));
    let client = browser("198.51.100.2");

    for _ in 0..5 {
        assert!(ctl.admit(&client).is_allowed());
    }
    clock.advance(TimeDelta::seconds(1));
    assert_eq!(ctl.admit(&client).reason(), Some(LimitReason::PerMinute));

    clock.advance(TimeDelta::seconds(61));
    for _ in 0..3 {
        assert!(ctl.admit(&client).is_allowed());
    }
    assert_eq!(ctl.admit(&client).reason(), Some(LimitReason::PerHour));

    clock.advance(TimeDelta::hours(1));
    assert!(ctl.admit(&client).is_allowed());
}

#[test]
fn test_minute_reported_when_both_horizons_full() {
    let (ctl, _clock) = controller(Some(3), Some(3));
    let client = browser("198.51.100.3");

    for _ in 0..3 {
        ctl.admit(&client);
    }
    assert_eq!(ctl.admit(&client), Admission::Denied(LimitReason::PerMinute));
}

#[test]
fn test_clients_are_isolated() {
    let (ctl, _clock) = controller(Some(2), None);
    let a = browser("10.0.0.1");
    let b = browser("10.0.0.2");
    let a_other_agent = RequestMeta::new(None, "10.0.0.1", "curl/8.0");

    ctl.admit(&a);
    ctl.admit(&a);
    assert!(!ctl.admit(&a).is_allowed());
    assert!(ctl.admit(&b).is_allowed());
    assert!(ctl.admit(&a_other_agent).is_allowed());
    assert_eq!(ctl.snapshot().active_clients, 3);
}

#[test]
fn test_forwarded_chain_identifies_client() {
    let (ctl, _clock) = controller(Some(1), None);
    let via_proxy = RequestMeta::new(Some("203.0.113.9, 10.0.0.1"), "10.0.0.1", "ua");
    let direct = RequestMeta::new(None, "203.0.113.9", "ua");

    assert_eq!(ClientFingerprint::from_meta(&via_proxy), ClientFingerprint::from_meta(&direct));
    assert!(ctl.admit(&via_proxy).is_allowed());
    assert!(!ctl.admit(&direct).is_allowed());
}

#[test]
fn test_concurrent_admits_respect_limit() {
    let (ctl, _clock) = controller(Some(25), Some(100));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ctl = Arc::clone(&ctl);
            thread::spawn(move || {
                let client = browser("192.0.2.50");
                (0..10).filter(|_| ctl.admit(&client).is_allowed()).count()
            })
        })
        .collect();

    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(admitted, 25);
}

#[test]
fn test_sweep_bounds_memory() {
    let (ctl, clock) = controller(Some(10), Some(100));
    for i in 0..50 {
        ctl.admit(&browser(&format!("10.1.0.{i}")));
    }
    assert_eq!(ctl.snapshot().active_clients, 50);

    clock.advance(TimeDelta::minutes(10));
    assert_eq!(ctl.sweep().remaining, 50);

    clock.advance(TimeDelta::minutes(51));
    let stats = ctl.sweep();
    assert_eq!(stats.evicted, 50);
    assert_eq!(ctl.snapshot().active_clients, 0);
}
