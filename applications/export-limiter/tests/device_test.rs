use chrono::Utc;
use export_limiter::config::REG_EXPORT_LIMIT;
use export_limiter::device::{spawn_device, DeviceHandle};
use export_limiter::price::PriceSample;
use export_limiter::surface::{apply_command, Command};
use export_limiter::LinkError;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

mod test_helpers;
use test_helpers::*;

struct Running {
    handle: DeviceHandle,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Running {
    fn start(link: &FakeLink, automation: bool) -> Self {
        let cfg = device_config("garage", automation, 0);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let handle = spawn_device(&cfg, link.clone(), cancel.clone(), &mut tasks);
        Self {
            handle,
            cancel,
            tasks,
        }
    }

    async fn stop(mut self) {
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
    }
}

#[tokio::test(start_paused = true)]
async fn test_price_decision_waits_for_next_poll() {
    let link = FakeLink::inverter(5000, 5000);
    let dev = Running::start(&link, true);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(link.device().connects, 1);
    assert!(link.writes().is_empty());
    assert!(dev.handle.reports.borrow().available);

    dev.handle.offer_price(PriceSample::new(-2.0, Utc::now()));
    sleep(Duration::from_secs(10)).await;

    // decision committed, but price updates never touch the field bus
    assert!(link.writes().is_empty());
    {
        let report = dev.handle.reports.borrow();
        assert!(report.price_curtail);
        assert_eq!(report.current_price, Some(-2.0));
    }

    sleep(Duration::from_secs(50)).await;
    assert_eq!(link.writes(), vec![(REG_EXPORT_LIMIT, 0)]);
    let report = dev.handle.reports.borrow().clone();
    assert_eq!(report.export_limit_w, Some(0));
    assert_eq!(report.grid_max_w, Some(5000));
    assert_eq!(report.curtailed, Some(true));
    assert!(report.write_performed);

    dev.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reverted_price_spike_never_writes() {
    let link = FakeLink::inverter(5000, 5000);
    let dev = Running::start(&link, true);
    sleep(Duration::from_secs(1)).await;

    dev.handle.offer_price(PriceSample::new(8.0, Utc::now()));
    sleep(Duration::from_secs(10)).await;
    dev.handle.offer_price(PriceSample::new(-2.0, Utc::now()));
    sleep(Duration::from_secs(2)).await;
    dev.handle.offer_price(PriceSample::new(4.0, Utc::now()));
    sleep(Duration::from_secs(120)).await;

    assert!(link.writes().is_empty());
    assert!(!dev.handle.reports.borrow().price_curtail);

    dev.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_policy_change_reconciles_immediately() {
    let link = FakeLink::inverter(5000, 5000);
    let dev = Running::start(&link, false);
    sleep(Duration::from_secs(1)).await;
    assert!(link.writes().is_empty());

    assert!(apply_command(&dev.handle.policy, Command::ManualLimit(Some(2000))));
    sleep(Duration::from_secs(1)).await;

    assert_eq!(link.writes(), vec![(REG_EXPORT_LIMIT, 2000)]);
    let report = dev.handle.reports.borrow().clone();
    assert_eq!(report.manual_limit_w, Some(2000));
    assert!(!report.automation_enabled);
    assert_eq!(report.export_limit_w, Some(2000));
    assert_eq!(report.curtailed, Some(true));

    dev.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_device_goes_unavailable_and_heals() {
    let link = FakeLink::inverter(5000, 5000);
    let dev = Running::start(&link, true);
    sleep(Duration::from_secs(1)).await;

    link.fail_all_reads(Some(LinkError::Connection("no route to host".into())));
    sleep(Duration::from_secs(120)).await;
    {
        // two failed polls, still under the threshold of three
        let report = dev.handle.reports.borrow();
        assert_eq!(report.consecutive_failures, 2);
        assert!(report.available);
        assert_eq!(report.export_limit_w, Some(5000));
    }

    sleep(Duration::from_secs(60)).await;
    {
        let report = dev.handle.reports.borrow();
        assert_eq!(report.consecutive_failures, 3);
        assert!(!report.available);
        assert!(report.last_error.as_deref().unwrap().contains("no route to host"));
    }

    link.fail_all_reads(None);
    sleep(Duration::from_secs(60)).await;
    {
        let report = dev.handle.reports.borrow();
        assert!(report.available);
        assert_eq!(report.last_error, None);
    }
    assert!(link.writes().is_empty());

    dev.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_device_never_read_stays_available_until_threshold() {
    let link = FakeLink::inverter(5000, 5000);
    link.fail_all_reads(Some(LinkError::Timeout(Duration::from_secs(10))));
    let dev = Running::start(&link, true);

    sleep(Duration::from_secs(2)).await;
    {
        let report = dev.handle.reports.borrow();
        assert_eq!(report.consecutive_failures, 1);
        assert!(report.available);
        assert_eq!(report.export_limit_w, None);
    }

    sleep(Duration::from_secs(60)).await;
    {
        let report = dev.handle.reports.borrow();
        assert_eq!(report.consecutive_failures, 2);
        assert!(report.available);
    }

    sleep(Duration::from_secs(60)).await;
    {
        let report = dev.handle.reports.borrow();
        assert_eq!(report.consecutive_failures, 3);
        assert!(!report.available);
    }

    dev.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_price_clears_current_price_only() {
    let link = FakeLink::inverter(5000, 5000);
    let dev = Running::start(&link, true);
    sleep(Duration::from_secs(1)).await;

    dev.handle.offer_price(PriceSample::new(-2.0, Utc::now()));
    sleep(Duration::from_secs(10)).await;
    assert_eq!(dev.handle.reports.borrow().current_price, Some(-2.0));

    dev.handle.price_unavailable();
    sleep(Duration::from_secs(1)).await;
    {
        let report = dev.handle.reports.borrow();
        assert_eq!(report.current_price, None);
        assert!(report.price_curtail);
    }

    // the next poll still acts on the committed decision
    sleep(Duration::from_secs(60)).await;
    assert_eq!(link.writes(), vec![(REG_EXPORT_LIMIT, 0)]);
    assert_eq!(dev.handle.reports.borrow().current_price, None);

    dev.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_in_flight_cycle() {
    let link = FakeLink::inverter(5000, 5000);
    link.respond_after(Duration::from_secs(3600));
    let mut dev = Running::start(&link, true);
    sleep(Duration::from_secs(1)).await;

    dev.cancel.cancel();
    let drained = tokio::time::timeout(Duration::from_secs(20), async {
        while dev.tasks.join_next().await.is_some() {}
    })
    .await;

    assert!(drained.is_ok());
    assert!(link.writes().is_empty());
    assert_eq!(link.device().disconnects, 1);
    assert!(!dev.handle.reports.borrow().available);
}

#[tokio::test(start_paused = true)]
async fn test_devices_do_not_share_state() {
    let healthy = FakeLink::inverter(5000, 5000);
    let broken = FakeLink::inverter(5000, 5000);
    broken.fail_all_reads(Some(LinkError::Timeout(Duration::from_secs(10))));
    let a = Running::start(&healthy, true);
    let b = Running::start(&broken, true);

    a.handle.offer_price(PriceSample::new(-2.0, Utc::now()));
    sleep(Duration::from_secs(61)).await;

    assert_eq!(healthy.writes(), vec![(REG_EXPORT_LIMIT, 0)]);
    assert!(broken.writes().is_empty());
    assert!(!b.handle.reports.borrow().price_curtail);
    assert_eq!(b.handle.reports.borrow().consecutive_failures, 2);

    a.stop().await;
    b.stop().await;
}
