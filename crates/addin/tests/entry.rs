#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use spill_addin::{Addin, AddinConfig};
use spill_core::{Area, RangeRef};
use spill_host::{HostValue, MemHost};

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within deadline");
}

fn started(host: &Arc<MemHost>) -> Arc<Addin> {
    Addin::start(host.clone() as Arc<dyn spill_host::SheetHost>, AddinConfig::default()).unwrap()
}

#[tokio::test]
async fn absent_argument_spills_default_items() {
    let host = Arc::new(MemHost::new());
    let addin = started(&host);
    host.set_caller(RangeRef::single(1, 5, 2));

    let ack = addin.on_request(&HostValue::Missing);
    assert_eq!(ack, HostValue::Text(String::new()));

    wait_until(|| host.set_count() == 2).await;
    assert_eq!(host.formula_at(1, 6, 2).as_deref(), Some("=URTD(\"EUR\")"));
    assert_eq!(host.formula_at(1, 7, 2).as_deref(), Some("=URTD(\"GBP\")"));
    assert_eq!(host.open_temps(), 0);
    addin.shutdown().await;
}

#[tokio::test]
async fn duplicate_request_is_suppressed_and_change_is_not() {
    let host = Arc::new(MemHost::new());
    let addin = started(&host);
    host.set_caller(RangeRef::single(1, 5, 2));

    addin.on_request(&HostValue::Missing);
    wait_until(|| host.set_count() == 2).await;

    // Same origin, same items: nothing new reaches the document.
    addin.on_request(&HostValue::Missing);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.set_count(), 2);
    assert_eq!(addin.pending_jobs(), 0);

    // Changed items from the same origin go through.
    addin.on_request(&HostValue::Text("JPY".into()));
    wait_until(|| host.set_count() == 3).await;
    assert_eq!(host.formula_at(1, 6, 2).as_deref(), Some("=URTD(\"JPY\")"));
    assert_eq!(host.open_temps(), 0);
    addin.shutdown().await;
}

#[tokio::test]
async fn array_argument_coerces_each_cell_in_order() {
    let host = Arc::new(MemHost::new());
    let addin = started(&host);
    host.set_caller(RangeRef::single(2, 0, 0));

    let arg = HostValue::Array {
        rows: 2,
        cols: 2,
        values: vec![
            HostValue::Text("EUR".into()),
            HostValue::Number(7.0),
            HostValue::Missing,
            HostValue::Bool(true),
        ],
    };
    addin.on_request(&arg);

    wait_until(|| host.set_count() == 3).await;
    assert_eq!(host.formula_at(2, 1, 0).as_deref(), Some("=URTD(\"EUR\")"));
    assert_eq!(host.formula_at(2, 2, 0).as_deref(), Some("=URTD(\"7\")"));
    assert_eq!(host.formula_at(2, 3, 0).as_deref(), Some("=URTD(\"TRUE\")"));
    addin.shutdown().await;
}

#[tokio::test]
async fn non_range_caller_is_ignored() {
    let host = Arc::new(MemHost::new());
    let addin = started(&host);
    host.set_caller_value(Some(HostValue::Text("toolbar".into())));

    let ack = addin.on_request(&HostValue::Missing);
    assert_eq!(ack, HostValue::Text(String::new()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.set_count(), 0);
    assert_eq!(addin.pending_jobs(), 0);
    assert_eq!(host.open_temps(), 0);
    addin.shutdown().await;
}

#[tokio::test]
async fn missing_caller_is_ignored() {
    let host = Arc::new(MemHost::new());
    let addin = started(&host);

    addin.on_request(&HostValue::Missing);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.set_count(), 0);
    assert_eq!(host.open_temps(), 0);
    addin.shutdown().await;
}

#[tokio::test]
async fn zero_cell_caller_is_ignored() {
    let host = Arc::new(MemHost::new());
    let addin = started(&host);
    let mut degenerate = RangeRef::single(1, 5, 2);
    degenerate.areas[0] = Area::rect(5, 2, 4, 2);
    host.set_caller(degenerate);

    addin.on_request(&HostValue::Missing);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.set_count(), 0);
    assert_eq!(host.open_temps(), 0);
    addin.shutdown().await;
}

#[tokio::test]
async fn unsafe_document_drops_jobs_but_dedup_still_advances() {
    let host = Arc::new(MemHost::new());
    let addin = started(&host);
    host.set_caller(RangeRef::single(1, 5, 2));
    host.set_safe(false);

    addin.on_request(&HostValue::Missing);
    wait_until(|| addin.pending_jobs() == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.set_count(), 0);
    assert_eq!(host.open_temps(), 0);

    // The request was accepted (and dropped at the gate), so an identical
    // recalculation is suppressed even though nothing was injected.
    addin.on_request(&HostValue::Missing);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.set_count(), 0);
    assert_eq!(addin.pending_jobs(), 0);
    addin.shutdown().await;
}

#[tokio::test]
async fn registration_happens_at_startup_and_shutdown_is_idempotent() {
    let host = Arc::new(MemHost::new());
    let addin = started(&host);

    let specs = host.registered();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].export, "SPILL");
    assert_eq!(specs[0].arg_name, "items");

    addin.shutdown().await;
    addin.shutdown().await;
}
