//! Integration tests for the recovery engine: presumed abort, commit
//! completion after a crash, in-flight skipping and failed-resource healing.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{MockProducer, MockXaResource};
use tandem_tm::{
    ResourceProducer, ServiceContext, TransactionManager, TxStatus, Uid, UidGenerator, Xid,
};

fn names(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

struct Fixture {
    _dir: TempDir,
    manager: Arc<TransactionManager>,
    services: Arc<ServiceContext>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = common::test_config(&dir).build().unwrap();
    let services = ServiceContext::new(config);
    services.journal().open().unwrap();
    let manager = TransactionManager::new(Arc::clone(&services));
    Fixture {
        _dir: dir,
        manager,
        services,
    }
}

/// Generates three branch Xids sharing one fresh gtrid owned by this node.
fn three_branches(generator: &UidGenerator) -> (Uid, Vec<Xid>) {
    let gtrid = generator.generate_uid();
    let xids = (0..3).map(|_| generator.generate_xid(&gtrid)).collect();
    (gtrid, xids)
}

#[tokio::test]
async fn test_presumed_abort_on_restart() {
    let fixture = fixture();
    let log = common::new_event_log();
    let resource = MockXaResource::new("mock-rm", Arc::clone(&log));
    let producer = MockProducer::new("mock-rm", Arc::clone(&resource));
    fixture.services.registry().register(producer).unwrap();

    let (_gtrid, xids) = three_branches(fixture.services.uid_generator());
    for xid in xids {
        resource.add_in_doubt_xid(xid);
    }

    // empty journal: every in-doubt branch is presumed aborted
    let result = fixture.manager.run_recovery().await;

    assert_eq!(result.committed_count(), 0);
    assert_eq!(result.rolledback_count(), 3);
    assert!(result.completion_error().is_none());
    assert_eq!(resource.in_doubt_count(), 0);
    assert_eq!(resource.rolled_back().len(), 3);
}

#[tokio::test]
async fn test_commit_completion_after_crash() {
    let fixture = fixture();
    let log = common::new_event_log();
    let resource = MockXaResource::new("mock-rm", Arc::clone(&log));
    let producer = MockProducer::new("mock-rm", Arc::clone(&resource));
    fixture.services.registry().register(producer).unwrap();

    let journal = fixture.services.journal();
    let generator = fixture.services.uid_generator();
    for _ in 0..3 {
        let gtrid = generator.generate_uid();
        resource.add_in_doubt_xid(generator.generate_xid(&gtrid));
        journal
            .log(TxStatus::Committing, &gtrid, &names(&["mock-rm"]))
            .unwrap();
    }

    let result = fixture.manager.run_recovery().await;

    assert_eq!(result.committed_count(), 3);
    assert_eq!(result.rolledback_count(), 0);
    assert_eq!(resource.in_doubt_count(), 0);
    assert_eq!(resource.committed().len(), 3);
    // recovery wrote the matching terminal records
    assert!(journal.collect_dangling_records().unwrap().is_empty());
}

#[tokio::test]
async fn test_in_flight_transaction_is_skipped() {
    let fixture = fixture();
    let log = common::new_event_log();
    let resource = MockXaResource::new("mock-rm", Arc::clone(&log));
    let producer = MockProducer::new("mock-rm", Arc::clone(&resource));
    fixture.services.registry().register(producer).unwrap();

    let generator = fixture.services.uid_generator();

    // a gtrid older than any in-flight transaction: plain crash leftover
    let old_gtrid = generator.generate_uid();
    let old_xid = generator.generate_xid(&old_gtrid);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let transaction = fixture.manager.begin().await.unwrap();

    // an in-doubt branch of the transaction this process is driving right now
    let live_xid = generator.generate_xid(transaction.gtrid());

    resource.add_in_doubt_xid(old_xid);
    resource.add_in_doubt_xid(live_xid.clone());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let result = fixture.manager.run_recovery().await;

    assert_eq!(result.rolledback_count(), 1);
    assert_eq!(resource.in_doubt_count(), 1);
    assert_eq!(resource.rolled_back().len(), 1);
    assert_ne!(&resource.rolled_back()[0], &live_xid);

    // once the transaction completes, the branch is fair game
    fixture.manager.commit(&transaction).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let result = fixture.manager.run_recovery().await;
    assert_eq!(result.rolledback_count(), 1);
    assert_eq!(resource.in_doubt_count(), 0);
}

#[tokio::test]
async fn test_foreign_xids_are_left_untouched() {
    let fixture = fixture();
    let log = common::new_event_log();
    let resource = MockXaResource::new("mock-rm", Arc::clone(&log));
    let producer = MockProducer::new("mock-rm", Arc::clone(&resource));
    fixture.services.registry().register(producer).unwrap();

    let generator = fixture.services.uid_generator();

    // wrong format id: another coordinator's branch
    let foreign_gtrid = generator.generate_uid();
    resource.add_in_doubt_xid(Xid::with_format_id(
        0x0BAD_F00D,
        foreign_gtrid.clone(),
        generator.generate_uid(),
    ));

    // right format id, wrong node
    let other_node = UidGenerator::new("other-node");
    let other_gtrid = other_node.generate_uid();
    resource.add_in_doubt_xid(other_node.generate_xid(&other_gtrid));

    let result = fixture.manager.run_recovery().await;

    assert_eq!(result.committed_count(), 0);
    assert_eq!(result.rolledback_count(), 0);
    assert_eq!(resource.in_doubt_count(), 2);
}

#[tokio::test]
async fn test_failed_resource_stays_registered_and_heals() {
    let fixture = fixture();
    let log = common::new_event_log();
    let resource = MockXaResource::new("flaky-rm", Arc::clone(&log));
    let producer = MockProducer::new("flaky-rm", Arc::clone(&resource));
    fixture
        .services
        .registry()
        .register(Arc::clone(&producer) as Arc<dyn tandem_tm::ResourceProducer>)
        .unwrap();

    let generator = fixture.services.uid_generator();
    let gtrid = generator.generate_uid();
    resource.add_in_doubt_xid(generator.generate_xid(&gtrid));

    // the pool cannot hand out a recovery connection: resource goes failed
    producer.refuse_recovery(true);
    let producer_dyn: Arc<dyn tandem_tm::ResourceProducer> = producer.clone();
    let err = fixture.manager.recover_resource(&producer_dyn).await.unwrap_err();
    assert!(matches!(err, tandem_tm::TransactionError::Recovery(_)));
    assert!(producer.is_failed());
    assert_eq!(fixture.services.registry().len(), 1);

    // next acquisition path retries incremental recovery and heals the flag
    producer.refuse_recovery(false);
    fixture.manager.recover_resource(&producer_dyn).await.unwrap();
    assert!(!producer.is_failed());
    assert_eq!(resource.in_doubt_count(), 0);
    assert_eq!(resource.rolled_back().len(), 1);
}

#[tokio::test]
async fn test_full_pass_reports_scan_failures_but_continues() {
    let fixture = fixture();
    let log = common::new_event_log();

    let broken = MockXaResource::new("broken-rm", Arc::clone(&log));
    broken.fail_recover(true);
    let broken_producer = MockProducer::new("broken-rm", Arc::clone(&broken));

    let healthy = MockXaResource::new("healthy-rm", Arc::clone(&log));
    let generator = fixture.services.uid_generator();
    let gtrid = generator.generate_uid();
    healthy.add_in_doubt_xid(generator.generate_xid(&gtrid));
    let healthy_producer = MockProducer::new("healthy-rm", Arc::clone(&healthy));

    let registry = fixture.services.registry();
    registry.register(Arc::clone(&broken_producer) as _).unwrap();
    registry.register(healthy_producer).unwrap();

    let result = fixture.manager.run_recovery().await;

    assert!(result.completion_error().is_some());
    assert!(broken_producer.is_failed());
    // the healthy resource was still reconciled
    assert_eq!(result.rolledback_count(), 1);
    assert_eq!(healthy.in_doubt_count(), 0);
}
