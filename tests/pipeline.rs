//! Blackbox pipeline test: decode JSON frames, classify them against an
//! in-memory taxonomy and customer directory, and aggregate the derived
//! presence pings. No live store or cache is involved; the store-facing SQL
//! is covered by the unit tests in the store modules.

use std::sync::Arc;

use metrika::customers::{Customer, CustomerDirectory};
use metrika::identity::{self, IdentityResolver};
use metrika::ingest::frame::parse_frame;
use metrika::ingest::{Classifier, ClassifyError};
use metrika::presence::{PresenceAggregator, PresencePing};
use metrika::store::presence::PresenceStore;
use metrika::taxonomy::{MetricContextType, MetricTypeRow, TaxonomyRegistry};

/// 2023-11-14T22:13:20Z.
const BASE_MS: i64 = 1_700_000_000_000;

fn metric_type(id: u32, name: &str, contexts: &[(u32, &str)]) -> MetricTypeRow {
    MetricTypeRow {
        id,
        name: name.to_string(),
        contexts: contexts
            .iter()
            .map(|(cid, cname)| MetricContextType {
                id: *cid,
                name: cname.to_string(),
            })
            .collect(),
    }
}

fn registry() -> Arc<TaxonomyRegistry> {
    let registry = TaxonomyRegistry::new();
    registry.set_all(vec![
        metric_type(1, "MSG", &[(10, "TEXT"), (11, "IMAGE")]),
        metric_type(2, "GROUP_MSG", &[(12, "TEXT")]),
        metric_type(3, "VOIP_CALL", &[(20, "RINGING"), (21, "VOIP")]),
        metric_type(4, "DURATION_VOIP_CALL", &[(22, "END")]),
    ]);
    Arc::new(registry)
}

fn directory() -> Arc<CustomerDirectory> {
    let dir = CustomerDirectory::new();
    dir.set_all(vec![
        Customer {
            id: 100,
            prefix: "am".to_string(),
        },
        Customer {
            id: 200,
            prefix: "ru".to_string(),
        },
    ]);
    Arc::new(dir)
}

fn classifier() -> Classifier {
    Classifier::new(
        registry(),
        directory(),
        Arc::new(IdentityResolver::new(None)),
    )
}

fn aggregator() -> PresenceAggregator {
    let pool = clickhouse_rs::Pool::new("tcp://localhost:9000/test");
    let store = Arc::new(PresenceStore::new(pool, "test".to_string(), None));
    PresenceAggregator::new(directory(), store)
}

fn msg_frame(from: &str, at_ms: i64) -> String {
    format!(
        r#"{{"from": "{from}", "to": "am37455900000", "time": {at_ms},
            "kind": "MSG", "contextType": "TEXT"}}"#
    )
}

fn ping_from_frame(text: &str) -> PresencePing {
    let packet = parse_frame(text).expect("valid frame");
    let (prefix, local_number) = identity::split(packet.sender());
    PresencePing {
        tenant_prefix: prefix,
        username: local_number,
        created_at_ms: packet.timestamp_ms(),
        network: packet.network(),
    }
}

#[tokio::test]
async fn classifies_the_four_label_shapes() {
    let classifier = classifier();

    let msg = classifier
        .classify_frame(&msg_frame("am37455909314", BASE_MS))
        .await
        .expect("plain message");
    assert_eq!(msg.metric_type_id, 1);
    assert_eq!(msg.metric_context_type_id, 10);
    assert_eq!(msg.value, 1);

    let group = classifier
        .classify_frame(&format!(
            r#"{{"from": "am37455909314", "time": {BASE_MS}, "kind": "MSG",
                "group": true, "contextType": "TEXT"}}"#
        ))
        .await
        .expect("group message");
    assert_eq!(group.metric_type_id, 2);
    assert_eq!(group.metric_context_type_id, 12);

    let ringing = classifier
        .classify_frame(&format!(
            r#"{{"from": "am37455909314", "time": {BASE_MS}, "kind": "CALL",
                "contextType": "VOIP", "meta": {{"action": "RINGING"}}}}"#
        ))
        .await
        .expect("ringing call");
    assert_eq!(ringing.metric_type_id, 3);
    assert_eq!(ringing.metric_context_type_id, 20);
    assert_eq!(ringing.value, 1);

    let ended = classifier
        .classify_frame(&format!(
            r#"{{"from": "am37455909314", "time": {BASE_MS}, "kind": "CALL",
                "contextType": "VOIP",
                "meta": {{"action": "END", "duration": 42, "network": 7}}}}"#
        ))
        .await
        .expect("ended call");
    assert_eq!(ended.metric_type_id, 4);
    assert_eq!(ended.metric_context_type_id, 22);
    assert_eq!(ended.value, 42);
    assert_eq!(ended.network_id, Some(7));
}

#[tokio::test]
async fn classified_events_carry_attribution() {
    let classifier = classifier();

    let event = classifier
        .classify_frame(&msg_frame("am37455909314", BASE_MS))
        .await
        .expect("classifies");

    assert_eq!(event.customer_id, 100);
    assert_eq!(event.sender_local_id, "37455909314");
    assert_eq!(event.timestamp_secs, BASE_MS / 1000);
    assert!(!event.region_code.is_empty());

    let other = classifier
        .classify_frame(&msg_frame("ru37455909314", BASE_MS))
        .await
        .expect("classifies");
    assert_eq!(other.customer_id, 200);
}

#[tokio::test]
async fn drop_policies_match_the_error_origin() {
    let classifier = classifier();

    // Missing sender: unattributable, silent.
    let err = classifier
        .classify_frame(r#"{"kind": "MSG", "contextType": "TEXT"}"#)
        .await
        .unwrap_err();
    assert!(err.is_silent());

    // Unknown tenant prefix: unattributable, silent.
    let err = classifier
        .classify_frame(&msg_frame("xy37455909314", BASE_MS))
        .await
        .unwrap_err();
    assert!(matches!(err, ClassifyError::UnknownTenant { .. }));
    assert!(err.is_silent());

    // Taxonomy skew: dropped but logged.
    let err = classifier
        .classify_frame(&format!(
            r#"{{"from": "am37455909314", "time": {BASE_MS}, "kind": "CALL",
                "contextType": "VIDEO", "meta": {{"action": "RINGING"}}}}"#
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ClassifyError::UnknownMetric(_)));
    assert!(!err.is_silent());
}

#[tokio::test]
async fn registry_replacement_changes_classification_atomically() {
    let registry = registry();
    let classifier = Classifier::new(
        Arc::clone(&registry),
        directory(),
        Arc::new(IdentityResolver::new(None)),
    );

    let frame = msg_frame("am37455909314", BASE_MS);
    assert!(classifier.classify_frame(&frame).await.is_ok());

    // Full replace without MSG: the old type becomes unreachable.
    registry.set_all(vec![metric_type(3, "VOIP_CALL", &[(20, "RINGING")])]);
    let err = classifier.classify_frame(&frame).await.unwrap_err();
    assert!(matches!(err, ClassifyError::UnknownMetric(_)));
}

#[test]
fn frames_become_presence_pings_and_bucket_by_day() {
    let aggregator = aggregator();

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;
    let pings = vec![
        ping_from_frame(&msg_frame("am37455909314", BASE_MS)),
        ping_from_frame(&msg_frame("am37455900000", BASE_MS + 60_000)),
        ping_from_frame(&msg_frame("am37455909314", BASE_MS + DAY_MS)),
        ping_from_frame(&msg_frame("ru37455909314", BASE_MS)),
        // Unknown tenant prefix is skipped by aggregation.
        ping_from_frame(&msg_frame("xy37455909314", BASE_MS)),
    ];

    let batch = aggregator.aggregate(&pings, false);

    assert_eq!(batch.daily.len(), 3);
    let same_day = batch
        .daily
        .iter()
        .find(|row| row.customer_id == 100 && row.count == 2)
        .expect("two same-day pings for the first customer");
    assert_eq!(same_day.network_id, None);
    assert_eq!(batch.instances.len(), 4);
}

#[test]
fn network_scoped_aggregation_filters_and_keys_by_network() {
    let aggregator = aggregator();

    let with_network = format!(
        r#"{{"from": "am37455909314", "time": {BASE_MS}, "kind": "CALL",
            "contextType": "VOIP", "meta": {{"action": "RINGING", "network": 7}}}}"#
    );
    let pings = vec![
        ping_from_frame(&with_network),
        ping_from_frame(&with_network),
        ping_from_frame(&msg_frame("am37455909314", BASE_MS)),
    ];

    let batch = aggregator.aggregate(&pings, true);

    assert_eq!(batch.daily.len(), 1);
    assert_eq!(batch.daily[0].count, 2);
    assert_eq!(batch.daily[0].network_id, Some(7));
    assert_eq!(batch.instances.len(), 2);

    // The overall batch over the same pings keeps all three.
    let overall = aggregator.aggregate(&pings, false);
    assert_eq!(overall.daily.len(), 1);
    assert_eq!(overall.daily[0].count, 3);
}

#[test]
fn redelivered_frames_double_count_presence() {
    let aggregator = aggregator();

    let frame = msg_frame("am37455909314", BASE_MS);
    let once = aggregator.aggregate(&[ping_from_frame(&frame)], false);
    let twice = aggregator.aggregate(
        &[ping_from_frame(&frame), ping_from_frame(&frame)],
        false,
    );

    assert_eq!(once.daily[0].count, 1);
    assert_eq!(twice.daily[0].count, 2);
    assert_eq!(twice.instances.len(), 2);
}
