//! Round-trip tests against a live DoH endpoint.
//!
//! These reach the real dns.google service. Run them explicitly with
//! `cargo test -- --ignored` on a machine with network access.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};

use cloak_dns::{DnsListener, DnsSummary, DnsTransport, DohTransport, QueryStatus};

const TEST_URL: &str = "https://dns.google/dns-query";

fn fallback_ips() -> Vec<String> {
    [
        "8.8.8.8",
        "8.8.4.4",
        "2001:4860:4860::8888",
        "2001:4860:4860::8844",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn query_bytes(id: u16) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(
        Name::from_str("youtube.com.").unwrap(),
        RecordType::A,
    ));
    message.to_vec().unwrap()
}

#[derive(Default)]
struct RecordingListener {
    summaries: Mutex<Vec<DnsSummary>>,
}

impl DnsListener for RecordingListener {
    fn on_dns_transaction(&self, summary: &DnsSummary) {
        self.summaries.lock().unwrap().push(summary.clone());
    }
}

#[tokio::test]
async fn transport_builds_against_the_real_endpoint() {
    // Construction succeeds even without working DNS; the fallback IPs
    // populate the candidate set on their own.
    let transport = DohTransport::new(TEST_URL, &fallback_ips(), None)
        .await
        .unwrap();
    assert_eq!(transport.url(), TEST_URL);
}

#[tokio::test]
#[ignore = "requires network access"]
async fn query_round_trip_preserves_the_id() {
    let listener = Arc::new(RecordingListener::default());
    let transport = DohTransport::new(TEST_URL, &fallback_ips(), Some(listener.clone()))
        .await
        .unwrap();

    let id = u16::from_be_bytes([111, 222]);
    let query = query_bytes(id);
    let before = query.clone();

    let response = transport.query(&query).await.unwrap();

    // The caller's buffer is untouched and the response carries its ID.
    assert_eq!(query, before);
    assert_eq!(&response[..2], &[111, 222]);
    assert!(response.len() > query.len(), "response is short");

    let summaries = listener.summaries.lock().unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].status, QueryStatus::Complete);
    assert!(!summaries[0].server.is_empty());
    assert_eq!(summaries[0].query, query);
}

#[tokio::test]
#[ignore = "requires network access"]
async fn second_query_reuses_the_learned_connection() {
    let listener = Arc::new(RecordingListener::default());
    let transport = DohTransport::new(TEST_URL, &fallback_ips(), Some(listener.clone()))
        .await
        .unwrap();

    for id in [0x1234u16, 0x5678] {
        let response = transport.query(&query_bytes(id)).await.unwrap();
        assert_eq!(&response[..2], &id.to_be_bytes());
    }

    let summaries = listener.summaries.lock().unwrap();
    assert_eq!(summaries.len(), 2);
    // Both transactions went to the same server.
    assert_eq!(summaries[0].server, summaries[1].server);
}
