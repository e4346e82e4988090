//! Mailbox delivery guarantees: FIFO per inbox, exactly-once consumption.
//!
//! Tests cover:
//! - send/receive ordering for a single agent
//! - isolation between inboxes
//! - concurrent consumers never sharing a message
//! - interleaved sends and receives

use std::collections::HashSet;
use std::sync::Arc;

use foreman_sdk::{Mailbox, Message, MessageKind};
use serde_json::json;

fn open() -> (tempfile::TempDir, Mailbox) {
    let temp = tempfile::tempdir().unwrap();
    let mailbox = Mailbox::open(temp.path().join("messages")).unwrap();
    (temp, mailbox)
}

fn request(to: &str, n: usize) -> Message {
    Message::request("Orchestrator", to, json!({ "n": n }))
}

#[test]
fn three_messages_come_back_in_order_then_none() {
    let (_temp, mailbox) = open();
    let m1 = request("Reviewer", 1);
    let m2 = request("Reviewer", 2);
    let m3 = request("Reviewer", 3);
    for m in [&m1, &m2, &m3] {
        mailbox.send(m).unwrap();
    }

    assert_eq!(mailbox.receive("Reviewer").unwrap().as_ref(), Some(&m1));
    assert_eq!(mailbox.receive("Reviewer").unwrap().as_ref(), Some(&m2));
    assert_eq!(mailbox.receive("Reviewer").unwrap().as_ref(), Some(&m3));
    assert!(mailbox.receive("Reviewer").unwrap().is_none());
}

#[test]
fn inboxes_are_isolated() {
    let (_temp, mailbox) = open();
    mailbox.send(&request("QA", 1)).unwrap();
    mailbox.send(&request("Architect", 2)).unwrap();

    assert_eq!(mailbox.pending("QA").unwrap(), 1);
    assert_eq!(mailbox.pending("Architect").unwrap(), 1);
    let got = mailbox.receive("QA").unwrap().unwrap();
    assert_eq!(got.to(), "QA");
    assert!(mailbox.receive("QA").unwrap().is_none());
    assert_eq!(mailbox.pending("Architect").unwrap(), 1);
}

#[test]
fn interleaved_sends_and_receives_stay_fifo() {
    let (_temp, mailbox) = open();
    let mut received = Vec::new();
    let mut sent = Vec::new();
    for round in 0..5 {
        for i in 0..3 {
            let m = request("Builder", round * 3 + i);
            mailbox.send(&m).unwrap();
            sent.push(m);
        }
        if let Some(m) = mailbox.receive("Builder").unwrap() {
            received.push(m);
        }
    }
    while let Some(m) = mailbox.receive("Builder").unwrap() {
        received.push(m);
    }

    assert_eq!(received, sent);
    for pair in received.windows(2) {
        assert!(pair[0].created_at() <= pair[1].created_at());
    }
}

#[test]
fn concurrent_consumers_never_share_a_message() {
    let (_temp, mailbox) = open();
    let total = 200;
    let mut ids = HashSet::new();
    for n in 0..total {
        let m = Message::builder("Orchestrator", "Worker", MessageKind::Notification)
            .payload(json!({ "n": n }))
            .build();
        ids.insert(m.id().to_string());
        mailbox.send(&m).unwrap();
    }

    let mailbox = Arc::new(mailbox);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(m) = mailbox.receive("Worker").unwrap() {
                    got.push(m.id().to_string());
                }
                got
            })
        })
        .collect();

    let mut seen = Vec::new();
    for h in handles {
        seen.extend(h.join().unwrap());
    }
    assert_eq!(seen.len(), total, "every message delivered exactly once");
    let unique: HashSet<String> = seen.into_iter().collect();
    assert_eq!(unique, ids);
}
