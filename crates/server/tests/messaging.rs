mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;

use agent_mesh_core::{
    AutoApprove, Input, InputSource, Proposal, ReasoningContext, RunStatus, RuntimeEventKind,
};
use agent_mesh_server::{MemoryBus, Messenger};

use common::{FnEngine, SlowEngine};

const INBOX_CONFIG: &str = r#"
[approval]
enabled = false

[[triggers]]
name = "inbox"
type = "inbox"
"#;

#[tokio::test]
async fn message_from_bill_starts_a_run_for_sam() {
    let bus = MemoryBus::new();

    let peers_seen = Arc::new(Mutex::new(Vec::new()));
    let seen = peers_seen.clone();
    let bill_engine = FnEngine(move |context: &ReasoningContext| {
        *seen.lock().unwrap() = context.peers.clone();
        Proposal::final_answer(r#"Pinging sam. {"target": "sam", "message": "ping"}"#)
    });
    let bill = common::start(&bus, INBOX_CONFIG, Arc::new(bill_engine), Arc::new(AutoApprove)).await;

    let sam_engine = Arc::new(SlowEngine::new(Duration::from_millis(1)));
    let sam = common::start(&bus, INBOX_CONFIG, sam_engine.clone(), Arc::new(AutoApprove)).await;

    sam.runtime.open_session("sam", None).await.unwrap();
    bill.runtime.open_session("bill", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bill.runtime.list_active(), vec!["bill", "sam"]);

    let result = bill.runtime.ask("bill", Input::user("say hi to sam")).await.unwrap();
    assert_eq!(result.status, RunStatus::Done);
    assert_eq!(*peers_seen.lock().unwrap(), vec!["sam".to_string()]);
    assert!(bill
        .runtime
        .events()
        .for_session("bill")
        .iter()
        .any(|e| matches!(&e.kind, RuntimeEventKind::MessageSent { to } if to == "sam")));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sam_engine.seen(), vec!["[from bill] ping"]);
    let started: Vec<_> = sam
        .runtime
        .events()
        .for_session("sam")
        .into_iter()
        .filter_map(|e| match e.kind {
            RuntimeEventKind::RunStarted { source, .. } => Some(source),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![InputSource::Message { from: "bill".into() }]);

    // Sam's answer carries no communication block, so nothing comes back.
    let bill_runs = bill.runtime.events().for_session("bill");
    assert_eq!(common::run_boundaries(&bill_runs), (1, 1));

    bill.runtime.shutdown().await;
    sam.runtime.shutdown().await;
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() {
    let bus = MemoryBus::new();
    let sam_engine = Arc::new(SlowEngine::new(Duration::from_millis(5)));
    let sam = common::start(&bus, INBOX_CONFIG, sam_engine.clone(), Arc::new(AutoApprove)).await;
    sam.runtime.open_session("sam", None).await.unwrap();

    let messenger = Messenger::new(Arc::new(bus.clone()), "agent_mesh");
    for payload in ["m1", "m2", "m3"] {
        messenger.send("bill", "sam", payload).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        sam_engine.seen(),
        vec!["[from bill] m1", "[from bill] m2", "[from bill] m3"]
    );
    sam.runtime.shutdown().await;
}

#[tokio::test]
async fn inbox_observes_only_its_own_session() {
    let bus = MemoryBus::new();
    let messenger = Messenger::new(Arc::new(bus.clone()), "agent_mesh");
    let mut sam_inbox = messenger.subscribe("sam").await;
    let mut ann_inbox = messenger.subscribe("ann").await;

    messenger.send("bill", "ann", "for ann").await.unwrap();
    messenger.send("bill", "sam", "for sam").await.unwrap();

    assert_eq!(sam_inbox.next().await.unwrap().payload, "for sam");
    assert_eq!(ann_inbox.next().await.unwrap().payload, "for ann");
}
