//! End-to-end validation sessions against the mock control link.
//!
//! Each fetch opens a stream on the mock link and only returns its scripted
//! result once the engine attached that stream to a circuit.

use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;
use tempfile::TempDir;
use tova_circus::{CircuitPool, PoolConfig, RelayCatalog};
use tova_control::MockControlLink;
use tova_core::{unix_now, CircuitStatus, Protocol, RecordSink, RelayDescriptor, RelayFlag};
use tova_registry::{CircuitRegistry, FileRegistry, MemoryRegistry};
use tova_validation::{logged_len, ScriptedFetcher, SessionConfig, ValidationEngine};

fn relays(exits: u8) -> Vec<RelayDescriptor> {
    let mut relays = vec![RelayDescriptor {
        fingerprint: "G".to_string(),
        nickname: "guard".to_string(),
        address: Ipv4Addr::new(10, 0, 0, 1),
        bandwidth: 1000,
        flags: BTreeSet::from([RelayFlag::Guard, RelayFlag::Fast, RelayFlag::Running]),
    }];
    relays.extend((0..exits).map(|i| RelayDescriptor {
        fingerprint: format!("E{}", i),
        nickname: format!("exit{}", i),
        address: Ipv4Addr::new(60, i, 0, 1),
        bandwidth: 1000,
        flags: BTreeSet::from([RelayFlag::Exit, RelayFlag::Running]),
    }));
    relays
}

async fn circuits<R: CircuitRegistry>(link: &MockControlLink, registry: &R, count: u8) {
    for i in 0..count {
        let id = format!("{}", 10 + i);
        link.add_circuit(&id, CircuitStatus::Built, &["G", &format!("E{}", i)]);
        registry.set(&id, unix_now()).await.unwrap();
    }
}

fn session_config(k: usize, n: usize) -> SessionConfig {
    SessionConfig {
        val_k: k,
        val_n: n,
        circuit_ttl: 600,
        session_timeout: Duration::from_secs(20),
        poll_interval: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn test_quorum_after_fourth_vote() {
    let link = MockControlLink::new().with_relays(relays(6));
    let registry = MemoryRegistry::new();
    circuits(&link, &registry, 6).await;

    let fetcher = ScriptedFetcher::new(
        link.clone(),
        &["OK-A", "OK-A", "ERR:Timeout", "OK-A", "ERR:ConnError"],
    );
    let engine = ValidationEngine::new(
        link.clone(),
        registry,
        fetcher,
        session_config(3, 5),
        RecordSink::TracingOnly,
    );

    let verdict = engine
        .run_session(Protocol::Http, "example.org", ".well-known/acme-challenge/tok")
        .await;

    assert_eq!(verdict.output, "OK-A");
    assert_eq!(verdict.confidence, 3);
    // Round one launches 3, round two only the one still missing
    assert_eq!(verdict.attempts, 4);
    assert_eq!(verdict.results.len(), 4);
    assert!(!verdict.timed_out);

    let used: Vec<_> = link.attachments().into_iter().map(|(_, c)| c).collect();
    let distinct: HashSet<_> = used.iter().collect();
    assert_eq!(used.len(), distinct.len());
}

#[tokio::test]
async fn test_exhaustion_without_quorum() {
    let link = MockControlLink::new().with_relays(relays(5));
    let registry = MemoryRegistry::new();
    circuits(&link, &registry, 5).await;

    let fetcher = ScriptedFetcher::new(link.clone(), &["OK-A", "OK-B", "OK-C", "ERR:Timeout"]);
    let engine = ValidationEngine::new(
        link.clone(),
        registry,
        fetcher,
        session_config(3, 4),
        RecordSink::TracingOnly,
    );

    let verdict = engine.run_session(Protocol::Https, "example.org", "tok").await;

    assert_eq!(verdict.output, "ERROR");
    assert_eq!(verdict.confidence, 1);
    assert_eq!(verdict.attempts, 4);
    assert!(!verdict.is_ok());
}

#[tokio::test]
async fn test_session_record_written() {
    let temp_dir = TempDir::new().unwrap();
    let link = MockControlLink::new().with_relays(relays(3));
    let registry = FileRegistry::open(temp_dir.path().join("circuits"))
        .await
        .unwrap();
    circuits(&link, &registry, 3).await;

    let body = "x".repeat(250);
    let fetcher = ScriptedFetcher::new(link.clone(), &[body.as_str(), body.as_str(), body.as_str()]);
    let log_path = temp_dir.path().join("logs/app.log");
    let engine = ValidationEngine::new(
        link.clone(),
        registry,
        fetcher,
        session_config(3, 5),
        RecordSink::append_file(&log_path),
    );

    let verdict = engine.run_session(Protocol::Http, "example.org", "tok").await;
    assert_eq!(verdict.output, body);

    let content = std::fs::read_to_string(&log_path).unwrap();
    let record: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
    assert_eq!(record["domain"], "example.org");
    assert_eq!(record["ok"], true);
    assert!(record["req_end"].as_f64().unwrap() >= record["req_start"].as_f64().unwrap());

    let results = record["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    for triple in results {
        let triple = triple.as_array().unwrap();
        assert!(triple[0].as_str().unwrap().starts_with("60."));
        assert_eq!(triple[1], "example.org");
        let logged = triple[2].as_str().unwrap();
        assert!(logged.len() < 250);
        assert_eq!(logged_len(logged), 250);
    }
}

#[tokio::test]
async fn test_pool_and_session_share_registry() {
    let temp_dir = TempDir::new().unwrap();
    let link = MockControlLink::new().with_relays(relays(6));
    let registry = FileRegistry::open(temp_dir.path()).await.unwrap();

    let mut pool = CircuitPool::new(
        link.clone(),
        registry.clone(),
        PoolConfig {
            n_circuits: 4,
            batch_size: 2,
            circuit_ttl: 600,
            prefix_len: 16,
            build_interval: Duration::from_millis(1),
            relay_wait: Duration::from_millis(1),
        },
        RecordSink::TracingOnly,
    )
    .with_catalog(RelayCatalog::new().with_backoff(Duration::from_millis(1)));
    pool.bootstrap().await;
    assert_eq!(registry.entries().await.unwrap().len(), 4);

    let worker_registry = FileRegistry::open(temp_dir.path()).await.unwrap();
    let fetcher = ScriptedFetcher::new(link.clone(), &["OK-A", "OK-A"]);
    let engine = ValidationEngine::new(
        link.clone(),
        worker_registry,
        fetcher,
        session_config(2, 3),
        RecordSink::TracingOnly,
    );
    let verdict = engine.run_session(Protocol::Http, "example.org", "tok").await;
    assert_eq!(verdict.output, "OK-A");

    // Every circuit is still fresh and built
    let report = pool.tick().await.unwrap();
    assert_eq!(report.active, 4);
    assert!(link.closed_circuits().is_empty());
}
