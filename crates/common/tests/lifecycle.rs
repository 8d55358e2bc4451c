use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wgkeeper_common::artifact::parse_client_config;
use wgkeeper_common::server_conf::{allowed_addresses, section_names};
use wgkeeper_common::{
    AllocationPolicy, FsStore, KeeperConfig, PeerManager, ReloadOutcome, ReloadTrigger,
    ReloadWorker, RetryPolicy,
};

const SERVER_CONF: &str = "[Interface]
# server interface
Address = 192.0.0.1/24
ListenPort = 51820
PrivateKey = c2VydmVyLXByaXZhdGUta2V5LW5vdC1yZWFsLTAwMDA=
PostUp = iptables -A FORWARD -i %i -j ACCEPT
";

fn setup(policy: AllocationPolicy) -> (TempDir, KeeperConfig) {
    let tmp = TempDir::new().expect("tempdir");
    std::fs::create_dir_all(tmp.path().join("wg_confs")).expect("mkdir wg_confs");
    std::fs::create_dir_all(tmp.path().join("server")).expect("mkdir server");
    std::fs::write(tmp.path().join("wg_confs/wg0.conf"), SERVER_CONF).expect("write server conf");
    std::fs::write(tmp.path().join("server/publickey-server"), "SERVERPUBKEY\n")
        .expect("write server key");

    let config = KeeperConfig {
        wireguard_path: tmp.path().to_path_buf(),
        allocation: policy,
        ..KeeperConfig::default()
    };
    (tmp, config)
}

fn manager(config: &KeeperConfig) -> PeerManager {
    let store = Arc::new(FsStore::new(&config.wireguard_path));
    PeerManager::new(config, store).expect("manager")
}

fn server_conf(root: &Path) -> String {
    std::fs::read_to_string(root.join("wg_confs/wg0.conf")).expect("read server conf")
}

/// Two peers are created, the first is deleted and only the second survives
#[tokio::test]
async fn create_create_delete_leaves_only_second_peer() {
    let (tmp, config) = setup(AllocationPolicy::Count);
    let m = manager(&config);

    let alice = m.create("alice").await.expect("create alice");
    let bob = m.create("bob").await.expect("create bob");
    assert_eq!(alice.address, Ipv4Addr::new(192, 0, 0, 2));
    assert_eq!(bob.address, Ipv4Addr::new(192, 0, 0, 3));

    let doc = server_conf(tmp.path());
    assert_eq!(section_names(&doc), vec!["alice", "bob"]);
    assert!(doc.contains("AllowedIPs = 192.0.0.2/32"));
    assert!(doc.contains("AllowedIPs = 192.0.0.3/32"));

    m.delete("alice").await.expect("delete alice");

    let doc = server_conf(tmp.path());
    assert_eq!(section_names(&doc), vec!["bob"]);
    assert!(!tmp.path().join("alice").exists());
    assert!(!tmp.path().join("alice.conf").exists());
    assert!(tmp.path().join("bob/peer.conf").exists());

    let peers = m.list(false).await.expect("list");
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name.as_str(), "bob");
    assert_eq!(peers[0].address, Some(Ipv4Addr::new(192, 0, 0, 3)));
    assert_eq!(peers[0].public_key.as_deref(), Some(bob.public_key.as_str()));
    assert!(!peers[0].orphaned);
}

/// The count-based policy hands out an address that is still in use after a
/// delete; the verified policy skips it
#[tokio::test]
async fn count_policy_collides_after_delete_and_verified_does_not() {
    let (_tmp, config) = setup(AllocationPolicy::Count);
    let m = manager(&config);
    for name in ["alice", "bob", "carol"] {
        m.create(name).await.expect("create");
    }
    m.delete("alice").await.expect("delete alice");
    let dave = m.create("dave").await.expect("create dave");
    assert_eq!(dave.address, Ipv4Addr::new(192, 0, 0, 4), "same address as carol");

    let (tmp, config) = setup(AllocationPolicy::Verified);
    let m = manager(&config);
    for name in ["alice", "bob", "carol"] {
        m.create(name).await.expect("create");
    }
    m.delete("alice").await.expect("delete alice");
    let dave = m.create("dave").await.expect("create dave");
    assert_eq!(dave.address, Ipv4Addr::new(192, 0, 0, 5));

    let addrs = allowed_addresses(&server_conf(tmp.path()));
    assert_eq!(addrs.len(), 3);
}

/// Create p1, delete it, create p2: p2 may reuse p1's address, and the
/// document never holds two sections with one address
#[tokio::test]
async fn address_is_reused_after_delete_under_both_policies() {
    for policy in [AllocationPolicy::Count, AllocationPolicy::Verified] {
        let (tmp, config) = setup(policy);
        let m = manager(&config);

        let p1 = m.create("p1").await.expect("create p1");
        m.delete("p1").await.expect("delete p1");
        let p2 = m.create("p2").await.expect("create p2");

        assert_eq!(p1.address, Ipv4Addr::new(192, 0, 0, 2), "{:?}", policy);
        assert_eq!(p2.address, p1.address, "{:?}", policy);

        let doc = server_conf(tmp.path());
        assert_eq!(section_names(&doc), vec!["p2"]);
        assert_eq!(allowed_addresses(&doc).len(), 1);
    }
}

/// Create then delete leaves the server document byte-identical
#[tokio::test]
async fn create_then_delete_restores_document_exactly() {
    let (tmp, config) = setup(AllocationPolicy::Verified);
    let before = server_conf(tmp.path());
    let m = manager(&config);

    m.create("laptop").await.expect("create");
    assert_ne!(server_conf(tmp.path()), before);
    m.delete("laptop").await.expect("delete");

    assert_eq!(server_conf(tmp.path()), before);
}

/// Sections that are not ours keep their content and relative order
#[tokio::test]
async fn foreign_sections_are_preserved() {
    let (tmp, config) = setup(AllocationPolicy::Verified);
    let doc = format!(
        "{}\n[Peer]\n# handmade\nPublicKey = HANDMADE\nAllowedIPs = 192.0.0.50/32\n",
        SERVER_CONF
    );
    std::fs::write(tmp.path().join("wg_confs/wg0.conf"), &doc).expect("write");
    let m = manager(&config);

    m.create("phone").await.expect("create phone");
    m.create("tablet").await.expect("create tablet");
    m.delete("phone").await.expect("delete phone");

    let after = server_conf(tmp.path());
    assert!(after.starts_with(&doc));
    assert_eq!(section_names(&after), vec!["handmade", "tablet"]);
    assert_eq!(m.server_info().await.expect("info").orphaned_sections, vec!["handmade"]);
}

/// Deleting an unknown peer is NotFound and leaves every byte in place
#[tokio::test]
async fn delete_unknown_peer_is_not_found() {
    let (tmp, config) = setup(AllocationPolicy::Verified);
    let m = manager(&config);
    m.create("alice").await.expect("create");
    let before = server_conf(tmp.path());

    let err = m.delete("nobody").await.expect_err("unknown peer");
    assert!(err.is_not_found());
    assert_eq!(server_conf(tmp.path()), before);

    m.delete("alice").await.expect("first delete");
    let after_first = server_conf(tmp.path());
    let err = m.delete("alice").await.expect_err("second delete");
    assert!(err.is_not_found());
    assert_eq!(server_conf(tmp.path()), after_first);
    assert!(section_names(&after_first).is_empty());
}

/// The flat document carries the allocated address and the server key
#[tokio::test]
async fn flat_document_round_trips() {
    let (_tmp, config) = setup(AllocationPolicy::Verified);
    let m = manager(&config);
    let created = m.create("Work Laptop!").await.expect("create");
    assert_eq!(created.name.as_str(), "worklaptop");
    assert!(!created.server_key_pending);

    let text = m.config("worklaptop").await.expect("config");
    let fields = parse_client_config(&text);
    assert_eq!(fields.address, Some(created.address));
    assert_eq!(fields.server_public_key.as_deref(), Some("SERVERPUBKEY"));
    assert!(text.contains("Endpoint = 192.168.43.30:51820"));
    assert!(text.contains("DNS = 8.8.8.8"));

    assert!(m.config("ghost").await.expect_err("missing").is_not_found());
}

/// Concurrent creates are all kept with distinct addresses
#[tokio::test]
async fn concurrent_creates_are_serialized() {
    let (tmp, config) = setup(AllocationPolicy::Verified);
    let m = Arc::new(manager(&config));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let m = m.clone();
        tasks.push(tokio::spawn(async move { m.create(&format!("peer{}", i)).await }));
    }
    for task in tasks {
        task.await.expect("join").expect("create");
    }

    let doc = server_conf(tmp.path());
    assert_eq!(section_names(&doc).len(), 8);
    assert_eq!(allowed_addresses(&doc).len(), 8);
    assert_eq!(m.list(false).await.expect("list").len(), 8);
}

/// Independent managers over independent stores on one tree behave like
/// separate `wgkeeper` processes and must not lose each other's sections
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_managers_do_not_lose_sections() {
    let (tmp, config) = setup(AllocationPolicy::Count);

    let mut tasks = Vec::new();
    for i in 0..4 {
        let config = config.clone();
        tasks.push(tokio::spawn(async move {
            let m = manager(&config);
            let mut created = Vec::new();
            for j in 0..3 {
                created.push(m.create(&format!("peer{}-{}", i, j)).await?);
            }
            Ok::<_, wgkeeper_common::Error>(created)
        }));
    }

    let mut addresses = std::collections::HashSet::new();
    for task in tasks {
        for peer in task.await.expect("join").expect("create") {
            assert!(addresses.insert(peer.address), "duplicate {}", peer.address);
        }
    }

    let doc = server_conf(tmp.path());
    assert_eq!(section_names(&doc).len(), 12);
    assert_eq!(allowed_addresses(&doc), addresses);
    assert!(tmp.path().join("wg_confs/wg0.conf.lock").exists());
}

/// Deleting and creating from two managers interleaves cleanly
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn separate_managers_delete_and_create() {
    let (tmp, config) = setup(AllocationPolicy::Verified);
    let seed = manager(&config);
    for i in 0..4 {
        seed.create(&format!("old{}", i)).await.expect("seed");
    }

    let deleter = {
        let config = config.clone();
        tokio::spawn(async move {
            let m = manager(&config);
            for i in 0..4 {
                m.delete(&format!("old{}", i)).await?;
            }
            Ok::<_, wgkeeper_common::Error>(())
        })
    };
    let creator = {
        let config = config.clone();
        tokio::spawn(async move {
            let m = manager(&config);
            for i in 0..4 {
                m.create(&format!("new{}", i)).await?;
            }
            Ok::<_, wgkeeper_common::Error>(())
        })
    };
    deleter.await.expect("join").expect("delete");
    creator.await.expect("join").expect("create");

    let doc = server_conf(tmp.path());
    assert_eq!(section_names(&doc), vec!["new0", "new1", "new2", "new3"]);
    assert_eq!(allowed_addresses(&doc).len(), 4);
}

#[derive(Default)]
struct CountingTrigger {
    reloads: AtomicUsize,
    restarts: AtomicUsize,
}

#[async_trait]
impl ReloadTrigger for CountingTrigger {
    async fn reload(&self) -> ReloadOutcome {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        ReloadOutcome::ok("reloaded")
    }

    async fn restart(&self) -> ReloadOutcome {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        ReloadOutcome::ok("restarted")
    }
}

/// Lifecycle changes queue restarts that the worker executes in the background
#[tokio::test]
async fn changes_queue_restarts() {
    let (_tmp, config) = setup(AllocationPolicy::Verified);
    let trigger = Arc::new(CountingTrigger::default());
    let worker = ReloadWorker::spawn(
        trigger.clone(),
        RetryPolicy::from(&config.reload),
        config.reload.queue_depth,
    );
    let m = manager(&config).with_reload(worker.handle());

    m.create("alice").await.expect("create");
    m.delete("alice").await.expect("delete");

    drop(m);
    worker.shutdown(Duration::from_secs(5)).await;

    let restarts = trigger.restarts.load(Ordering::SeqCst);
    assert!((1..=2).contains(&restarts), "got {} restarts", restarts);
    assert_eq!(trigger.reloads.load(Ordering::SeqCst), 0);
}
