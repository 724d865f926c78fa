use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use sysconf_core::config::{IdentityBackend, SystemSettings};
use sysconf_core::identity::{FlatFileIdentityStore, IdentityStore};
use sysconf_core::logging::recent_events;
use sysconf_core::reconcile::{
    AUTHORIZED_KEY_PATH, DNS_SEARCH_PATH, DNS_SERVER_PATH, HOSTNAME_PATH, NTP_PATH, TIMEZONE_PATH,
    USER_PATH,
};
use sysconf_core::resolver::MemoryCollectionService;
use sysconf_core::{db, dispatch, run_pass, Backends, ChangeBatch, ChangeEvent, TransactionPhase};
use tempfile::TempDir;

const ED25519: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

struct System {
    root: TempDir,
    collections: Arc<MemoryCollectionService>,
    backends: Backends,
}

impl System {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let base = root.path();
        for dir in ["etc", "home", "root", "zoneinfo/Europe", "zoneinfo/America"] {
            fs::create_dir_all(base.join(dir)).unwrap();
        }
        for zone in ["UTC", "Europe/Berlin", "America/New_York"] {
            fs::write(base.join("zoneinfo").join(zone), "TZif").unwrap();
        }
        std::os::unix::fs::symlink(base.join("zoneinfo/UTC"), base.join("etc/localtime")).unwrap();
        fs::write(base.join("etc/hostname"), "factory\n").unwrap();
        fs::write(
            base.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\nbin:x:2:2:bin:/bin:/usr/sbin/nologin\n",
        )
        .unwrap();
        fs::write(
            base.join("etc/shadow"),
            "root:$6$r$h:19000:0:99999:7:::\nbin:*:19000:0:99999:7:::\n",
        )
        .unwrap();
        fs::write(base.join("etc/group"), "root:x:0:\nbin:x:2:\n").unwrap();
        fs::write(base.join("etc/gshadow"), "root:*::\nbin:*::\n").unwrap();

        let settings = SystemSettings {
            zoneinfo_dir: base.join("zoneinfo"),
            localtime_link: base.join("etc/localtime"),
            hostname_file: base.join("etc/hostname"),
            identity_backend: IdentityBackend::Files,
            identity_dir: base.join("etc"),
            home_root: base.join("home"),
            root_home: base.join("root"),
            skel_dir: base.join("etc/skel"),
            ..SystemSettings::default()
        };
        let collections = Arc::new(MemoryCollectionService::new());
        let backends = Backends {
            collections: collections.clone(),
            identity: Arc::new(FlatFileIdentityStore::new(base.join("etc"))),
            settings,
            audit: Some(db::init_in_memory().unwrap()),
        };
        Self {
            root,
            collections,
            backends,
        }
    }

    fn path(&self, rel: &str) -> std::path::PathBuf {
        self.root.path().join(rel)
    }

    fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).unwrap()
    }

    fn apply(&self, subtree: &str, events: Vec<ChangeEvent>) -> sysconf_core::PassSummary {
        run_pass(
            &self.backends,
            &ChangeBatch::new(subtree, TransactionPhase::Apply, events),
        )
        .unwrap()
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        let mut files = Vec::new();
        collect(self.root.path(), self.root.path(), &mut files);
        files.sort();
        files
    }
}

fn collect(base: &Path, dir: &Path, out: &mut Vec<(String, String)>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        let rel = path.strip_prefix(base).unwrap().display().to_string();
        let meta = fs::symlink_metadata(&path).unwrap();
        if meta.file_type().is_symlink() {
            out.push((rel, fs::read_link(&path).unwrap().display().to_string()));
        } else if meta.is_dir() {
            collect(base, &path, out);
        } else {
            out.push((rel, fs::read_to_string(&path).unwrap()));
        }
    }
}

fn server(name: &str, address: &str) -> Vec<ChangeEvent> {
    let entry = format!("{DNS_SERVER_PATH}[name='{name}']");
    vec![
        ChangeEvent::create(entry.clone(), None),
        ChangeEvent::create(format!("{entry}/name"), Some(name)),
        ChangeEvent::create(format!("{entry}/udp-and-tcp/address"), Some(address)),
    ]
}

#[test]
fn created_servers_are_added_to_the_baseline() {
    let sys = System::new();
    sys.collections.insert(
        "dns-servers",
        json!({"ifindex": 0, "family": 2, "address": [1, 1, 1, 1], "port": 0, "name": "A"}),
    );

    let summary = sys.apply(DNS_SERVER_PATH, server("B", "2.2.2.2"));
    assert!(summary.stored);

    let calls = sys.collections.set_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].2,
        vec![
            json!({"ifindex": 0, "family": 2, "address": [1, 1, 1, 1], "port": 53, "name": "A"}),
            json!({"ifindex": 0, "family": 2, "address": [2, 2, 2, 2], "port": 53, "name": "B"}),
        ]
    );
}

#[test]
fn many_distinct_creates_union_with_baseline() {
    let sys = System::new();
    sys.collections.insert(
        "dns-domains",
        json!({"ifindex": 0, "domain": "base.example", "routing_only": false}),
    );
    let events = ["a.example", "b.example", "c.example"]
        .into_iter()
        .map(|d| ChangeEvent::create(format!("{DNS_SEARCH_PATH}[.='{d}']"), Some(d)))
        .collect();
    sys.apply(DNS_SEARCH_PATH, events);

    let domains: Vec<String> = sys
        .collections
        .items("dns-domains")
        .iter()
        .map(|d| d["domain"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(domains, vec!["base.example", "a.example", "b.example", "c.example"]);
}

#[test]
fn search_create_then_delete_stores_empty_collection() {
    let sys = System::new();
    sys.apply(
        DNS_SEARCH_PATH,
        vec![
            ChangeEvent::create(DNS_SEARCH_PATH, Some("example.com")),
            ChangeEvent::delete(format!("{DNS_SEARCH_PATH}[.='example.com']")),
        ],
    );
    let calls = sys.collections.set_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].2.is_empty());
}

#[test]
fn creating_alice_writes_user_and_mirror_group() {
    let sys = System::new();
    sys.apply(
        USER_PATH,
        vec![
            ChangeEvent::create(format!("{USER_PATH}[name='alice']"), None),
            ChangeEvent::create(format!("{USER_PATH}[name='alice']/name"), Some("alice")),
        ],
    );

    let db = sys.backends.identity.load().unwrap();
    let alice = db.user("alice").unwrap();
    assert_eq!(alice.uid, 1000);
    assert_eq!(alice.shell, "/bin/bash");
    let group = db.group("alice").unwrap();
    assert_eq!(group.gid, alice.gid);
    assert_eq!(group.members, vec!["alice"]);
    assert_eq!(group.admins, vec!["alice"]);
    assert!(sys.read("etc/gshadow").contains("alice:!:alice:alice\n"));
}

#[test]
fn password_set_then_removed_leaves_only_sentinels() {
    let sys = System::new();
    let user = format!("{USER_PATH}[name='carol']");
    sys.apply(
        USER_PATH,
        vec![
            ChangeEvent::create(user.clone(), None),
            ChangeEvent::create(format!("{user}/password"), Some("$6$salt$secret")),
        ],
    );
    assert!(sys.read("etc/shadow").contains("carol:$6$salt$secret:"));

    sys.apply(USER_PATH, vec![ChangeEvent::delete(format!("{user}/password"))]);
    let shadow = sys.read("etc/shadow");
    let gshadow = sys.read("etc/gshadow");
    assert!(shadow.contains("carol:*:"));
    assert!(gshadow.contains("carol:!:"));
    assert!(!shadow.contains("secret") && !gshadow.contains("secret"));
}

#[test]
fn user_creation_skips_ids_in_use() {
    let sys = System::new();
    fs::write(
        sys.path("etc/passwd"),
        "root:x:0:0:root:/root:/bin/bash\nold:x:1000:1000::/home/old:/bin/sh\nsvc:x:1001:1005::/srv:/bin/sh\n",
    )
    .unwrap();
    fs::write(sys.path("etc/group"), "root:x:0:\nold:x:1000:\nops:x:1006:\n").unwrap();

    sys.apply(
        USER_PATH,
        vec![ChangeEvent::create(format!("{USER_PATH}[name='new']"), None)],
    );
    let db = sys.backends.identity.load().unwrap();
    let new = db.user("new").unwrap();
    assert_eq!(new.uid, 1002);
    assert_eq!(new.gid, 1007);
    assert_eq!(db.users().iter().filter(|u| u.uid == new.uid).count(), 1);
    assert_eq!(db.groups().iter().filter(|g| g.gid == new.gid).count(), 1);
}

#[test]
fn unknown_zone_is_rejected_in_verify_and_link_survives() {
    let sys = System::new();
    let events = vec![ChangeEvent::modify(TIMEZONE_PATH, "Mars/Olympus_Mons")];
    for phase in [TransactionPhase::Verify, TransactionPhase::Apply] {
        let err = run_pass(
            &sys.backends,
            &ChangeBatch::new(TIMEZONE_PATH, phase, events.clone()),
        )
        .unwrap_err();
        assert_eq!(err.code(), "VAL-1001");
    }
    assert_eq!(
        fs::read_link(sys.path("etc/localtime")).unwrap(),
        sys.path("zoneinfo/UTC")
    );
}

#[test]
fn verify_refuses_a_user_named_like_a_group() {
    let sys = System::new();
    fs::write(sys.path("etc/group"), "root:x:0:\nbin:x:2:\ndocker:x:998:\n").unwrap();
    fs::write(sys.path("etc/gshadow"), "root:*::\nbin:*::\ndocker:!::\n").unwrap();
    let files = sys.snapshot();

    let err = run_pass(
        &sys.backends,
        &ChangeBatch::new(
            USER_PATH,
            TransactionPhase::Verify,
            vec![ChangeEvent::create(format!("{USER_PATH}[name='docker']"), None)],
        ),
    )
    .unwrap_err();

    assert_eq!(err.code(), "VAL-1001");
    assert_eq!(sys.snapshot(), files);
}

#[test]
fn passes_without_changes_leave_everything_untouched() {
    let sys = System::new();
    sys.collections.insert(
        "dns-servers",
        json!({"ifindex": 0, "family": 10, "address": [32, 1, 13, 184, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], "port": 853, "name": "v6"}),
    );
    fs::create_dir_all(sys.path("root/.ssh")).unwrap();
    fs::write(
        sys.path("root/.ssh/ops.pub"),
        format!("ssh-ed25519  {ED25519}  ops@bastion\n"),
    )
    .unwrap();
    let files = sys.snapshot();
    let servers = sys.collections.items("dns-servers");

    for subtree in [
        HOSTNAME_PATH,
        TIMEZONE_PATH,
        DNS_SERVER_PATH,
        DNS_SEARCH_PATH,
        NTP_PATH,
        USER_PATH,
        AUTHORIZED_KEY_PATH,
    ] {
        sys.apply(subtree, Vec::new());
    }

    assert_eq!(sys.snapshot(), files);
    assert_eq!(sys.collections.items("dns-servers"), servers);
}

#[test]
fn full_transaction_verifies_then_applies_every_subtree() {
    let sys = System::new();
    let user = format!("{USER_PATH}[name='dana']");
    let key = format!("{user}/authorized-key[name='laptop']");
    let mut events = vec![
        ChangeEvent::create(format!("{key}/algorithm"), Some("ssh-ed25519")),
        ChangeEvent::create(format!("{key}/key-data"), Some(ED25519)),
        ChangeEvent::create(user.clone(), None),
        ChangeEvent::modify(HOSTNAME_PATH, "edge-7"),
        ChangeEvent::modify(TIMEZONE_PATH, "Europe/Berlin"),
    ];
    events.extend(server("quad9", "9.9.9.9"));

    let verified = dispatch(&sys.backends, TransactionPhase::Verify, events.clone()).unwrap();
    assert!(verified.iter().all(|s| !s.stored));
    assert_eq!(sys.read("etc/hostname"), "factory\n");

    let applied = dispatch(&sys.backends, TransactionPhase::Apply, events).unwrap();
    assert_eq!(applied.len(), 5);
    assert!(applied.iter().all(|s| s.stored));

    assert_eq!(sys.read("etc/hostname"), "edge-7\n");
    assert_eq!(
        fs::read_link(sys.path("etc/localtime")).unwrap(),
        sys.path("zoneinfo/Europe/Berlin")
    );
    assert!(sys.read("etc/passwd").contains("dana:x:1000:1000:"));
    assert_eq!(
        sys.read("home/dana/.ssh/laptop.pub"),
        format!("ssh-ed25519 {ED25519}\n")
    );
    assert_eq!(sys.collections.items("dns-servers").len(), 1);

    let pool = sys.backends.audit.as_ref().unwrap();
    let conn = pool.get().unwrap();
    let records = recent_events(&conn, "reconcile", 50).unwrap();
    assert_eq!(records.len(), 10);
    assert!(records.iter().all(|r| r.code.is_none()));
}

#[test]
fn failed_pass_is_audited_with_its_code() {
    let sys = System::new();
    sys.collections.fail_reads(Some("resolver bus unavailable"));
    let err = run_pass(
        &sys.backends,
        &ChangeBatch::new(DNS_SERVER_PATH, TransactionPhase::Apply, server("A", "1.1.1.1")),
    )
    .unwrap_err();
    assert_eq!(err.code(), "LOAD-1001");
    assert!(sys.collections.set_calls().is_empty());

    let pool = sys.backends.audit.as_ref().unwrap();
    let conn = pool.get().unwrap();
    let records = recent_events(&conn, "reconcile", 5).unwrap();
    assert_eq!(records[0].code.as_deref(), Some("LOAD-1001"));
    assert_eq!(records[0].level, "error");
}
