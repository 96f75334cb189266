#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;

use linkguard_core::rules::MatcherKind;
use linkguard_core::Condition;
use linkguard_policy::engine::{CONNECTION_DISALLOWED, LINK_DISALLOWED, SESSION_DISALLOWED};
use linkguard_policy::{
    config, AdmissionGate, AuthzGrants, ConnectionRole, ConnectionState, IdentityAuthority, LinkDecision,
    LinkRole, LocalAuthority, OpenDecision, Phase, PolicyEngine, SessionDecision, Terminus, TransportLimits,
};

use fake_authority::{engine, governed, info, FakeAuthority, PROFILE, VHOST};

async fn opened(engine: &PolicyEngine, id: u64, user: &str) -> ConnectionState {
    let mut conn = engine.accept(info(id, user)).expect("admitted");
    let d = engine.open(&mut conn, Some(VHOST)).await;
    assert!(d.is_allowed(), "open denied: {d:?}");
    conn
}

fn denials(engine: &PolicyEngine, group: &str) -> (u64, u64, u64) {
    let d = engine
        .profile_denials()
        .into_iter()
        .find(|d| d.group == group)
        .expect("counter group exists");
    (d.session_denied, d.sender_denied, d.receiver_denied)
}

const GROUP: &str = "vh/p";

#[tokio::test]
async fn third_session_denied_at_limit_of_two() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({ "maxSessions": 2 })));
    let engine = engine(&auth);
    let mut conn = opened(&engine, 1, "bob").await;

    assert!(engine.approve_session(&mut conn).is_allowed());
    assert_eq!(conn.n_sessions(), 1);
    assert!(engine.approve_session(&mut conn).is_allowed());
    assert_eq!(conn.n_sessions(), 2);

    let third = engine.approve_session(&mut conn);
    match third {
        SessionDecision::Deny(d) => {
            assert_eq!(d.condition, Condition::ResourceLimitExceeded);
            assert_eq!(d.description, SESSION_DISALLOWED);
        }
        other => panic!("expected deny, got {other:?}"),
    }
    assert_eq!(conn.n_sessions(), 2);
    assert_eq!(denials(&engine, GROUP), (1, 0, 0));

    // a freed slot can be reused
    engine.session_ended(&mut conn);
    assert!(engine.approve_session(&mut conn).is_allowed());
}

#[tokio::test]
async fn session_window_from_profile_or_default() {
    let auth = Arc::new(
        FakeAuthority::default()
            .user("bob", "windowed")
            .user("carol", "plain")
            .profile("windowed", json!({ "maxSessionWindow": 4096 }))
            .profile("plain", json!({})),
    );
    let engine = engine(&auth);

    let mut bob = opened(&engine, 1, "bob").await;
    assert_eq!(
        engine.approve_session(&mut bob),
        SessionDecision::Allow { incoming_capacity: 4096 }
    );

    let mut carol = opened(&engine, 2, "carol").await;
    assert_eq!(
        engine.approve_session(&mut carol),
        SessionDecision::Allow {
            incoming_capacity: 1_638_400
        }
    );
}

#[tokio::test]
async fn anonymous_sender_denied_counts_exactly_once() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({
        "allowAnonymousSender": false,
        "targets": "*",
    })));
    let engine = engine(&auth);
    let mut conn = opened(&engine, 1, "bob").await;

    let d = engine.approve_sender(&mut conn, &Terminus::anonymous());
    assert_eq!(
        d,
        LinkDecision::Deny(linkguard_policy::Denial {
            condition: Condition::UnauthorizedAccess,
            description: LINK_DISALLOWED,
        })
    );
    assert_eq!(conn.n_senders(), 0);
    assert_eq!(denials(&engine, GROUP), (0, 1, 0));

    // empty address is the same as no address
    assert!(!engine.approve_sender(&mut conn, &Terminus::address("")).is_allowed());
    assert_eq!(denials(&engine, GROUP), (0, 2, 0));
}

#[tokio::test]
async fn anonymous_sender_allowed_when_profile_permits() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({ "allowAnonymousSender": true })));
    let engine = engine(&auth);
    let mut conn = opened(&engine, 1, "bob").await;

    assert!(engine.approve_sender(&mut conn, &Terminus::anonymous()).is_allowed());
    assert_eq!(conn.n_senders(), 1);
}

#[tokio::test]
async fn sender_target_checked_against_user_rules() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({
        "targets": "public, tmp-${user}, ${user}.inbox",
    })));
    let engine = engine(&auth);
    let mut conn = opened(&engine, 1, "bob").await;

    for ok in ["public", "tmp-bob", "bob.inbox"] {
        assert!(engine.approve_sender(&mut conn, &Terminus::address(ok)).is_allowed(), "target={ok}");
    }
    for bad in ["tmp-bobby", "alice.inbox", "private"] {
        assert!(!engine.approve_sender(&mut conn, &Terminus::address(bad)).is_allowed(), "target={bad}");
    }
    assert_eq!(conn.n_senders(), 3);
    assert_eq!(denials(&engine, GROUP), (0, 3, 0));

    engine.link_detached(&mut conn, LinkRole::Sender);
    assert_eq!(conn.n_senders(), 2);
}

#[tokio::test]
async fn link_limits_deny_with_resource_condition() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({
        "maxSenders": 1,
        "maxReceivers": 1,
        "sources": "*",
        "targets": "*",
    })));
    let engine = engine(&auth);
    let mut conn = opened(&engine, 1, "bob").await;

    assert!(engine.approve_sender(&mut conn, &Terminus::address("a")).is_allowed());
    assert!(engine.approve_receiver(&mut conn, &Terminus::address("a")).is_allowed());

    let s = engine.approve_sender(&mut conn, &Terminus::address("b"));
    let r = engine.approve_receiver(&mut conn, &Terminus::address("b"));
    for d in [s, r] {
        match d {
            LinkDecision::Deny(d) => assert_eq!(d.condition, Condition::ResourceLimitExceeded),
            LinkDecision::Allow => panic!("limit not enforced"),
        }
    }
    assert_eq!((conn.n_senders(), conn.n_receivers()), (1, 1));
    assert_eq!(denials(&engine, GROUP), (0, 1, 1));
}

#[tokio::test]
async fn waypoint_links_need_permission() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({
        "allowWaypointLinks": false,
        "sources": "*",
        "targets": "*",
    })));
    let engine = engine(&auth);
    let mut conn = opened(&engine, 1, "bob").await;

    let waypoint = Terminus::address("q1").with_capability("qd.waypoint.1");
    assert!(!engine.approve_sender(&mut conn, &waypoint).is_allowed());
    assert!(!engine.approve_receiver(&mut conn, &waypoint).is_allowed());
    assert_eq!(denials(&engine, GROUP), (0, 1, 1));

    // only the first capability is inspected
    let later = Terminus::address("q1")
        .with_capability("other")
        .with_capability("qd.waypoint");
    assert!(engine.approve_sender(&mut conn, &later).is_allowed());
    assert!(engine.approve_sender(&mut conn, &Terminus::address("q1")).is_allowed());
}

#[tokio::test]
async fn waypoint_links_allowed_by_default() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({ "targets": "*" })));
    let engine = engine(&auth);
    let mut conn = opened(&engine, 1, "bob").await;

    let waypoint = Terminus::address("q1").with_capability("qd.waypoint");
    assert!(engine.approve_sender(&mut conn, &waypoint).is_allowed());
}

#[tokio::test]
async fn receiver_dynamic_and_absent_sources() {
    let auth = Arc::new(
        FakeAuthority::default()
            .user("bob", "dyn")
            .user("carol", "static")
            .profile("dyn", json!({ "allowDynamicSource": true }))
            .profile("static", json!({ "sources": "*" })),
    );
    let engine = engine(&auth);

    let mut bob = opened(&engine, 1, "bob").await;
    assert!(engine.approve_receiver(&mut bob, &Terminus::dynamic()).is_allowed());
    assert!(!engine.approve_receiver(&mut bob, &Terminus::anonymous()).is_allowed());
    assert_eq!(bob.n_receivers(), 1);

    // a wildcard source rule does not cover dynamic sources
    let mut carol = opened(&engine, 2, "carol").await;
    assert!(!engine.approve_receiver(&mut carol, &Terminus::dynamic()).is_allowed());
    assert!(engine.approve_receiver(&mut carol, &Terminus::address("anything")).is_allowed());
    assert_eq!(denials(&engine, "vh/static"), (0, 0, 1));
}

#[tokio::test]
async fn no_rule_denies_every_named_link() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({})));
    let engine = engine(&auth);
    let mut conn = opened(&engine, 1, "bob").await;

    assert!(!engine.approve_sender(&mut conn, &Terminus::address("a")).is_allowed());
    assert!(!engine.approve_receiver(&mut conn, &Terminus::address("a")).is_allowed());
    assert!(conn.profile().unwrap().source_matcher().is_deny_all());
}

#[tokio::test]
async fn pattern_rules_select_tree_matcher() {
    let auth = Arc::new(
        FakeAuthority::default()
            .user("bob", "tree")
            .user("carol", "linear")
            .profile(
                "tree",
                json!({
                    "sources": "ignored",
                    "sourcePattern": "${user}.#, public.*",
                    "targetPattern": "q.${user}.x",
                }),
            )
            .profile("linear", json!({ "sources": "${user}.inbox" })),
    );
    let engine = engine(&auth);

    let mut bob = opened(&engine, 1, "bob").await;
    let p = bob.profile().unwrap();
    assert_eq!(p.source_matcher().kind(), Some(MatcherKind::Tree));
    assert_eq!(p.target_matcher().kind(), Some(MatcherKind::Tree));

    assert!(engine.approve_receiver(&mut bob, &Terminus::address("bob")).is_allowed());
    assert!(engine.approve_receiver(&mut bob, &Terminus::address("bob.a.b")).is_allowed());
    assert!(engine.approve_receiver(&mut bob, &Terminus::address("public.news")).is_allowed());
    assert!(!engine.approve_receiver(&mut bob, &Terminus::address("bobby.a")).is_allowed());
    assert!(!engine.approve_receiver(&mut bob, &Terminus::address("ignored")).is_allowed());

    // embedded substitution cannot be evaluated by the tree matcher
    assert!(!engine.approve_sender(&mut bob, &Terminus::address("q.bob.x")).is_allowed());
    assert_eq!(denials(&engine, "vh/tree"), (0, 1, 2));

    let carol = opened(&engine, 2, "carol").await;
    assert_eq!(
        carol.profile().unwrap().source_matcher().kind(),
        Some(MatcherKind::Linear)
    );
}

#[tokio::test]
async fn transport_limits_follow_profile() {
    let auth = Arc::new(
        FakeAuthority::default()
            .user("bob", "small")
            .user("carol", "huge")
            .user("dave", "none")
            .profile("small", json!({ "maxFrameSize": 4096, "maxSessions": 4 }))
            .profile("huge", json!({ "maxSessions": 100000 }))
            .profile("none", json!({})),
    );
    let engine = engine(&auth);

    let expect = [
        (
            "bob",
            TransportLimits {
                max_frame_size: Some(4096),
                channel_max: Some(3),
            },
        ),
        (
            "carol",
            TransportLimits {
                max_frame_size: None,
                channel_max: Some(u16::MAX),
            },
        ),
        ("dave", TransportLimits::default()),
    ];
    for (i, (user, limits)) in expect.into_iter().enumerate() {
        let mut conn = engine.accept(info(i as u64, user)).unwrap();
        assert_eq!(engine.open(&mut conn, Some(VHOST)).await, OpenDecision::Allow(limits), "user={user}");
    }
}

#[tokio::test]
async fn inter_router_connections_are_ungoverned() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({ "maxSessions": 1 })));
    let engine = engine(&auth);

    let mut conn = engine
        .accept(linkguard_policy::ConnectionInfo {
            role: ConnectionRole::InterRouter,
            ..info(1, "router-b")
        })
        .unwrap();
    assert_eq!(
        engine.open(&mut conn, Some(VHOST)).await,
        OpenDecision::Allow(TransportLimits::default())
    );
    assert!(matches!(conn.phase(), Phase::Ungoverned));
    assert!(auth.lookups().is_empty());

    for _ in 0..3 {
        assert!(engine.approve_session(&mut conn).is_allowed());
    }
    assert!(engine.approve_sender(&mut conn, &Terminus::anonymous()).is_allowed());
    assert!(engine.approve_receiver(&mut conn, &Terminus::anonymous()).is_allowed());
    assert_eq!((conn.n_sessions(), conn.n_senders(), conn.n_receivers()), (3, 1, 1));

    engine.close(conn).await;
    assert!(auth.closed().is_empty());
}

#[tokio::test]
async fn vhost_policy_disabled_means_ungoverned() {
    let auth = Arc::new(FakeAuthority::default());
    let engine = PolicyEngine::new(
        linkguard_policy::config::PolicySection::default(),
        Arc::clone(&auth) as Arc<dyn IdentityAuthority>,
    );
    let mut conn = engine.accept(info(1, "bob")).unwrap();

    assert!(engine.open(&mut conn, Some(VHOST)).await.is_allowed());
    assert!(matches!(conn.phase(), Phase::Ungoverned));
    assert!(conn.profile().is_none());
    assert!(auth.lookups().is_empty());
}

#[tokio::test]
async fn unknown_user_denied_at_open() {
    let auth = Arc::new(FakeAuthority::default().user("alice", PROFILE).profile(PROFILE, json!({})));
    let engine = engine(&auth);
    let mut conn = engine.accept(info(1, "mallory")).unwrap();

    match engine.open(&mut conn, Some(VHOST)).await {
        OpenDecision::Deny(d) => {
            assert_eq!(d.condition, Condition::ResourceLimitExceeded);
            assert_eq!(d.description, CONNECTION_DISALLOWED);
        }
        other => panic!("expected deny, got {other:?}"),
    }
    assert!(matches!(conn.phase(), Phase::Denied));
    assert!(!engine.approve_session(&mut conn).is_allowed());
    assert!(!engine.approve_sender(&mut conn, &Terminus::address("a")).is_allowed());
    assert_eq!(conn.n_sessions(), 0);

    // the authority never accepted this connection, so it is not told
    engine.close(conn).await;
    assert!(auth.closed().is_empty());
    assert_eq!(engine.admission().connections_current, 0);
}

#[tokio::test]
async fn authority_failure_denies_open() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({})));
    auth.fail_lookup.store(true, Ordering::SeqCst);
    let engine = engine(&auth);
    let mut conn = engine.accept(info(1, "bob")).unwrap();

    match engine.open(&mut conn, Some(VHOST)).await {
        OpenDecision::Deny(d) => assert_eq!(d.condition, Condition::UnauthorizedAccess),
        other => panic!("expected deny, got {other:?}"),
    }
    assert!(matches!(conn.phase(), Phase::Denied));
    assert_eq!(
        engine
            .metrics()
            .authority_failures
            .get(&[("call", "lookup_user"), ("code", "AUTHORITY")]),
        1
    );
}

#[tokio::test]
async fn misconfigured_authority_denies_with_internal_error() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({})));
    auth.misconfigured.store(true, Ordering::SeqCst);
    let engine = engine(&auth);
    let mut conn = engine.accept(info(1, "bob")).unwrap();

    match engine.open(&mut conn, Some(VHOST)).await {
        OpenDecision::Deny(d) => {
            assert_eq!(d.condition, Condition::InternalError);
            assert_eq!(d.condition.as_str(), "amqp:internal-error");
            assert_eq!(d.description, CONNECTION_DISALLOWED);
        }
        other => panic!("expected deny, got {other:?}"),
    }
    assert_eq!(
        engine
            .metrics()
            .authority_failures
            .get(&[("call", "lookup_user"), ("code", "CONFIG")]),
        1
    );
}

#[tokio::test]
async fn malformed_settings_deny_open() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({ "maxSessions": "two" })));
    let engine = engine(&auth);
    let mut conn = engine.accept(info(1, "bob")).unwrap();

    assert!(!engine.open(&mut conn, Some(VHOST)).await.is_allowed());
    // the user lookup succeeded, so the authority still expects a close
    engine.close(conn).await;
    assert_eq!(auth.closed(), vec![1]);
}

#[tokio::test]
async fn second_open_is_denied() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({})));
    let engine = engine(&auth);
    let mut conn = opened(&engine, 1, "bob").await;

    assert!(!engine.open(&mut conn, Some(VHOST)).await.is_allowed());
    assert!(matches!(conn.phase(), Phase::Governed(_)));
}

#[tokio::test]
async fn close_notifies_authority_and_releases_slot() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({})));
    let engine = engine(&auth);
    let conn = opened(&engine, 7, "bob").await;

    assert_eq!(engine.admission().connections_current, 1);
    assert_eq!(engine.metrics().governed_connections.get(&[("vhost", VHOST)]), 1);

    engine.close(conn).await;
    assert_eq!(auth.closed(), vec![7]);
    assert_eq!(engine.admission().connections_current, 0);
    assert_eq!(engine.metrics().governed_connections.get(&[("vhost", VHOST)]), 0);
}

#[tokio::test]
async fn shared_gate_caps_connections() {
    let gate = Arc::new(AdmissionGate::new(1));
    let auth = Arc::new(FakeAuthority::with_profile(json!({})));
    let engine = engine(&auth).with_admission_gate(Arc::clone(&gate));

    let first = engine.accept(info(1, "bob")).unwrap();
    assert!(engine.accept(info(2, "bob")).is_none());
    assert_eq!(gate.snapshot().connections_denied, 1);

    engine.close(first).await;
    assert!(engine.accept(info(3, "bob")).is_some());
    assert_eq!(engine.admission().connections_processed, 3);
}

#[tokio::test]
async fn profiles_compiled_once_until_invalidated() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({ "maxSessions": 3 })));
    let engine = engine(&auth);

    let a = opened(&engine, 1, "bob").await;
    let b = opened(&engine, 2, "carol").await;
    assert_eq!(auth.settings_calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(a.profile().unwrap(), b.profile().unwrap()));

    engine.invalidate_profiles();
    let c = opened(&engine, 3, "dave").await;
    assert_eq!(auth.settings_calls.load(Ordering::SeqCst), 2);
    assert!(!Arc::ptr_eq(a.profile().unwrap(), c.profile().unwrap()));
    // live connections keep what they resolved
    assert_eq!(a.profile().unwrap().max_sessions, 3);
}

#[tokio::test]
async fn prior_grants_are_not_overridden() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({
        "allowAnonymousSender": false,
        "targets": "public",
    })));
    let engine = engine(&auth);

    let mut granted = engine
        .accept(linkguard_policy::ConnectionInfo {
            grants: AuthzGrants {
                allow_anonymous_sender: true,
                targets: Some("private".into()),
                ..AuthzGrants::default()
            },
            ..info(1, "bob")
        })
        .unwrap();
    assert!(engine.open(&mut granted, Some(VHOST)).await.is_allowed());
    assert!(engine.approve_sender(&mut granted, &Terminus::anonymous()).is_allowed());
    assert!(engine.approve_sender(&mut granted, &Terminus::address("private")).is_allowed());
    assert!(!engine.approve_sender(&mut granted, &Terminus::address("public")).is_allowed());

    let mut plain = opened(&engine, 2, "carol").await;
    assert!(!engine.approve_sender(&mut plain, &Terminus::anonymous()).is_allowed());
    assert!(engine.approve_sender(&mut plain, &Terminus::address("public")).is_allowed());

    // both connections count into the same group
    assert_eq!(denials(&engine, GROUP), (0, 2, 0));
}

#[tokio::test]
async fn denial_count_groups_are_shared_across_profiles() {
    let auth = Arc::new(
        FakeAuthority::default()
            .user("bob", "one")
            .user("carol", "two")
            .profile("one", json!({ "maxSessions": 1, "denialCounts": "shared" }))
            .profile("two", json!({ "maxSessions": 1, "denialCounts": "shared" })),
    );
    let engine = engine(&auth);

    for (id, user) in [(1, "bob"), (2, "carol")] {
        let mut conn = opened(&engine, id, user).await;
        assert!(engine.approve_session(&mut conn).is_allowed());
        assert!(!engine.approve_session(&mut conn).is_allowed());
    }
    assert_eq!(denials(&engine, "shared"), (2, 0, 0));
    assert!(engine.profile_denials().iter().all(|d| d.group == "shared"));
}

#[tokio::test]
async fn hostname_patterns_normalize_vhost() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({})));
    let engine = PolicyEngine::new(
        linkguard_policy::config::PolicySection {
            enable_vhost_name_patterns: true,
            ..governed()
        },
        Arc::clone(&auth) as Arc<dyn IdentityAuthority>,
    );
    engine.add_vhost_pattern("*.example.com", "*.example.com".into()).unwrap();

    let mut a = engine.accept(info(1, "bob")).unwrap();
    assert!(engine.open(&mut a, Some("eu.example.com")).await.is_allowed());
    assert_eq!(a.vhost(), Some("*.example.com"));

    let mut b = engine.accept(info(2, "bob")).unwrap();
    assert!(engine.open(&mut b, Some("other.org")).await.is_allowed());
    assert_eq!(b.vhost(), Some("other.org"));

    let mut c = engine.accept(info(3, "bob")).unwrap();
    assert!(engine.open(&mut c, None).await.is_allowed());
    assert_eq!(c.vhost(), Some(""));

    let seen: Vec<String> = auth.lookups().into_iter().map(|(_, v)| v).collect();
    assert_eq!(seen, vec!["*.example.com", "other.org", ""]);
}

#[tokio::test]
async fn decisions_are_metered() {
    let auth = Arc::new(FakeAuthority::with_profile(json!({ "maxSessions": 1 })));
    let engine = engine(&auth);
    let mut conn = opened(&engine, 1, "bob").await;
    engine.approve_session(&mut conn);
    engine.approve_session(&mut conn);

    let m = engine.metrics();
    assert_eq!(m.decisions.get(&[("event", "accept"), ("outcome", "allow")]), 1);
    assert_eq!(m.decisions.get(&[("event", "open"), ("outcome", "allow")]), 1);
    assert_eq!(m.decisions.get(&[("event", "session"), ("outcome", "allow")]), 1);
    assert_eq!(m.decisions.get(&[("outcome", "deny"), ("event", "session")]), 1);
    assert_eq!(m.authority_latency.count(&[("call", "lookup_user")]), 1);
    assert_eq!(m.authority_latency.count(&[("call", "lookup_settings")]), 1);

    let text = m.render(&engine.metrics_extra());
    assert!(text.contains("linkguard_policy_decisions_total{event=\"session\",outcome=\"deny\"} 1"));
    assert!(text.contains("linkguard_connections_current 1"));
    assert!(text.contains("linkguard_profile_denials_total{group=\"vh/p\",kind=\"session\"} 1"));
}

fn governed_series(engine: &PolicyEngine) -> usize {
    engine
        .metrics()
        .render(&[])
        .lines()
        .filter(|l| l.starts_with("linkguard_governed_connections{"))
        .count()
}

#[tokio::test]
async fn fallback_hostnames_share_the_resolved_vhost_state() {
    let auth = Arc::new(
        FakeAuthority::with_profile(json!({ "maxSessions": 1 })).resolve_to("$default"),
    );
    let engine = engine(&auth);

    for id in 1..=20 {
        let mut conn = engine.accept(info(id, "bob")).unwrap();
        let host = format!("junk-{id}.example.net");
        assert!(engine.open(&mut conn, Some(&host)).await.is_allowed());
        assert_eq!(conn.vhost(), Some("$default"));
        assert!(engine.approve_session(&mut conn).is_allowed());
        assert!(!engine.approve_session(&mut conn).is_allowed());
        engine.close(conn).await;
    }

    assert_eq!(engine.cached_profiles(), 1);
    assert_eq!(auth.settings_calls.load(Ordering::SeqCst), 1);
    let groups = engine.profile_denials();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].group, "$default/p");
    assert_eq!(groups[0].session_denied, 20);
    assert_eq!(governed_series(&engine), 1);
    assert_eq!(engine.metrics().governed_connections.get(&[("vhost", "$default")]), 0);
}

#[tokio::test]
async fn local_default_vhost_state_stays_bounded() {
    let cfg = config::load_from_str(
        r#"
version: 1
vhosts:
  - hostname: "$default"
    groups:
      guests:
        users: ["*"]
        settings:
          targets: "public"
"#,
    )
    .unwrap();
    let authority = Arc::new(LocalAuthority::new(&cfg.vhosts).unwrap());
    let engine = PolicyEngine::new(governed(), Arc::clone(&authority) as Arc<dyn IdentityAuthority>);

    for id in 1..=50 {
        let mut conn = engine.accept(info(id, "mallory")).unwrap();
        let host = format!("junk-{id}.attacker");
        assert!(engine.open(&mut conn, Some(&host)).await.is_allowed());
        assert!(!engine.approve_sender(&mut conn, &Terminus::address("secret")).is_allowed());
        engine.close(conn).await;
    }

    assert_eq!(authority.connections("$default"), 0);
    assert_eq!(engine.admission().connections_current, 0);
    assert_eq!(engine.cached_profiles(), 1);
    let groups = engine.profile_denials();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].group, "$default/guests");
    assert_eq!(groups[0].sender_denied, 50);
    assert_eq!(governed_series(&engine), 1);
}
