//! Membership Module Tests
//!
//! Validates the membership state machine and the networked service.
//!
//! ## Test Scopes
//! - **Registry**: Member filtering and ordering.
//! - **State Machine**: Transitions, incarnation ordering, refutation and replay idempotence.
//! - **Peer Selection**: Probe ring and gossip target selection.
//! - **Service**: Create, join, leave, shutdown, failure detection and delegate hooks
//!   over loopback.

#[cfg(test)]
mod tests {
    use crate::membership::config::Config;
    use crate::membership::delegate::{Delegate, NoopDelegate};
    use crate::membership::error::{MembershipError, ShutdownStatus};
    use crate::membership::protocol::{
        Message, Packet, PushNodeState, decode_message, decode_packet, encode_message,
        encode_packet,
    };
    use crate::membership::registry::Registry;
    use crate::membership::service::MembershipService;
    use crate::membership::state::ClusterState;
    use crate::membership::types::{
        MembershipEvent, Node, NodeName, NodeState, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN,
        ProtocolVersion, State,
    };
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn node(name: &str, port: u16) -> Node {
        Node {
            name: NodeName::from(name),
            gossip_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            stream_addr: SocketAddr::from(([127, 0, 0, 1], port + 1)),
            meta: Vec::new(),
            version: Config::local().version(),
        }
    }

    fn name(name: &str) -> NodeName {
        NodeName::from(name)
    }

    /// Local node "local" at incarnation 1, plus `peers` Alive at incarnation 1.
    fn cluster(peers: &[&str]) -> ClusterState {
        let config = Config {
            rng_seed: Some(7),
            ..Config::local()
        };
        let mut state = ClusterState::new(node("local", 7000), &config);
        state.announce_local();

        let now = Instant::now();
        for (i, peer) in peers.iter().enumerate() {
            state.alive_node(1, node(peer, 7100 + 2 * i as u16), now);
        }

        state.broadcasts.reset();
        state
    }

    fn state_of(cluster: &ClusterState, node: &str) -> (State, u64) {
        let entry = cluster.registry.get(&name(node)).unwrap();
        (entry.state, entry.incarnation)
    }

    // ============================================================
    // REGISTRY TESTS
    // ============================================================

    #[test]
    fn test_members_excludes_dead_and_left_in_order() {
        let mut registry = Registry::new(node("a", 7000), 1);
        registry.insert(NodeState::new(node("b", 7002), State::Dead, 1));
        registry.insert(NodeState::new(node("c", 7004), State::Suspect, 1));
        registry.insert(NodeState::new(node("d", 7006), State::Left, 1));

        let names: Vec<NodeName> = registry.members().into_iter().map(|n| n.name).collect();

        assert_eq!(names, vec![name("a"), name("c")]);
        assert_eq!(registry.num_members(), 2);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_reap_removes_only_expired_terminal_entries() {
        let mut registry = Registry::new(node("a", 7000), 1);
        registry.insert(NodeState::new(node("b", 7002), State::Dead, 1));
        registry.insert(NodeState::new(node("c", 7004), State::Alive, 1));

        let later = Instant::now() + Duration::from_secs(60);
        let reaped = registry.reap(Duration::from_secs(30), later);

        assert_eq!(reaped, vec![name("b")]);
        assert!(registry.get(&name("b")).is_none());
        assert!(registry.get(&name("c")).is_some());
        assert!(registry.get(&name("a")).is_some());
    }

    // ============================================================
    // STATE MACHINE TESTS
    // ============================================================

    #[test]
    fn test_alive_about_unknown_node_adds_it() {
        let mut state = cluster(&[]);

        let effects = state.alive_node(1, node("b", 7002), Instant::now());

        assert_eq!(
            effects.events,
            vec![MembershipEvent::NodeJoined(node("b", 7002))]
        );
        assert_eq!(state.registry.num_members(), 2);
        assert_eq!(state.broadcasts.len(), 1);
    }

    #[test]
    fn test_replayed_messages_are_noops() {
        let mut state = cluster(&["b"]);
        let now = Instant::now();

        let replay = state.alive_node(1, node("b", 7100), now);
        assert!(replay.is_empty());
        assert!(state.broadcasts.is_empty());

        let first = state.suspect_node(1, &name("b"), &name("local"), now);
        assert_eq!(first.timers.len(), 1);
        state.broadcasts.reset();

        let replay = state.suspect_node(1, &name("b"), &name("local"), now);
        assert!(replay.is_empty());
        assert!(state.broadcasts.is_empty());

        state.dead_node(1, &name("b"), &name("local"), now);
        state.broadcasts.reset();

        let replay = state.dead_node(1, &name("b"), &name("local"), now);
        assert!(replay.is_empty());
        assert!(state.broadcasts.is_empty());
    }

    #[test]
    fn test_suspect_requires_current_incarnation() {
        let mut state = cluster(&[]);
        let now = Instant::now();
        state.alive_node(5, node("b", 7002), now);

        let stale = state.suspect_node(4, &name("b"), &name("local"), now);

        assert!(stale.is_empty());
        assert_eq!(state_of(&state, "b"), (State::Alive, 5));

        let effects = state.suspect_node(5, &name("b"), &name("local"), now);
        assert_eq!(
            effects.events,
            vec![MembershipEvent::NodeSuspected(name("b"))]
        );
        assert_eq!(state_of(&state, "b"), (State::Suspect, 5));
    }

    #[test]
    fn test_corroboration_shortens_suspicion_and_rebroadcasts() {
        let mut state = cluster(&["b", "c", "d"]);
        let now = Instant::now();

        state.suspect_node(1, &name("b"), &name("local"), now);
        let initial = state.remaining_suspicion(&name("b"), now).unwrap();
        state.broadcasts.reset();

        let effects = state.suspect_node(1, &name("b"), &name("c"), now);

        assert!(effects.events.is_empty());
        assert_eq!(state.broadcasts.len(), 1);
        assert_eq!(state.registry.get(&name("b")).unwrap().confirmations(), 1);

        let shortened = state.remaining_suspicion(&name("b"), now).unwrap();
        assert!(shortened < initial, "{:?} !< {:?}", shortened, initial);
    }

    #[test]
    fn test_higher_alive_refutes_suspicion() {
        let mut state = cluster(&["b"]);
        let now = Instant::now();
        state.suspect_node(1, &name("b"), &name("local"), now);

        let equal = state.alive_node(1, node("b", 7100), now);
        assert!(equal.is_empty());
        assert_eq!(state_of(&state, "b"), (State::Suspect, 1));

        state.alive_node(2, node("b", 7100), now);
        assert_eq!(state_of(&state, "b"), (State::Alive, 2));
        assert!(state.suspicion_deadline(&name("b"), 1).is_none());
    }

    #[test]
    fn test_suspicion_expiry_declares_dead() {
        let mut state = cluster(&["b"]);
        let now = Instant::now();
        state.suspect_node(1, &name("b"), &name("local"), now);

        let early = state.expire_suspicion(&name("b"), 1, now);
        assert!(early.is_empty());

        let effects = state.expire_suspicion(&name("b"), 1, now + Duration::from_secs(5));

        assert_eq!(
            effects.events,
            vec![MembershipEvent::NodeFailed(node("b", 7100))]
        );
        assert_eq!(state_of(&state, "b"), (State::Dead, 1));
        assert_eq!(state.registry.num_members(), 1);
    }

    #[test]
    fn test_left_outranks_dead_at_equal_incarnation() {
        let mut state = cluster(&["b"]);
        let now = Instant::now();

        state.dead_node(1, &name("b"), &name("local"), now);
        assert_eq!(state_of(&state, "b"), (State::Dead, 1));

        let effects = state.dead_node(1, &name("b"), &name("b"), now);
        assert_eq!(
            effects.events,
            vec![MembershipEvent::NodeLeft(node("b", 7100))]
        );
        assert_eq!(state_of(&state, "b"), (State::Left, 1));

        let downgrade = state.dead_node(1, &name("b"), &name("local"), now);
        assert!(downgrade.is_empty());
        assert_eq!(state_of(&state, "b"), (State::Left, 1));
    }

    #[test]
    fn test_dead_node_comes_back_with_higher_incarnation() {
        let mut state = cluster(&["b"]);
        let now = Instant::now();
        state.dead_node(1, &name("b"), &name("local"), now);

        let effects = state.alive_node(2, node("b", 7100), now);

        assert_eq!(
            effects.events,
            vec![MembershipEvent::NodeJoined(node("b", 7100))]
        );
        assert_eq!(state_of(&state, "b"), (State::Alive, 2));
    }

    #[test]
    fn test_unknown_node_is_not_suspected() {
        let mut state = cluster(&[]);
        let now = Instant::now();

        assert!(state.suspect_node(3, &name("ghost"), &name("b"), now).is_empty());
        assert!(state.dead_node(3, &name("ghost"), &name("b"), now).is_empty());
        assert!(state.registry.get(&name("ghost")).is_none());
    }

    #[test]
    fn test_incompatible_alive_is_ignored() {
        let mut state = cluster(&[]);
        let mut future = node("future", 7002);
        future.version = ProtocolVersion {
            min: PROTOCOL_VERSION_MAX + 1,
            max: PROTOCOL_VERSION_MAX + 1,
            current: PROTOCOL_VERSION_MAX + 1,
        };

        let effects = state.alive_node(1, future, Instant::now());

        assert!(effects.is_empty());
        assert_eq!(state.registry.len(), 1);
    }

    // ============================================================
    // INCARNATION & REFUTATION TESTS
    // ============================================================

    #[test]
    fn test_refutes_current_suspicion_about_self() {
        let mut state = cluster(&["b"]);
        assert_eq!(state.local_incarnation(), 1);

        state.suspect_node(1, &name("local"), &name("b"), Instant::now());

        assert_eq!(state.local_incarnation(), 2);
        assert_eq!(state.registry.local_state().state, State::Alive);
        assert_eq!(state.broadcasts.len(), 1);
    }

    #[test]
    fn test_ignores_stale_accusations_about_self() {
        let mut state = cluster(&["b"]);
        let now = Instant::now();
        state.suspect_node(1, &name("local"), &name("b"), now);
        state.broadcasts.reset();

        state.suspect_node(1, &name("local"), &name("b"), now);
        state.dead_node(0, &name("local"), &name("b"), now);

        assert_eq!(state.local_incarnation(), 2);
        assert!(state.broadcasts.is_empty());
    }

    #[test]
    fn test_refutation_jumps_past_accused_incarnation() {
        let mut state = cluster(&["b"]);

        state.dead_node(9, &name("local"), &name("b"), Instant::now());

        assert_eq!(state.local_incarnation(), 10);
        assert_eq!(state.registry.local_state().state, State::Alive);
    }

    #[test]
    fn test_incarnation_never_decreases() {
        let mut state = cluster(&["b"]);
        let now = Instant::now();
        let mut previous = state.local_incarnation();

        for accused in [3, 1, 7, 2, 7, 0] {
            state.suspect_node(accused, &name("local"), &name("b"), now);
            let current = state.local_incarnation();
            assert!(current >= previous);
            previous = current;
        }

        assert_eq!(previous, 8);
    }

    #[test]
    fn test_leave_marks_self_left_once() {
        let mut state = cluster(&["b"]);
        let now = Instant::now();

        let finished = state.leave_local(now);

        assert!(finished.is_some());
        assert_eq!(state.registry.local_state().state, State::Left);
        assert_eq!(state.local_incarnation(), 2);
        assert!(state.leave_local(now).is_none());

        // A leaving node does not fight accusations.
        state.dead_node(5, &name("local"), &name("b"), now);
        assert_eq!(state.local_incarnation(), 2);
    }

    // ============================================================
    // PUSH/PULL MERGE TESTS
    // ============================================================

    #[test]
    fn test_merge_downgrades_remote_dead_to_suspect() {
        let mut state = cluster(&["b", "d"]);
        let now = Instant::now();

        let entries = vec![
            PushNodeState {
                node: node("b", 7100),
                incarnation: 1,
                state: State::Dead,
            },
            PushNodeState {
                node: node("d", 7102),
                incarnation: 2,
                state: State::Left,
            },
        ];
        state.merge_remote(entries, &name("c"), now);

        assert_eq!(state_of(&state, "b"), (State::Suspect, 1));
        assert_eq!(state_of(&state, "d"), (State::Left, 2));
    }

    #[test]
    fn test_merge_and_gossip_agree() {
        let mut merged = cluster(&["b", "d"]);
        let mut gossiped = cluster(&["b", "d"]);
        let now = Instant::now();

        merged.merge_remote(
            vec![
                PushNodeState {
                    node: node("b", 7100),
                    incarnation: 3,
                    state: State::Alive,
                },
                PushNodeState {
                    node: node("d", 7102),
                    incarnation: 2,
                    state: State::Left,
                },
                PushNodeState {
                    node: node("e", 7200),
                    incarnation: 1,
                    state: State::Alive,
                },
            ],
            &name("c"),
            now,
        );

        gossiped.apply_message(
            Message::Alive {
                incarnation: 3,
                node: node("b", 7100),
            },
            now,
        );
        gossiped.apply_message(
            Message::Dead {
                incarnation: 2,
                node: name("d"),
                from: name("d"),
            },
            now,
        );
        gossiped.apply_message(
            Message::Alive {
                incarnation: 1,
                node: node("e", 7200),
            },
            now,
        );

        for peer in ["b", "d", "e"] {
            assert_eq!(state_of(&merged, peer), state_of(&gossiped, peer), "{}", peer);
        }
        assert_eq!(merged.registry.members(), gossiped.registry.members());
    }

    // ============================================================
    // PEER SELECTION TESTS
    // ============================================================

    #[test]
    fn test_user_payloads_keep_order_across_packets() {
        let mut state = cluster(&[]);
        let user = |byte| Message::User {
            payload: vec![byte; 10],
        };

        // Each encoded payload plus its part prefix takes 30 bytes.
        let first = state.fill_packet(vec![vec![b't'; 10], vec![b'f'; 10]], 40);
        let second = state.fill_packet(Vec::new(), 40);

        assert_eq!(first, vec![encode_message(&user(b't')).unwrap()]);
        assert_eq!(second, vec![encode_message(&user(b'f')).unwrap()]);
        assert!(state.broadcasts.is_empty());
    }

    #[test]
    fn test_probe_ring_visits_every_live_peer_once_per_cycle() {
        let mut state = cluster(&["b", "c", "d"]);
        let now = Instant::now();

        let cycle: HashSet<NodeName> = (0..3)
            .map(|_| state.next_probe_target(now).unwrap().0.name)
            .collect();
        assert_eq!(cycle, [name("b"), name("c"), name("d")].into_iter().collect::<HashSet<_>>());

        state.dead_node(1, &name("c"), &name("local"), now);

        let cycle: HashSet<NodeName> = (0..2)
            .map(|_| state.next_probe_target(now).unwrap().0.name)
            .collect();
        assert_eq!(cycle, [name("b"), name("d")].into_iter().collect::<HashSet<_>>());
    }

    #[test]
    fn test_probe_ring_is_empty_without_peers() {
        let mut state = cluster(&[]);
        assert!(state.next_probe_target(Instant::now()).is_none());
    }

    #[test]
    fn test_gossip_reaches_recently_dead_but_not_left() {
        let mut state = cluster(&["b", "c", "d"]);
        let now = Instant::now();
        state.dead_node(1, &name("c"), &name("local"), now);
        state.dead_node(1, &name("d"), &name("d"), now);

        let addr = |peer: &str| state.registry.get(&name(peer)).unwrap().node.gossip_addr;
        let (b, c, d) = (addr("b"), addr("c"), addr("d"));

        let targets = state.gossip_targets(10, now);
        assert!(targets.contains(&b));
        assert!(targets.contains(&c));
        assert!(!targets.contains(&d));

        let later = now + Duration::from_secs(60);
        assert_eq!(state.gossip_targets(10, later), vec![b]);
    }

    #[test]
    fn test_indirect_helpers_exclude_target() {
        let mut state = cluster(&["b", "c", "d"]);
        let target = state.registry.get(&name("b")).unwrap().node.gossip_addr;

        let helpers = state.indirect_helpers(&name("b"), 3);

        assert_eq!(helpers.len(), 2);
        assert!(!helpers.contains(&target));
    }

    // ============================================================
    // SERVICE TESTS
    // ============================================================

    /// Records delegate traffic for assertions.
    #[derive(Default)]
    struct RecordingDelegate {
        meta: Vec<u8>,
        state: Vec<u8>,
        pending: Mutex<Vec<Vec<u8>>>,
        received: Mutex<Vec<Vec<u8>>>,
        remote_states: Mutex<Vec<Vec<u8>>>,
    }

    impl Delegate for RecordingDelegate {
        fn node_meta(&self, _limit: usize) -> Vec<u8> {
            self.meta.clone()
        }

        fn notify_msg(&self, msg: &[u8]) {
            self.received.lock().push(msg.to_vec());
        }

        fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.pending.lock())
        }

        fn local_state(&self) -> Vec<u8> {
            self.state.clone()
        }

        fn merge_remote_state(&self, buf: &[u8]) {
            self.remote_states.lock().push(buf.to_vec());
        }
    }

    fn test_config(node: &str) -> Config {
        Config {
            rng_seed: Some(42),
            ..Config::local().with_name(node)
        }
    }

    async fn create(node: &str) -> Arc<MembershipService> {
        MembershipService::create(test_config(node), Arc::new(NoopDelegate))
            .await
            .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    fn member_names(service: &MembershipService) -> HashSet<NodeName> {
        service.members().into_iter().map(|n| n.name).collect()
    }

    #[tokio::test]
    async fn test_create_reports_only_itself() {
        let config = test_config("solo");
        let service = create("solo").await;

        let members = service.members();
        assert_eq!(members.len(), 1);
        assert_eq!(service.num_members(), 1);
        assert_eq!(members[0].name, name("solo"));
        assert_eq!(members[0].version, config.version());
        assert_ne!(service.gossip_addr().port(), 0);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_checks_protocol_version_bounds() {
        let too_new = Config {
            protocol_version: PROTOCOL_VERSION_MAX + 1,
            ..test_config("too-new")
        };
        let err = MembershipService::create(too_new, Arc::new(NoopDelegate))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MembershipError::VersionMismatch { .. }));

        for version in PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_MAX {
            let config = Config {
                protocol_version: version,
                ..test_config("versioned")
            };
            let service = MembershipService::create(config, Arc::new(NoopDelegate))
                .await
                .unwrap();
            assert_eq!(service.local_node().version.current, version);
            service.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_create_fails_on_taken_port() {
        let first = create("first").await;
        let config = Config {
            udp_port: first.gossip_addr().port(),
            ..test_config("second")
        };

        let err = MembershipService::create(config, Arc::new(NoopDelegate))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MembershipError::BindFailure { transport: "udp", .. }));

        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_rejects_oversized_meta() {
        let delegate = RecordingDelegate {
            meta: vec![0; 513],
            ..Default::default()
        };

        let err = MembershipService::create(test_config("fat"), Arc::new(delegate))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MembershipError::MetaTooLarge { size: 513, .. }));
    }

    #[tokio::test]
    async fn test_join_converges_both_sides() {
        let m1 = create("m1").await;
        let m2 = create("m2").await;

        let (joined, error) = m2.join(&[m1.stream_addr()]).await.unwrap();
        assert_eq!(joined, 1);
        assert!(error.is_none());

        assert!(wait_until(Duration::from_secs(2), || m1.num_members() == 2).await);
        assert_eq!(m2.num_members(), 2);
        assert_eq!(member_names(&m1), member_names(&m2));

        m1.shutdown().await;
        m2.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_reports_unreachable_seeds() {
        let m1 = create("m1").await;
        let m2 = create("m2").await;

        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let (joined, error) = m2.join(&[closed, m1.stream_addr()]).await.unwrap();

        assert_eq!(joined, 1);
        let error = error.unwrap();
        assert_eq!(error.failures.len(), 1);
        assert_eq!(error.failures[0].addr, closed);

        m1.shutdown().await;
        m2.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_reports_incompatible_seed() {
        let good = create("good").await;
        let newer = MembershipService::create(
            Config {
                protocol_version: 2,
                protocol_min: 2,
                protocol_max: 2,
                ..test_config("newer")
            },
            Arc::new(NoopDelegate),
        )
        .await
        .unwrap();
        let joiner = MembershipService::create(
            Config {
                protocol_version: 1,
                protocol_max: 1,
                ..test_config("joiner")
            },
            Arc::new(NoopDelegate),
        )
        .await
        .unwrap();

        let (joined, error) = joiner
            .join(&[good.stream_addr(), newer.stream_addr()])
            .await
            .unwrap();

        assert_eq!(joined, 1);
        let error = error.unwrap();
        assert_eq!(error.failures.len(), 1);
        assert_eq!(error.failures[0].addr, newer.stream_addr());
        assert!(matches!(
            error.failures[0].error,
            MembershipError::VersionMismatch { version: 2, .. }
        ));
        assert!(member_names(&joiner).contains(&name("good")));
        assert!(!member_names(&joiner).contains(&name("newer")));

        good.shutdown().await;
        newer.shutdown().await;
        joiner.shutdown().await;
    }

    #[tokio::test]
    async fn test_meta_propagates_on_join() {
        let delegate = RecordingDelegate {
            meta: b"web".to_vec(),
            ..Default::default()
        };
        let m1 = MembershipService::create(test_config("m1"), Arc::new(delegate))
            .await
            .unwrap();
        let m2 = create("m2").await;

        m2.join(&[m1.stream_addr()]).await.unwrap();

        let seen = m2
            .members()
            .into_iter()
            .find(|n| n.name == name("m1"))
            .unwrap();
        assert_eq!(seen.meta, b"web".to_vec());

        m1.shutdown().await;
        m2.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_exchanges_delegate_state() {
        let d1 = Arc::new(RecordingDelegate {
            state: b"state-a".to_vec(),
            ..Default::default()
        });
        let d2 = Arc::new(RecordingDelegate {
            state: b"state-b".to_vec(),
            ..Default::default()
        });
        let m1 = MembershipService::create(test_config("m1"), d1.clone())
            .await
            .unwrap();
        let m2 = MembershipService::create(test_config("m2"), d2.clone())
            .await
            .unwrap();

        m2.join(&[m1.stream_addr()]).await.unwrap();

        assert_eq!(*d2.remote_states.lock(), vec![b"state-a".to_vec()]);
        assert!(wait_until(Duration::from_secs(2), || !d1.remote_states.lock().is_empty()).await);
        assert_eq!(*d1.remote_states.lock(), vec![b"state-b".to_vec()]);

        m1.shutdown().await;
        m2.shutdown().await;
    }

    #[tokio::test]
    async fn test_user_broadcasts_delivered_in_order_once() {
        let sender = Arc::new(RecordingDelegate::default());
        let receiver = Arc::new(RecordingDelegate::default());
        let m1 = MembershipService::create(test_config("m1"), sender.clone())
            .await
            .unwrap();
        let m2 = MembershipService::create(test_config("m2"), receiver.clone())
            .await
            .unwrap();

        m2.join(&[m1.stream_addr()]).await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || m1.num_members() == 2).await);

        sender
            .pending
            .lock()
            .extend([b"test".to_vec(), b"foobar".to_vec()]);

        assert!(wait_until(Duration::from_secs(2), || receiver.received.lock().len() >= 2).await);
        // Give duplicates a chance to show up.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            *receiver.received.lock(),
            vec![b"test".to_vec(), b"foobar".to_vec()]
        );

        m1.shutdown().await;
        m2.shutdown().await;
    }

    #[tokio::test]
    async fn test_leave_removes_node_from_peers() {
        let m1 = create("m1").await;
        let m2 = create("m2").await;
        let m3 = create("m3").await;

        m2.join(&[m1.stream_addr()]).await.unwrap();
        m3.join(&[m1.stream_addr()]).await.unwrap();
        assert!(
            wait_until(Duration::from_secs(3), || {
                m1.num_members() == 3 && m2.num_members() == 3 && m3.num_members() == 3
            })
            .await
        );

        let mut events = m2.subscribe();
        m1.leave(Duration::from_secs(1)).await.unwrap();

        assert!(
            wait_until(Duration::from_secs(3), || {
                m2.num_members() == 2 && m3.num_members() == 2
            })
            .await
        );
        assert!(!member_names(&m2).contains(&name("m1")));

        let mut saw_left = false;
        while let Ok(event) = events.try_recv() {
            if matches!(&event, MembershipEvent::NodeLeft(n) if n.name == name("m1")) {
                saw_left = true;
            }
        }
        assert!(saw_left);

        m2.shutdown().await;
        m3.shutdown().await;
    }

    #[tokio::test]
    async fn test_unresponsive_node_is_declared_dead() {
        let m1 = create("m1").await;
        let m2 = create("m2").await;

        m2.join(&[m1.stream_addr()]).await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || m1.num_members() == 2).await);

        let mut events = m1.subscribe();
        m2.shutdown().await;

        assert!(wait_until(Duration::from_secs(5), || m1.num_members() == 1).await);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&MembershipEvent::NodeSuspected(name("m2"))));
        assert!(
            seen.iter()
                .any(|e| matches!(e, MembershipEvent::NodeFailed(n) if n.name == name("m2")))
        );

        m1.shutdown().await;
    }

    #[tokio::test]
    async fn test_indirect_ping_is_relayed_back_to_requester() {
        let helper = create("helper").await;
        let target = create("target").await;
        let requester = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let request = Message::IndirectPing {
            seq: 77,
            target: target.gossip_addr(),
            target_name: name("target"),
        };
        let packet = Packet::new(
            helper.local_node().version,
            vec![encode_message(&request).unwrap()],
        );
        requester
            .send_to(&encode_packet(&packet).unwrap(), helper.gossip_addr())
            .await
            .unwrap();

        let mut buf = vec![0u8; 65536];
        let relayed_by = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let (len, from) = requester.recv_from(&mut buf).await.unwrap();
                let packet = decode_packet(&buf[..len]).unwrap();
                let acked = packet
                    .parts
                    .iter()
                    .any(|part| decode_message(part).ok() == Some(Message::Ack { seq: 77 }));
                if acked {
                    return from;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(relayed_by, helper.gossip_addr());

        helper.shutdown().await;
        target.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_right_after_create() {
        let service = create("brief").await;

        let status = tokio::time::timeout(Duration::from_secs(2), service.shutdown())
            .await
            .unwrap();
        assert_eq!(status, ShutdownStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_releases_ports() {
        let first = create("first").await;
        let udp_port = first.gossip_addr().port();
        let tcp_port = first.stream_addr().port();
        first.shutdown().await;

        let config = Config {
            udp_port,
            tcp_port,
            ..test_config("second")
        };
        let second = MembershipService::create(config, Arc::new(NoopDelegate))
            .await
            .unwrap();
        assert_eq!(second.gossip_addr().port(), udp_port);
        assert_eq!(second.stream_addr().port(), tcp_port);

        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let service = create("once").await;

        assert_eq!(service.shutdown().await, ShutdownStatus::Completed);
        assert_eq!(service.shutdown().await, ShutdownStatus::AlreadyShutdown);
        assert!(service.is_shutdown());
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_fail() {
        let m1 = create("m1").await;
        let m2 = create("m2").await;
        m2.shutdown().await;

        let join = m2.join(&[m1.stream_addr()]).await;
        assert!(matches!(join, Err(MembershipError::UseAfterShutdown)));

        let leave = m2.leave(Duration::from_millis(10)).await;
        assert!(matches!(leave, Err(MembershipError::UseAfterShutdown)));

        m1.shutdown().await;
    }
}
