use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;

use rccs::bootstrap::{get_unique_id, AbortFlag, BootstrapError, BootstrapInit, BootstrapState};

fn new_flag() -> AbortFlag {
    Arc::new(AtomicU32::new(0))
}

fn stamp(rank: usize, i: usize) -> u8 {
    ((rank * 31 + i * 7) % 251) as u8
}

async fn launch(num_ranks: usize) -> Vec<BootstrapInit> {
    let handle = get_unique_id().unwrap();
    let tasks = (0..num_ranks).map(|rank| {
        let handle = handle.clone();
        tokio::spawn(async move {
            BootstrapState::init(&handle, rank, num_ranks, new_flag())
                .await
                .unwrap()
        })
    });
    try_join_all(tasks).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn four_rank_rendezvous_builds_a_ring() {
    let inits = launch(4).await;
    for (rank, init) in inits.iter().enumerate() {
        let state = &init.state;
        assert_eq!(state.rank, rank);
        assert_eq!(state.num_ranks, 4);
        assert_eq!(state.peer_comm_addrs.len(), 4);

        let distinct: HashSet<_> = state.peer_comm_addrs.iter().collect();
        assert_eq!(distinct.len(), 4);
        assert_eq!(
            state.peer_comm_addrs[rank],
            state.listener.local_addr().unwrap()
        );

        // The outbound ring socket must point at the right-hand neighbor.
        let ring = state.ring.try_lock().unwrap();
        assert_eq!(
            ring.ring_send.peer_addr().unwrap(),
            state.peer_comm_addrs[(rank + 1) % 4]
        );

        let proxy = init.proxy.as_ref().unwrap();
        assert_eq!(proxy.peer_addrs.len(), 4);
        assert_eq!(state.peer_proxy_addrs, proxy.peer_addrs);
    }
    for init in inits {
        init.state.close().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_rank_group_short_circuits() {
    let inits = launch(1).await;
    let init = inits.into_iter().next().unwrap();

    let mut buf = [0xa5u8; 16];
    init.state.all_gather(&mut buf).await.unwrap();
    assert_eq!(buf, [0xa5u8; 16]);

    init.state.barrier(&[0], 1).await.unwrap();
    init.state.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn all_gather_collects_every_contribution() {
    for num_ranks in [2usize, 4, 8] {
        for slice_size in [1usize, 8, 4096] {
            let inits = launch(num_ranks).await;
            let tasks = inits.into_iter().enumerate().map(|(rank, init)| {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; num_ranks * slice_size];
                    for (i, b) in buf[rank * slice_size..(rank + 1) * slice_size]
                        .iter_mut()
                        .enumerate()
                    {
                        *b = stamp(rank, i);
                    }
                    init.state.all_gather(&mut buf).await.unwrap();
                    for r in 0..num_ranks {
                        for i in 0..slice_size {
                            assert_eq!(
                                buf[r * slice_size + i],
                                stamp(r, i),
                                "bad byte {} of slice {} on rank {}",
                                i,
                                r,
                                rank
                            );
                        }
                    }

                    // A second pass over the filled buffer leaves it unchanged.
                    let snapshot = buf.clone();
                    init.state.all_gather(&mut buf).await.unwrap();
                    assert_eq!(buf, snapshot);

                    init.state.close().unwrap();
                })
            });
            try_join_all(tasks).await.unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn barrier_releases_all_ranks() {
    let inits = launch(5).await;
    let ranks: Vec<usize> = (0..5).collect();
    let tasks = inits.into_iter().map(|init| {
        let ranks = ranks.clone();
        tokio::spawn(async move {
            init.state.barrier(&ranks, 0x77).await.unwrap();
            init.state.close().unwrap();
        })
    });
    try_join_all(tasks).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_order_sends_match_by_peer_and_tag() {
    let inits = launch(3).await;
    let mut inits = inits.into_iter();
    let r0 = inits.next().unwrap();
    let r1 = inits.next().unwrap();
    let r2 = inits.next().unwrap();

    r1.state.send(0, 7, b"A1").await.unwrap();
    r1.state.send(0, 9, b"B1").await.unwrap();
    r2.state.send(0, 7, b"A2").await.unwrap();
    r2.state.send(0, 9, b"B2").await.unwrap();

    let mut buf = [0u8; 8];
    let n = r0.state.recv(2, 9, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"B2");
    let n = r0.state.recv(1, 7, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"A1");
    let n = r0.state.recv(2, 7, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"A2");
    let n = r0.state.recv(1, 9, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"B1");

    r0.state.close().unwrap();
    r1.state.close().unwrap();
    r2.state.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unexpected_queue_preserves_arrival_order() {
    let inits = launch(2).await;
    let mut inits = inits.into_iter();
    let r0 = inits.next().unwrap();
    let r1 = inits.next().unwrap();

    r1.state.send(0, 3, b"first").await.unwrap();
    r1.state.send(0, 3, b"second").await.unwrap();
    r1.state.send(0, 4, b"done").await.unwrap();

    // The tag-4 recv parks both tag-3 messages; they must come back in
    // arrival order.
    let mut buf = [0u8; 8];
    let n = r0.state.recv(1, 4, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"done");
    let n = r0.state.recv(1, 3, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"first");
    let n = r0.state.recv(1, 3, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"second");

    r0.state.close().unwrap();
    r1.state.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_replicates_root_payload() {
    let inits = launch(5).await;
    let ranks: Vec<usize> = (0..5).collect();
    let payload: Vec<u8> = (0..1024).map(|i| ((i * 37 + 11) % 256) as u8).collect();

    let tasks = inits.into_iter().enumerate().map(|(rank, init)| {
        let ranks = ranks.clone();
        let expected = payload.clone();
        tokio::spawn(async move {
            let mut buf = if rank == 2 {
                expected.clone()
            } else {
                vec![0u8; 1024]
            };
            init.state
                .intra_node_broadcast(&ranks, 2, &mut buf)
                .await
                .unwrap();
            assert_eq!(buf, expected);
            init.state.close().unwrap();
        })
    });
    try_join_all(tasks).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn intra_group_all_gather_over_p2p() {
    let inits = launch(3).await;
    let ranks: Vec<usize> = (0..3).collect();
    let slice_size = 8;

    let tasks = inits.into_iter().enumerate().map(|(rank, init)| {
        let ranks = ranks.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 3 * slice_size];
            for (i, b) in buf[rank * slice_size..(rank + 1) * slice_size]
                .iter_mut()
                .enumerate()
            {
                *b = stamp(rank, i);
            }
            init.state
                .intra_node_all_gather(&ranks, &mut buf)
                .await
                .unwrap();
            for r in 0..3 {
                for i in 0..slice_size {
                    assert_eq!(buf[r * slice_size + i], stamp(r, i));
                }
            }
            init.state.close().unwrap();
        })
    });
    try_join_all(tasks).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn split_builds_child_groups_over_parent_p2p() {
    let inits = launch(4).await;
    let tasks = inits.into_iter().enumerate().map(|(rank, init)| {
        tokio::spawn(async move {
            let group: Vec<usize> = if rank % 2 == 0 {
                vec![0, 2]
            } else {
                vec![1, 3]
            };
            let child = init.state.split(&group, false, new_flag()).await.unwrap();
            let child_rank = group.iter().position(|&r| r == rank).unwrap();
            assert_eq!(child.state.rank, child_rank);
            assert_eq!(child.state.num_ranks, 2);
            assert_eq!(child.state.peer_comm_addrs.len(), 2);
            assert!(child.proxy.is_some());

            // The child ring must carry collectives on its own.
            let mut buf = vec![0u8; 2 * 4];
            buf[child_rank * 4..(child_rank + 1) * 4]
                .copy_from_slice(&(rank as u32).to_be_bytes());
            child.state.all_gather(&mut buf).await.unwrap();
            for (i, &global) in group.iter().enumerate() {
                assert_eq!(&buf[i * 4..(i + 1) * 4], &(global as u32).to_be_bytes());
            }

            child.state.close().unwrap();
            init.state.close().unwrap();
        })
    });
    try_join_all(tasks).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn split_share_reuses_parent_proxy() {
    let inits = launch(2).await;
    let group: Vec<usize> = vec![0, 1];
    let tasks = inits.into_iter().map(|init| {
        let group = group.clone();
        tokio::spawn(async move {
            let child = init.state.split(&group, true, new_flag()).await.unwrap();
            assert!(child.proxy.is_none());
            assert!(child.state.peer_proxy_addrs.is_empty());
            child.state.close().unwrap();
            init.state.close().unwrap();
        })
    });
    try_join_all(tasks).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_unblocks_pending_recv() {
    let inits = launch(2).await;
    let mut inits = inits.into_iter();
    let r0 = inits.next().unwrap();
    let r1 = inits.next().unwrap();

    let state = r0.state.clone();
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 4];
        state.recv(1, 99, &mut buf).await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    r0.state.abort_flag.store(1, Ordering::Relaxed);

    let res = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("recv did not unwind after abort")
        .unwrap();
    assert!(matches!(res, Err(BootstrapError::Aborted)));

    r0.state.abort();
    r1.state.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn leftover_unexpected_connection_fails_close() {
    let inits = launch(2).await;
    let mut inits = inits.into_iter();
    let r0 = inits.next().unwrap();
    let r1 = inits.next().unwrap();

    r1.state.send(0, 5, b"stray").await.unwrap();
    r1.state.send(0, 7, b"want").await.unwrap();

    let mut buf = [0u8; 8];
    let n = r0.state.recv(1, 7, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"want");

    // The tag-5 message was never claimed; close must call it out.
    assert!(matches!(
        r0.state.close(),
        Err(BootstrapError::UnexpectedConnections)
    ));
    r1.state.close().unwrap();
}
