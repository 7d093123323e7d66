mod common;

use std::sync::Arc;

use anyhow::Result;
use coordinator::{Dispatch, Outbound, SessionPhase};
use futures::future::join_all;
use node_core::{weighted_mean, CloudNodeConfig, ModelTensors};
use serde_json::json;
use update_store::MemoryStorage;

use common::{gradients, new_session, service, Client};

const LIBRARIES: usize = 32;

fn contribution(index: usize) -> (serde_json::Value, f64) {
    let x = index as f64;
    (json!([[x, -x], [x * 0.5]]), 1.0 + (index % 4) as f64)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_fold_exactly_once() -> Result<()> {
    let node = service(&CloudNodeConfig::default(), Arc::new(MemoryStorage::new()));
    let dashboard = Client::new(&node);
    dashboard.register("DASHBOARD", "repo", "key").await;

    let libraries: Vec<Client> = (0..LIBRARIES).map(|_| Client::new(&node)).collect();
    for library in &libraries {
        library.register("LIBRARY", "repo", "key").await;
    }
    dashboard.send(new_session("repo", "s1", 1.0, 5)).await;

    let handles = libraries.iter().enumerate().map(|(index, library)| {
        let library = library.clone();
        tokio::spawn(async move {
            let (values, omega) = contribution(index);
            library
                .send(gradients("repo", "s1", 1, values, omega))
                .await
        })
    });
    let dispatches: Vec<Dispatch> = join_all(handles)
        .await
        .into_iter()
        .collect::<std::result::Result<_, _>>()?;

    // Exactly one update completes the round; all others are acknowledged
    let trains: Vec<_> = dispatches
        .iter()
        .filter_map(|d| match d.message() {
            Some(Outbound::Train(train)) => Some(train),
            _ => None,
        })
        .collect();
    assert_eq!(trains.len(), 1);
    assert_eq!(
        dispatches.iter().filter(|d| d.is_none()).count(),
        LIBRARIES - 1
    );

    let updates: Vec<(ModelTensors, f64)> = (0..LIBRARIES)
        .map(|index| {
            let (values, omega) = contribution(index);
            Ok((ModelTensors::from_json(&values)?, omega))
        })
        .collect::<node_core::Result<_>>()?;
    let expected = weighted_mean(&updates).expect("non-empty contributions");

    let aggregate = trains[0].gradients.as_ref().expect("gradient session");
    let diff = aggregate.max_abs_diff(&expected).expect("same shapes");
    assert!(diff < 1e-9, "aggregate off by {diff}");

    let snapshot = node.session_snapshot("repo").expect("repo is known");
    assert_eq!(snapshot.current_round, Some(2));
    assert_eq!(snapshot.num_nodes_averaged, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repos_progress_independently() -> Result<()> {
    let node = service(&CloudNodeConfig::default(), Arc::new(MemoryStorage::new()));

    let mut handles = Vec::new();
    for repo in ["repo-a", "repo-b", "repo-c"] {
        let node = node.clone();
        handles.push(tokio::spawn(async move {
            let dashboard = Client::new(&node);
            dashboard.register("DASHBOARD", repo, "key").await;
            let library = Client::new(&node);
            library.register("LIBRARY", repo, "key").await;
            dashboard.send(new_session(repo, "s1", 1.0, 2)).await;

            let mut last = Dispatch::None;
            for round in 1..=2 {
                last = library
                    .send(gradients(repo, "s1", round, json!([[round as f64]]), 1.0))
                    .await;
            }
            last
        }));
    }

    for dispatch in join_all(handles).await {
        assert!(matches!(dispatch?.message(), Some(Outbound::Stop(_))));
    }
    for repo in ["repo-a", "repo-b", "repo-c"] {
        assert_eq!(
            node.session_snapshot(repo).map(|s| s.phase),
            Some(SessionPhase::Idle)
        );
        // Round 2 is both due by frequency and final
        assert_eq!(node.store().checkpoints(repo, "s1").len(), 1);
    }
    Ok(())
}
