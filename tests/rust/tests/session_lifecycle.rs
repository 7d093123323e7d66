mod common;

use std::sync::Arc;

use anyhow::Result;
use coordinator::{Dispatch, Outbound, SessionPhase};
use node_core::{CloudNodeConfig, ModelTensors};
use serde_json::json;
use update_store::{LocalStorage, MemoryStorage};

use common::{gradients, new_session, recipients, service, Client};

#[tokio::test]
async fn test_full_session_with_local_storage() -> Result<()> {
    common::init_tracing();
    let dir = tempfile::tempdir()?;
    let node = service(
        &CloudNodeConfig::default(),
        Arc::new(LocalStorage::new(dir.path())),
    );

    let dashboard = Client::new(&node);
    dashboard.register("DASHBOARD", "repo", "key").await;
    let libraries: Vec<Client> = (0..3).map(|_| Client::new(&node)).collect();
    for library in &libraries {
        let reply = library.register("LIBRARY", "repo", "key").await;
        assert_eq!(
            reply,
            json!({"action": "UNICAST", "message": {"action": "REGISTRATION_SUCCESS", "error": false}})
        );
    }

    let start = dashboard.send_json(new_session("repo", "s1", 0.75, 3)).await;
    assert_eq!(start["action"], "BROADCAST");
    assert_eq!(recipients(&start).len(), 3);
    assert_eq!(start["message"]["action"], "TRAIN");
    assert_eq!(start["message"]["round"], 1);
    assert_eq!(start["message"]["hyperparams"]["batch_size"], 32);

    // Round 1: 2 of 3 is below 0.75, the third completes it
    let rounds = [
        [(json!([[1.0, 2.0]]), 1.0), (json!([[3.0, 4.0]]), 1.0), (json!([[5.0, 0.0]]), 2.0)],
        [(json!([[1.0, 1.0]]), 1.0), (json!([[1.0, 1.0]]), 1.0), (json!([[4.0, 4.0]]), 2.0)],
    ];
    let expected = [json!([[3.5, 1.5]]), json!([[2.5, 2.5]])];

    for (index, round) in rounds.iter().enumerate() {
        let round_number = index as u64 + 1;
        for (library, (values, omega)) in libraries.iter().zip(round.iter()).take(2) {
            let ack = library
                .send_json(gradients("repo", "s1", round_number, values.clone(), *omega))
                .await;
            assert_eq!(ack, json!({"action": "NONE"}));
        }
        let (values, omega) = &round[2];
        let next = libraries[2]
            .send_json(gradients("repo", "s1", round_number, values.clone(), *omega))
            .await;
        assert_eq!(next["message"]["action"], "TRAIN");
        assert_eq!(next["message"]["round"], round_number + 1);
        assert_eq!(next["message"]["gradients"], expected[index]);
    }

    // Round 3 terminates the session
    let mut last = Dispatch::None;
    for library in &libraries {
        last = library
            .send(gradients("repo", "s1", 3, json!([[0.0, 0.0]]), 1.0))
            .await;
    }
    match &last {
        Dispatch::Broadcast { client_list, message: Outbound::Stop(stop) } => {
            assert_eq!(client_list.len(), 4);
            assert!(client_list.contains(&dashboard.id));
            assert_eq!(stop.session_id, "s1");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        node.session_snapshot("repo").map(|s| s.phase),
        Some(SessionPhase::Idle)
    );

    // Round 2 is due by frequency, round 3 by termination
    let session_dir = dir.path().join("repo").join("s1");
    assert!(!session_dir.join("1").join("aggregate.json").exists());
    assert!(session_dir.join("2").join("aggregate.json").exists());
    assert!(session_dir.join("3").join("aggregate.json").exists());
    assert_eq!(
        node.store().load_checkpoint("repo", "s1", 2).await?,
        ModelTensors::from_json(&json!([[2.5, 2.5]]))?
    );

    node.store().flush().await?;
    let events = std::fs::read_dir(session_dir.join("events"))?.count();
    assert_eq!(events, 5);
    Ok(())
}

#[tokio::test]
async fn test_stale_duplicate_and_foreign_updates() -> Result<()> {
    let node = service(&CloudNodeConfig::default(), Arc::new(MemoryStorage::new()));
    let dashboard = Client::new(&node);
    dashboard.register("DASHBOARD", "repo", "key").await;
    let a = Client::new(&node);
    let b = Client::new(&node);
    a.register("LIBRARY", "repo", "key").await;
    b.register("LIBRARY", "repo", "key").await;
    dashboard.send(new_session("repo", "s1", 1.0, 5)).await;

    assert_eq!(
        a.send_json(gradients("repo", "s1", 1, json!([[1.0]]), 1.0)).await,
        json!({"action": "NONE"})
    );

    let duplicate = a.send_json(gradients("repo", "s1", 1, json!([[9.0]]), 1.0)).await;
    assert_eq!(duplicate["action"], "UNICAST");
    assert_eq!(duplicate["message"]["error"], true);
    assert_eq!(duplicate["message"]["type"], "SERVER_BUSY");

    let stale = b.send_json(gradients("repo", "s1", 2, json!([[9.0]]), 1.0)).await;
    assert_eq!(stale["message"]["type"], "SERVER_BUSY");

    let foreign = b.send_json(gradients("repo", "other", 1, json!([[9.0]]), 1.0)).await;
    assert_eq!(foreign["message"]["type"], "SERVER_BUSY");

    let outsider = Client::new(&node);
    let rejected = outsider
        .send_json(gradients("repo", "s1", 1, json!([[9.0]]), 1.0))
        .await;
    assert_eq!(rejected["message"]["type"], "NOT_REGISTERED");

    // None of the rejections leaked into the average
    let next = b.send_json(gradients("repo", "s1", 1, json!([[3.0]]), 1.0)).await;
    assert_eq!(next["message"]["round"], 2);
    assert_eq!(next["message"]["gradients"], json!([[2.0]]));
    Ok(())
}

#[tokio::test]
async fn test_dashboard_disconnect_stops_session() -> Result<()> {
    let node = service(&CloudNodeConfig::default(), Arc::new(MemoryStorage::new()));
    let dashboard = Client::new(&node);
    dashboard.register("DASHBOARD", "repo", "key").await;
    let library = Client::new(&node);
    library.register("LIBRARY", "repo", "key").await;
    dashboard.send(new_session("repo", "s1", 1.0, 5)).await;

    let stops = dashboard.disconnect().await;
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].recipients(dashboard.id), vec![library.id]);
    assert!(matches!(stops[0].message(), Some(Outbound::Stop(_))));

    // The old session is gone; the repo accepts a new dashboard and session
    let late = library
        .send_json(gradients("repo", "s1", 1, json!([[1.0]]), 1.0))
        .await;
    assert_eq!(late["message"]["type"], "SERVER_BUSY");

    let successor = Client::new(&node);
    successor.register("DASHBOARD", "repo", "key").await;
    let restart = successor.send_json(new_session("repo", "s2", 1.0, 5)).await;
    assert_eq!(restart["message"]["session_id"], "s2");
    Ok(())
}

#[tokio::test]
async fn test_library_joins_running_round() -> Result<()> {
    let node = service(&CloudNodeConfig::default(), Arc::new(MemoryStorage::new()));
    let dashboard = Client::new(&node);
    dashboard.register("DASHBOARD", "repo", "key").await;
    let first = Client::new(&node);
    first.register("LIBRARY", "repo", "key").await;
    dashboard.send(new_session("repo", "s1", 1.0, 5)).await;

    let late = Client::new(&node);
    let reply = late.register("LIBRARY", "repo", "key").await;
    assert_eq!(reply["action"], "UNICAST");
    assert_eq!(reply["message"]["action"], "TRAIN");
    assert_eq!(reply["message"]["round"], 1);

    let snapshot = node.session_snapshot("repo").expect("repo is known");
    assert_eq!(snapshot.num_nodes_chosen, 2);

    // The round now needs both libraries
    assert_eq!(
        first.send_json(gradients("repo", "s1", 1, json!([[1.0]]), 1.0)).await,
        json!({"action": "NONE"})
    );
    let next = late.send_json(gradients("repo", "s1", 1, json!([[2.0]]), 1.0)).await;
    assert_eq!(next["message"]["round"], 2);
    Ok(())
}

#[tokio::test]
async fn test_api_key_enforced() -> Result<()> {
    let mut config = CloudNodeConfig::default();
    config.auth.api_key = Some("secret".to_string());
    let node = service(&config, Arc::new(MemoryStorage::new()));

    let client = Client::new(&node);
    let reply = client.register("LIBRARY", "repo", "wrong").await;
    assert_eq!(
        reply,
        json!({
            "action": "UNICAST",
            "message": {
                "error": true,
                "error_message": "API key provided is invalid!",
                "type": "AUTHENTICATION",
            },
        })
    );
    assert_eq!(node.registry().registration_count(), 0);

    let reply = client.register("LIBRARY", "repo", "secret").await;
    assert_eq!(reply["message"]["action"], "REGISTRATION_SUCCESS");
    Ok(())
}

#[tokio::test]
async fn test_no_dataset_and_training_error() -> Result<()> {
    let node = service(&CloudNodeConfig::default(), Arc::new(MemoryStorage::new()));
    let dashboard = Client::new(&node);
    dashboard.register("DASHBOARD", "repo", "key").await;
    let a = Client::new(&node);
    let b = Client::new(&node);
    a.register("LIBRARY", "repo", "key").await;
    b.register("LIBRARY", "repo", "key").await;
    dashboard.send(new_session("repo", "s1", 1.0, 5)).await;

    a.send(gradients("repo", "s1", 1, json!([[4.0]]), 1.0)).await;
    let next = b
        .send_json(json!({"type": "NO_DATASET", "repo_id": "repo", "session_id": "s1", "round": 1}))
        .await;
    assert_eq!(next["message"]["round"], 2);
    assert_eq!(next["message"]["gradients"], json!([[4.0]]));

    let failure = a
        .send_json(json!({"type": "TRAINING_ERROR", "repo_id": "repo", "session_id": "s1", "round": 2}))
        .await;
    assert_eq!(failure["action"], "BROADCAST");
    assert_eq!(recipients(&failure).len(), 3);
    assert_eq!(failure["message"]["type"], "MODEL_ERROR");
    assert_eq!(
        node.session_snapshot("repo").map(|s| s.phase),
        Some(SessionPhase::Idle)
    );
    Ok(())
}
