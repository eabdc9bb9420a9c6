// Two collaborator engines against a real aggregator on an ephemeral port.
#![cfg(unix)]

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use aggregator::{serve, FederationService};
use collaborator::{CollaboratorEngine, EngineConfig, GrpcTransport, ProcessTrainer, Trainer, WorkingDir};
use common::{fast_settings, ShiftTrainer};
use fedlink_core::aggregation::{decode_weights, encode_weights, Mean};
use fedlink_core::security::{SecuritySettings, TlsSettings};
use fedlink_core::task::TaskConfig;
use fedlink_core::{ClientTransport, CoordinationMode, RoundEngine, ServerTransport};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn plaintext() -> SecuritySettings {
    SecuritySettings { tls: TlsSettings { enabled: false, allow_insecure: true, ..TlsSettings::default() } }
}

#[tokio::test]
async fn collaborators_train_two_rounds_over_grpc() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("final.bin");
    let engine = Arc::new(RoundEngine::new(CoordinationMode::Sync, encode_weights(&[0.0, 0.0]), Box::new(Mean)));
    engine.join("c1").unwrap();
    engine.join("c2").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = FederationService::new(Arc::clone(&engine)).with_output_model(Some(output.clone()));
    let stop = CancellationToken::new();
    let shutdown = stop.clone();
    let server = tokio::spawn(async move {
        serve(service, ServerTransport::from_settings(&plaintext()).unwrap(), listener, async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });

    // c2 trains through a real child process that returns the model unchanged.
    let script = dir.path().join("train.sh");
    std::fs::write(&script, "cp \"$2\" \"$4\"\n").unwrap();
    let shell = ProcessTrainer::new(TaskConfig {
        script: script.to_str().unwrap().to_string(),
        interpreter: Some("/bin/sh".into()),
        args: BTreeMap::new(),
    });

    let security = ClientTransport::from_settings(&plaintext()).unwrap();
    let trainers: [(&str, Arc<dyn Trainer>); 2] = [("c1", Arc::new(ShiftTrainer::new(1.0))), ("c2", Arc::new(shell))];
    let mut runs = Vec::new();
    for (id, trainer) in trainers {
        let transport = GrpcTransport::connect(&addr.to_string(), &security, Duration::from_secs(5)).unwrap();
        let config = EngineConfig { id: id.into(), mode: CoordinationMode::Sync, rounds: 2, settings: fast_settings() };
        let workdir = WorkingDir::create(dir.path().join(id)).await.unwrap();
        let mut c = CollaboratorEngine::new(config, Arc::new(transport), trainer, workdir);
        runs.push(tokio::spawn(async move { c.run(CancellationToken::new()).await }));
    }
    for run in runs {
        let summary = tokio::time::timeout(Duration::from_secs(20), run).await.unwrap().unwrap().unwrap();
        assert_eq!(summary.rounds_completed, 2);
    }

    assert_eq!(engine.current_round(), 3);
    // [0,0] -> mean([1,1],[0,0]) = [0.5,0.5] -> mean([1.5,1.5],[0.5,0.5]) = [1,1]
    let written = fedlink_core::ModelBlob::new(std::fs::read(&output).unwrap());
    assert_eq!(decode_weights(&written).unwrap(), vec![1.0, 1.0]);

    stop.cancel();
    server.await.unwrap();
}
