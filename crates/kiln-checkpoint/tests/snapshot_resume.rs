use kiln_checkpoint::{
    BackupConfig, BackupManager, CheckpointError, CompressionType, EmaState, ModelHandle,
    ModelSaver, ModelType, OptimizerState, ParamGroupState, ParameterModule, Precision,
    ProvenanceHeader, SnapshotArtifact, SnapshotConfig, StateFormat, SubModel, TrainProgress,
};
use kiln_tensor::{DType, Device, Tensor, TensorMap};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn weights() -> TensorMap {
    let mut w = TensorMap::new();
    w.insert(
        "proj_out.weight",
        Tensor::from_vec(vec![0.5f32, -1.0, 2.0, 0.125], &[2, 2]).unwrap(),
    );
    w.insert("proj_out.bias", Tensor::zeros(DType::F32, &[2]));
    w
}

fn training_model(progress: TrainProgress) -> ModelHandle {
    let mut optimizer = OptimizerState::new("adamw").with_step(progress.global_step);
    optimizer.add_param_group(
        ParamGroupState::new("transformer", 0.5)
            .with_weight_decay(0.25)
            .with_params(["proj_out.weight", "proj_out.bias"]),
    );
    optimizer.set_buffer(
        "proj_out.weight",
        "exp_avg",
        Tensor::from_vec(vec![0.25f32; 4], &[2, 2]).unwrap(),
    );

    ModelHandle::new(ModelType::PixArtAlpha, optimizer)
        .with_component(
            "transformer",
            ParameterModule::new(serde_json::json!({"_class_name": "Transformer2DModel"}), weights())
                .on_device(Device::Cuda(0)),
        )
        .with_ema(EmaState::new(0.9999, weights()).with_update_step(progress.global_step))
        .with_train_progress(progress)
        .with_model_spec(
            ProvenanceHeader::new("pixart_alpha")
                .with_title("resume test")
                .with_extra("resolution", "512"),
        )
}

#[test]
fn test_resume_restores_counters_exactly() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("snapshot");
    let progress = TrainProgress::new(3, 120, 15360, 4020);
    let mut model = training_model(progress);

    let saver = ModelSaver::new().with_snapshot_config(
        SnapshotConfig::new()
            .with_state_format(StateFormat::MessagePack)
            .with_compression(CompressionType::GzipLevel(6)),
    );
    saver
        .save(&mut model, "internal".parse().unwrap(), &dest, Precision::F16)
        .unwrap();

    assert!(dest.join("optimizer/optimizer.msgpack.gz").is_file());
    assert!(dest.join("ema/ema.msgpack.gz").is_file());
    assert!(saver.snapshot().missing_artifacts(&dest, true).is_empty());

    let snapshot = saver.snapshot().read_snapshot(&dest).unwrap();
    assert_eq!(snapshot.train_progress, progress);
    assert_eq!(snapshot.optimizer.step, 4020);
    assert_eq!(snapshot.optimizer.param_groups[0].weight_decay, 0.25);
    assert_eq!(
        snapshot.optimizer.buffer("proj_out.weight", "exp_avg"),
        model.optimizer.state_dict().buffer("proj_out.weight", "exp_avg")
    );
    let ema = snapshot.ema.expect("ema state");
    assert_eq!(ema.decay, 0.9999);
    assert_eq!(ema.shadow, weights());

    assert_eq!(snapshot.model_spec.title.as_deref(), Some("resume test"));
    assert_eq!(snapshot.model_spec.extra["resolution"], "512");
    assert!(snapshot.model_spec.date.is_some());

    // Weights are float32 regardless of the requested precision.
    let restored = snapshot.pipeline.components["transformer"].clone().into_module();
    assert_eq!(restored.state_dict(), weights());
    assert_eq!(model.devices()["transformer"], Device::Cuda(0));
}

#[test]
fn test_incomplete_snapshot_is_reported() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("snapshot");
    let saver = ModelSaver::new();
    saver
        .save_str(
            &mut training_model(TrainProgress::new(0, 10, 80, 10)),
            "internal",
            &dest,
            Precision::F32,
        )
        .unwrap();

    std::fs::remove_file(dest.join("meta.json")).unwrap();

    assert_eq!(
        saver.snapshot().missing_artifacts(&dest, true),
        vec![SnapshotArtifact::Metadata]
    );
    let err = saver.snapshot().read_snapshot(&dest).unwrap_err();
    assert!(
        matches!(
            err,
            CheckpointError::Artifact {
                artifact: SnapshotArtifact::Metadata,
                ..
            }
        ),
        "{err:?}"
    );
}

#[test]
fn test_rolling_backups_during_training() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let config = BackupConfig::new(tmp.path())
        .with_max_to_keep(2)
        .with_backup_interval(100)
        .with_snapshot(SnapshotConfig::new().with_state_format(StateFormat::Json));
    let mut manager = BackupManager::new(config);
    manager.initialize().unwrap();

    let mut saved = Vec::new();
    for step in (0..=450).step_by(50) {
        if manager.should_backup(step) {
            let mut model = training_model(TrainProgress::new(step / 200, step % 200, step * 16, step));
            saved.push(manager.save(&mut model).unwrap().global_step);
        }
    }
    assert_eq!(saved, vec![100, 200, 300, 400]);
    assert_eq!(
        manager.list_backups(),
        vec![tmp.path().join("backup-300"), tmp.path().join("backup-400")]
    );

    let latest = manager.restore_latest().unwrap();
    assert_eq!(latest.train_progress, TrainProgress::new(2, 0, 6400, 400));
    assert!(matches!(
        manager.restore_step(100),
        Err(CheckpointError::NotFound(_))
    ));

    let mut reopened = BackupManager::new(BackupConfig::new(tmp.path()));
    reopened.initialize().unwrap();
    assert_eq!(reopened.backup_count(), 2);
}
