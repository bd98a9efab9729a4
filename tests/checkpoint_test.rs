use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::prelude::*;
use burn::tensor::Int;
use std::fs;
use std::path::PathBuf;

use translator_mt::checkpoint::{
    checkpoint_dir_name, load_checkpoint_state, load_model_generic, save_checkpoint,
    CheckpointState, STATE_SCHEMA_VERSION,
};
use translator_mt::config::{ModelHyperParams, TrainConfig, MAX_LEN};
use translator_mt::model::Seq2SeqModel;
use translator_mt::scheduler::WarmupCooldownLr;

type TestBackend = Autodiff<NdArray>;

const SRC_VOCAB: usize = 50;
const TGT_VOCAB: usize = 60;

/// テスト用の一時ディレクトリを作成
fn create_test_dir(name: &str) -> PathBuf {
    let test_dir = PathBuf::from("tests").join(name);
    if test_dir.exists() {
        fs::remove_dir_all(&test_dir).ok();
    }
    fs::create_dir_all(&test_dir).unwrap();
    test_dir
}

/// テスト用の一時ディレクトリを削除
fn cleanup_test_dir(test_dir: &PathBuf) {
    if test_dir.exists() {
        fs::remove_dir_all(test_dir).ok();
    }
}

fn test_state(step: usize) -> CheckpointState {
    CheckpointState {
        schema_version: STATE_SCHEMA_VERSION,
        global_step: step,
        epoch: 1,
        recent_losses: vec![2.0, 1.8],
        eval_loss: 1.9,
        scheduler: WarmupCooldownLr::new(1e-4, 10, 90),
        hyper_params: ModelHyperParams::current(SRC_VOCAB, TGT_VOCAB),
        train_config: TrainConfig::default(),
        saved_at: "test".to_string(),
    }
}

fn dummy_tokens<B: Backend>(ids: &[i32], device: &B::Device) -> Tensor<B, 2, Int> {
    let mut padded = ids.to_vec();
    padded.resize(MAX_LEN, 0);
    Tensor::<B, 1, Int>::from_data(padded.as_slice(), device).reshape([1, MAX_LEN])
}

/// テンソル間の近似一致を検証
fn assert_tensors_close<B: Backend>(a: &Tensor<B, 3>, b: &Tensor<B, 3>, tolerance: f32) -> bool {
    let diff = (a.clone() - b.clone()).abs();
    let diff_data: Vec<f32> = diff.to_data().convert::<f32>().to_vec().unwrap();
    let max_diff = diff_data.iter().copied().fold(0.0_f32, f32::max);
    max_diff < tolerance
}

#[test]
fn test_checkpoint_roundtrip() {
    // デバイス初期化
    let device = NdArrayDevice::default();
    let test_dir = create_test_dir("temp_checkpoint_roundtrip");

    // モデル作成
    let model = Seq2SeqModel::<TestBackend>::new(&device, SRC_VOCAB, TGT_VOCAB);
    let optimizer = AdamConfig::new().init::<TestBackend, Seq2SeqModel<TestBackend>>();

    let src_tokens = dummy_tokens::<NdArray>(&[1, 2, 3, 4, 5], &device);
    let tgt_tokens = dummy_tokens::<NdArray>(&[2, 7, 8], &device);

    // 保存前の出力（推論用の内部バックエンドで計算）
    let output_before = model
        .valid()
        .forward(src_tokens.clone(), tgt_tokens.clone(), None);

    // チェックポイント保存
    let checkpoint_dir =
        save_checkpoint(&test_dir, &model, &optimizer, &test_state(100)).expect("保存失敗");

    // モデル読み込み（NdArray）
    let loaded_model = load_model_generic::<NdArray>(&checkpoint_dir, &device, SRC_VOCAB, TGT_VOCAB)
        .expect("読み込み失敗");

    // 読み込み後の出力
    let output_after = loaded_model.forward(src_tokens, tgt_tokens, None);

    // 近似一致を検証
    assert!(
        assert_tensors_close(&output_before, &output_after, 1e-5),
        "保存前後の出力が一致しません（許容誤差: 1e-5）"
    );

    cleanup_test_dir(&test_dir);
}

#[test]
fn test_checkpoint_files_created() {
    let device = NdArrayDevice::default();
    let test_dir = create_test_dir("temp_checkpoint_files");

    let model = Seq2SeqModel::<TestBackend>::new(&device, SRC_VOCAB, TGT_VOCAB);
    let optimizer = AdamConfig::new().init::<TestBackend, Seq2SeqModel<TestBackend>>();

    let checkpoint_dir =
        save_checkpoint(&test_dir, &model, &optimizer, &test_state(500)).expect("保存失敗");

    assert_eq!(
        checkpoint_dir.file_name().unwrap().to_string_lossy(),
        checkpoint_dir_name(500)
    );
    assert!(checkpoint_dir.join("model.bin").exists());
    assert!(checkpoint_dir.join("optim.bin").exists());
    assert!(checkpoint_dir.join("state.json").exists());

    let state = load_checkpoint_state(&checkpoint_dir).unwrap();
    assert_eq!(state.global_step, 500);
    assert_eq!(state.hyper_params.src_vocab_size, SRC_VOCAB);

    cleanup_test_dir(&test_dir);
}

#[test]
fn test_checkpoints_for_different_steps_coexist() {
    let device = NdArrayDevice::default();
    let test_dir = create_test_dir("temp_checkpoint_coexist");

    let model = Seq2SeqModel::<TestBackend>::new(&device, SRC_VOCAB, TGT_VOCAB);
    let optimizer = AdamConfig::new().init::<TestBackend, Seq2SeqModel<TestBackend>>();

    let dir1 = save_checkpoint(&test_dir, &model, &optimizer, &test_state(100)).expect("保存失敗");
    let dir2 = save_checkpoint(&test_dir, &model, &optimizer, &test_state(200)).expect("保存失敗");

    // 別ステップのチェックポイントは別ディレクトリに残る
    assert_ne!(dir1, dir2);
    assert!(dir1.join("model.bin").exists());
    assert!(dir2.join("model.bin").exists());

    cleanup_test_dir(&test_dir);
}
