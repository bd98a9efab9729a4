use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::backend::Autodiff;
use std::fs;
use std::path::PathBuf;

use translator_mt::checkpoint::{
    checkpoint_dir_name, find_latest_checkpoint, load_checkpoint_state, load_model_generic,
};
use translator_mt::config::TrainConfig;
use translator_mt::data::ParallelDataset;
use translator_mt::model::Seq2SeqModel;
use translator_mt::tokenizer::SubwordTokenizer;
use translator_mt::training::run_training;

type TestBackend = Autodiff<NdArray>;

/// テスト用の一時ディレクトリを作成
fn create_test_dir(name: &str) -> PathBuf {
    let test_dir = PathBuf::from("tests").join(name);
    if test_dir.exists() {
        fs::remove_dir_all(&test_dir).ok();
    }
    fs::create_dir_all(&test_dir).unwrap();
    test_dir
}

fn write_lines(dir: &PathBuf, name: &str, lines: &[&str]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, lines.join("\n")).unwrap();
    path
}

struct ToySetup {
    src_tokenizer: SubwordTokenizer,
    tgt_tokenizer: SubwordTokenizer,
    train_src: PathBuf,
    train_tgt: PathBuf,
    val_src: PathBuf,
    val_tgt: PathBuf,
}

/// 小さな対訳コーパスとトークナイザを用意する
fn toy_setup(dir: &PathBuf) -> ToySetup {
    let train_src = write_lines(
        dir,
        "train.src",
        &[
            "ichi ni san",
            "shi go roku",
            "nana hachi kyu",
            "ichi go kyu",
            "ni shi hachi",
            "san roku kyu",
        ],
    );
    let train_tgt = write_lines(
        dir,
        "train.tgt",
        &[
            "one two three",
            "four five six",
            "seven eight nine",
            "one five nine",
            "two four eight",
            "three six nine",
        ],
    );
    let val_src = write_lines(dir, "val.src", &["ichi ni", "go roku"]);
    let val_tgt = write_lines(dir, "val.tgt", &["one two", "five six"]);

    let src_tokenizer = SubwordTokenizer::fit(&train_src, 200).unwrap();
    let tgt_tokenizer = SubwordTokenizer::fit(&train_tgt, 200).unwrap();

    ToySetup {
        src_tokenizer,
        tgt_tokenizer,
        train_src,
        train_tgt,
        val_src,
        val_tgt,
    }
}

fn toy_config(total_steps: usize) -> TrainConfig {
    TrainConfig {
        batch_size: 2,
        peak_lr: 1e-3,
        warmup_steps: 1,
        cooldown_steps: total_steps.saturating_sub(1).max(1),
        total_steps,
        eval_interval: 2,
        eval_batches: 1,
        grad_clip_norm: 1.0,
        loss_window: 10,
        sample_sentences: 1,
    }
}

#[test]
fn test_training_loop_end_to_end() {
    let test_dir = create_test_dir("temp_training_e2e");
    let setup = toy_setup(&test_dir);

    let train_data = ParallelDataset::load(
        &setup.train_src,
        &setup.train_tgt,
        &setup.src_tokenizer,
        &setup.tgt_tokenizer,
    )
    .unwrap();
    let val_data = ParallelDataset::load(
        &setup.val_src,
        &setup.val_tgt,
        &setup.src_tokenizer,
        &setup.tgt_tokenizer,
    )
    .unwrap();

    let device = NdArrayDevice::default();
    let model = Seq2SeqModel::<TestBackend>::new(
        &device,
        setup.src_tokenizer.vocab_size(),
        setup.tgt_tokenizer.vocab_size(),
    );

    // 2ステップ予算・評価間隔2 → チェックポイントはちょうど1個
    let config = toy_config(2);
    let save_root = test_dir.join("run");
    let (_model, metrics) = run_training(
        model,
        &train_data,
        &val_data,
        &setup.src_tokenizer,
        &setup.tgt_tokenizer,
        &config,
        &save_root,
        None,
        &device,
    )
    .expect("訓練失敗");

    // チェックポイントディレクトリの検証
    let checkpoint_dirs: Vec<_> = fs::read_dir(&save_root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("checkpoint-")
        })
        .collect();
    assert_eq!(checkpoint_dirs.len(), 1, "チェックポイントは1個のはず");
    assert_eq!(
        checkpoint_dirs[0].file_name().to_string_lossy(),
        checkpoint_dir_name(2)
    );

    // 保存された状態の検証
    let state = load_checkpoint_state(&checkpoint_dirs[0].path()).unwrap();
    assert_eq!(state.global_step, 2);
    assert!(state.eval_loss.is_finite());
    assert!(!state.recent_losses.is_empty());

    // メトリクスの検証
    assert_eq!(metrics.total_steps, 2);
    assert_eq!(metrics.eval_losses.len(), 1, "評価は1回のはず");
    assert!(metrics.final_loss.is_finite());
    assert!(metrics.epochs >= 1);

    fs::remove_dir_all(&test_dir).ok();
}

#[test]
fn test_training_resume_from_checkpoint() {
    let test_dir = create_test_dir("temp_training_resume");
    let setup = toy_setup(&test_dir);

    let train_data = ParallelDataset::load(
        &setup.train_src,
        &setup.train_tgt,
        &setup.src_tokenizer,
        &setup.tgt_tokenizer,
    )
    .unwrap();
    let val_data = ParallelDataset::load(
        &setup.val_src,
        &setup.val_tgt,
        &setup.src_tokenizer,
        &setup.tgt_tokenizer,
    )
    .unwrap();

    let device = NdArrayDevice::default();
    let src_vocab = setup.src_tokenizer.vocab_size();
    let tgt_vocab = setup.tgt_tokenizer.vocab_size();
    let model = Seq2SeqModel::<TestBackend>::new(&device, src_vocab, tgt_vocab);

    let save_root = test_dir.join("run");

    // まず2ステップ訓練してチェックポイントを作る
    let config = toy_config(2);
    run_training(
        model,
        &train_data,
        &val_data,
        &setup.src_tokenizer,
        &setup.tgt_tokenizer,
        &config,
        &save_root,
        None,
        &device,
    )
    .expect("初回訓練失敗");

    let latest = find_latest_checkpoint(&save_root)
        .unwrap()
        .expect("チェックポイントがあるはず");

    // 続きから4ステップまで訓練する
    let resumed_model =
        load_model_generic::<TestBackend>(&latest, &device, src_vocab, tgt_vocab).unwrap();
    let config = toy_config(4);
    let (_model, metrics) = run_training(
        resumed_model,
        &train_data,
        &val_data,
        &setup.src_tokenizer,
        &setup.tgt_tokenizer,
        &config,
        &save_root,
        Some(&latest),
        &device,
    )
    .expect("再開訓練失敗");

    assert_eq!(metrics.total_steps, 4);

    // 再開後のチェックポイントはステップ4のもの
    let latest = find_latest_checkpoint(&save_root).unwrap().unwrap();
    assert_eq!(
        latest.file_name().unwrap().to_string_lossy(),
        checkpoint_dir_name(4)
    );
    let state = load_checkpoint_state(&latest).unwrap();
    assert_eq!(state.global_step, 4);

    fs::remove_dir_all(&test_dir).ok();
}
