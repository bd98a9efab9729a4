#![recursion_limit = "256"]

use anyhow::{bail, Result};
use burn::backend::wgpu::WgpuDevice;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Instant;

use translator_mt::checkpoint::{find_latest_checkpoint, load_model_generic, TrainingBackend};
use translator_mt::config::{TrainConfig, VOCAB_SIZE};
use translator_mt::data::ParallelDataset;
use translator_mt::inference::run_translation_inference;
use translator_mt::metrics::save_metrics;
use translator_mt::model::Seq2SeqModel;
use translator_mt::tokenizer::SubwordTokenizer;
use translator_mt::training::run_training;

/// Seq2Seq Transformerによる対訳コーパス機械翻訳
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 訓練モード（訓練を実行する場合に指定）
    #[arg(long)]
    train: bool,

    /// デモモード（縮小したステップ予算で動作確認）
    #[arg(long)]
    demo: bool,

    /// 対訳コーパスのディレクトリ（train.src/train.tgt/val.src/val.tgtを置く）
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// チェックポイントを保存するディレクトリ
    #[arg(long, default_value = "models/run")]
    save: PathBuf,

    /// チェックポイントを読み込むディレクトリ（保存ルートなら最新を選ぶ）
    #[arg(long)]
    load: Option<PathBuf>,

    /// 翻訳するテキスト
    #[arg(long)]
    predict: Option<String>,

    /// バックエンドの選択（auto, wgpu, ndarray）
    #[arg(long, default_value = "wgpu")]
    backend: String,
}

/// 指定パスがチェックポイント本体か保存ルートかを解決する
fn resolve_checkpoint_dir(path: &Path) -> Result<PathBuf> {
    if path.join("state.json").exists() {
        return Ok(path.to_path_buf());
    }
    match find_latest_checkpoint(path)? {
        Some(dir) => Ok(dir),
        None => bail!(
            "チェックポイントが見つかりません: {}",
            path.display()
        ),
    }
}

fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    // トークナイザの準備（保存済みがあれば読み込み、なければコーパスから学習）
    let src_tokenizer = SubwordTokenizer::load_or_fit(
        &args.data_dir.join("tokenizer_src.json"),
        &args.data_dir.join("train.src"),
        VOCAB_SIZE,
    )?;
    let tgt_tokenizer = SubwordTokenizer::load_or_fit(
        &args.data_dir.join("tokenizer_tgt.json"),
        &args.data_dir.join("train.tgt"),
        VOCAB_SIZE,
    )?;
    src_tokenizer.export_vocab(&args.data_dir.join("vocab_src.txt"))?;
    tgt_tokenizer.export_vocab(&args.data_dir.join("vocab_tgt.txt"))?;

    // 訓練モード
    if args.train {
        println!("\n===== 訓練開始 =====");
        let train_data = ParallelDataset::load(
            &args.data_dir.join("train.src"),
            &args.data_dir.join("train.tgt"),
            &src_tokenizer,
            &tgt_tokenizer,
        )?;
        let val_data = ParallelDataset::load(
            &args.data_dir.join("val.src"),
            &args.data_dir.join("val.tgt"),
            &src_tokenizer,
            &tgt_tokenizer,
        )?;

        let config = if args.demo {
            println!("デモモード: 縮小したステップ予算で実行します");
            TrainConfig::demo()
        } else {
            TrainConfig::default()
        };

        let device = WgpuDevice::default();

        // 新規モデル、または既存チェックポイントから再開
        let (model, resume_from) = if let Some(load_dir) = &args.load {
            let checkpoint_dir = resolve_checkpoint_dir(load_dir)?;
            let model = load_model_generic::<TrainingBackend>(
                &checkpoint_dir,
                &device,
                src_tokenizer.vocab_size(),
                tgt_tokenizer.vocab_size(),
            )?;
            (model, Some(checkpoint_dir))
        } else {
            let model = Seq2SeqModel::<TrainingBackend>::new(
                &device,
                src_tokenizer.vocab_size(),
                tgt_tokenizer.vocab_size(),
            );
            (model, None)
        };

        let (_model, metrics) = run_training(
            model,
            &train_data,
            &val_data,
            &src_tokenizer,
            &tgt_tokenizer,
            &config,
            &args.save,
            resume_from.as_ref(),
            &device,
        )?;
        save_metrics(&args.save, &metrics)?;
        println!("訓練完了！");
    }

    // 推論モード
    if let Some(predict_text) = &args.predict {
        println!("\n===== 推論テスト =====");

        let load_root = args.load.as_ref().unwrap_or(&args.save);
        let checkpoint_dir = resolve_checkpoint_dir(load_root)?;

        let translation = run_translation_inference(
            &args.backend,
            &checkpoint_dir,
            predict_text,
            &src_tokenizer,
            &tgt_tokenizer,
        )?;
        println!("入力: {} → 翻訳: {}", predict_text, translation);
    }

    // 使い方表示（引数なし）
    if !args.train && args.predict.is_none() {
        println!("===== 使用方法 =====");
        println!("  訓練:     cargo run --release -- --train --save models/run");
        println!("  デモ訓練: cargo run --release -- --train --demo --save models/demo");
        println!("  翻訳:     cargo run --release -- --load models/run --predict \"こんにちは\"");
        println!("  継続訓練: cargo run --release -- --load models/run --train --save models/run");
    }

    let duration = start_time.elapsed();
    println!("\n実行時間: {:.2}秒", duration.as_secs_f64());

    Ok(())
}
