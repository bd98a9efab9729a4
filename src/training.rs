use anyhow::{bail, Result};
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Int};
use chrono::Local;
use std::path::{Path, PathBuf};

use crate::checkpoint::{
    load_checkpoint_state, load_optimizer, save_checkpoint, CheckpointState, STATE_SCHEMA_VERSION,
};
use crate::config::{ModelHyperParams, TrainConfig, BOS_ID, EOS_ID, LOG_INTERVAL, MAX_LEN, PAD_ID};
use crate::data::{Batch, BatchStream, ParallelDataset};
use crate::metrics::{RollingLoss, TrainingMetrics};
use crate::model::Seq2SeqModel;
use crate::scheduler::WarmupCooldownLr;
use crate::tokenizer::SubwordTokenizer;

/// 訓練ループの状態遷移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// 学習率ウォームアップ中
    Warmup,
    /// 通常訓練中
    Training,
    /// 検証損失の計算とサンプル翻訳中
    Evaluating,
    /// チェックポイント保存直後
    Checkpointed,
    /// ステップ予算を使い切った
    Done,
}

/// 訓練ループの可変状態（ばらばらの変数ではなく1つの構造体に集約）
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: usize,
    pub phase: Phase,
    /// 進捗表示用の直近損失の移動窓
    pub rolling_loss: RollingLoss,
    /// 現在の評価区間の損失合計とステップ数（区間平均の報告用）
    interval_loss_sum: f32,
    interval_step_count: usize,
    /// 評価区間ごとの訓練損失平均
    pub loss_history: Vec<f32>,
    /// 評価ごとの検証損失
    pub eval_losses: Vec<f32>,
}

impl TrainerState {
    pub fn new(loss_window: usize) -> Self {
        Self {
            global_step: 0,
            epoch: 0,
            phase: Phase::Warmup,
            rolling_loss: RollingLoss::new(loss_window),
            interval_loss_sum: 0.0,
            interval_step_count: 0,
            loss_history: Vec::new(),
            eval_losses: Vec::new(),
        }
    }

    fn record_step_loss(&mut self, loss: f32) {
        self.rolling_loss.push(loss);
        self.interval_loss_sum += loss;
        self.interval_step_count += 1;
    }

    /// 評価区間を締めて区間平均を返す
    fn close_interval(&mut self) -> f32 {
        let avg = if self.interval_step_count > 0 {
            self.interval_loss_sum / self.interval_step_count as f32
        } else {
            0.0
        };
        self.loss_history.push(avg);
        self.interval_loss_sum = 0.0;
        self.interval_step_count = 0;
        avg
    }
}

/// バッチをテンソルへ変換: (ソース, デコーダー入力, ラベル)
fn batch_to_tensors<B: Backend>(
    batch: &Batch,
    device: &B::Device,
) -> (Tensor<B, 2, Int>, Tensor<B, 2, Int>, Tensor<B, 2, Int>) {
    let batch_size = batch.len();

    let flat_src: Vec<i32> = batch.src.iter().flatten().copied().collect();
    let src = Tensor::<B, 1, Int>::from_data(flat_src.as_slice(), device)
        .reshape([batch_size, MAX_LEN]);

    let flat_tgt_input: Vec<i32> = batch.tgt_input.iter().flatten().copied().collect();
    let tgt_input = Tensor::<B, 1, Int>::from_data(flat_tgt_input.as_slice(), device)
        .reshape([batch_size, MAX_LEN]);

    let flat_tgt_label: Vec<i32> = batch.tgt_label.iter().flatten().copied().collect();
    let tgt_label = Tensor::<B, 1, Int>::from_data(flat_tgt_label.as_slice(), device)
        .reshape([batch_size, MAX_LEN]);

    (src, tgt_input, tgt_label)
}

/// 損失計算
///
/// パディング位置を除外したクロスエントロピー。バッチ内の有効ターゲット
/// トークン数で正規化されるため、損失のスケールは系列長の分布に依らない。
///
/// `CrossEntropyLoss`の`pad_tokens`はパディング位置をゼロにした上で
/// 全要素数で平均するため、そのままではパディング比率に応じて損失が
/// 縮む。全要素数/有効トークン数でスケールし直して有効トークン平均にする。
fn compute_loss<B: Backend>(
    logits: Tensor<B, 3>,
    tgt_label: Tensor<B, 2, Int>,
    valid_label_tokens: usize,
    device: &B::Device,
) -> Tensor<B, 1> {
    let [batch_size, target_len, vocab_size] = logits.dims();

    let flat_logits = logits.reshape([batch_size * target_len, vocab_size]);
    let flat_targets = tgt_label.reshape([batch_size * target_len]);

    let mean_over_all = CrossEntropyLossConfig::new()
        .with_pad_tokens(Some(vec![PAD_ID as usize]))
        .init(device)
        .forward(flat_logits, flat_targets);

    let rescale = (batch_size * target_len) as f32 / valid_label_tokens as f32;
    mean_over_all.mul_scalar(rescale)
}

/// 検証損失を計算（最大`eval_batches`バッチの平均、検証セット全体は使わない）
fn evaluate<B: Backend>(
    model: &Seq2SeqModel<B>,
    val_data: &ParallelDataset,
    config: &TrainConfig,
    device: &B::Device,
) -> Result<f32> {
    let mut stream = BatchStream::new(val_data, config.batch_size);
    let mut loss_sum = 0.0;
    let mut batch_count = 0;

    while batch_count < config.eval_batches {
        let Some(batch) = stream.next_batch()? else {
            break;
        };
        // 有効トークンのないバッチは0割りを避けてスキップ
        if batch.valid_label_tokens == 0 {
            continue;
        }

        let (src, tgt_input, tgt_label) = batch_to_tensors::<B>(&batch, device);
        let src_mask = src.clone().equal_elem(PAD_ID);

        let logits = model.forward(src, tgt_input, Some(src_mask));
        let loss = compute_loss(logits, tgt_label, batch.valid_label_tokens, device);

        loss_sum += loss.into_scalar().elem::<f32>();
        batch_count += 1;
    }

    if batch_count == 0 {
        bail!("検証データから有効なバッチが1つも作れません");
    }

    Ok(loss_sum / batch_count as f32)
}

/// 検証セット先頭の数文を貪欲法で翻訳して表示（定性確認用）
fn print_sample_translations<B: Backend>(
    model: &Seq2SeqModel<B>,
    val_data: &ParallelDataset,
    src_tokenizer: &SubwordTokenizer,
    tgt_tokenizer: &SubwordTokenizer,
    config: &TrainConfig,
    device: &B::Device,
) -> Result<()> {
    let count = config.sample_sentences.min(val_data.len());
    for idx in 0..count {
        let (src_text, tgt_text) = val_data.pair(idx);

        let (mut src_ids, _) = src_tokenizer.transform(src_text)?;
        src_ids.truncate(MAX_LEN);
        src_ids.resize(MAX_LEN, PAD_ID);

        let src_tokens =
            Tensor::<B, 1, Int>::from_data(src_ids.as_slice(), device).reshape([1, MAX_LEN]);
        let src_mask = src_tokens.clone().equal_elem(PAD_ID);

        let generated = model.generate(
            src_tokens,
            Some(src_mask),
            BOS_ID,
            EOS_ID,
            MAX_LEN,
            tgt_tokenizer.vocab_size(),
        );
        let translation = tgt_tokenizer.inverse_transform(&generated[0])?;

        println!("  入力: {}", src_text);
        println!("  参照: {}", tgt_text);
        println!("  出力: {}", translation);
    }

    Ok(())
}

/// 訓練ループの実行
///
/// ステップ予算を使い切るまで訓練し、`eval_interval` ごとに
/// 評価 → サンプル翻訳 → チェックポイント保存を行う。
/// `resume_from` を渡すとオプティマイザ・スケジューラ・カウンタを復元して続きから訓練する。
#[allow(clippy::too_many_arguments)]
pub fn run_training<B: AutodiffBackend>(
    model: Seq2SeqModel<B>,
    train_data: &ParallelDataset,
    val_data: &ParallelDataset,
    src_tokenizer: &SubwordTokenizer,
    tgt_tokenizer: &SubwordTokenizer,
    config: &TrainConfig,
    save_root: &Path,
    resume_from: Option<&PathBuf>,
    device: &B::Device,
) -> Result<(Seq2SeqModel<B>, TrainingMetrics)> {
    if train_data.is_empty() {
        bail!("訓練データが空です");
    }

    let hyper_params =
        ModelHyperParams::current(src_tokenizer.vocab_size(), tgt_tokenizer.vocab_size());

    let mut optimizer = AdamConfig::new()
        .with_beta_1(0.9)
        .with_beta_2(0.999)
        .with_epsilon(1e-8)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(config.grad_clip_norm)))
        .init();

    let mut scheduler =
        WarmupCooldownLr::new(config.peak_lr, config.warmup_steps, config.cooldown_steps);
    let mut state = TrainerState::new(config.loss_window);

    // チェックポイントからの再開
    if let Some(checkpoint_dir) = resume_from {
        let saved = load_checkpoint_state(checkpoint_dir)?;
        optimizer = load_optimizer::<B, _>(checkpoint_dir, optimizer, device)?;
        scheduler = saved.scheduler;
        state.global_step = saved.global_step;
        state.epoch = saved.epoch;
        state.rolling_loss = RollingLoss::from_values(&saved.recent_losses, config.loss_window);
        println!(
            "チェックポイントから再開: step={}, epoch={}",
            state.global_step, state.epoch
        );
    }

    let mut model = model;
    let mut stream = BatchStream::new(train_data, config.batch_size);

    println!(
        "訓練開始: {}ステップ（ウォームアップ{} + クールダウン{}、評価間隔{}）",
        config.total_steps, config.warmup_steps, config.cooldown_steps, config.eval_interval
    );

    while state.global_step < config.total_steps {
        // バッチ取得。読み切ったらエポックを進めて先頭から読み直す
        let batch = match stream.next_batch()? {
            Some(batch) => batch,
            None => {
                state.epoch += 1;
                stream.restart();
                println!("エポック{}開始 (step {})", state.epoch + 1, state.global_step);
                match stream.next_batch()? {
                    Some(batch) => batch,
                    None => bail!("訓練データからバッチが作れません"),
                }
            }
        };

        // 有効ターゲットトークンが1つもないバッチは損失が定義できないのでスキップ
        if batch.valid_label_tokens == 0 {
            eprintln!("Warning: 有効トークンのないバッチをスキップ");
            continue;
        }

        let (src, tgt_input, tgt_label) = batch_to_tensors::<B>(&batch, device);
        let src_mask = src.clone().equal_elem(PAD_ID);

        // フォワードパス（Teacher Forcing）
        let logits = model.forward(src, tgt_input, Some(src_mask));
        let loss = compute_loss(logits, tgt_label, batch.valid_label_tokens, device);
        let loss_value = loss.clone().into_scalar().elem::<f32>();

        // バックプロパゲーション
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);

        // 学習率スケジュール（全長を超えたら学習率は固定のまま）と勾配クリッピング込みの更新
        let lr = scheduler.advance();
        model = optimizer.step(lr, model, grads);

        state.global_step += 1;
        state.record_step_loss(loss_value);
        state.phase = if scheduler.in_warmup() {
            Phase::Warmup
        } else {
            Phase::Training
        };

        if state.global_step % LOG_INTERVAL == 0 {
            println!(
                "Step {}/{}: loss(直近{}) = {:.6}, lr = {:.2e}",
                state.global_step,
                config.total_steps,
                state.rolling_loss.len(),
                state.rolling_loss.mean(),
                lr
            );
        }

        // 評価 → サンプル翻訳 → チェックポイント保存
        if state.global_step % config.eval_interval == 0 {
            state.phase = Phase::Evaluating;

            let interval_avg = state.close_interval();
            let valid_model = model.valid();
            let eval_loss = evaluate(&valid_model, val_data, config, device)?;
            state.eval_losses.push(eval_loss);

            println!(
                "評価 @ step {}: 訓練損失(区間平均) = {:.6}, 検証損失 = {:.6}",
                state.global_step, interval_avg, eval_loss
            );
            print_sample_translations(
                &valid_model,
                val_data,
                src_tokenizer,
                tgt_tokenizer,
                config,
                device,
            )?;

            let checkpoint_state = CheckpointState {
                schema_version: STATE_SCHEMA_VERSION,
                global_step: state.global_step,
                epoch: state.epoch,
                recent_losses: state.rolling_loss.values(),
                eval_loss,
                scheduler: scheduler.clone(),
                hyper_params: hyper_params.clone(),
                train_config: config.clone(),
                saved_at: Local::now().to_rfc3339(),
            };
            // 保存失敗は致命的（リトライせず訓練ごと停止）
            save_checkpoint(save_root, &model, &optimizer, &checkpoint_state)?;
            // 次のステップで Warmup/Training に戻る
            state.phase = Phase::Checkpointed;
        }
    }

    state.phase = Phase::Done;
    println!("訓練完了: {}ステップ, {}エポック", state.global_step, state.epoch + 1);

    let metrics = TrainingMetrics {
        loss_history: state.loss_history.clone(),
        eval_losses: state.eval_losses.clone(),
        final_loss: state.rolling_loss.mean(),
        total_steps: state.global_step,
        epochs: state.epoch + 1,
        peak_lr: config.peak_lr,
        batch_size: config.batch_size,
    };

    Ok((model, metrics))
}
