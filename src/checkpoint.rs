use anyhow::{anyhow, bail, Context, Result};
use burn::backend::wgpu::Wgpu;
use burn::backend::Autodiff;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::{ModelHyperParams, TrainConfig};
use crate::model::Seq2SeqModel;
use crate::scheduler::WarmupCooldownLr;

pub type TrainingBackend = Autodiff<Wgpu>;

/// チェックポイントディレクトリ名の接頭辞
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// state.jsonのスキーマバージョン（フィールド追加時にインクリメント）
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// ステップ数からチェックポイントディレクトリ名を作る
///
/// ステップ数をゼロ埋めするため、異なるステップの名前は衝突しない。
pub fn checkpoint_dir_name(step: usize) -> String {
    format!("{}{:07}", CHECKPOINT_PREFIX, step)
}

/// チェックポイントに書き出す訓練状態（モデル重みは別ファイル）
#[derive(Serialize, Deserialize, Debug)]
pub struct CheckpointState {
    pub schema_version: u32,
    pub global_step: usize,
    pub epoch: usize,
    /// 直近損失の移動窓の中身
    pub recent_losses: Vec<f32>,
    /// このチェックポイント時点の検証損失
    pub eval_loss: f32,
    pub scheduler: WarmupCooldownLr,
    pub hyper_params: ModelHyperParams,
    pub train_config: TrainConfig,
    pub saved_at: String,
}

/// チェックポイント一式を新しいディレクトリへ保存
///
/// ステップ数をキーとするため既存チェックポイントを上書きしない。
/// 一時ディレクトリに全ファイルを書き切ってからrenameで確定するため、
/// 途中でクラッシュしても中途半端なチェックポイントが残らない
/// （`.tmp`はステップ数として解析できず、最新チェックポイント探索から外れる）。
/// 書き込みに失敗した場合はエラーを返し、訓練ループごと停止させる。
pub fn save_checkpoint<B, O>(
    save_root: &Path,
    model: &Seq2SeqModel<B>,
    optimizer: &O,
    state: &CheckpointState,
) -> Result<PathBuf>
where
    B: AutodiffBackend,
    O: Optimizer<Seq2SeqModel<B>, B>,
{
    let dir = save_root.join(checkpoint_dir_name(state.global_step));
    let tmp_dir = save_root.join(format!("{}.tmp", checkpoint_dir_name(state.global_step)));
    if tmp_dir.exists() {
        // 前回クラッシュの残骸
        std::fs::remove_dir_all(&tmp_dir)
            .with_context(|| format!("一時ディレクトリ削除失敗: {}", tmp_dir.display()))?;
    }
    std::fs::create_dir_all(&tmp_dir)
        .with_context(|| format!("チェックポイントディレクトリ作成失敗: {}", tmp_dir.display()))?;

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();

    model
        .clone()
        .save_file(tmp_dir.join("model"), &recorder)
        .map_err(|e| anyhow!("モデル保存エラー: {:?}", e))?;

    recorder
        .record(optimizer.to_record(), tmp_dir.join("optim"))
        .map_err(|e| anyhow!("オプティマイザ状態保存エラー: {:?}", e))?;

    let json = serde_json::to_string_pretty(state)?;
    std::fs::write(tmp_dir.join("state.json"), json)
        .with_context(|| format!("state.json書き込み失敗: {}", tmp_dir.display()))?;

    std::fs::rename(&tmp_dir, &dir)
        .with_context(|| format!("チェックポイント確定失敗: {}", dir.display()))?;

    println!("チェックポイントを保存: {}", dir.display());
    Ok(dir)
}

/// state.jsonを読み込み（スキーマバージョンを検証）
pub fn load_checkpoint_state(checkpoint_dir: &Path) -> Result<CheckpointState> {
    let path = checkpoint_dir.join("state.json");
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("state.jsonが読み込めません: {}", path.display()))?;
    let state: CheckpointState = serde_json::from_str(&json)
        .with_context(|| format!("state.jsonの解析失敗: {}", path.display()))?;

    if state.schema_version > STATE_SCHEMA_VERSION {
        bail!(
            "未対応のチェックポイントスキーマ: {} (対応: {}以下)",
            state.schema_version,
            STATE_SCHEMA_VERSION
        );
    }

    Ok(state)
}

/// モデルを読み込み（ジェネリックなBackend用）
pub fn load_model_generic<B: Backend>(
    checkpoint_dir: &Path,
    device: &B::Device,
    src_vocab_size: usize,
    tgt_vocab_size: usize,
) -> Result<Seq2SeqModel<B>> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();

    let model = Seq2SeqModel::<B>::new(device, src_vocab_size, tgt_vocab_size)
        .load_file(checkpoint_dir.join("model"), &recorder, device)
        .map_err(|e| anyhow!("モデル読み込みエラー: {:?}", e))?;

    println!("モデルを読み込み: {}", checkpoint_dir.display());
    Ok(model)
}

/// オプティマイザ状態を読み込んで復元
pub fn load_optimizer<B, O>(checkpoint_dir: &Path, optimizer: O, device: &B::Device) -> Result<O>
where
    B: AutodiffBackend,
    O: Optimizer<Seq2SeqModel<B>, B>,
{
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load(checkpoint_dir.join("optim"), device)
        .map_err(|e| anyhow!("オプティマイザ状態読み込みエラー: {:?}", e))?;
    Ok(optimizer.load_record(record))
}

/// 保存ルート直下から最新（最大ステップ）のチェックポイントを探す
pub fn find_latest_checkpoint(save_root: &Path) -> Result<Option<PathBuf>> {
    if !save_root.exists() {
        return Ok(None);
    }

    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(save_root)
        .with_context(|| format!("ディレクトリが読めません: {}", save_root.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(step_str) = name.strip_prefix(CHECKPOINT_PREFIX) else {
            continue;
        };
        let Ok(step) = step_str.parse::<usize>() else {
            continue;
        };
        if latest.as_ref().map_or(true, |(best, _)| step > *best) {
            latest = Some((step, entry.path()));
        }
    }

    Ok(latest.map(|(_, path)| path))
}
