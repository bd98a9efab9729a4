use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

/// 直近の損失を保持する固定長の移動窓
///
/// 進捗表示用の平滑化メトリクス。評価時に報告する区間平均とは別物。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RollingLoss {
    window: VecDeque<f32>,
    capacity: usize,
}

impl RollingLoss {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, loss: f32) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(loss);
    }

    pub fn mean(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// チェックポイント保存用に中身を取り出す
    pub fn values(&self) -> Vec<f32> {
        self.window.iter().copied().collect()
    }

    /// チェックポイントから復元する
    pub fn from_values(values: &[f32], capacity: usize) -> Self {
        let mut rolling = Self::new(capacity);
        for &v in values {
            rolling.push(v);
        }
        rolling
    }
}

/// 訓練メトリクス
#[derive(Serialize, Deserialize, Debug)]
pub struct TrainingMetrics {
    /// 評価区間ごとの訓練損失平均
    pub loss_history: Vec<f32>,
    /// 評価ごとの検証損失
    pub eval_losses: Vec<f32>,
    /// 最終訓練損失（移動窓平均）
    pub final_loss: f32,
    /// 実行した総ステップ数
    pub total_steps: usize,
    /// 経過エポック数
    pub epochs: usize,
    /// 最大学習率
    pub peak_lr: f64,
    /// バッチサイズ
    pub batch_size: usize,
}

/// メトリクスをJSONで保存
pub fn save_metrics(save_dir: &Path, metrics: &TrainingMetrics) -> Result<()> {
    std::fs::create_dir_all(save_dir)
        .with_context(|| format!("ディレクトリ作成失敗: {}", save_dir.display()))?;

    let path = save_dir.join("metrics.json");
    let json = serde_json::to_string_pretty(metrics)?;
    std::fs::write(&path, json)
        .with_context(|| format!("メトリクス書き込み失敗: {}", path.display()))?;

    println!("メトリクスを保存: {}", path.display());
    Ok(())
}
