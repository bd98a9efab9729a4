use serde::{Deserialize, Serialize};

// モデルハイパーパラメーター
pub const D_MODEL: usize = 128; // 埋め込み次元
pub const NUM_HEADS: usize = 4; // Multi-head Attentionのヘッド数
pub const D_HEAD: usize = D_MODEL / NUM_HEADS; // 各ヘッドの次元数
pub const D_FF: usize = D_MODEL * 4; // Feed-forward中間層の次元数
pub const MAX_LEN: usize = 40; // パディング後の固定シーケンス長（ソース・ターゲット共通）
pub const NUM_ENCODER_LAYERS: usize = 3; // Encoderレイヤー数
pub const NUM_DECODER_LAYERS: usize = 3; // Decoderレイヤー数
pub const VOCAB_SIZE: usize = 8000; // サブワード語彙サイズ（言語ごと）

// 特殊トークンID（トークナイザ学習時の登録順で固定）
pub const PAD_ID: i32 = 0;
pub const UNK_ID: i32 = 1;
pub const BOS_ID: i32 = 2;
pub const EOS_ID: i32 = 3;

// 訓練設定
pub const BATCH_SIZE: usize = 64; // バッチサイズ
pub const PEAK_LR: f64 = 1e-4; // ウォームアップ終了時の最大学習率
pub const WARMUP_STEPS: usize = 400; // 学習率上昇フェーズのステップ数
pub const COOLDOWN_STEPS: usize = 4600; // 学習率減衰フェーズのステップ数
pub const TOTAL_STEPS: usize = 5000; // 総ステップ数
pub const EVAL_INTERVAL: usize = 500; // 評価・チェックポイント間隔（ステップ）
pub const EVAL_BATCHES: usize = 20; // 評価に使う検証バッチ数の上限
pub const GRAD_CLIP_NORM: f32 = 1.0; // 勾配ノルムのクリッピング閾値
pub const LOSS_WINDOW: usize = 50; // 直近損失の移動窓サイズ
pub const SAMPLE_SENTENCES: usize = 3; // 評価時に翻訳表示する検証文の数
pub const LOG_INTERVAL: usize = 10; // 進捗表示の間隔（ステップ）

/// 実行時の訓練設定（チェックポイントに埋め込む）
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub peak_lr: f64,
    pub warmup_steps: usize,
    pub cooldown_steps: usize,
    pub total_steps: usize,
    pub eval_interval: usize,
    pub eval_batches: usize,
    pub grad_clip_norm: f32,
    pub loss_window: usize,
    pub sample_sentences: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            peak_lr: PEAK_LR,
            warmup_steps: WARMUP_STEPS,
            cooldown_steps: COOLDOWN_STEPS,
            total_steps: TOTAL_STEPS,
            eval_interval: EVAL_INTERVAL,
            eval_batches: EVAL_BATCHES,
            grad_clip_norm: GRAD_CLIP_NORM,
            loss_window: LOSS_WINDOW,
            sample_sentences: SAMPLE_SENTENCES,
        }
    }
}

impl TrainConfig {
    /// デモモード用の縮小設定（動作確認向け）
    pub fn demo() -> Self {
        Self {
            total_steps: 20,
            warmup_steps: 5,
            cooldown_steps: 15,
            eval_interval: 10,
            eval_batches: 2,
            batch_size: 8,
            ..Self::default()
        }
    }
}

/// モデル構成（チェックポイントに埋め込む）
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelHyperParams {
    pub d_model: usize,
    pub num_heads: usize,
    pub d_ff: usize,
    pub num_encoder_layers: usize,
    pub num_decoder_layers: usize,
    pub max_len: usize,
    pub src_vocab_size: usize,
    pub tgt_vocab_size: usize,
}

impl ModelHyperParams {
    pub fn current(src_vocab_size: usize, tgt_vocab_size: usize) -> Self {
        Self {
            d_model: D_MODEL,
            num_heads: NUM_HEADS,
            d_ff: D_FF,
            num_encoder_layers: NUM_ENCODER_LAYERS,
            num_decoder_layers: NUM_DECODER_LAYERS,
            max_len: MAX_LEN,
            src_vocab_size,
            tgt_vocab_size,
        }
    }
}
