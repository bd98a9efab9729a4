use burn::nn::{Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;

use crate::config::{D_FF, D_HEAD, D_MODEL, NUM_DECODER_LAYERS, NUM_ENCODER_LAYERS, NUM_HEADS};

// ===== 共通ヘルパー関数 =====

/// 位置エンコーディングを追加（Encoder/Decoder共通）
fn add_positional_encoding<B: Backend>(x: Tensor<B, 3>) -> Tensor<B, 3> {
    let shape = x.dims();
    let seq_len = shape[1];
    let d_model = shape[2];

    let mut pos_encoding_data = Vec::new();

    for pos in 0..seq_len {
        for i in 0..d_model {
            let value = if i % 2 == 0 {
                let angle = pos as f32 / 10000_f32.powf(i as f32 / d_model as f32);
                angle.sin()
            } else {
                let angle = pos as f32 / 10000_f32.powf((i - 1) as f32 / d_model as f32);
                angle.cos()
            };
            pos_encoding_data.push(value);
        }
    }

    let pos_encoding = Tensor::<B, 1>::from_floats(pos_encoding_data.as_slice(), &x.device())
        .reshape([seq_len, d_model]);

    let pos_encoding = pos_encoding.unsqueeze::<3>();

    x + pos_encoding
}

/// Attentionヘッドを連結（Self/Cross共通）
fn concatenate_heads<B: Backend>(heads: Vec<Tensor<B, 3>>) -> Tensor<B, 3> {
    Tensor::cat(heads, 2)
}

/// パディングマスクを適用
/// scores: [batch, q_len, k_len], mask: [batch, k_len]（trueがパディング位置）
fn apply_padding_mask<B: Backend>(
    scores: Tensor<B, 3>,
    mask: Tensor<B, 2, Bool>,
) -> Tensor<B, 3> {
    let [batch_size, q_len, k_len] = scores.dims();
    let mask = mask
        .unsqueeze_dim::<3>(1) // [batch, 1, k_len]
        .expand([batch_size, q_len, k_len]);
    scores.mask_fill(mask, -1e9)
}

/// 因果マスクを適用（未来位置のスコアを潰す）
/// scores: [batch, q_len, k_len]
fn apply_causal_mask<B: Backend>(scores: Tensor<B, 3>) -> Tensor<B, 3> {
    let [batch_size, q_len, k_len] = scores.dims();
    let causal = Tensor::<B, 2>::ones([q_len, k_len], &scores.device())
        .triu(1)
        .equal_elem(1.0); // 上三角（対角除く）がtrue
    let causal = causal.unsqueeze::<3>().expand([batch_size, q_len, k_len]);
    scores.mask_fill(causal, -1e9)
}

// ===== FeedForward =====

#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    w_1: Linear<B>,
    w_2: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(device: &B::Device) -> Self {
        let w1 = LinearConfig::new(D_MODEL, D_FF).init(device);
        let w2 = LinearConfig::new(D_FF, D_MODEL).init(device);

        Self { w_1: w1, w_2: w2 }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.w_1.forward(x);
        let activated = burn::tensor::activation::relu(hidden);
        self.w_2.forward(activated)
    }
}

// ===== Multi-Head Self-Attention =====

#[derive(Module, Debug)]
pub struct CustomMultiHeadAttention<B: Backend> {
    w_q: Vec<Linear<B>>,
    w_k: Vec<Linear<B>>,
    w_v: Vec<Linear<B>>,
    w_o: Linear<B>,
}

impl<B: Backend> CustomMultiHeadAttention<B> {
    pub fn new(device: &B::Device) -> Self {
        let mut w_q = Vec::new();
        let mut w_k = Vec::new();
        let mut w_v = Vec::new();

        for _ in 0..NUM_HEADS {
            w_q.push(LinearConfig::new(D_MODEL, D_HEAD).init(device));
            w_k.push(LinearConfig::new(D_MODEL, D_HEAD).init(device));
            w_v.push(LinearConfig::new(D_MODEL, D_HEAD).init(device));
        }

        let w_o = LinearConfig::new(D_MODEL, D_MODEL).init(device);

        Self { w_q, w_k, w_v, w_o }
    }

    /// x: [batch, seq_len, d_model]
    /// pad_mask: [batch, seq_len]（trueがパディング位置）
    /// causal: trueなら自己回帰マスクを適用
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        pad_mask: Option<Tensor<B, 2, Bool>>,
        causal: bool,
    ) -> Tensor<B, 3> {
        let mut head_outputs = Vec::new();

        for head_idx in 0..NUM_HEADS {
            let output = self.compute_head(x.clone(), head_idx, pad_mask.clone(), causal);
            head_outputs.push(output);
        }

        let concat = concatenate_heads(head_outputs);
        self.w_o.forward(concat)
    }

    fn compute_head(
        &self,
        x: Tensor<B, 3>,
        head_idx: usize,
        pad_mask: Option<Tensor<B, 2, Bool>>,
        causal: bool,
    ) -> Tensor<B, 3> {
        let q = self.w_q[head_idx].forward(x.clone());
        let k = self.w_k[head_idx].forward(x.clone());
        let v = self.w_v[head_idx].forward(x);

        // Attention Score: Q × K^T / sqrt(d_head)
        let k_t = k.transpose();
        let scores = q.matmul(k_t);
        let scale = (D_HEAD as f32).sqrt();
        let mut scores = scores / scale;

        if let Some(mask) = pad_mask {
            scores = apply_padding_mask(scores, mask);
        }
        if causal {
            scores = apply_causal_mask(scores);
        }

        let attention_weights = burn::tensor::activation::softmax(scores, 2);

        attention_weights.matmul(v)
    }
}

// ===== Cross-Attention =====

#[derive(Module, Debug)]
pub struct CustomCrossAttention<B: Backend> {
    // Query用の線形変換（Decoder側の入力から）
    w_q: Vec<Linear<B>>,
    // Key/Value用の線形変換（Encoder側の出力から）
    w_k: Vec<Linear<B>>,
    w_v: Vec<Linear<B>>,
    w_o: Linear<B>,
}

impl<B: Backend> CustomCrossAttention<B> {
    pub fn new(device: &B::Device) -> Self {
        let mut w_q = Vec::new();
        let mut w_k = Vec::new();
        let mut w_v = Vec::new();

        for _ in 0..NUM_HEADS {
            w_q.push(LinearConfig::new(D_MODEL, D_HEAD).init(device));
            w_k.push(LinearConfig::new(D_MODEL, D_HEAD).init(device));
            w_v.push(LinearConfig::new(D_MODEL, D_HEAD).init(device));
        }

        let w_o = LinearConfig::new(D_MODEL, D_MODEL).init(device);

        Self { w_q, w_k, w_v, w_o }
    }

    /// query_input: [batch, tgt_len, d_model]（Decoder側）
    /// key_value_input: [batch, src_len, d_model]（Encoder出力）
    /// src_mask: [batch, src_len]（Encoderのパディングマスク）
    pub fn forward(
        &self,
        query_input: Tensor<B, 3>,
        key_value_input: Tensor<B, 3>,
        src_mask: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let mut head_outputs = Vec::new();

        for head_idx in 0..NUM_HEADS {
            let output = self.compute_head(
                query_input.clone(),
                key_value_input.clone(),
                head_idx,
                src_mask.clone(),
            );
            head_outputs.push(output);
        }

        let concat = concatenate_heads(head_outputs);
        self.w_o.forward(concat)
    }

    fn compute_head(
        &self,
        query_input: Tensor<B, 3>,
        key_value_input: Tensor<B, 3>,
        head_idx: usize,
        src_mask: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let q = self.w_q[head_idx].forward(query_input);
        let k = self.w_k[head_idx].forward(key_value_input.clone());
        let v = self.w_v[head_idx].forward(key_value_input);

        let k_t = k.transpose();
        let scores = q.matmul(k_t);
        let scale = (D_HEAD as f32).sqrt();
        let mut scores = scores / scale;

        if let Some(mask) = src_mask {
            scores = apply_padding_mask(scores, mask);
        }

        let attention_weights = burn::tensor::activation::softmax(scores, 2);

        attention_weights.matmul(v)
    }
}

// ===== EncoderBlock =====

#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    attention: CustomMultiHeadAttention<B>,
    feed_forward: FeedForward<B>,
    layer_norm1: LayerNorm<B>,
    layer_norm2: LayerNorm<B>,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn new(device: &B::Device) -> Self {
        let attention = CustomMultiHeadAttention::new(device);
        let feed_forward = FeedForward::new(device);

        let layer_norm1 = LayerNormConfig::new(D_MODEL).init(device);
        let layer_norm2 = LayerNormConfig::new(D_MODEL).init(device);

        Self {
            attention,
            feed_forward,
            layer_norm1,
            layer_norm2,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, src_mask: Option<Tensor<B, 2, Bool>>) -> Tensor<B, 3> {
        // Pre-LN方式: Layer Norm → Attention → 残差接続

        let normalized1 = self.layer_norm1.forward(x.clone());
        let attention_output = self.attention.forward(normalized1, src_mask, false);
        let residual1 = x + attention_output;

        let normalized2 = self.layer_norm2.forward(residual1.clone());
        let ff_output = self.feed_forward.forward(normalized2);
        residual1 + ff_output
    }
}

// ===== DecoderBlock =====

#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    self_attention: CustomMultiHeadAttention<B>,
    cross_attention: CustomCrossAttention<B>,
    feed_forward: FeedForward<B>,
    layer_norm1: LayerNorm<B>,
    layer_norm2: LayerNorm<B>,
    layer_norm3: LayerNorm<B>,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn new(device: &B::Device) -> Self {
        let self_attention = CustomMultiHeadAttention::new(device);
        let cross_attention = CustomCrossAttention::new(device);
        let feed_forward = FeedForward::new(device);

        let layer_norm1 = LayerNormConfig::new(D_MODEL).init(device);
        let layer_norm2 = LayerNormConfig::new(D_MODEL).init(device);
        let layer_norm3 = LayerNormConfig::new(D_MODEL).init(device);

        Self {
            self_attention,
            cross_attention,
            feed_forward,
            layer_norm1,
            layer_norm2,
            layer_norm3,
        }
    }

    /// x: [batch, tgt_len, d_model]
    /// encoder_output: [batch, src_len, d_model]
    /// src_mask: [batch, src_len]（Encoderのパディングマスク）
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        encoder_output: Tensor<B, 3>,
        src_mask: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        // Pre-LN方式: Layer Norm → Attention → 残差接続

        // 1. Self-Attention（因果マスク付き）
        let normalized1 = self.layer_norm1.forward(x.clone());
        let self_attn_output = self.self_attention.forward(normalized1, None, true);
        let residual1 = x + self_attn_output;

        // 2. Cross-Attention（Encoderの出力を参照）
        let normalized2 = self.layer_norm2.forward(residual1.clone());
        let cross_attn_output = self
            .cross_attention
            .forward(normalized2, encoder_output, src_mask);
        let residual2 = residual1 + cross_attn_output;

        // 3. Feed-Forward
        let normalized3 = self.layer_norm3.forward(residual2.clone());
        let ff_output = self.feed_forward.forward(normalized3);
        residual2 + ff_output
    }
}

// ===== Encoder =====

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    embedding: Embedding<B>,
    encoder_blocks: Vec<EncoderBlock<B>>,
}

impl<B: Backend> Encoder<B> {
    pub fn new(device: &B::Device, src_vocab_size: usize) -> Self {
        let embedding = EmbeddingConfig::new(src_vocab_size, D_MODEL).init(device);

        let mut encoder_blocks = Vec::new();
        for _ in 0..NUM_ENCODER_LAYERS {
            encoder_blocks.push(EncoderBlock::new(device));
        }

        Self {
            embedding,
            encoder_blocks,
        }
    }

    /// 入力: [batch, src_len] のトークンID
    /// 出力: [batch, src_len, d_model] のエンコード表現
    pub fn forward(
        &self,
        src_tokens: Tensor<B, 2, Int>,
        src_mask: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let embedded = self.embedding.forward(src_tokens);
        let mut x = add_positional_encoding(embedded);

        for block in &self.encoder_blocks {
            x = block.forward(x, src_mask.clone());
        }

        x
    }
}

// ===== Decoder =====

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    embedding: Embedding<B>,
    decoder_blocks: Vec<DecoderBlock<B>>,
    output_projection: Linear<B>,
}

impl<B: Backend> Decoder<B> {
    pub fn new(device: &B::Device, tgt_vocab_size: usize) -> Self {
        let embedding = EmbeddingConfig::new(tgt_vocab_size, D_MODEL).init(device);

        let mut decoder_blocks = Vec::new();
        for _ in 0..NUM_DECODER_LAYERS {
            decoder_blocks.push(DecoderBlock::new(device));
        }

        let output_projection = LinearConfig::new(D_MODEL, tgt_vocab_size).init(device);

        Self {
            embedding,
            decoder_blocks,
            output_projection,
        }
    }

    /// tgt_tokens: [batch, tgt_len] のトークンID
    /// 出力: [batch, tgt_len, tgt_vocab_size]
    pub fn forward(
        &self,
        tgt_tokens: Tensor<B, 2, Int>,
        encoder_output: Tensor<B, 3>,
        src_mask: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let embedded = self.embedding.forward(tgt_tokens);
        let mut x = add_positional_encoding(embedded);

        for block in &self.decoder_blocks {
            x = block.forward(x, encoder_output.clone(), src_mask.clone());
        }

        self.output_projection.forward(x)
    }
}

// ===== Seq2SeqModel（Encoder-Decoder統合） =====

#[derive(Module, Debug)]
pub struct Seq2SeqModel<B: Backend> {
    encoder: Encoder<B>,
    decoder: Decoder<B>,
}

impl<B: Backend> Seq2SeqModel<B> {
    pub fn new(device: &B::Device, src_vocab_size: usize, tgt_vocab_size: usize) -> Self {
        let encoder = Encoder::new(device, src_vocab_size);
        let decoder = Decoder::new(device, tgt_vocab_size);

        Self { encoder, decoder }
    }

    /// 訓練時のフォワードパス（Teacher Forcing）
    /// src_tokens: [batch, src_len]、tgt_tokens: [batch, tgt_len]
    /// src_mask: [batch, src_len]（trueがパディング位置）
    /// 出力: [batch, tgt_len, tgt_vocab_size]
    pub fn forward(
        &self,
        src_tokens: Tensor<B, 2, Int>,
        tgt_tokens: Tensor<B, 2, Int>,
        src_mask: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let encoder_output = self.encoder.forward(src_tokens, src_mask.clone());
        self.decoder.forward(tgt_tokens, encoder_output, src_mask)
    }

    /// 貪欲法による自己回帰生成
    ///
    /// 各サンプルは `<eos>` を出力するか `max_len` に達した時点で停止する。
    /// 出力: サンプルごとの生成トークンID列（先頭の `<bos>` を含む）
    pub fn generate(
        &self,
        src_tokens: Tensor<B, 2, Int>,
        src_mask: Option<Tensor<B, 2, Bool>>,
        bos_id: i32,
        eos_id: i32,
        max_len: usize,
        tgt_vocab_size: usize,
    ) -> Vec<Vec<i32>> {
        let encoder_output = self.encoder.forward(src_tokens, src_mask.clone());

        let batch_size = encoder_output.dims()[0];
        let device = encoder_output.device();

        // 最初のトークンは<bos>
        let mut generated_ids = vec![vec![bos_id]; batch_size];
        let mut finished = vec![false; batch_size];

        for _ in 0..max_len {
            let current_len = generated_ids[0].len();
            let flat_ids: Vec<i32> = generated_ids.iter().flatten().copied().collect();
            let tgt_tokens = Tensor::<B, 1, Int>::from_data(flat_ids.as_slice(), &device)
                .reshape([batch_size, current_len]);

            let logits = self
                .decoder
                .forward(tgt_tokens, encoder_output.clone(), src_mask.clone());

            // 最後の位置のlogitsを取得: [batch, tgt_vocab_size]
            let last_logits = logits
                .slice([0..batch_size, current_len - 1..current_len, 0..tgt_vocab_size])
                .reshape([batch_size, tgt_vocab_size]);

            // 最も確率の高いトークンを選択
            let predicted_ids = last_logits.argmax(1).reshape([batch_size]);
            let predicted_data: Vec<i32> = predicted_ids
                .to_data()
                .convert::<i32>()
                .to_vec()
                .expect("argmax結果の取り出しに失敗");

            for (i, &predicted_id) in predicted_data.iter().enumerate() {
                if finished[i] {
                    // 終了済みサンプルは<eos>で埋めて形状を揃える
                    generated_ids[i].push(eos_id);
                    continue;
                }
                generated_ids[i].push(predicted_id);
                if predicted_id == eos_id {
                    finished[i] = true;
                }
            }

            if finished.iter().all(|&f| f) {
                break;
            }
        }

        generated_ids
    }
}
