use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::config::{BOS_ID, EOS_ID, MAX_LEN, PAD_ID};
use crate::tokenizer::SubwordTokenizer;

/// 1サンプル: (ソースID列, デコーダー入力ID列, ラベルID列)
///
/// デコーダー入力は `[<bos>, w1, ..., wN]`、ラベルは `[w1, ..., wN, <eos>]`。
/// 両者は同じ長さで、ちょうど1位置ずれている。
pub struct Example {
    pub src_ids: Vec<i32>,
    pub tgt_input_ids: Vec<i32>,
    pub tgt_label_ids: Vec<i32>,
}

/// ターゲットID列からデコーダー入力とラベルのペアを作る
pub fn make_target_pair(ids: &[i32]) -> (Vec<i32>, Vec<i32>) {
    let mut input = Vec::with_capacity(ids.len() + 1);
    input.push(BOS_ID);
    input.extend_from_slice(ids);

    let mut label = Vec::with_capacity(ids.len() + 1);
    label.extend_from_slice(ids);
    label.push(EOS_ID);

    (input, label)
}

/// 行単位で対応づけられた対訳コーパス
///
/// 生テキスト行を保持し、トークン化はアクセス時に行う。
pub struct ParallelDataset<'a> {
    pairs: Vec<(String, String)>,
    src_tokenizer: &'a SubwordTokenizer,
    tgt_tokenizer: &'a SubwordTokenizer,
}

impl<'a> ParallelDataset<'a> {
    /// ソース・ターゲットのテキストファイルを読み込む（行番号で1:1対応）
    pub fn load(
        src_path: &Path,
        tgt_path: &Path,
        src_tokenizer: &'a SubwordTokenizer,
        tgt_tokenizer: &'a SubwordTokenizer,
    ) -> Result<Self> {
        let src_content = std::fs::read_to_string(src_path)
            .with_context(|| format!("ソースコーパスが読み込めません: {}", src_path.display()))?;
        let tgt_content = std::fs::read_to_string(tgt_path).with_context(|| {
            format!(
                "ターゲットコーパスが読み込めません: {}",
                tgt_path.display()
            )
        })?;

        let src_lines: Vec<&str> = src_content.lines().collect();
        let tgt_lines: Vec<&str> = tgt_content.lines().collect();

        if src_lines.len() != tgt_lines.len() {
            bail!(
                "対訳コーパスの行数が一致しません: {} ({}行) / {} ({}行)",
                src_path.display(),
                src_lines.len(),
                tgt_path.display(),
                tgt_lines.len()
            );
        }

        let mut pairs = Vec::new();
        for (src_line, tgt_line) in src_lines.iter().zip(tgt_lines.iter()) {
            let src_line = src_line.trim();
            let tgt_line = tgt_line.trim();

            // どちらかが空の行はペアごとスキップ（行対応は崩れない）
            if src_line.is_empty() || tgt_line.is_empty() {
                continue;
            }

            pairs.push((src_line.to_string(), tgt_line.to_string()));
        }

        println!("対訳サンプル数: {}", pairs.len());

        Ok(Self {
            pairs,
            src_tokenizer,
            tgt_tokenizer,
        })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// 生の対訳ペアを返す（評価時のサンプル翻訳表示用）
    pub fn pair(&self, idx: usize) -> (&str, &str) {
        let (src, tgt) = &self.pairs[idx];
        (src, tgt)
    }

    /// idx番目のサンプルをトークン化して返す
    pub fn example(&self, idx: usize) -> Result<Example> {
        let (src_text, tgt_text) = &self.pairs[idx];

        let (mut src_ids, _) = self.src_tokenizer.transform(src_text)?;
        src_ids.truncate(MAX_LEN);

        let (mut tgt_ids, _) = self.tgt_tokenizer.transform(tgt_text)?;
        // <bos>/<eos>を足してもMAX_LENに収まるように切り詰める
        tgt_ids.truncate(MAX_LEN - 1);

        let (tgt_input_ids, tgt_label_ids) = make_target_pair(&tgt_ids);

        Ok(Example {
            src_ids,
            tgt_input_ids,
            tgt_label_ids,
        })
    }
}

/// 固定形状にパディングされたバッチ
pub struct Batch {
    pub src: Vec<Vec<i32>>,       // (batch, MAX_LEN)
    pub tgt_input: Vec<Vec<i32>>, // (batch, MAX_LEN)
    pub tgt_label: Vec<Vec<i32>>, // (batch, MAX_LEN)
    pub src_lengths: Vec<usize>,
    pub tgt_lengths: Vec<usize>,
    pub valid_label_tokens: usize, // 損失の正規化に使う非パディングトークン数
}

impl Batch {
    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }
}

fn pad_to_max_len(ids: &[i32]) -> Vec<i32> {
    let mut padded = ids.to_vec();
    padded.truncate(MAX_LEN);
    padded.resize(MAX_LEN, PAD_ID);
    padded
}

/// サンプル列を固定形状 (batch, MAX_LEN) のバッチに詰める
pub fn collate(examples: &[Example]) -> Batch {
    let mut src = Vec::with_capacity(examples.len());
    let mut tgt_input = Vec::with_capacity(examples.len());
    let mut tgt_label = Vec::with_capacity(examples.len());
    let mut src_lengths = Vec::with_capacity(examples.len());
    let mut tgt_lengths = Vec::with_capacity(examples.len());
    let mut valid_label_tokens = 0;

    for example in examples {
        let src_len = example.src_ids.len().min(MAX_LEN);
        let tgt_len = example.tgt_label_ids.len().min(MAX_LEN);

        src.push(pad_to_max_len(&example.src_ids));
        tgt_input.push(pad_to_max_len(&example.tgt_input_ids));
        tgt_label.push(pad_to_max_len(&example.tgt_label_ids));
        src_lengths.push(src_len);
        tgt_lengths.push(tgt_len);
        valid_label_tokens += tgt_len;
    }

    Batch {
        src,
        tgt_input,
        tgt_label,
        src_lengths,
        tgt_lengths,
        valid_label_tokens,
    }
}

/// 再開可能なバッチ列
///
/// イテレータ枯渇を例外ではなく `None` で通知し、`restart` で先頭から
/// 読み直す。エポック境界の処理は呼び出し側（訓練ループ）が行う。
pub struct BatchStream<'a, 'b> {
    dataset: &'b ParallelDataset<'a>,
    batch_size: usize,
    cursor: usize,
}

impl<'a, 'b> BatchStream<'a, 'b> {
    pub fn new(dataset: &'b ParallelDataset<'a>, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size,
            cursor: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.dataset.len()
    }

    /// 次のバッチを返す。データを読み切っていれば `None`
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.is_exhausted() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.dataset.len());
        let mut examples = Vec::with_capacity(end - self.cursor);
        for idx in self.cursor..end {
            examples.push(self.dataset.example(idx)?);
        }
        self.cursor = end;

        Ok(Some(collate(&examples)))
    }

    /// 先頭に巻き戻す（グローバルステップ数は呼び出し側で維持される）
    pub fn restart(&mut self) {
        self.cursor = 0;
    }
}
