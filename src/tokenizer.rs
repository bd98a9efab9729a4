use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use tokenizers::models::bpe::{BpeTrainer, BPE};
use tokenizers::models::TrainerWrapper;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{AddedToken, Tokenizer};

use crate::config::{BOS_ID, EOS_ID, PAD_ID};

/// サブワードトークナイザ（言語ごとに1つ、BPEで学習）
///
/// 特殊トークンは学習時の登録順で `<pad>`=0, `<unk>`=1, `<bos>`=2, `<eos>`=3 に固定される。
pub struct SubwordTokenizer {
    tokenizer: Tokenizer,
}

impl SubwordTokenizer {
    /// コーパスファイルからBPEを学習
    pub fn fit(corpus_path: &Path, vocab_size: usize) -> Result<Self> {
        if !corpus_path.exists() {
            bail!(
                "コーパスファイルが見つかりません: {}",
                corpus_path.display()
            );
        }

        let bpe = BPE::builder()
            .unk_token("<unk>".to_string())
            .build()
            .map_err(|e| anyhow!("BPEモデル構築エラー: {}", e))?;

        let mut tokenizer = Tokenizer::new(bpe);
        tokenizer.with_pre_tokenizer(Whitespace::default());

        let mut trainer: TrainerWrapper = BpeTrainer::builder()
            .vocab_size(vocab_size)
            .special_tokens(vec![
                AddedToken::from("<pad>", true),
                AddedToken::from("<unk>", true),
                AddedToken::from("<bos>", true),
                AddedToken::from("<eos>", true),
            ])
            .build()
            .into();

        let files = vec![corpus_path.to_string_lossy().to_string()];
        tokenizer
            .train_from_files(&mut trainer, files)
            .map_err(|e| anyhow!("トークナイザ学習エラー: {}", e))?;

        println!(
            "トークナイザを学習: {} (語彙サイズ: {})",
            corpus_path.display(),
            tokenizer.get_vocab_size(true)
        );

        Ok(Self { tokenizer })
    }

    /// 保存済みトークナイザをJSONファイルから読み込み
    pub fn load(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("トークナイザ読み込みエラー ({}): {}", path.display(), e))?;
        Ok(Self { tokenizer })
    }

    /// トークナイザをJSONファイルへ保存
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("ディレクトリ作成失敗: {}", parent.display()))?;
        }
        self.tokenizer
            .save(path, false)
            .map_err(|e| anyhow!("トークナイザ保存エラー ({}): {}", path.display(), e))?;
        println!("トークナイザを保存: {}", path.display());
        Ok(())
    }

    /// 保存済みがあれば読み込み、なければコーパスから学習して保存
    pub fn load_or_fit(artifact_path: &Path, corpus_path: &Path, vocab_size: usize) -> Result<Self> {
        if artifact_path.exists() {
            println!("既存トークナイザを使用: {}", artifact_path.display());
            Self::load(artifact_path)
        } else {
            let fitted = Self::fit(corpus_path, vocab_size)?;
            fitted.save(artifact_path)?;
            Ok(fitted)
        }
    }

    /// テキストをトークンID列へ変換（ID列と有効長を返す）
    pub fn transform(&self, text: &str) -> Result<(Vec<i32>, usize)> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("エンコードエラー: {}", e))?;
        let ids: Vec<i32> = encoding.get_ids().iter().map(|&id| id as i32).collect();
        let length = ids.len();
        Ok((ids, length))
    }

    /// トークンID列をテキストへ復元（特殊トークンは出力しない）
    pub fn inverse_transform(&self, ids: &[i32]) -> Result<String> {
        let ids: Vec<u32> = ids
            .iter()
            .filter(|&&id| id >= 0 && id != PAD_ID && id != BOS_ID && id != EOS_ID)
            .map(|&id| id as u32)
            .collect();
        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| anyhow!("デコードエラー: {}", e))
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// 語彙一覧をテキストファイルへエクスポート（1行 = トークン\tID）
    pub fn export_vocab(&self, path: &Path) -> Result<()> {
        let vocab = self.tokenizer.get_vocab(true);
        let mut entries: Vec<(String, u32)> = vocab.into_iter().collect();
        entries.sort_by_key(|(_, id)| *id);

        let mut listing = String::new();
        for (token, id) in entries {
            listing.push_str(&format!("{}\t{}\n", token, id));
        }
        std::fs::write(path, listing)
            .with_context(|| format!("語彙一覧の書き込み失敗: {}", path.display()))?;
        println!("語彙一覧をエクスポート: {}", path.display());
        Ok(())
    }
}
