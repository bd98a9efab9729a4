use anyhow::{bail, Result};
use burn::backend::ndarray::NdArray;
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::prelude::*;
use burn::tensor::Int;
use std::path::Path;

use crate::checkpoint::load_model_generic;
use crate::config::{BOS_ID, EOS_ID, MAX_LEN, PAD_ID};
use crate::model::Seq2SeqModel;
use crate::tokenizer::SubwordTokenizer;

/// 1文を貪欲法で翻訳（ジェネリックBackend）
pub fn translate<B: Backend>(
    model: &Seq2SeqModel<B>,
    src_tokenizer: &SubwordTokenizer,
    tgt_tokenizer: &SubwordTokenizer,
    input_text: &str,
    device: &B::Device,
) -> Result<String> {
    let (mut src_ids, _) = src_tokenizer.transform(input_text)?;
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

    tgt_tokenizer.inverse_transform(&generated[0])
}

/// チェックポイントを読み込んで翻訳（指定Backend）
fn load_and_translate<B: Backend>(
    checkpoint_dir: &Path,
    predict_text: &str,
    src_tokenizer: &SubwordTokenizer,
    tgt_tokenizer: &SubwordTokenizer,
    device: &B::Device,
) -> Result<String> {
    let model = load_model_generic::<B>(
        checkpoint_dir,
        device,
        src_tokenizer.vocab_size(),
        tgt_tokenizer.vocab_size(),
    )?;
    translate(&model, src_tokenizer, tgt_tokenizer, predict_text, device)
}

/// バックエンドを選択して推論実行
pub fn run_translation_inference(
    backend_name: &str,
    checkpoint_dir: &Path,
    predict_text: &str,
    src_tokenizer: &SubwordTokenizer,
    tgt_tokenizer: &SubwordTokenizer,
) -> Result<String> {
    match backend_name {
        "wgpu" => {
            let device = WgpuDevice::default();
            load_and_translate::<Wgpu>(
                checkpoint_dir,
                predict_text,
                src_tokenizer,
                tgt_tokenizer,
                &device,
            )
        }
        "ndarray" => {
            let device = Default::default();
            load_and_translate::<NdArray>(
                checkpoint_dir,
                predict_text,
                src_tokenizer,
                tgt_tokenizer,
                &device,
            )
        }
        "auto" => {
            // WGPUを試し、失敗したらNdArrayにフォールバック
            println!("バックエンド: 自動選択中...");
            let wgpu_result = std::panic::catch_unwind(|| {
                let device = WgpuDevice::default();
                load_model_generic::<Wgpu>(
                    checkpoint_dir,
                    &device,
                    src_tokenizer.vocab_size(),
                    tgt_tokenizer.vocab_size(),
                )
            });

            match wgpu_result {
                Ok(Ok(model)) => {
                    println!("バックエンド: WGPU（自動選択）");
                    let device = WgpuDevice::default();
                    translate(&model, src_tokenizer, tgt_tokenizer, predict_text, &device)
                }
                _ => {
                    println!("バックエンド: NdArray（WGPU利用不可のためフォールバック）");
                    let device = Default::default();
                    load_and_translate::<NdArray>(
                        checkpoint_dir,
                        predict_text,
                        src_tokenizer,
                        tgt_tokenizer,
                        &device,
                    )
                }
            }
        }
        _ => bail!("未対応のバックエンド: {}", backend_name),
    }
}
