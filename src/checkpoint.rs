//! Checkpoint Files
//!
//! Reads and writes the binary checkpoint layout the bundled backend loads its
//! model from. All integers and floats are little-endian.
//!
//! ```text
//! "FESTE_CKPT"                  10-byte magic
//! u8 version                    always 1
//! u32 len + JSON                model config
//! tensor token_embedding
//! tensor position_embedding
//! u32 num_blocks
//! per block (16 tensors):
//!     ln1 gamma, ln1 beta,
//!     q weight, q bias, k weight, k bias, v weight, v bias, out weight, out bias,
//!     ln2 gamma, ln2 beta,
//!     fc1 weight, fc1 bias, fc2 weight, fc2 bias
//! tensor ln_final gamma, tensor ln_final beta, tensor output_weight
//! u8 has_optimizer
//!     [u64 step, f32 beta1, f32 beta2, f32 epsilon,
//!      4 + 32 × num_blocks + 6 moment tensors]
//! u8 has_tokenizer
//!     [u32 len + JSON tokenizer]
//! u32 len + JSON metadata       {step, best_val_loss, best_val_step}
//!
//! tensor := u32 ndim, ndim × u32 dims, u32 len, len × f32
//! ```
//!
//! Optimizer state is skipped on load; this crate only runs inference and
//! never writes it.

use crate::error::{Result, TouchstoneError};
use crate::model::{Attention, Block, Gpt2, LayerNorm, Linear, Mlp, ModelConfig};
use crate::tensor::Tensor;
use crate::tokenizer::BPETokenizer;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 10] = b"FESTE_CKPT";
const VERSION: u8 = 1;
/// Moment tensors stored per block by the optimizer (m and v for 16 weights)
const OPTIMIZER_TENSORS_PER_BLOCK: usize = 32;
/// Moment tensors for embeddings (4) and final layers (6)
const OPTIMIZER_TENSORS_OUTSIDE_BLOCKS: usize = 10;
/// Refuse single tensors claiming more than 1G floats
const MAX_TENSOR_LEN: usize = 1 << 30;

/// Training bookkeeping stored at the end of a checkpoint
///
/// `best_val_loss` is written as JSON `null` when no validation ever ran.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub step: usize,
    pub best_val_loss: Option<f32>,
    pub best_val_step: usize,
}

/// A loaded checkpoint: network, optional tokenizer, metadata
#[derive(Debug)]
pub struct Checkpoint {
    pub model: Gpt2,
    pub tokenizer: Option<BPETokenizer>,
    pub metadata: CheckpointMetadata,
    /// Whether the file carried optimizer state (skipped on load)
    pub had_optimizer: bool,
}

impl Checkpoint {
    /// Wrap a model for saving, with no training history
    pub fn inference_only(model: Gpt2, tokenizer: Option<BPETokenizer>) -> Self {
        Self {
            model,
            tokenizer,
            metadata: CheckpointMetadata::default(),
            had_optimizer: false,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading checkpoint from {}", path.display());
        let mut reader = BufReader::new(File::open(path)?);
        let checkpoint = Self::read_from(&mut reader)?;

        info!(
            "Loaded {} parameters ({} layers, n_embd {}, context {})",
            checkpoint.model.count_parameters(),
            checkpoint.model.config.n_layers,
            checkpoint.model.config.n_embd,
            checkpoint.model.config.block_size
        );
        match &checkpoint.tokenizer {
            Some(t) => info!("Tokenizer included (vocab size: {})", t.vocab_size()),
            None => info!("No tokenizer in checkpoint"),
        }
        Ok(checkpoint)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        info!("Saved checkpoint to {}", path.display());
        Ok(())
    }

    /// Parse a checkpoint from any reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 10];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid("bad header, expected FESTE_CKPT"));
        }
        let version = read_u8(reader)?;
        if version != VERSION {
            return Err(invalid(format!("unsupported version {}", version)));
        }

        let config: ModelConfig = serde_json::from_slice(&read_blob(reader)?)?;
        config.validate()?;
        let n = config.n_embd;
        let vocab = config.vocab_size;

        let token_embedding = read_shaped(reader, "token_embedding", &[vocab, n])?;
        let position_embedding =
            read_shaped(reader, "position_embedding", &[config.block_size, n])?;

        let num_blocks = read_u32(reader)? as usize;
        if num_blocks != config.n_layers {
            return Err(invalid(format!(
                "{} blocks stored, config says {} layers",
                num_blocks, config.n_layers
            )));
        }
        let mut blocks = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            blocks.push(read_block(reader, n)?);
        }

        let ln_final = read_layer_norm(reader, n)?;
        let output_weight = read_shaped(reader, "output_weight", &[n, vocab])?;

        let had_optimizer = read_u8(reader)? == 1;
        if had_optimizer {
            // step (u64) + beta1, beta2, epsilon (f32)
            let mut header = [0u8; 8 + 4 * 3];
            reader.read_exact(&mut header)?;
            let count =
                OPTIMIZER_TENSORS_OUTSIDE_BLOCKS + OPTIMIZER_TENSORS_PER_BLOCK * num_blocks;
            for _ in 0..count {
                read_tensor(reader)?;
            }
        }

        let tokenizer = if read_u8(reader)? == 1 {
            Some(serde_json::from_slice(&read_blob(reader)?)?)
        } else {
            None
        };

        let metadata: CheckpointMetadata = serde_json::from_slice(&read_blob(reader)?)?;

        let model = Gpt2 {
            config,
            token_embedding,
            position_embedding,
            blocks,
            ln_final,
            output_weight,
        };

        Ok(Self {
            model,
            tokenizer,
            metadata,
            had_optimizer,
        })
    }

    /// Serialize to any writer (never includes optimizer state)
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let model = &self.model;
        writer.write_all(MAGIC)?;
        writer.write_all(&[VERSION])?;
        write_blob(writer, serde_json::to_string(&model.config)?.as_bytes())?;

        write_tensor(writer, &model.token_embedding)?;
        write_tensor(writer, &model.position_embedding)?;

        writer.write_all(&(model.blocks.len() as u32).to_le_bytes())?;
        for block in &model.blocks {
            write_tensor(writer, &block.ln1.gamma)?;
            write_tensor(writer, &block.ln1.beta)?;
            for linear in [
                &block.attn.q_proj,
                &block.attn.k_proj,
                &block.attn.v_proj,
                &block.attn.out_proj,
            ] {
                write_tensor(writer, &linear.weight)?;
                write_tensor(writer, &linear.bias)?;
            }
            write_tensor(writer, &block.ln2.gamma)?;
            write_tensor(writer, &block.ln2.beta)?;
            for linear in [&block.mlp.fc1, &block.mlp.fc2] {
                write_tensor(writer, &linear.weight)?;
                write_tensor(writer, &linear.bias)?;
            }
        }

        write_tensor(writer, &model.ln_final.gamma)?;
        write_tensor(writer, &model.ln_final.beta)?;
        write_tensor(writer, &model.output_weight)?;

        writer.write_all(&[0u8])?;

        match &self.tokenizer {
            Some(tokenizer) => {
                writer.write_all(&[1u8])?;
                write_blob(writer, serde_json::to_string(tokenizer)?.as_bytes())?;
            }
            None => writer.write_all(&[0u8])?,
        }

        write_blob(writer, serde_json::to_string(&self.metadata)?.as_bytes())?;
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> TouchstoneError {
    TouchstoneError::InvalidCheckpoint(reason.into())
}

fn read_block<R: Read>(reader: &mut R, n: usize) -> Result<Block> {
    let ln1 = read_layer_norm(reader, n)?;
    let attn = Attention {
        q_proj: read_linear(reader, "q_proj", n, n)?,
        k_proj: read_linear(reader, "k_proj", n, n)?,
        v_proj: read_linear(reader, "v_proj", n, n)?,
        out_proj: read_linear(reader, "out_proj", n, n)?,
    };
    let ln2 = read_layer_norm(reader, n)?;
    let mlp = Mlp {
        fc1: read_linear(reader, "fc1", n, 4 * n)?,
        fc2: read_linear(reader, "fc2", 4 * n, n)?,
    };
    Ok(Block { ln1, attn, ln2, mlp })
}

fn read_layer_norm<R: Read>(reader: &mut R, n: usize) -> Result<LayerNorm> {
    Ok(LayerNorm {
        gamma: read_shaped(reader, "layer norm gamma", &[n])?,
        beta: read_shaped(reader, "layer norm beta", &[n])?,
        eps: LayerNorm::EPS,
    })
}

fn read_linear<R: Read>(reader: &mut R, name: &str, fan_in: usize, fan_out: usize) -> Result<Linear> {
    Ok(Linear {
        weight: read_shaped(reader, name, &[fan_in, fan_out])?,
        bias: read_shaped(reader, name, &[fan_out])?,
    })
}

fn read_shaped<R: Read>(reader: &mut R, name: &str, expected: &[usize]) -> Result<Tensor> {
    let tensor = read_tensor(reader)?;
    if tensor.shape != expected {
        return Err(invalid(format!(
            "{} has shape {:?}, expected {:?}",
            name, tensor.shape, expected
        )));
    }
    Ok(tensor)
}

fn read_tensor<R: Read>(reader: &mut R) -> Result<Tensor> {
    let ndim = read_u32(reader)? as usize;
    if ndim > 8 {
        return Err(invalid(format!("tensor with {} dimensions", ndim)));
    }
    let mut shape = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        shape.push(read_u32(reader)? as usize);
    }

    let len = read_u32(reader)? as usize;
    let expected = shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
    if expected != Some(len) || len > MAX_TENSOR_LEN {
        return Err(invalid(format!(
            "tensor data length {} doesn't fit shape {:?}",
            len, shape
        )));
    }

    let raw = read_bytes(reader, len as u64 * 4)?;
    let data = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Tensor::new(data, shape))
}

fn write_tensor<W: Write>(writer: &mut W, tensor: &Tensor) -> Result<()> {
    writer.write_all(&(tensor.shape.len() as u32).to_le_bytes())?;
    for &dim in &tensor.shape {
        writer.write_all(&(dim as u32).to_le_bytes())?;
    }
    writer.write_all(&(tensor.data.len() as u32).to_le_bytes())?;
    let mut raw = Vec::with_capacity(tensor.data.len() * 4);
    for v in &tensor.data {
        raw.extend_from_slice(&v.to_le_bytes());
    }
    writer.write_all(&raw)?;
    Ok(())
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    reader.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    reader.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

/// Length-prefixed byte string
fn read_blob<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(reader)? as u64;
    read_bytes(reader, len)
}

/// Exactly `len` bytes, grown with what is actually read so a bogus length
/// on a short file ends in `UnexpectedEof` instead of a huge allocation
fn read_bytes<R: Read>(reader: &mut R, len: u64) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut bytes)?;
    if bytes.len() as u64 != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {} bytes, got {}", len, bytes.len()),
        )
        .into());
    }
    Ok(bytes)
}

fn write_blob<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tiny_checkpoint(with_tokenizer: bool) -> Checkpoint {
        let model = Gpt2::new(&ModelConfig::tiny(256), 11).unwrap();
        let tokenizer = with_tokenizer.then(BPETokenizer::new);
        Checkpoint::inference_only(model, tokenizer)
    }

    #[test]
    fn test_write_read_preserves_weights() {
        let original = tiny_checkpoint(true);
        let mut bytes = Vec::new();
        original.write_to(&mut bytes).unwrap();

        let loaded = Checkpoint::read_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(loaded.model.config, original.model.config);
        assert_eq!(loaded.model.output_weight, original.model.output_weight);
        assert_eq!(
            loaded.model.blocks[1].mlp.fc2.weight,
            original.model.blocks[1].mlp.fc2.weight
        );
        assert_eq!(loaded.tokenizer.map(|t| t.vocab_size()), Some(256));
        assert_eq!(loaded.metadata.best_val_loss, None);
        assert!(!loaded.had_optimizer);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let err = Checkpoint::read_from(&mut Cursor::new(b"NOT_A_CKPT\x01".to_vec())).unwrap_err();
        assert!(matches!(err, TouchstoneError::InvalidCheckpoint(_)));
    }

    #[test]
    fn test_truncated_file_is_an_io_error() {
        let mut bytes = Vec::new();
        tiny_checkpoint(false).write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() / 2);
        let err = Checkpoint::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, TouchstoneError::Io(_)));
    }

    #[test]
    fn test_optimizer_state_is_skipped() {
        let original = tiny_checkpoint(false);
        let mut bytes = Vec::new();
        original.write_to(&mut bytes).unwrap();

        // Rebuild the file with an optimizer section spliced in after the weights
        let tail_len = {
            let mut tail = Vec::new();
            tail.push(0u8); // has_tokenizer
            write_blob(&mut tail, serde_json::to_string(&original.metadata).unwrap().as_bytes())
                .unwrap();
            tail.len() + 1 // + has_optimizer
        };
        let split = bytes.len() - tail_len;
        let mut spliced = bytes[..split].to_vec();
        spliced.push(1u8);
        spliced.extend_from_slice(&7u64.to_le_bytes());
        for v in [0.9f32, 0.999, 1e-8] {
            spliced.extend_from_slice(&v.to_le_bytes());
        }
        let moments = OPTIMIZER_TENSORS_OUTSIDE_BLOCKS
            + OPTIMIZER_TENSORS_PER_BLOCK * original.model.blocks.len();
        for _ in 0..moments {
            write_tensor(&mut spliced, &Tensor::zeros(vec![2])).unwrap();
        }
        spliced.extend_from_slice(&bytes[split + 1..]);

        let loaded = Checkpoint::read_from(&mut Cursor::new(spliced)).unwrap();
        assert!(loaded.had_optimizer);
        assert_eq!(loaded.model.token_embedding, original.model.token_embedding);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let mut checkpoint = tiny_checkpoint(false);
        checkpoint.model.output_weight = Tensor::zeros(vec![3, 3]);
        let mut bytes = Vec::new();
        checkpoint.write_to(&mut bytes).unwrap();
        let err = Checkpoint::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, TouchstoneError::InvalidCheckpoint(_)));
    }

    /// Bytes of a checkpoint up to (not including) the block count
    fn bytes_before_block_count(checkpoint: &Checkpoint) -> usize {
        let model = &checkpoint.model;
        let mut prefix = Vec::new();
        prefix.extend_from_slice(MAGIC);
        prefix.push(VERSION);
        write_blob(&mut prefix, serde_json::to_string(&model.config).unwrap().as_bytes()).unwrap();
        write_tensor(&mut prefix, &model.token_embedding).unwrap();
        write_tensor(&mut prefix, &model.position_embedding).unwrap();
        prefix.len()
    }

    #[test]
    fn test_huge_block_count_is_rejected() {
        let checkpoint = tiny_checkpoint(false);
        let mut bytes = Vec::new();
        checkpoint.write_to(&mut bytes).unwrap();
        let at = bytes_before_block_count(&checkpoint);
        assert_eq!(&bytes[at..at + 4], &2u32.to_le_bytes());

        bytes[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        bytes.truncate(at + 4);
        let err = Checkpoint::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, TouchstoneError::InvalidCheckpoint(_)));
    }

    #[test]
    fn test_block_count_must_match_config() {
        let mut checkpoint = tiny_checkpoint(false);
        checkpoint.model.blocks.pop();
        let mut bytes = Vec::new();
        checkpoint.write_to(&mut bytes).unwrap();
        let err = Checkpoint::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, TouchstoneError::InvalidCheckpoint(_)));
    }

    #[test]
    fn test_oversized_blob_length_on_short_input_is_io_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.push(VERSION);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"{}");
        let err = Checkpoint::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, TouchstoneError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }
}
